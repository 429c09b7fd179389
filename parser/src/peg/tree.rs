use serde::Serialize;
use serde_json::{json, Value};

use super::{extract_without_markers, Grammar, InputBuffer};
use crate::api::MatcherId;

/// One successful match of a (non-suppressed) matcher.
///
/// Offsets index the buffer the parse ran over; `end` is exclusive.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Node<V> {
    matcher: MatcherId,
    children: Vec<Node<V>>,
    start: usize,
    end: usize,
    value: Option<V>,
    has_error: bool,
}

impl<V> Node<V> {
    pub(crate) fn new(
        matcher: MatcherId,
        children: Vec<Node<V>>,
        start: usize,
        end: usize,
        value: Option<V>,
        has_error: bool,
    ) -> Self {
        Node {
            matcher,
            children,
            start,
            end,
            value,
            has_error,
        }
    }

    #[inline(always)]
    pub fn matcher(&self) -> MatcherId {
        self.matcher
    }

    pub fn children(&self) -> &[Node<V>] {
        &self.children
    }

    pub(crate) fn into_children(self) -> Vec<Node<V>> {
        self.children
    }

    pub fn start_index(&self) -> usize {
        self.start
    }

    pub fn end_index(&self) -> usize {
        self.end
    }

    /// The top of the value stack when the node was created.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Set when recovery repaired input somewhere inside this match.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn label<'g>(&self, grammar: &'g Grammar<V>) -> &'g str {
        grammar.label(self.matcher)
    }

    /// The matched text; deleted characters and markers are left out,
    /// conjured characters included.
    pub fn text(&self, input: &dyn InputBuffer) -> String {
        if self.has_error {
            extract_without_markers(input, self.start, self.end)
        } else {
            input.extract(self.start, self.end)
        }
    }

    /// Pre-order walk over this node and all its descendants.
    pub fn walk<'n>(&'n self, f: &mut impl FnMut(&'n Node<V>)) {
        f(self);
        for ch in &self.children {
            ch.walk(f);
        }
    }

    pub fn find_by_label<'n>(&'n self, grammar: &Grammar<V>, label: &str) -> Option<&'n Node<V>> {
        if self.label(grammar) == label {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|ch| ch.find_by_label(grammar, label))
    }

    /// Follows a `/`-separated list of labels down from this node's
    /// children, taking the first match at every step.
    pub fn find_by_path<'n>(&'n self, grammar: &Grammar<V>, path: &str) -> Option<&'n Node<V>> {
        let mut curr = self;
        for label in path.split('/') {
            curr = curr
                .children
                .iter()
                .find(|ch| ch.label(grammar) == label)?;
        }
        Some(curr)
    }

    pub fn collect<'n>(&'n self, pred: impl Fn(&Node<V>) -> bool) -> Vec<&'n Node<V>> {
        let mut r = vec![];
        self.walk(&mut |n| {
            if pred(n) {
                r.push(n)
            }
        });
        r
    }
}

/// JSON view of a tree for debugging and test expectations:
/// `{"label", "text", "start", "end", "error"?, "value"?, "children"?}`.
pub fn tree_to_json<V: Serialize>(
    node: &Node<V>,
    grammar: &Grammar<V>,
    input: &dyn InputBuffer,
) -> Value {
    let mut r = json!({
        "label": node.label(grammar),
        "text": node.text(input),
        "start": node.start,
        "end": node.end,
    });
    if node.has_error {
        r["error"] = json!(true);
    }
    if let Some(v) = &node.value {
        r["value"] = serde_json::to_value(v).unwrap_or(Value::Null);
    }
    if !node.children.is_empty() {
        r["children"] = Value::Array(
            node.children
                .iter()
                .map(|ch| tree_to_json(ch, grammar, input))
                .collect(),
        );
    }
    r
}
