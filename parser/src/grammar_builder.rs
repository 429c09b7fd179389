use std::{any::Any, sync::Arc};

use anyhow::{bail, ensure, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    api::{MatcherId, VarId},
    errors::GrammarError,
    peg::{
        ActionContext, Grammar, Matcher, MatcherFlags, MatcherKind, Var, VarDecl, EOI,
    },
};

enum Entry<V> {
    Matcher(Matcher<V>),
    /// Forward reference; `target` is filled in by `set_placeholder()`.
    /// Labeling or flagging a placeholder before it is set yields another
    /// placeholder pointing at the first one and carrying the override.
    Placeholder {
        target: Option<MatcherId>,
        label: Option<String>,
        flags: MatcherFlags,
    },
}

/// Builds a matcher graph into an arena and hands out `MatcherId`s.
///
/// Recursive rules are closed with `placeholder()` and `set_placeholder()`;
/// `finalize()` resolves every placeholder and produces the immutable
/// `Grammar`.
pub struct GrammarBuilder<V> {
    entries: Vec<Entry<V>>,
    strings: FxHashMap<String, MatcherId>,
    chars: FxHashMap<char, MatcherId>,
    vars: Vec<VarDecl>,
}

impl<V> Default for GrammarBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn char_label(c: char) -> String {
    if c == EOI {
        "EOI".to_string()
    } else {
        format!("'{}'", c.escape_default())
    }
}

fn set_label(set: &[char]) -> String {
    set.iter().map(|c| c.escape_default().to_string()).collect()
}

impl<V> GrammarBuilder<V> {
    pub fn new() -> Self {
        GrammarBuilder {
            entries: vec![],
            strings: FxHashMap::default(),
            chars: FxHashMap::default(),
            vars: vec![],
        }
    }

    fn add(&mut self, kind: MatcherKind<V>, children: Vec<MatcherId>, label: &str) -> MatcherId {
        let id = MatcherId(self.entries.len());
        self.entries
            .push(Entry::Matcher(Matcher::new(kind, children, label.to_string())));
        id
    }

    fn add_flagged(
        &mut self,
        kind: MatcherKind<V>,
        children: Vec<MatcherId>,
        label: &str,
        flags: MatcherFlags,
    ) -> MatcherId {
        let id = self.add(kind, children, label);
        if let Entry::Matcher(m) = &mut self.entries[id.0] {
            m.flags = flags;
        }
        id
    }

    fn entry_kind(&self, id: MatcherId) -> Option<&MatcherKind<V>> {
        match &self.entries[id.0] {
            Entry::Matcher(m) => Some(&m.kind),
            Entry::Placeholder { .. } => None,
        }
    }

    pub fn ch(&mut self, c: char) -> MatcherId {
        if let Some(id) = self.chars.get(&c) {
            return *id;
        }
        let id = self.add(MatcherKind::Char(c), vec![], &char_label(c));
        self.chars.insert(c, id);
        id
    }

    pub fn eoi(&mut self) -> MatcherId {
        self.ch(EOI)
    }

    pub fn ignore_case(&mut self, c: char) -> MatcherId {
        let lower = c.to_lowercase().next().unwrap_or(c);
        let upper = c.to_uppercase().next().unwrap_or(c);
        if lower == upper {
            return self.ch(c);
        }
        self.add(
            MatcherKind::CharIgnoreCase { lower, upper },
            vec![],
            &format!("'{}/{}'", lower, upper),
        )
    }

    pub fn char_range(&mut self, low: char, high: char) -> Result<MatcherId> {
        if low > high {
            bail!(GrammarError::InvalidRange(format!("{}..{}", low, high)));
        }
        if low == high {
            return Ok(self.ch(low));
        }
        Ok(self.add(
            MatcherKind::CharRange { low, high },
            vec![],
            &format!("{}..{}", low.escape_default(), high.escape_default()),
        ))
    }

    fn code_point(cp: u32) -> Result<char> {
        match char::from_u32(cp) {
            Some(c) => Ok(c),
            None => bail!(GrammarError::InvalidCodePoint(cp)),
        }
    }

    pub fn unicode_char(&mut self, cp: u32) -> Result<MatcherId> {
        let c = Self::code_point(cp)?;
        Ok(self.ch(c))
    }

    pub fn unicode_range(&mut self, low: u32, high: u32) -> Result<MatcherId> {
        let low = Self::code_point(low)?;
        let high = Self::code_point(high)?;
        self.char_range(low, high)
    }

    pub fn any_of(&mut self, chars: &str) -> MatcherId {
        let mut set: Vec<char> = chars.chars().collect();
        set.sort_unstable();
        set.dedup();
        match set.len() {
            0 => self.nothing(),
            1 => self.ch(set[0]),
            _ => {
                let label = format!("[{}]", set_label(&set));
                self.add(MatcherKind::AnyOf(set), vec![], &label)
            }
        }
    }

    pub fn none_of(&mut self, chars: &str) -> MatcherId {
        let mut set: Vec<char> = chars.chars().collect();
        set.sort_unstable();
        set.dedup();
        if set.is_empty() {
            return self.any();
        }
        let label = format!("![{}]", set_label(&set));
        self.add(MatcherKind::NoneOf(set), vec![], &label)
    }

    pub fn any(&mut self) -> MatcherId {
        self.add(MatcherKind::Any, vec![], "ANY")
    }

    pub fn empty(&mut self) -> MatcherId {
        self.add(MatcherKind::Empty, vec![], "EMPTY")
    }

    pub fn nothing(&mut self) -> MatcherId {
        self.add(MatcherKind::Nothing, vec![], "NOTHING")
    }

    /// A literal; identical literals share one matcher.
    pub fn string(&mut self, s: &str) -> MatcherId {
        if let Some(id) = self.strings.get(s) {
            return *id;
        }
        let chars: Vec<char> = s.chars().collect();
        let id = match chars.len() {
            0 => self.empty(),
            1 => self.ch(chars[0]),
            _ => {
                let children = chars.iter().map(|&c| self.ch(c)).collect();
                self.add_flagged(
                    MatcherKind::String(chars),
                    children,
                    &format!("\"{}\"", s.escape_default()),
                    MatcherFlags::SUBNODES_SUPPRESSED,
                )
            }
        };
        self.strings.insert(s.to_string(), id);
        id
    }

    pub fn ignore_case_string(&mut self, s: &str) -> MatcherId {
        let children: Vec<MatcherId> = s.chars().map(|c| self.ignore_case(c)).collect();
        match children.len() {
            0 => self.empty(),
            1 => children[0],
            _ => self.add_flagged(
                MatcherKind::Sequence,
                children,
                &format!("\"{}\"", s.escape_default()),
                MatcherFlags::SUBNODES_SUPPRESSED,
            ),
        }
    }

    pub fn seq(&mut self, children: &[MatcherId]) -> MatcherId {
        match children.len() {
            0 => self.empty(),
            1 => children[0],
            _ => self.add(MatcherKind::Sequence, children.to_vec(), "Sequence"),
        }
    }

    /// Ordered choice. When every alternative is a string literal the
    /// result checks the first character before trying an alternative.
    pub fn first_of(&mut self, children: &[MatcherId]) -> MatcherId {
        match children.len() {
            0 => self.nothing(),
            1 => children[0],
            _ => {
                let all_strings = children
                    .iter()
                    .all(|&c| matches!(self.entry_kind(c), Some(MatcherKind::String(_))));
                let kind = if all_strings {
                    MatcherKind::FirstOfStrings
                } else {
                    MatcherKind::FirstOf
                };
                self.add(kind, children.to_vec(), "FirstOf")
            }
        }
    }

    pub fn optional(&mut self, inner: MatcherId) -> MatcherId {
        self.add(MatcherKind::Optional, vec![inner], "Optional")
    }

    pub fn zero_or_more(&mut self, inner: MatcherId) -> MatcherId {
        self.add(MatcherKind::ZeroOrMore, vec![inner], "ZeroOrMore")
    }

    pub fn one_or_more(&mut self, inner: MatcherId) -> MatcherId {
        self.add(MatcherKind::OneOrMore, vec![inner], "OneOrMore")
    }

    /// Positive lookahead; the default label is filled in by `finalize()`.
    pub fn test(&mut self, inner: MatcherId) -> MatcherId {
        self.add_flagged(
            MatcherKind::Test,
            vec![inner],
            "",
            MatcherFlags::SUBNODES_SUPPRESSED,
        )
    }

    pub fn test_not(&mut self, inner: MatcherId) -> MatcherId {
        self.add_flagged(
            MatcherKind::TestNot,
            vec![inner],
            "",
            MatcherFlags::SUBNODES_SUPPRESSED,
        )
    }

    pub fn action(
        &mut self,
        f: impl Fn(&mut ActionContext<'_, '_, V>) -> Result<bool> + Send + Sync + 'static,
    ) -> MatcherId {
        self.add(MatcherKind::Action(Arc::new(f)), vec![], "Action")
    }

    /// Caches failures of `inner` per input position for the duration of a
    /// run.
    pub fn memo_mismatches(&mut self, inner: MatcherId) -> MatcherId {
        self.add_flagged(
            MatcherKind::MemoMismatches,
            vec![inner],
            "",
            MatcherFlags::MEMO_MISMATCHES,
        )
    }

    /// Gives every activation of `inner` a fresh value for each of `vars`.
    pub fn with_vars(&mut self, inner: MatcherId, vars: &[VarId]) -> MatcherId {
        self.add(MatcherKind::VarFraming(vars.to_vec()), vec![inner], "")
    }

    pub fn var<T: Any>(
        &mut self,
        name: &str,
        init: impl Fn() -> T + Send + Sync + 'static,
    ) -> Var<T> {
        let id = VarId(self.vars.len());
        self.vars.push(VarDecl {
            name: name.to_string(),
            init: Arc::new(move || Box::new(init()) as Box<dyn Any>),
        });
        Var::new(id)
    }

    pub fn placeholder(&mut self) -> MatcherId {
        let id = MatcherId(self.entries.len());
        self.entries.push(Entry::Placeholder {
            target: None,
            label: None,
            flags: MatcherFlags::empty(),
        });
        id
    }

    pub fn set_placeholder(&mut self, placeholder: MatcherId, target: MatcherId) -> Result<()> {
        ensure!(
            target.0 < self.entries.len(),
            "matcher {} does not exist",
            target.0
        );
        match &mut self.entries[placeholder.0] {
            Entry::Placeholder { target: t, .. } => {
                if t.is_some() {
                    bail!(GrammarError::PlaceholderAlreadySet(format!(
                        "#{}",
                        placeholder.0
                    )));
                }
                *t = Some(target);
                Ok(())
            }
            Entry::Matcher(m) => bail!(GrammarError::NotAPlaceholder(m.label.clone())),
        }
    }

    // Copy-on-write: the original matcher stays untouched and keeps being
    // shared by everyone referring to it.
    fn derive(&mut self, id: MatcherId, label: Option<&str>, flags: MatcherFlags) -> MatcherId {
        let entry = match &self.entries[id.0] {
            Entry::Matcher(m) => {
                let mut m = m.clone();
                if let Some(l) = label {
                    m.label = l.to_string();
                }
                m.flags |= flags;
                Entry::Matcher(m)
            }
            Entry::Placeholder { .. } => Entry::Placeholder {
                target: Some(id),
                label: label.map(|l| l.to_string()),
                flags,
            },
        };
        let r = MatcherId(self.entries.len());
        self.entries.push(entry);
        r
    }

    pub fn label(&mut self, id: MatcherId, label: &str) -> MatcherId {
        self.derive(id, Some(label), MatcherFlags::empty())
    }

    pub fn suppress_node(&mut self, id: MatcherId) -> MatcherId {
        self.derive(id, None, MatcherFlags::NODE_SUPPRESSED)
    }

    pub fn suppress_subnodes(&mut self, id: MatcherId) -> MatcherId {
        self.derive(id, None, MatcherFlags::SUBNODES_SUPPRESSED)
    }

    pub fn skip_node(&mut self, id: MatcherId) -> MatcherId {
        self.derive(id, None, MatcherFlags::NODE_SKIPPED)
    }

    pub fn skip_in_predicates(&mut self, id: MatcherId) -> MatcherId {
        self.derive(id, None, MatcherFlags::SKIP_IN_PREDICATES)
    }

    fn placeholder_name(&self, id: MatcherId) -> String {
        match &self.entries[id.0] {
            Entry::Placeholder {
                label: Some(l), ..
            } => l.clone(),
            _ => format!("#{}", id.0),
        }
    }

    // Follows a chain of placeholders to a real matcher, applying the
    // overrides collected on the way; the outermost label wins.
    fn resolve(&self, id: MatcherId) -> Result<Matcher<V>> {
        let mut visited = FxHashSet::default();
        let mut label = None;
        let mut flags = MatcherFlags::empty();
        let mut curr = id;
        loop {
            if !visited.insert(curr) {
                bail!(GrammarError::PlaceholderCycle(self.placeholder_name(id)));
            }
            match &self.entries[curr.0] {
                Entry::Matcher(m) => {
                    let mut m = m.clone();
                    if let Some(l) = label {
                        m.label = l;
                    }
                    m.flags |= flags;
                    return Ok(m);
                }
                Entry::Placeholder {
                    target,
                    label: l,
                    flags: f,
                } => {
                    if label.is_none() {
                        label = l.clone();
                    }
                    flags |= *f;
                    match target {
                        Some(t) => curr = *t,
                        None => {
                            bail!(GrammarError::UnresolvedPlaceholder(self.placeholder_name(id)))
                        }
                    }
                }
            }
        }
    }

    // Wrappers are transparent: they take over the label and flags of what
    // they wrap. Predicates are labeled after their inner matcher.
    fn fill_derived_labels(matchers: &mut [Matcher<V>]) {
        fn fill<V>(matchers: &mut [Matcher<V>], idx: usize, visiting: &mut FxHashSet<usize>) {
            if !matchers[idx].label.is_empty() || !visiting.insert(idx) {
                return;
            }
            if let Some(inner) = matchers[idx].inner() {
                fill(matchers, inner.0, visiting);
                let inner_label = matchers[inner.0].label.clone();
                let inner_flags = matchers[inner.0].flags;
                let m = &mut matchers[idx];
                match m.kind {
                    MatcherKind::Test => m.label = format!("&({})", inner_label),
                    MatcherKind::TestNot => m.label = format!("!({})", inner_label),
                    _ => {
                        m.label = inner_label;
                        m.flags |= inner_flags
                            & (MatcherFlags::NODE_SUPPRESSED
                                | MatcherFlags::SUBNODES_SUPPRESSED
                                | MatcherFlags::NODE_SKIPPED);
                    }
                }
            }
            visiting.remove(&idx);
        }
        let mut visiting = FxHashSet::default();
        for idx in 0..matchers.len() {
            fill(matchers, idx, &mut visiting);
        }
    }

    pub fn finalize(self, start: MatcherId) -> Result<Grammar<V>> {
        ensure!(
            start.0 < self.entries.len(),
            "start matcher {} does not exist",
            start.0
        );
        let mut matchers = Vec::with_capacity(self.entries.len());
        for idx in 0..self.entries.len() {
            matchers.push(self.resolve(MatcherId(idx))?);
        }
        Self::fill_derived_labels(&mut matchers);
        Ok(Grammar::new(matchers, self.vars, start))
    }
}
