use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    errors::{format_parse_error, ParseError},
    peg::{InputBuffer, Node, ValueStack},
};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
        #[serde(transparent)]
        pub struct $name(pub usize);
    };
}

id_type!(MatcherId);
id_type!(VarId);

/// Bounds on the work done by the recovering runner.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryLimits {
    /// Wall-clock budget for one `run()`; checked between fix attempts and
    /// whenever a sequence fails during a recovery pass.
    pub timeout_ms: Option<u64>,

    /// Maximum number of errors repaired before the runner gives up and
    /// returns whatever the final pass produces.
    pub max_error_fixes: usize,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        RecoveryLimits {
            timeout_ms: None,
            max_error_fixes: 10_000,
        }
    }
}

/// Outcome of one runner invocation.
pub struct ParsingResult<V> {
    pub matched: bool,
    /// Present only when the root matcher matched and its node was not
    /// suppressed.
    pub parse_tree_root: Option<Node<V>>,
    pub value_stack: ValueStack<V>,
    pub parse_errors: Vec<ParseError>,
    /// The buffer the parse ran over; node offsets index into it. For the
    /// recovering runner this includes the injected recovery markers.
    pub input_buffer: Rc<dyn InputBuffer>,
    /// The buffer supplied by the caller; parse error offsets index into it.
    pub source: Rc<dyn InputBuffer>,
}

impl<V> ParsingResult<V> {
    pub fn has_errors(&self) -> bool {
        !self.parse_errors.is_empty()
    }

    /// The top of the value stack, if any.
    pub fn result_value(&self) -> Option<&V> {
        self.value_stack.peek().ok()
    }

    /// Node text with recovery markers resolved.
    pub fn node_text(&self, node: &Node<V>) -> String {
        node.text(&*self.input_buffer)
    }

    pub fn format_errors(&self) -> String {
        self.parse_errors
            .iter()
            .map(|e| format_parse_error(e, &*self.source))
            .collect::<Vec<_>>()
            .join("---\n")
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for ParsingResult<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsingResult")
            .field("matched", &self.matched)
            .field("parse_tree_root", &self.parse_tree_root)
            .field("value_stack", &self.value_stack)
            .field("parse_errors", &self.parse_errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_serde() {
        let limits: RecoveryLimits = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(limits.timeout_ms, Some(250));
        assert_eq!(limits.max_error_fixes, RecoveryLimits::default().max_error_fixes);
        let v = serde_json::to_value(RecoveryLimits::default()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"timeout_ms": null, "max_error_fixes": 10000})
        );
        assert_eq!(serde_json::to_string(&MatcherId(3)).unwrap(), "3");
    }
}
