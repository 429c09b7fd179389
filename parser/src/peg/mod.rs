mod context;
mod grammar;
mod input;
mod tree;
mod value_stack;

pub use context::{ActionContext, BasicMatchHandler, MatchHandler, MatcherContext};
pub use grammar::{
    ActionFn, Grammar, Matcher, MatcherFlags, MatcherKind, Var, VarDecl, VarInit,
};
pub use input::{
    extract_without_markers, is_recovery_marker, DefaultInputBuffer, InputBuffer,
    MutableInputBuffer, Position, DEL_ERROR, EOI, INS_ERROR, RESYNC, RESYNC_END, RESYNC_EOI,
    RESYNC_START,
};
pub use tree::{tree_to_json, Node};
pub use value_stack::{ValueStack, ValueStackError, ValueStackSnapshot};
