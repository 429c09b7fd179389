use std::{any::Any, fmt, sync::Arc};

use anyhow::Result;
use bitflags::bitflags;
use rustc_hash::FxHashSet;

use super::{context::ActionContext, input::is_recovery_marker, EOI};
use crate::api::{MatcherId, VarId};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MatcherFlags: u8 {
        /// No node is built for this matcher.
        const NODE_SUPPRESSED = 1 << 0;
        /// No nodes are built for anything below this matcher.
        const SUBNODES_SUPPRESSED = 1 << 1;
        /// The node is not built but its children are attached to the parent.
        const NODE_SKIPPED = 1 << 2;
        const MEMO_MISMATCHES = 1 << 3;
        /// Actions only: succeed without running inside Test/TestNot.
        const SKIP_IN_PREDICATES = 1 << 4;
    }
}

pub type ActionFn<V> = Arc<dyn Fn(&mut ActionContext<'_, '_, V>) -> Result<bool> + Send + Sync>;
pub type VarInit = Arc<dyn Fn() -> Box<dyn Any> + Send + Sync>;

pub enum MatcherKind<V> {
    Char(char),
    CharIgnoreCase { lower: char, upper: char },
    /// Inclusive on both ends.
    CharRange { low: char, high: char },
    /// Sorted, without duplicates.
    AnyOf(Vec<char>),
    NoneOf(Vec<char>),
    Any,
    Empty,
    Nothing,
    /// Children are the character matchers, one per char.
    String(Vec<char>),
    Sequence,
    FirstOf,
    /// FirstOf whose children are all `String`s.
    FirstOfStrings,
    Optional,
    ZeroOrMore,
    OneOrMore,
    Test,
    TestNot,
    Action(ActionFn<V>),
    /// Wraps children[0].
    MemoMismatches,
    /// Wraps children[0]; opens a frame for each variable around it.
    VarFraming(Vec<VarId>),
}

impl<V> Clone for MatcherKind<V> {
    fn clone(&self) -> Self {
        match self {
            MatcherKind::Char(c) => MatcherKind::Char(*c),
            MatcherKind::CharIgnoreCase { lower, upper } => MatcherKind::CharIgnoreCase {
                lower: *lower,
                upper: *upper,
            },
            MatcherKind::CharRange { low, high } => MatcherKind::CharRange {
                low: *low,
                high: *high,
            },
            MatcherKind::AnyOf(s) => MatcherKind::AnyOf(s.clone()),
            MatcherKind::NoneOf(s) => MatcherKind::NoneOf(s.clone()),
            MatcherKind::Any => MatcherKind::Any,
            MatcherKind::Empty => MatcherKind::Empty,
            MatcherKind::Nothing => MatcherKind::Nothing,
            MatcherKind::String(s) => MatcherKind::String(s.clone()),
            MatcherKind::Sequence => MatcherKind::Sequence,
            MatcherKind::FirstOf => MatcherKind::FirstOf,
            MatcherKind::FirstOfStrings => MatcherKind::FirstOfStrings,
            MatcherKind::Optional => MatcherKind::Optional,
            MatcherKind::ZeroOrMore => MatcherKind::ZeroOrMore,
            MatcherKind::OneOrMore => MatcherKind::OneOrMore,
            MatcherKind::Test => MatcherKind::Test,
            MatcherKind::TestNot => MatcherKind::TestNot,
            MatcherKind::Action(f) => MatcherKind::Action(f.clone()),
            MatcherKind::MemoMismatches => MatcherKind::MemoMismatches,
            MatcherKind::VarFraming(v) => MatcherKind::VarFraming(v.clone()),
        }
    }
}

impl<V> fmt::Debug for MatcherKind<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherKind::Char(c) => write!(f, "Char({:?})", c),
            MatcherKind::CharIgnoreCase { lower, upper } => {
                write!(f, "CharIgnoreCase({:?}, {:?})", lower, upper)
            }
            MatcherKind::CharRange { low, high } => write!(f, "CharRange({:?}, {:?})", low, high),
            MatcherKind::AnyOf(s) => write!(f, "AnyOf({:?})", s),
            MatcherKind::NoneOf(s) => write!(f, "NoneOf({:?})", s),
            MatcherKind::String(s) => write!(f, "String({:?})", s.iter().collect::<String>()),
            MatcherKind::Action(_) => write!(f, "Action"),
            MatcherKind::VarFraming(v) => write!(f, "VarFraming({:?})", v),
            MatcherKind::Any => write!(f, "Any"),
            MatcherKind::Empty => write!(f, "Empty"),
            MatcherKind::Nothing => write!(f, "Nothing"),
            MatcherKind::Sequence => write!(f, "Sequence"),
            MatcherKind::FirstOf => write!(f, "FirstOf"),
            MatcherKind::FirstOfStrings => write!(f, "FirstOfStrings"),
            MatcherKind::Optional => write!(f, "Optional"),
            MatcherKind::ZeroOrMore => write!(f, "ZeroOrMore"),
            MatcherKind::OneOrMore => write!(f, "OneOrMore"),
            MatcherKind::Test => write!(f, "Test"),
            MatcherKind::TestNot => write!(f, "TestNot"),
            MatcherKind::MemoMismatches => write!(f, "MemoMismatches"),
        }
    }
}

impl<V> MatcherKind<V> {
    /// Matchers consuming exactly one character on success.
    pub fn is_single_char(&self) -> bool {
        matches!(
            self,
            MatcherKind::Char(_)
                | MatcherKind::CharIgnoreCase { .. }
                | MatcherKind::CharRange { .. }
                | MatcherKind::AnyOf(_)
                | MatcherKind::NoneOf(_)
                | MatcherKind::Any
        )
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(
            self,
            MatcherKind::MemoMismatches | MatcherKind::VarFraming(_)
        )
    }

    pub fn is_predicate(&self) -> bool {
        matches!(self, MatcherKind::Test | MatcherKind::TestNot)
    }

    /// Does `c` satisfy this single-character matcher?
    /// Always false for other kinds.
    pub fn accepts_char(&self, c: char) -> bool {
        match self {
            MatcherKind::Char(x) => c == *x,
            MatcherKind::CharIgnoreCase { lower, upper } => c == *lower || c == *upper,
            MatcherKind::CharRange { low, high } => *low <= c && c <= *high,
            MatcherKind::AnyOf(set) => set.binary_search(&c).is_ok(),
            MatcherKind::NoneOf(set) => {
                c != EOI && !is_recovery_marker(c) && set.binary_search(&c).is_err()
            }
            MatcherKind::Any => c != EOI && !is_recovery_marker(c),
            _ => false,
        }
    }
}

pub struct Matcher<V> {
    pub kind: MatcherKind<V>,
    pub children: Vec<MatcherId>,
    pub label: String,
    pub flags: MatcherFlags,
}

impl<V> Clone for Matcher<V> {
    fn clone(&self) -> Self {
        Matcher {
            kind: self.kind.clone(),
            children: self.children.clone(),
            label: self.label.clone(),
            flags: self.flags,
        }
    }
}

impl<V> fmt::Debug for Matcher<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("kind", &self.kind)
            .field("children", &self.children)
            .field("label", &self.label)
            .field("flags", &self.flags)
            .finish()
    }
}

impl<V> Matcher<V> {
    pub fn new(kind: MatcherKind<V>, children: Vec<MatcherId>, label: String) -> Self {
        Matcher {
            kind,
            children,
            label,
            flags: MatcherFlags::empty(),
        }
    }

    pub fn has_flag(&self, flag: MatcherFlags) -> bool {
        self.flags.contains(flag)
    }

    /// The wrapped matcher, or the only child for unary kinds.
    pub fn inner(&self) -> Option<MatcherId> {
        self.children.first().copied()
    }
}

pub struct VarDecl {
    pub name: String,
    pub init: VarInit,
}

/// A finalized matcher graph. Built with `GrammarBuilder`, immutable
/// afterwards and shared by reference between runs.
pub struct Grammar<V> {
    matchers: Vec<Matcher<V>>,
    vars: Vec<VarDecl>,
    start: MatcherId,
}

impl<V> fmt::Debug for Grammar<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Grammar start={}", self.start.0)?;
        for (idx, m) in self.matchers.iter().enumerate() {
            writeln!(f, "  {:4}: {} {:?} {:?}", idx, m.label, m.kind, m.children)?;
        }
        Ok(())
    }
}

impl<V> Grammar<V> {
    pub(crate) fn new(matchers: Vec<Matcher<V>>, vars: Vec<VarDecl>, start: MatcherId) -> Self {
        Grammar {
            matchers,
            vars,
            start,
        }
    }

    #[inline(always)]
    pub fn start(&self) -> MatcherId {
        self.start
    }

    #[inline(always)]
    pub fn matcher(&self, id: MatcherId) -> &Matcher<V> {
        &self.matchers[id.0]
    }

    pub fn label(&self, id: MatcherId) -> &str {
        &self.matchers[id.0].label
    }

    pub fn vars(&self) -> &[VarDecl] {
        &self.vars
    }

    /// Follows memoizing and variable-framing wrappers down to the matcher
    /// doing the actual work.
    pub fn unwrap(&self, mut id: MatcherId) -> MatcherId {
        loop {
            let m = self.matcher(id);
            match (m.kind.is_wrapper(), m.inner()) {
                (true, Some(inner)) => id = inner,
                _ => return id,
            }
        }
    }

    pub fn is_single_char(&self, id: MatcherId) -> bool {
        self.matcher(self.unwrap(id)).kind.is_single_char()
    }

    /// A character accepted by the given single-character matcher, used
    /// when error recovery conjures up a missing character.
    pub fn starter_char(&self, id: MatcherId) -> Option<char> {
        match &self.matcher(self.unwrap(id)).kind {
            MatcherKind::Char(c) => Some(*c),
            MatcherKind::CharIgnoreCase { lower, .. } => Some(*lower),
            MatcherKind::CharRange { low, .. } => Some(*low),
            MatcherKind::AnyOf(set) => set.first().copied(),
            MatcherKind::NoneOf(set) => (' '..=char::MAX).find(|c| set.binary_search(c).is_err()),
            MatcherKind::Any => Some(' '),
            _ => None,
        }
    }

    pub fn can_match_empty(&self, id: MatcherId) -> bool {
        self.can_match_empty_inner(id, &mut FxHashSet::default())
    }

    fn can_match_empty_inner(&self, id: MatcherId, visited: &mut FxHashSet<MatcherId>) -> bool {
        if !visited.insert(id) {
            return false;
        }
        let m = self.matcher(id);
        let r = match &m.kind {
            MatcherKind::Empty
            | MatcherKind::Optional
            | MatcherKind::ZeroOrMore
            | MatcherKind::Test
            | MatcherKind::TestNot
            | MatcherKind::Action(_) => true,
            MatcherKind::String(s) => s.is_empty(),
            MatcherKind::Sequence => m
                .children
                .iter()
                .all(|&c| self.can_match_empty_inner(c, visited)),
            MatcherKind::FirstOf | MatcherKind::FirstOfStrings => m
                .children
                .iter()
                .any(|&c| self.can_match_empty_inner(c, visited)),
            MatcherKind::OneOrMore | MatcherKind::MemoMismatches | MatcherKind::VarFraming(_) => {
                m.inner()
                    .map_or(false, |c| self.can_match_empty_inner(c, visited))
            }
            MatcherKind::Char(c) => *c == EOI,
            _ => false,
        };
        visited.remove(&id);
        r
    }

    /// Can a match of `id` begin with `c`?
    pub fn can_start_with(&self, id: MatcherId, c: char) -> bool {
        self.can_start_with_inner(id, c, &mut FxHashSet::default())
    }

    fn can_start_with_inner(
        &self,
        id: MatcherId,
        c: char,
        visited: &mut FxHashSet<MatcherId>,
    ) -> bool {
        if !visited.insert(id) {
            return false;
        }
        let m = self.matcher(id);
        let r = match &m.kind {
            k if k.is_single_char() => k.accepts_char(c),
            MatcherKind::Sequence | MatcherKind::String(_) => {
                let mut r = false;
                for &child in &m.children {
                    if self.can_start_with_inner(child, c, visited) {
                        r = true;
                        break;
                    }
                    if !self.can_match_empty(child) {
                        break;
                    }
                }
                r
            }
            MatcherKind::FirstOf | MatcherKind::FirstOfStrings => m
                .children
                .iter()
                .any(|&child| self.can_start_with_inner(child, c, visited)),
            MatcherKind::Optional
            | MatcherKind::ZeroOrMore
            | MatcherKind::OneOrMore
            | MatcherKind::Test
            | MatcherKind::MemoMismatches
            | MatcherKind::VarFraming(_) => m
                .inner()
                .map_or(false, |child| self.can_start_with_inner(child, c, visited)),
            _ => false,
        };
        visited.remove(&id);
        r
    }
}

/// Typed handle to a rule variable declared with `GrammarBuilder::var()`.
pub struct Var<T> {
    id: VarId,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Var<T> {}

impl<T> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({})", self.id.0)
    }
}

impl<T> Var<T> {
    pub(crate) fn new(id: VarId) -> Self {
        Var {
            id,
            _marker: std::marker::PhantomData,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> VarId {
        self.id
    }
}
