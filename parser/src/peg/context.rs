use std::{any::Any, panic::AssertUnwindSafe};

use anyhow::{bail, Result};
use rustc_hash::FxHashSet;

use super::{
    extract_without_markers, Grammar, InputBuffer, Matcher, MatcherFlags, MatcherKind, Node,
    Position, ValueStack, Var, EOI,
};
use crate::{
    api::{MatcherId, VarId},
    errors::{ActionFailure, GrammarError, MatchLocation, MatcherPath, ParseError, PathElement},
    panic_utils,
};

/// Drives a single matcher invocation. Runners install one per pass; the
/// default one just dispatches to the matcher, others observe or alter the
/// outcome.
pub trait MatchHandler<V> {
    fn run(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool>;
}

pub struct BasicMatchHandler;

impl<V: Clone> MatchHandler<V> for BasicMatchHandler {
    fn run(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool> {
        ctx.match_current()
    }
}

/// Per-level invocation record. Frames are reused: entering a child
/// reinitializes the frame one level below the caller.
pub(crate) struct Frame<V> {
    /// `None` once the invocation has retired.
    pub(crate) matcher: Option<MatcherId>,
    pub(crate) start_index: usize,
    pub(crate) current_index: usize,
    pub(crate) current_char: char,
    pub(crate) sub_nodes: Vec<Node<V>>,
    /// Index of the child currently running, for sequences.
    pub(crate) tag: usize,
    pub(crate) node_suppressed: bool,
    pub(crate) has_error: bool,
    pub(crate) in_predicate: bool,
    pub(crate) in_test_not: bool,
}

impl<V> Default for Frame<V> {
    fn default() -> Self {
        Frame {
            matcher: None,
            start_index: 0,
            current_index: 0,
            current_char: EOI,
            sub_nodes: vec![],
            tag: 0,
            node_suppressed: false,
            has_error: false,
            in_predicate: false,
            in_test_not: false,
        }
    }
}

/// State of one pass of a grammar over an input: the frame stack, the value
/// stack, collected parse errors and the run-scoped side tables.
pub struct MatcherContext<'a, V> {
    grammar: &'a Grammar<V>,
    input: &'a dyn InputBuffer,
    handler: &'a dyn MatchHandler<V>,
    pub(crate) value_stack: ValueStack<V>,
    pub(crate) parse_errors: Vec<ParseError>,
    pub(crate) frames: Vec<Frame<V>>,
    pub(crate) level: usize,
    // (matcher, index) pairs known not to match
    memo: FxHashSet<(MatcherId, usize)>,
    vars: Vec<Vec<Box<dyn Any>>>,
    pub(crate) fast_string_matching: bool,
    pub(crate) build_tree: bool,
    pub(crate) memoize: bool,
    pub(crate) error_recovery: bool,
    root_node: Option<Node<V>>,
}

impl<'a, V: Clone> MatcherContext<'a, V> {
    pub fn new(
        grammar: &'a Grammar<V>,
        input: &'a dyn InputBuffer,
        handler: &'a dyn MatchHandler<V>,
        value_stack: ValueStack<V>,
    ) -> Self {
        let start = grammar.start();
        let start_kind = &grammar.matcher(grammar.unwrap(start)).kind;
        let root = Frame {
            matcher: Some(start),
            current_char: input.char_at(0),
            node_suppressed: grammar
                .matcher(start)
                .has_flag(MatcherFlags::NODE_SUPPRESSED),
            in_predicate: start_kind.is_predicate(),
            in_test_not: matches!(start_kind, MatcherKind::TestNot),
            ..Frame::default()
        };
        MatcherContext {
            grammar,
            input,
            handler,
            value_stack,
            parse_errors: vec![],
            frames: vec![root],
            level: 0,
            memo: FxHashSet::default(),
            vars: grammar.vars().iter().map(|d| vec![(d.init)()]).collect(),
            fast_string_matching: true,
            build_tree: true,
            memoize: true,
            error_recovery: false,
            root_node: None,
        }
    }

    /// Runs the start matcher from index 0.
    pub fn run_root(&mut self) -> Result<bool> {
        self.level = 0;
        self.run_matcher()
    }

    pub(crate) fn into_parts(self) -> (Option<Node<V>>, ValueStack<V>, Vec<ParseError>) {
        (self.root_node, self.value_stack, self.parse_errors)
    }

    #[inline(always)]
    pub fn grammar(&self) -> &'a Grammar<V> {
        self.grammar
    }

    #[inline(always)]
    pub fn input(&self) -> &'a dyn InputBuffer {
        self.input
    }

    #[inline(always)]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline(always)]
    fn frame(&self) -> &Frame<V> {
        &self.frames[self.level]
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut Frame<V> {
        &mut self.frames[self.level]
    }

    /// The matcher of the running invocation.
    pub fn matcher(&self) -> Option<MatcherId> {
        self.frame().matcher
    }

    pub fn start_index(&self) -> usize {
        self.frame().start_index
    }

    pub fn current_index(&self) -> usize {
        self.frame().current_index
    }

    pub fn current_char(&self) -> char {
        self.frame().current_char
    }

    pub fn tag(&self) -> usize {
        self.frame().tag
    }

    pub(crate) fn set_tag(&mut self, tag: usize) {
        self.frame_mut().tag = tag;
    }

    pub fn in_predicate(&self) -> bool {
        self.frame().in_predicate
    }

    /// True anywhere below a TestNot, where a successful match means the
    /// enclosing rule fails.
    pub fn in_test_not(&self) -> bool {
        self.frame().in_test_not
    }

    pub fn has_error(&self) -> bool {
        self.frame().has_error
    }

    pub fn is_node_suppressed(&self) -> bool {
        self.frame().node_suppressed
    }

    pub fn in_error_recovery(&self) -> bool {
        self.error_recovery
    }

    pub fn value_stack(&self) -> &ValueStack<V> {
        &self.value_stack
    }

    pub fn value_stack_mut(&mut self) -> &mut ValueStack<V> {
        &mut self.value_stack
    }

    pub fn parse_errors(&self) -> &[ParseError] {
        &self.parse_errors
    }

    pub fn add_parse_error(&mut self, error: ParseError) {
        self.parse_errors.push(error);
    }

    pub fn set_current_index(&mut self, index: usize) {
        let c = self.input.char_at(index);
        let f = self.frame_mut();
        f.current_index = index;
        f.current_char = c;
    }

    pub fn set_start_index(&mut self, index: usize) {
        self.frame_mut().start_index = index;
    }

    pub fn advance_index(&mut self, delta: usize) {
        let idx = self.current_index() + delta;
        self.set_current_index(idx);
    }

    pub fn path(&self) -> MatcherPath {
        self.path_at(self.level)
    }

    pub fn path_at(&self, level: usize) -> MatcherPath {
        let elements = self.frames[..=level]
            .iter()
            .enumerate()
            .filter_map(|(level, f)| {
                f.matcher.map(|m| PathElement {
                    matcher: m,
                    label: self.grammar.label(m).to_string(),
                    start_index: f.start_index,
                    level,
                })
            })
            .collect();
        MatcherPath { elements }
    }

    /// Flags the running invocation and all its callers as containing an
    /// error.
    pub fn mark_error(&mut self) {
        for f in self.frames[..=self.level].iter_mut() {
            f.has_error = true;
        }
    }

    /// Makes sure a node is built for the running invocation, and for every
    /// suppressed caller up the chain.
    pub fn clear_node_suppression(&mut self) {
        for f in self.frames[..=self.level].iter_mut().rev() {
            if !f.node_suppressed {
                break;
            }
            f.node_suppressed = false;
        }
    }

    /// Installs `id` in the frame one level below the running invocation.
    pub(crate) fn enter(&mut self, id: MatcherId) {
        let grammar = self.grammar;
        let m = grammar.matcher(id);
        let kind = &grammar.matcher(grammar.unwrap(id)).kind;
        let parent = self.frame();
        let parent_flags = parent
            .matcher
            .map(|p| grammar.matcher(p).flags)
            .unwrap_or_default();
        let node_suppressed = parent.node_suppressed
            || parent_flags.contains(MatcherFlags::SUBNODES_SUPPRESSED)
            || m.has_flag(MatcherFlags::NODE_SUPPRESSED);
        let in_predicate = parent.in_predicate || kind.is_predicate();
        let in_test_not = parent.in_test_not || matches!(kind, MatcherKind::TestNot);
        let (index, c) = (parent.current_index, parent.current_char);
        let is_action = matches!(kind, MatcherKind::Action(_));

        self.level += 1;
        if self.level == self.frames.len() {
            self.frames.push(Frame::default());
        }
        let f = self.frame_mut();
        f.matcher = Some(id);
        f.sub_nodes.clear();
        f.tag = 0;
        f.node_suppressed = node_suppressed;
        f.has_error = false;
        f.in_predicate = in_predicate;
        f.in_test_not = in_test_not;
        // an action keeps the span of the sibling before it, which is what
        // its match_text() refers to
        if !is_action {
            f.start_index = index;
            f.current_index = index;
            f.current_char = c;
        }
    }

    /// Runs the installed matcher through the handler, retires the frame and
    /// on success hands the new position to the caller.
    pub fn run_matcher(&mut self) -> Result<bool> {
        let handler = self.handler;
        let matched = match handler.run(self) {
            Ok(r) => r,
            Err(e) => return Err(self.annotate(e)),
        };
        let level = self.level;
        let (index, c) = {
            let f = &mut self.frames[level];
            f.matcher = None;
            (f.current_index, f.current_char)
        };
        if level > 0 {
            self.level -= 1;
            if matched {
                let parent = self.frame_mut();
                parent.current_index = index;
                parent.current_char = c;
            }
        }
        Ok(matched)
    }

    fn annotate(&self, e: anyhow::Error) -> anyhow::Error {
        if e.downcast_ref::<MatchLocation>().is_some() {
            return e;
        }
        let location = MatchLocation {
            path: self.path(),
            index: self.input.original_index(self.current_index()),
        };
        e.context(location)
    }

    pub fn run_child(&mut self, id: MatcherId) -> Result<bool> {
        self.enter(id);
        self.run_matcher()
    }

    /// Zero-width trial of the running matcher at the current position.
    /// Position and value stack are left as they were.
    pub(crate) fn run_trial_match(&mut self) -> Result<bool> {
        let Some(id) = self.matcher() else {
            bail!("no running matcher to try");
        };
        let index = self.current_index();
        let snapshot = self.value_stack.take_snapshot();
        self.enter(id);
        {
            let f = self.frame_mut();
            f.in_predicate = true;
            f.node_suppressed = true;
        }
        let r = self.run_matcher()?;
        self.value_stack.restore_snapshot(snapshot);
        self.set_current_index(index);
        Ok(r)
    }

    /// Builds the node of the running invocation from its pending sub-nodes
    /// and links it into the caller.
    pub fn create_node(&mut self) {
        let level = self.level;
        if !self.build_tree || self.frames[level].node_suppressed {
            return;
        }
        let value = self.value_stack.peek().ok().cloned();
        let f = &mut self.frames[level];
        let Some(id) = f.matcher else {
            return;
        };
        let node = Node::new(
            id,
            std::mem::take(&mut f.sub_nodes),
            f.start_index,
            f.current_index,
            value,
            f.has_error,
        );
        if level == 0 {
            self.root_node = Some(node);
            return;
        }
        let skipped = self.grammar.matcher(id).has_flag(MatcherFlags::NODE_SKIPPED);
        let parent = &mut self.frames[level - 1].sub_nodes;
        if skipped {
            parent.extend(node.into_children());
        } else {
            parent.push(node);
        }
    }

    /// The nodes built so far by the children of the running invocation.
    pub fn sub_nodes(&self) -> &[Node<V>] {
        &self.frame().sub_nodes
    }

    pub(crate) fn clear_sub_nodes(&mut self) {
        self.frame_mut().sub_nodes.clear();
    }

    /// Default dispatch: performs the match of the running matcher itself.
    pub fn match_current(&mut self) -> Result<bool> {
        let Some(id) = self.matcher() else {
            bail!("no running matcher at level {}", self.level);
        };
        self.match_layer(id)
    }

    // Wrappers run the matcher they wrap without touching the frame, which
    // keeps the wrapper's label, flags and path for the whole invocation.
    fn match_layer(&mut self, id: MatcherId) -> Result<bool> {
        let grammar = self.grammar;
        let m = grammar.matcher(id);
        match &m.kind {
            MatcherKind::MemoMismatches => {
                let key = (id, self.current_index());
                if self.memoize && self.memo.contains(&key) {
                    return Ok(false);
                }
                let r = self.match_layer(m.children[0])?;
                if !r && self.memoize {
                    self.memo.insert(key);
                }
                Ok(r)
            }
            MatcherKind::VarFraming(vars) => {
                self.push_var_frames(vars);
                let r = self.match_layer(m.children[0]);
                self.pop_var_frames(vars);
                r
            }
            _ => self.match_kind(m),
        }
    }

    fn match_kind(&mut self, m: &'a Matcher<V>) -> Result<bool> {
        let grammar = self.grammar;
        match &m.kind {
            k if k.is_single_char() => {
                let c = self.current_char();
                if !k.accepts_char(c) {
                    return Ok(false);
                }
                // EOI is zero-width
                if c != EOI {
                    self.advance_index(1);
                }
                self.create_node();
                Ok(true)
            }
            MatcherKind::Empty => {
                self.create_node();
                Ok(true)
            }
            MatcherKind::Nothing => Ok(false),
            MatcherKind::String(chars) if self.fast_string_matching => {
                let start = self.current_index();
                for (i, &c) in chars.iter().enumerate() {
                    if self.input.char_at(start + i) != c {
                        return Ok(false);
                    }
                }
                self.advance_index(chars.len());
                self.create_node();
                Ok(true)
            }
            MatcherKind::String(_) | MatcherKind::Sequence => self.match_sequence(&m.children),
            MatcherKind::FirstOf | MatcherKind::FirstOfStrings => {
                let prefilter =
                    self.fast_string_matching && matches!(m.kind, MatcherKind::FirstOfStrings);
                let c = self.current_char();
                for &child in &m.children {
                    if prefilter {
                        if let MatcherKind::String(s) = &grammar.matcher(child).kind {
                            if s.first() != Some(&c) {
                                continue;
                            }
                        }
                    }
                    if self.run_child(child)? {
                        self.create_node();
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            MatcherKind::Optional => {
                self.run_child(m.children[0])?;
                self.create_node();
                Ok(true)
            }
            MatcherKind::ZeroOrMore | MatcherKind::OneOrMore => {
                let inner = m.children[0];
                let mut count = 0;
                loop {
                    let before = self.current_index();
                    if !self.run_child(inner)? {
                        break;
                    }
                    if self.current_index() == before {
                        let label = self.matcher().map_or(&m.label[..], |id| grammar.label(id));
                        bail!(GrammarError::EmptyLoop(label.to_string()));
                    }
                    count += 1;
                }
                if count == 0 && matches!(m.kind, MatcherKind::OneOrMore) {
                    return Ok(false);
                }
                self.create_node();
                Ok(true)
            }
            MatcherKind::Test | MatcherKind::TestNot => {
                let index = self.current_index();
                let snapshot = self.value_stack.take_snapshot();
                let r = self.run_child(m.children[0])?;
                self.value_stack.restore_snapshot(snapshot);
                self.set_current_index(index);
                Ok(r == matches!(m.kind, MatcherKind::Test))
            }
            MatcherKind::Action(f) => self.match_action(f, m.has_flag(MatcherFlags::SKIP_IN_PREDICATES)),
            // wrappers are peeled off by match_layer()
            MatcherKind::MemoMismatches | MatcherKind::VarFraming(_) => Ok(false),
            // is_single_char() kinds are handled by the first arm
            MatcherKind::Char(_)
            | MatcherKind::CharIgnoreCase { .. }
            | MatcherKind::CharRange { .. }
            | MatcherKind::AnyOf(_)
            | MatcherKind::NoneOf(_)
            | MatcherKind::Any => Ok(false),
        }
    }

    fn match_sequence(&mut self, children: &[MatcherId]) -> Result<bool> {
        let snapshot = self.value_stack.take_snapshot();
        for (idx, &child) in children.iter().enumerate() {
            self.frame_mut().tag = idx;
            if !self.run_child(child)? {
                self.value_stack.restore_snapshot(snapshot);
                return Ok(false);
            }
        }
        self.create_node();
        Ok(true)
    }

    fn push_var_frames(&mut self, vars: &[VarId]) {
        let grammar = self.grammar;
        for v in vars {
            self.vars[v.0].push((grammar.vars()[v.0].init)());
        }
    }

    fn pop_var_frames(&mut self, vars: &[VarId]) {
        for v in vars {
            self.vars[v.0].pop();
        }
    }

    /// Opens the variable frames of every `with_vars` wrapper around `id`,
    /// for code that runs the wrapped matcher's children directly.
    pub(crate) fn open_var_frames(&mut self, id: MatcherId) {
        let grammar = self.grammar;
        let mut id = id;
        loop {
            let m = grammar.matcher(id);
            if let MatcherKind::VarFraming(vars) = &m.kind {
                self.push_var_frames(vars);
            }
            match (m.kind.is_wrapper(), m.inner()) {
                (true, Some(inner)) => id = inner,
                _ => break,
            }
        }
    }

    /// Closes the frames opened by `open_var_frames(id)`.
    pub(crate) fn close_var_frames(&mut self, id: MatcherId) {
        let grammar = self.grammar;
        let mut id = id;
        loop {
            let m = grammar.matcher(id);
            if let MatcherKind::VarFraming(vars) = &m.kind {
                self.pop_var_frames(vars);
            }
            match (m.kind.is_wrapper(), m.inner()) {
                (true, Some(inner)) => id = inner,
                _ => break,
            }
        }
    }

    fn finish_action(&mut self) {
        if self.level > 0 {
            let parent = &self.frames[self.level - 1];
            let (index, c) = (parent.current_index, parent.current_char);
            let f = self.frame_mut();
            f.start_index = index;
            f.current_index = index;
            f.current_char = c;
        }
    }

    fn match_action(&mut self, f: &super::ActionFn<V>, skip_in_predicates: bool) -> Result<bool> {
        if skip_in_predicates && self.in_predicate() {
            self.finish_action();
            return Ok(true);
        }
        let snapshot = self.value_stack.take_snapshot();
        let r = {
            let mut actx = ActionContext { ctx: self };
            panic_utils::catch_unwind(AssertUnwindSafe(|| (**f)(&mut actx)))
        };
        match r {
            Ok(true) => {
                self.finish_action();
                Ok(true)
            }
            Ok(false) => {
                self.value_stack.restore_snapshot(snapshot);
                Ok(false)
            }
            Err(e) => {
                let Some(failure) = e.downcast_ref::<ActionFailure>() else {
                    return Err(e);
                };
                let index = self.input.original_index(self.parent_frame().current_index);
                let error = ParseError::Action {
                    index,
                    message: failure.message.clone(),
                    path: self.path(),
                };
                self.parse_errors.push(error);
                self.value_stack.restore_snapshot(snapshot);
                Ok(false)
            }
        }
    }

    fn parent_frame(&self) -> &Frame<V> {
        &self.frames[self.level.saturating_sub(1)]
    }
}

/// What an action sees: the state of the enclosing rule, the value stack
/// and rule variables.
pub struct ActionContext<'c, 'a, V> {
    ctx: &'c mut MatcherContext<'a, V>,
}

impl<V: Clone> ActionContext<'_, '_, V> {
    fn parent(&self) -> &Frame<V> {
        self.ctx.parent_frame()
    }

    // The match_* family describes the sibling right before the action in
    // the enclosing sequence.
    fn previous_match(&self) -> Result<(usize, usize)> {
        let ctx = &*self.ctx;
        let grammar = ctx.grammar;
        let in_sequence = ctx.level > 0
            && self.parent().matcher.map_or(false, |p| {
                matches!(grammar.matcher(grammar.unwrap(p)).kind, MatcherKind::Sequence)
            });
        if !in_sequence {
            bail!(GrammarError::IllegalAction(
                "match_text() and friends can only be called from actions inside a sequence"
                    .to_string()
            ));
        }
        if self.parent().tag == 0 {
            bail!(GrammarError::IllegalAction(
                "match_text() and friends cannot be called from an action at the start of a sequence"
                    .to_string()
            ));
        }
        let f = ctx.frame();
        Ok((f.start_index, f.current_index))
    }

    pub fn match_text(&self) -> Result<String> {
        let (start, end) = self.previous_match()?;
        if self.parent().has_error {
            Ok(extract_without_markers(self.ctx.input, start, end))
        } else {
            Ok(self.ctx.input.extract(start, end))
        }
    }

    pub fn match_start(&self) -> Result<usize> {
        Ok(self.previous_match()?.0)
    }

    pub fn match_end(&self) -> Result<usize> {
        Ok(self.previous_match()?.1)
    }

    pub fn match_range(&self) -> Result<(usize, usize)> {
        self.previous_match()
    }

    pub fn match_length(&self) -> Result<usize> {
        let (start, end) = self.previous_match()?;
        Ok(end - start)
    }

    pub fn first_match_char(&self) -> Result<char> {
        let (start, end) = self.previous_match()?;
        if start == end {
            bail!(GrammarError::IllegalAction(
                "first_match_char() called on an empty match".to_string()
            ));
        }
        Ok(self.ctx.input.char_at(start))
    }

    pub fn value_stack(&mut self) -> &mut ValueStack<V> {
        &mut self.ctx.value_stack
    }

    pub fn push(&mut self, value: V) {
        self.ctx.value_stack.push(value);
    }

    pub fn pop(&mut self) -> Result<V> {
        Ok(self.ctx.value_stack.pop()?)
    }

    pub fn peek(&self) -> Result<&V> {
        Ok(self.ctx.value_stack.peek()?)
    }

    /// Position of the enclosing rule, after everything matched so far.
    pub fn current_index(&self) -> usize {
        self.parent().current_index
    }

    pub fn current_char(&self) -> char {
        self.parent().current_char
    }

    pub fn position(&self) -> Position {
        self.ctx.input.position(self.current_index())
    }

    pub fn input(&self) -> &dyn InputBuffer {
        self.ctx.input
    }

    pub fn grammar(&self) -> &Grammar<V> {
        self.ctx.grammar
    }

    pub fn in_predicate(&self) -> bool {
        self.ctx.in_predicate()
    }

    pub fn in_error_recovery(&self) -> bool {
        self.ctx.error_recovery
    }

    pub fn has_error(&self) -> bool {
        self.parent().has_error
    }

    pub fn level(&self) -> usize {
        self.ctx.level.saturating_sub(1)
    }

    pub fn path(&self) -> MatcherPath {
        self.ctx.path()
    }

    /// Nodes built so far by the enclosing rule.
    pub fn sub_nodes(&self) -> &[Node<V>] {
        &self.parent().sub_nodes
    }

    fn var_slot(&self, id: crate::api::VarId) -> Result<&(dyn Any + 'static)> {
        match self.ctx.vars[id.0].last() {
            Some(v) => Ok(&**v),
            None => bail!(GrammarError::NoVariableFrame(
                self.ctx.grammar.vars()[id.0].name.clone()
            )),
        }
    }

    pub fn var<T: Any>(&self, var: Var<T>) -> Result<&T> {
        match self.var_slot(var.id())?.downcast_ref::<T>() {
            Some(v) => Ok(v),
            None => bail!(GrammarError::VariableType(
                self.ctx.grammar.vars()[var.id().0].name.clone()
            )),
        }
    }

    pub fn var_mut<T: Any>(&mut self, var: Var<T>) -> Result<&mut T> {
        let name = &self.ctx.grammar.vars()[var.id().0].name;
        let Some(slot) = self.ctx.vars[var.id().0].last_mut() else {
            bail!(GrammarError::NoVariableFrame(name.clone()));
        };
        match slot.downcast_mut::<T>() {
            Some(v) => Ok(v),
            None => bail!(GrammarError::VariableType(name.clone())),
        }
    }

    pub fn set_var<T: Any>(&mut self, var: Var<T>, value: T) -> Result<()> {
        *self.var_mut(var)? = value;
        Ok(())
    }
}
