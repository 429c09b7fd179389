use std::{cell::Cell, rc::Rc, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use instant::Instant;

use crate::{
    api::{MatcherId, ParsingResult, RecoveryLimits},
    debug,
    errors::{MatcherPath, ParseError, RecoveryTimeout, RunError},
    infoln,
    peg::{
        BasicMatchHandler, Grammar, InputBuffer, MatchHandler, MatcherContext, MatcherKind,
        MutableInputBuffer, ValueStack, DEL_ERROR, EOI, INS_ERROR, RESYNC, RESYNC_END,
        RESYNC_EOI, RESYNC_START,
    },
    runner::{
        run_pass, runner_setters, ErrorLocatingMatchHandler, ParseRunner, PassOptions,
        PassResult, ReportingMatchHandler,
    },
    warn, Logger,
};

/// Handler used by every pass over a buffer carrying recovery markers.
///
/// A single-character matcher standing on a DEL or INS marker skips it (and
/// the deleted character) only if a zero-width trial match after the skip
/// succeeds. A sequence failing on a resync marker is forced to succeed by
/// skipping the resynchronization region. Once the rest of the input has been
/// skipped, every sequence that consumed input and then fails at the end of
/// the input is closed the same way.
pub struct RecoveringMatchHandler {
    started: Instant,
    deadline: Option<Instant>,
    // where the first bare RESYNC region of the pass ended
    resync_end: Cell<Option<usize>>,
    skipped_to_end: Cell<bool>,
}

impl RecoveringMatchHandler {
    pub fn new(started: Instant, deadline: Option<Instant>) -> Self {
        RecoveringMatchHandler {
            started,
            deadline,
            resync_end: Cell::new(None),
            skipped_to_end: Cell::new(false),
        }
    }

    pub fn resync_end(&self) -> Option<usize> {
        self.resync_end.get()
    }

    /// True once a RESYNC_EOI region was skipped in this pass.
    pub fn skipped_to_end(&self) -> bool {
        self.skipped_to_end.get()
    }

    fn check_timeout(&self) -> Result<()> {
        check_deadline(self.started, self.deadline)
    }

    fn prepare_error_location<V: Clone>(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool> {
        match ctx.current_char() {
            DEL_ERROR => {
                // there is nothing to delete at the end of the input
                if ctx.input().char_at(ctx.current_index() + 1) == EOI {
                    return Ok(false);
                }
                self.will_match_error(ctx, 2)
            }
            INS_ERROR => self.will_match_error(ctx, 1),
            _ => Ok(true),
        }
    }

    fn will_match_error<V: Clone>(
        &self,
        ctx: &mut MatcherContext<'_, V>,
        skip: usize,
    ) -> Result<bool> {
        let pre_skip = ctx.current_index();
        ctx.advance_index(skip);
        if !ctx.run_trial_match()? {
            ctx.set_current_index(pre_skip);
            return Ok(false);
        }
        ctx.set_start_index(ctx.current_index());
        ctx.clear_node_suppression();
        ctx.mark_error();
        Ok(true)
    }

    fn resynchronize<V: Clone>(
        &self,
        ctx: &mut MatcherContext<'_, V>,
        target: MatcherId,
    ) -> Result<()> {
        ctx.clear_node_suppression();
        ctx.mark_error();

        let grammar = ctx.grammar();
        let children = &grammar.matcher(target).children;
        let failed = ctx.tag();

        // rebuild nodes and values of the children that matched before the
        // failure; the sequence already rolled them back
        let start = ctx.start_index();
        ctx.set_current_index(start);
        ctx.clear_sub_nodes();
        for (idx, &child) in children.iter().enumerate().take(failed) {
            ctx.set_tag(idx);
            ctx.run_child(child)?;
        }
        ctx.set_tag(failed);

        match ctx.current_char() {
            RESYNC => {
                ctx.advance_index(1);
                let followers = follower_matchers(ctx);
                loop {
                    let c = ctx.current_char();
                    if c == EOI || followers.iter().any(|&f| grammar.can_start_with(f, c)) {
                        break;
                    }
                    ctx.advance_index(1);
                }
                if self.resync_end.get().is_none() {
                    self.resync_end.set(Some(ctx.current_index()));
                }
            }
            RESYNC_START => {
                ctx.advance_index(1);
                while !matches!(ctx.current_char(), RESYNC_END | EOI) {
                    ctx.advance_index(1);
                }
                if ctx.current_char() == RESYNC_END {
                    ctx.advance_index(1);
                }
            }
            RESYNC_END => ctx.advance_index(1),
            RESYNC_EOI => {
                let end = ctx.input().len();
                ctx.set_current_index(end);
                self.skipped_to_end.set(true);
            }
            _ => {}
        }
        debug!(
            "  resynchronized {} at {}..{}",
            grammar.label(target),
            start,
            ctx.current_index()
        );

        // the remaining actions still run, but their outcome is ignored
        let was_recovering = ctx.error_recovery;
        ctx.error_recovery = true;
        let mut r = Ok(());
        for (idx, &child) in children.iter().enumerate().skip(failed) {
            if matches!(grammar.matcher(child).kind, MatcherKind::Action(_)) {
                ctx.set_tag(idx);
                if let Err(e) = ctx.run_child(child) {
                    r = Err(e);
                    break;
                }
            }
        }
        ctx.error_recovery = was_recovering;
        r?;

        ctx.create_node();
        Ok(())
    }
}

impl<V: Clone> MatchHandler<V> for RecoveringMatchHandler {
    fn run(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool> {
        let grammar = ctx.grammar();
        let Some(id) = ctx.matcher() else {
            return ctx.match_current();
        };
        let target = grammar.unwrap(id);
        let kind = &grammar.matcher(target).kind;
        if kind.is_single_char() {
            return Ok(self.prepare_error_location(ctx)? && ctx.match_current()?);
        }
        if ctx.match_current()? {
            return Ok(true);
        }
        if matches!(kind, MatcherKind::Sequence | MatcherKind::String(_)) && !ctx.in_predicate() {
            self.check_timeout()?;
            let c = ctx.current_char();
            let unclosed_at_end =
                c == EOI && self.skipped_to_end.get() && ctx.current_index() > ctx.start_index();
            if unclosed_at_end || matches!(c, RESYNC | RESYNC_START | RESYNC_END | RESYNC_EOI) {
                // the replayed children run inside the wrapper's variable frames
                ctx.open_var_frames(id);
                let r = self.resynchronize(ctx, target);
                ctx.close_var_frames(id);
                r?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check_deadline(started: Instant, deadline: Option<Instant>) -> Result<()> {
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            bail!(RecoveryTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
    }
    Ok(())
}

/// Matchers that may legally come right after the running sequence,
/// collected from the enclosing sequences and loops.
fn follower_matchers<V: Clone>(ctx: &MatcherContext<'_, V>) -> Vec<MatcherId> {
    let grammar = ctx.grammar();
    let mut r = vec![];
    for f in ctx.frames[..ctx.level].iter().rev() {
        let Some(id) = f.matcher else {
            continue;
        };
        let m = grammar.matcher(grammar.unwrap(id));
        match &m.kind {
            MatcherKind::Sequence | MatcherKind::String(_) => {
                for &child in m.children.iter().skip(f.tag + 1) {
                    r.push(child);
                    if !grammar.can_match_empty(child) {
                        return r;
                    }
                }
            }
            MatcherKind::ZeroOrMore | MatcherKind::OneOrMore => r.push(m.children[0]),
            _ => {}
        }
    }
    r
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    c: Option<char>,
    next_error: usize,
    // length of the shortest failed path the character was taken from
    depth: usize,
}

impl Candidate {
    const NONE: Candidate = Candidate {
        c: None,
        next_error: 0,
        depth: usize::MAX,
    };

    // Equal progress goes to the matcher closest to the root, which closes
    // open constructs before opening new ones.
    fn beats(&self, best: &Candidate) -> bool {
        best.c.is_none()
            || self.next_error > best.next_error
            || (self.next_error == best.next_error && self.depth < best.depth)
    }
}

enum Insertion {
    ErrorFree(char),
    Best(Candidate),
}

#[derive(Debug, PartialEq, Eq)]
enum Fix {
    /// The input now parses without errors.
    ErrorFree,
    /// A single character was deleted, inserted or replaced.
    Patched,
    /// Input up to a follower of the failing sequence is skipped.
    Resynced,
    /// The rest of the input is skipped.
    SkippedToEnd,
}

/// How far the repair of errors at one original position has escalated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    SingleChar,
    Resynced,
    SkippedToEnd,
}

// Repair state of the original position the runner is stuck at.
struct Spot {
    start: usize,
    // shortest failed path seen when the last single-char fix was chosen
    depth: usize,
    stage: Stage,
}

impl Spot {
    fn new(start: usize) -> Self {
        Spot {
            start,
            depth: usize::MAX,
            stage: Stage::SingleChar,
        }
    }
}

struct Recovery<'r, V> {
    grammar: &'r Grammar<V>,
    limits: &'r RecoveryLimits,
    logger: &'r mut Logger,
    buffer: MutableInputBuffer,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    started: Instant,
    deadline: Option<Instant>,
    error_index: usize,
    resync_end: Option<usize>,
    failed_matchers: Vec<MatcherPath>,
    // position in parse_errors of the error being repaired
    current_error: usize,
}

impl<V: Clone> Recovery<'_, V> {
    fn handler(&self) -> RecoveringMatchHandler {
        RecoveringMatchHandler::new(self.started, self.deadline)
    }

    fn run_locating_match(&mut self) -> Result<bool> {
        let handler = ErrorLocatingMatchHandler::new(self.handler());
        let pass = run_pass(
            self.grammar,
            &self.buffer,
            &handler,
            self.value_stack.clone(),
            vec![],
            PassOptions::RECOVERY,
        )?;
        self.error_index = handler.error_index();
        self.resync_end = handler.inner().resync_end();
        debug!(
            "  locating: matched={} error_index={}",
            pass.matched, self.error_index
        );
        Ok(pass.matched)
    }

    fn run_reporting_match(&mut self) -> Result<()> {
        let handler = ReportingMatchHandler::new(self.handler(), self.error_index);
        run_pass(
            self.grammar,
            &self.buffer,
            &handler,
            self.value_stack.clone(),
            vec![],
            PassOptions::RECOVERY,
        )?;
        self.failed_matchers = handler.into_failed_matchers();
        let start_index = self.buffer.original_index(self.error_index);
        let error = ParseError::InvalidInput {
            start_index,
            end_index: (start_index + 1).min(self.buffer.original().len()),
            failed_matchers: self.failed_matchers.clone(),
            message: None,
        };
        infoln!(
            self,
            "invalid input at {} (buffer index {}), expected {:?}",
            start_index,
            self.error_index,
            error.expected_labels()
        );
        self.parse_errors.push(error);
        self.current_error = self.parse_errors.len() - 1;
        Ok(())
    }

    // Shortest path among the matchers that failed at the error.
    fn failed_depth(&self) -> usize {
        self.failed_matchers
            .iter()
            .map(|p| p.len())
            .min()
            .unwrap_or(0)
    }

    fn set_error_end(&mut self, end: usize) {
        if let Some(ParseError::InvalidInput { end_index, .. }) =
            self.parse_errors.get_mut(self.current_error)
        {
            *end_index = end;
        }
    }

    fn try_fix_by_single_char_deletion(&mut self, fix_index: usize) -> Result<bool> {
        self.buffer.insert_char(fix_index, DEL_ERROR);
        let error_free = self.run_locating_match()?;
        if !error_free {
            self.buffer.undo_char_insertion(fix_index)?;
        }
        Ok(error_free)
    }

    // Tries the starter character of every failed matcher; the one pushing
    // the next error furthest wins, ties go to the shallowest matcher.
    fn find_best_single_char_insertion(&mut self, fix_index: usize) -> Result<Insertion> {
        let mut candidates: Vec<(char, usize)> = vec![];
        for path in &self.failed_matchers {
            let starter = path
                .last()
                .and_then(|e| self.grammar.starter_char(e.matcher));
            let Some(c) = starter else {
                continue;
            };
            // conjuring up an EOI would end the input early
            if c == EOI {
                continue;
            }
            match candidates.iter_mut().find(|(prev, _)| *prev == c) {
                Some((_, depth)) => *depth = (*depth).min(path.len()),
                None => candidates.push((c, path.len())),
            }
        }

        let mut best = Candidate::NONE;
        for (c, depth) in candidates {
            self.buffer.insert_char(fix_index, c);
            self.buffer.insert_char(fix_index, INS_ERROR);
            if self.run_locating_match()? {
                return Ok(Insertion::ErrorFree(c));
            }
            infoln!(
                self,
                "  inserting {:?}: next error at {}",
                c,
                self.error_index
            );
            let candidate = Candidate {
                c: Some(c),
                next_error: self.error_index,
                depth,
            };
            if candidate.beats(&best) {
                best = candidate;
            }
            self.buffer.undo_char_insertion(fix_index)?;
            self.buffer.undo_char_insertion(fix_index)?;
        }
        Ok(Insertion::Best(best))
    }

    fn fix_error(&mut self, fix_index: usize) -> Result<Fix> {
        let start = self.buffer.original_index(fix_index);
        // past the end there is nothing to delete or replace
        let at_end = self.buffer.char_at(fix_index) == EOI;

        let after_deletion = if at_end {
            fix_index
        } else {
            if self.try_fix_by_single_char_deletion(fix_index)? {
                infoln!(self, "  fixed by deleting the character at {}", start);
                self.set_error_end(start + 1);
                return Ok(Fix::ErrorFree);
            }
            infoln!(self, "  deleting: next error at {}", self.error_index);
            self.error_index
        };

        let insertion = match self.find_best_single_char_insertion(fix_index)? {
            Insertion::ErrorFree(c) => {
                infoln!(self, "  fixed by inserting {:?} at {}", c, start);
                self.set_error_end(start);
                return Ok(Fix::ErrorFree);
            }
            Insertion::Best(b) => b,
        };

        let replacement = if at_end {
            Candidate::NONE
        } else {
            // the deleted character sits after the inserted one
            self.buffer.insert_char(fix_index, DEL_ERROR);
            let best = match self.find_best_single_char_insertion(fix_index)? {
                Insertion::ErrorFree(c) => {
                    infoln!(
                        self,
                        "  fixed by replacing the character at {} with {:?}",
                        start,
                        c
                    );
                    self.set_error_end(start + 1);
                    return Ok(Fix::ErrorFree);
                }
                Insertion::Best(b) => b,
            };
            self.buffer.undo_char_insertion(fix_index)?;
            best
        };

        if after_deletion >= insertion.next_error
            && after_deletion >= replacement.next_error
            && fix_index < after_deletion
        {
            infoln!(self, "  deleting the character at {}", start);
            self.buffer.insert_char(fix_index, DEL_ERROR);
            self.set_error_end(start + 1);
        } else if let Some(c) = insertion
            .c
            .filter(|_| insertion.next_error >= replacement.next_error)
            .filter(|_| fix_index < insertion.next_error)
        {
            infoln!(self, "  inserting {:?} at {}", c, start);
            self.buffer.insert_char(fix_index, c);
            self.buffer.insert_char(fix_index, INS_ERROR);
            self.set_error_end(start);
        } else if let Some(c) = replacement.c.filter(|_| fix_index < replacement.next_error) {
            infoln!(self, "  replacing the character at {} with {:?}", start, c);
            self.buffer.insert_char(fix_index, DEL_ERROR);
            self.buffer.insert_char(fix_index, c);
            self.buffer.insert_char(fix_index, INS_ERROR);
            self.set_error_end(start + 1);
        } else {
            return self.resynchronize(fix_index);
        }
        Ok(Fix::Patched)
    }

    // No single-character fix helps: skip input up to something that can
    // follow the failing sequence. Without such a follower the rest of the
    // input goes.
    fn resynchronize(&mut self, fix_index: usize) -> Result<Fix> {
        self.buffer.insert_char(fix_index, RESYNC);
        self.run_locating_match()?;
        match self.resync_end.filter(|&end| end < self.buffer.len()) {
            Some(end) => {
                let original_end = self.buffer.original_index(end);
                self.buffer.replace_inserted_char(fix_index, RESYNC_START)?;
                self.buffer.insert_char(end, RESYNC_END);
                self.set_error_end(original_end);
                infoln!(self, "  resynchronizing up to {}", original_end);
                Ok(Fix::Resynced)
            }
            None => {
                self.buffer.replace_inserted_char(fix_index, RESYNC_EOI)?;
                self.skip_to_end()
            }
        }
    }

    fn skip_to_end(&mut self) -> Result<Fix> {
        let original_end = self.buffer.original().len();
        self.set_error_end(original_end);
        infoln!(self, "  resynchronizing up to the end of input");
        Ok(Fix::SkippedToEnd)
    }

    fn check_timeout(&self) -> Result<()> {
        check_deadline(self.started, self.deadline)
    }

    // Picks the repair for the error at `fix_index`. Single-char fixes are
    // tried while each one leaves the error in a shallower matcher; after
    // that the input is resynchronized, then skipped to the end.
    fn escalate(&mut self, spot: &mut Spot, fix_index: usize) -> Result<Fix> {
        let depth = self.failed_depth();
        let fix = match spot.stage {
            Stage::SingleChar if depth < spot.depth => {
                spot.depth = depth;
                self.fix_error(fix_index)?
            }
            Stage::SingleChar => self.resynchronize(fix_index)?,
            Stage::Resynced | Stage::SkippedToEnd => {
                self.buffer.insert_char(fix_index, RESYNC_EOI);
                self.skip_to_end()?
            }
        };
        let reached = match fix {
            Fix::ErrorFree | Fix::Patched => Stage::SingleChar,
            Fix::Resynced => Stage::Resynced,
            Fix::SkippedToEnd => Stage::SkippedToEnd,
        };
        spot.stage = spot.stage.max(reached);
        Ok(fix)
    }

    fn run(&mut self) -> Result<PassResult<V>> {
        let mut num_fixes = 0;
        let mut spot: Option<Spot> = None;
        if !self.run_locating_match()? {
            loop {
                self.check_timeout()?;
                if num_fixes >= self.limits.max_error_fixes {
                    warn!(
                        self,
                        "giving up error recovery after {} fixes",
                        num_fixes
                    );
                    break;
                }
                let fix_index = self.error_index;
                let start = self.buffer.original_index(fix_index);
                let mut here = match spot.take() {
                    Some(s) if s.start == start => s,
                    _ => Spot::new(start),
                };
                if here.stage == Stage::SkippedToEnd {
                    warn!(self, "cannot recover from the error at {}", start);
                    break;
                }
                self.run_reporting_match()?;
                num_fixes += 1;
                if self.escalate(&mut here, fix_index)? == Fix::ErrorFree {
                    break;
                }
                spot = Some(here);
                if self.run_locating_match()? {
                    break;
                }
                if self.buffer.original_index(self.error_index) < start {
                    warn!(self, "error recovery stalled at {}", start);
                    break;
                }
            }
        }
        infoln!(
            self,
            "recovery done: {} fix(es), {} marker(s) injected",
            num_fixes,
            self.buffer.num_insertions()
        );
        let handler = self.handler();
        run_pass(
            self.grammar,
            &self.buffer,
            &handler,
            self.value_stack.clone(),
            self.parse_errors.clone(),
            PassOptions::RECOVERY_FINAL,
        )
    }
}

/// Never gives up on recoverable input: repairs it one error at a time in a
/// `MutableInputBuffer` and reports every repaired error.
pub struct RecoveringParseRunner<V> {
    grammar: Arc<Grammar<V>>,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    pub logger: Logger,
    limits: RecoveryLimits,
}

impl<V: Clone> RecoveringParseRunner<V> {
    pub fn new(grammar: Arc<Grammar<V>>) -> Self {
        RecoveringParseRunner {
            grammar,
            value_stack: ValueStack::new(),
            parse_errors: vec![],
            logger: Logger::default(),
            limits: RecoveryLimits::default(),
        }
    }

    runner_setters!();

    pub fn with_limits(mut self, limits: RecoveryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &RecoveryLimits {
        &self.limits
    }
}

impl<V: Clone> ParseRunner<V> for RecoveringParseRunner<V> {
    fn run(&mut self, input: Rc<dyn InputBuffer>) -> Result<ParsingResult<V>, RunError<V>> {
        let started = Instant::now();
        let basic = run_pass(
            &self.grammar,
            &*input,
            &BasicMatchHandler,
            self.value_stack.clone(),
            self.parse_errors.clone(),
            PassOptions::BASIC,
        )?;
        if basic.matched {
            return Ok(basic.into_result(input.clone(), input));
        }
        infoln!(self, "input does not match; starting error recovery");

        let mut recovery = Recovery {
            grammar: &self.grammar,
            limits: &self.limits,
            logger: &mut self.logger,
            buffer: MutableInputBuffer::new(input.clone()),
            value_stack: self.value_stack.clone(),
            parse_errors: self.parse_errors.clone(),
            started,
            deadline: self
                .limits
                .timeout_ms
                .map(|ms| started + Duration::from_millis(ms)),
            error_index: 0,
            resync_end: None,
            failed_matchers: vec![],
            current_error: 0,
        };
        match recovery.run() {
            Ok(pass) => {
                let buffer: Rc<dyn InputBuffer> = Rc::new(recovery.buffer);
                Ok(pass.into_result(buffer, input))
            }
            Err(e) => {
                let Some(timeout) = e.downcast_ref::<RecoveryTimeout>() else {
                    return Err(RunError::Fatal(e));
                };
                let elapsed_ms = timeout.elapsed_ms;
                let partial = PassResult {
                    matched: false,
                    root: None,
                    value_stack: basic.value_stack,
                    parse_errors: recovery.parse_errors,
                };
                let buffer: Rc<dyn InputBuffer> = Rc::new(recovery.buffer);
                Err(RunError::Timeout {
                    elapsed_ms,
                    last_result: Box::new(partial.into_result(buffer, input)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peg::DefaultInputBuffer, GrammarBuilder};

    // (ab) c
    fn nested_grammar() -> Grammar<()> {
        let mut b = GrammarBuilder::<()>::new();
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        let inner = b.seq(&[a, bb]);
        let inner = b.label(inner, "Inner");
        let outer = b.seq(&[inner, c]);
        b.finalize(outer).unwrap()
    }

    fn marked_buffer(text: &str, marks: &[(usize, char)]) -> MutableInputBuffer {
        let mut buf = MutableInputBuffer::new(Rc::new(DefaultInputBuffer::new(text)));
        for &(idx, c) in marks {
            buf.insert_char(idx, c);
        }
        buf
    }

    fn final_pass(
        g: &Grammar<()>,
        buf: &MutableInputBuffer,
        handler: &RecoveringMatchHandler,
    ) -> PassResult<()> {
        run_pass(
            g,
            buf,
            handler,
            ValueStack::new(),
            vec![],
            PassOptions::RECOVERY_FINAL,
        )
        .unwrap()
    }

    #[test]
    fn test_resync_stops_at_follower() {
        let g = nested_grammar();
        let buf = marked_buffer("axxc", &[(1, RESYNC)]);
        let handler = RecoveringMatchHandler::new(Instant::now(), None);
        let r = final_pass(&g, &buf, &handler);
        assert!(r.matched);
        assert_eq!(handler.resync_end(), Some(4));
        let root = r.root.unwrap();
        assert!(root.has_error());
        let inner = root.find_by_label(&g, "Inner").unwrap();
        assert!(inner.has_error());
        assert_eq!((inner.start_index(), inner.end_index()), (0, 4));
    }

    #[test]
    fn test_resync_region_is_skipped() {
        let g = nested_grammar();
        // a [START] x x [END] c
        let buf = marked_buffer("axxc", &[(1, RESYNC_START), (4, RESYNC_END)]);
        let handler = RecoveringMatchHandler::new(Instant::now(), None);
        let r = final_pass(&g, &buf, &handler);
        assert!(r.matched);
        assert_eq!(handler.resync_end(), None);
        let root = r.root.unwrap();
        assert_eq!(root.text(&buf), "ac");
        assert_eq!(root.end_index(), buf.len());
    }

    #[test]
    fn test_markers_skipped_only_when_followed_by_match() {
        let g = nested_grammar();
        let handler = RecoveringMatchHandler::new(Instant::now(), None);

        // a [DEL] x b c
        let buf = marked_buffer("axbc", &[(1, DEL_ERROR)]);
        let r = final_pass(&g, &buf, &handler);
        assert!(r.matched);
        assert_eq!(r.root.unwrap().text(&buf), "abc");

        // a [INS] b c, the conjured 'b' is part of the text
        let buf = marked_buffer("ac", &[(1, 'b'), (1, INS_ERROR)]);
        let r = final_pass(&g, &buf, &handler);
        assert!(r.matched);
        assert_eq!(r.root.unwrap().text(&buf), "abc");

        // a [DEL] x y c: deleting one char is not enough
        let buf = marked_buffer("axyc", &[(1, DEL_ERROR)]);
        assert!(!final_pass(&g, &buf, &handler).matched);
    }

    #[test]
    fn test_skip_to_end_closes_enclosing_sequences() {
        let g = nested_grammar();
        // a [EOI region]: Inner is skipped to the end, the outer sequence
        // then fails on EOI after consuming 'a' and is closed as well
        let buf = marked_buffer("a", &[(1, RESYNC_EOI)]);
        let handler = RecoveringMatchHandler::new(Instant::now(), None);
        let r = final_pass(&g, &buf, &handler);
        assert!(r.matched);
        assert!(handler.skipped_to_end());
        let root = r.root.unwrap();
        assert_eq!(root.end_index(), buf.len());
        assert_eq!(root.text(&buf), "a");

        // without a skipped region a failure at EOI is a plain failure
        let buf = marked_buffer("a", &[]);
        let handler = RecoveringMatchHandler::new(Instant::now(), None);
        assert!(!final_pass(&g, &buf, &handler).matched);
        assert!(!handler.skipped_to_end());
    }

    // Group <- vars(letters) '(' [a-z]* record ')' count
    // Start <- Group outer
    fn framed_grammar() -> Grammar<usize> {
        let mut b = GrammarBuilder::<usize>::new();
        let letters = b.var("letters", || 0usize);
        let letter = b.char_range('a', 'z').unwrap();
        let items = b.zero_or_more(letter);
        let record = b.action(move |ctx| {
            let n = ctx.match_text()?.chars().count();
            *ctx.var_mut(letters)? = n;
            Ok(true)
        });
        let open = b.ch('(');
        let close = b.ch(')');
        let count = b.action(move |ctx| {
            let n = *ctx.var(letters)?;
            ctx.push(n);
            Ok(true)
        });
        let group = b.seq(&[open, items, record, close, count]);
        let group = b.with_vars(group, &[letters.id()]);
        let outer = b.action(move |ctx| {
            let n = *ctx.var(letters)?;
            ctx.push(n);
            Ok(true)
        });
        let start = b.seq(&[group, outer]);
        b.finalize(start).unwrap()
    }

    #[test]
    fn test_resync_replays_in_variable_frames() {
        let g = framed_grammar();
        // ( a b [EOI region]: the group is resynchronized, its letters are
        // counted in the group's own frame
        let buf = marked_buffer("(ab", &[(3, RESYNC_EOI)]);
        let handler = RecoveringMatchHandler::new(Instant::now(), None);
        let r = run_pass(
            &g,
            &buf,
            &handler,
            ValueStack::new(),
            vec![],
            PassOptions::RECOVERY_FINAL,
        )
        .unwrap();
        assert!(r.matched);
        assert_eq!(r.value_stack.to_vec(), vec![2, 0]);
    }

    #[test]
    fn test_expired_deadline() {
        let g = nested_grammar();
        let buf = marked_buffer("ax", &[]);
        let started = Instant::now();
        let handler = RecoveringMatchHandler::new(started, Some(started));
        let err = run_pass(
            &g,
            &buf,
            &handler,
            ValueStack::new(),
            vec![],
            PassOptions::RECOVERY,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<RecoveryTimeout>().is_some());
    }
}
