use std::{
    cell::{Cell, RefCell},
    panic::AssertUnwindSafe,
    rc::Rc,
    sync::Arc,
};

use anyhow::Result;

use crate::{
    api::ParsingResult,
    errors::{MatcherPath, ParseError, RunError},
    infoln,
    panic_utils,
    peg::{
        BasicMatchHandler, DefaultInputBuffer, Grammar, InputBuffer, MatchHandler,
        MatcherContext, Node, ValueStack,
    },
    Logger,
};

/// Runs a grammar over an input buffer.
pub trait ParseRunner<V> {
    fn run(&mut self, input: Rc<dyn InputBuffer>) -> Result<ParsingResult<V>, RunError<V>>;

    fn run_str(&mut self, text: &str) -> Result<ParsingResult<V>, RunError<V>> {
        self.run(Rc::new(DefaultInputBuffer::new(text)))
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PassOptions {
    pub fast_string_matching: bool,
    pub build_tree: bool,
    pub memoize: bool,
}

impl PassOptions {
    pub const BASIC: PassOptions = PassOptions {
        fast_string_matching: true,
        build_tree: true,
        memoize: true,
    };
    pub const LOCATING: PassOptions = PassOptions {
        fast_string_matching: false,
        build_tree: false,
        memoize: true,
    };
    // Markers make the outcome at a position depend on the path taken to
    // it, so recovery passes never consult the mismatch memo.
    pub const RECOVERY: PassOptions = PassOptions {
        fast_string_matching: false,
        build_tree: false,
        memoize: false,
    };
    pub const RECOVERY_FINAL: PassOptions = PassOptions {
        fast_string_matching: false,
        build_tree: true,
        memoize: false,
    };
}

#[derive(Debug)]
pub(crate) struct PassResult<V> {
    pub matched: bool,
    pub root: Option<Node<V>>,
    pub value_stack: ValueStack<V>,
    pub parse_errors: Vec<ParseError>,
}

impl<V> PassResult<V> {
    pub fn into_result(
        self,
        input_buffer: Rc<dyn InputBuffer>,
        source: Rc<dyn InputBuffer>,
    ) -> ParsingResult<V> {
        ParsingResult {
            matched: self.matched,
            parse_tree_root: if self.matched { self.root } else { None },
            value_stack: self.value_stack,
            parse_errors: self.parse_errors,
            input_buffer,
            source,
        }
    }
}

/// One complete pass of the grammar over `input`. Panics anywhere in the
/// pass come back as errors.
pub(crate) fn run_pass<V: Clone>(
    grammar: &Grammar<V>,
    input: &dyn InputBuffer,
    handler: &dyn MatchHandler<V>,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    options: PassOptions,
) -> Result<PassResult<V>> {
    let mut ctx = MatcherContext::new(grammar, input, handler, value_stack);
    ctx.parse_errors = parse_errors;
    ctx.fast_string_matching = options.fast_string_matching;
    ctx.build_tree = options.build_tree;
    ctx.memoize = options.memoize;
    let matched = panic_utils::catch_unwind(AssertUnwindSafe(|| ctx.run_root()))?;
    let (root, value_stack, parse_errors) = ctx.into_parts();
    Ok(PassResult {
        matched,
        root,
        value_stack,
        parse_errors,
    })
}

/// Records the furthest index reached by any successful match outside of a
/// TestNot. After a failed pass that is where the input went wrong.
pub struct ErrorLocatingMatchHandler<H> {
    inner: H,
    error_index: Cell<usize>,
}

impl<H> ErrorLocatingMatchHandler<H> {
    pub fn new(inner: H) -> Self {
        ErrorLocatingMatchHandler {
            inner,
            error_index: Cell::new(0),
        }
    }

    pub fn error_index(&self) -> usize {
        self.error_index.get()
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<V: Clone, H: MatchHandler<V>> MatchHandler<V> for ErrorLocatingMatchHandler<H> {
    fn run(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool> {
        if !self.inner.run(ctx)? {
            return Ok(false);
        }
        if ctx.current_index() > self.error_index.get() && !ctx.in_test_not() {
            self.error_index.set(ctx.current_index());
        }
        Ok(true)
    }
}

/// Collects the paths of the single-character matchers failing at the
/// error index.
pub struct ReportingMatchHandler<H> {
    inner: H,
    error_index: usize,
    failed_matchers: RefCell<Vec<MatcherPath>>,
}

impl<H> ReportingMatchHandler<H> {
    pub fn new(inner: H, error_index: usize) -> Self {
        ReportingMatchHandler {
            inner,
            error_index,
            failed_matchers: RefCell::new(vec![]),
        }
    }

    pub fn into_failed_matchers(self) -> Vec<MatcherPath> {
        self.failed_matchers.into_inner()
    }
}

impl<V: Clone, H: MatchHandler<V>> MatchHandler<V> for ReportingMatchHandler<H> {
    fn run(&self, ctx: &mut MatcherContext<'_, V>) -> Result<bool> {
        if self.inner.run(ctx)? {
            return Ok(true);
        }
        let single_char = ctx
            .matcher()
            .map_or(false, |m| ctx.grammar().is_single_char(m));
        if single_char && ctx.current_index() == self.error_index && !ctx.in_test_not() {
            let path = ctx.path();
            let mut failed = self.failed_matchers.borrow_mut();
            if !failed.contains(&path) {
                failed.push(path);
            }
        }
        Ok(false)
    }
}

/// Single pass with the default handler; the parse tree is built only if
/// the input matched.
pub struct BasicParseRunner<V> {
    grammar: Arc<Grammar<V>>,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    pub logger: Logger,
}

macro_rules! runner_setters {
    () => {
        pub fn with_value_stack(mut self, value_stack: ValueStack<V>) -> Self {
            self.value_stack = value_stack;
            self
        }

        pub fn with_parse_errors(mut self, parse_errors: Vec<ParseError>) -> Self {
            self.parse_errors = parse_errors;
            self
        }

        pub fn with_logger(mut self, logger: Logger) -> Self {
            self.logger = logger;
            self
        }

        pub fn grammar(&self) -> &Arc<Grammar<V>> {
            &self.grammar
        }
    };
}
pub(crate) use runner_setters;

impl<V: Clone> BasicParseRunner<V> {
    pub fn new(grammar: Arc<Grammar<V>>) -> Self {
        BasicParseRunner {
            grammar,
            value_stack: ValueStack::new(),
            parse_errors: vec![],
            logger: Logger::default(),
        }
    }

    runner_setters!();
}

impl<V: Clone> ParseRunner<V> for BasicParseRunner<V> {
    fn run(&mut self, input: Rc<dyn InputBuffer>) -> Result<ParsingResult<V>, RunError<V>> {
        let pass = run_pass(
            &self.grammar,
            &*input,
            &BasicMatchHandler,
            self.value_stack.clone(),
            self.parse_errors.clone(),
            PassOptions::BASIC,
        )?;
        infoln!(self, "basic pass: matched={}", pass.matched);
        Ok(pass.into_result(input.clone(), input))
    }
}

/// Single pass without tree building that finds where the input stops
/// matching.
pub struct ErrorLocatingParseRunner<V> {
    grammar: Arc<Grammar<V>>,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    pub logger: Logger,
    error_index: usize,
}

impl<V: Clone> ErrorLocatingParseRunner<V> {
    pub fn new(grammar: Arc<Grammar<V>>) -> Self {
        ErrorLocatingParseRunner {
            grammar,
            value_stack: ValueStack::new(),
            parse_errors: vec![],
            logger: Logger::default(),
            error_index: 0,
        }
    }

    runner_setters!();

    /// The furthest index reached by the last `run()`.
    pub fn error_index(&self) -> usize {
        self.error_index
    }
}

impl<V: Clone> ParseRunner<V> for ErrorLocatingParseRunner<V> {
    fn run(&mut self, input: Rc<dyn InputBuffer>) -> Result<ParsingResult<V>, RunError<V>> {
        let handler = ErrorLocatingMatchHandler::new(BasicMatchHandler);
        let pass = run_pass(
            &self.grammar,
            &*input,
            &handler,
            self.value_stack.clone(),
            self.parse_errors.clone(),
            PassOptions::LOCATING,
        )?;
        self.error_index = handler.error_index();
        infoln!(
            self,
            "locating pass: matched={} error_index={}",
            pass.matched,
            self.error_index
        );
        Ok(pass.into_result(input.clone(), input))
    }
}

/// Reports the first error of an invalid input together with what would
/// have been accepted there.
pub struct ReportingParseRunner<V> {
    grammar: Arc<Grammar<V>>,
    value_stack: ValueStack<V>,
    parse_errors: Vec<ParseError>,
    pub logger: Logger,
}

impl<V: Clone> ReportingParseRunner<V> {
    pub fn new(grammar: Arc<Grammar<V>>) -> Self {
        ReportingParseRunner {
            grammar,
            value_stack: ValueStack::new(),
            parse_errors: vec![],
            logger: Logger::default(),
        }
    }

    runner_setters!();
}

impl<V: Clone> ParseRunner<V> for ReportingParseRunner<V> {
    fn run(&mut self, input: Rc<dyn InputBuffer>) -> Result<ParsingResult<V>, RunError<V>> {
        let mut basic = run_pass(
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

        let locating = ErrorLocatingMatchHandler::new(BasicMatchHandler);
        run_pass(
            &self.grammar,
            &*input,
            &locating,
            self.value_stack.clone(),
            vec![],
            PassOptions::LOCATING,
        )?;
        let error_index = locating.error_index();

        let reporting = ReportingMatchHandler::new(BasicMatchHandler, error_index);
        run_pass(
            &self.grammar,
            &*input,
            &reporting,
            self.value_stack.clone(),
            vec![],
            PassOptions::LOCATING,
        )?;
        let failed_matchers = reporting.into_failed_matchers();
        infoln!(
            self,
            "error at {}; {} failed matcher(s)",
            error_index,
            failed_matchers.len()
        );

        let start_index = input.original_index(error_index);
        let input_end = input.original_index(input.len());
        basic.parse_errors.push(ParseError::InvalidInput {
            start_index,
            end_index: (start_index + 1).min(input_end),
            failed_matchers,
            message: None,
        });
        Ok(basic.into_result(input.clone(), input))
    }
}
