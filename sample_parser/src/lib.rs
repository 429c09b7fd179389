use std::sync::Arc;

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use serde::Serialize;
use pegmatch::{
    peg::{tree_to_json, Grammar, Var},
    ActionFailure, BasicParseRunner, GrammarBuilder, Logger, MatcherId, ParseRunner,
    ParsingResult, RecoveringParseRunner, RecoveryLimits, ReportingParseRunner,
};

/// Four-function calculator over non-negative integers; the value of the
/// expression ends up on top of the value stack.
///
/// ```text
/// InputLine  <- Expression EOI
/// Expression <- Term (('+' Term) / ('-' Term))*
/// Term       <- Factor (('*' Factor) / ('/' Factor))*
/// Factor     <- Number / Parens
/// Parens     <- '(' Expression ')'
/// Number     <- [0-9]+
/// ```
pub fn calculator_grammar() -> Result<Grammar<f64>> {
    let mut b = GrammarBuilder::<f64>::new();
    let expression = b.placeholder();

    let digit = b.char_range('0', '9')?;
    let digits = b.one_or_more(digit);
    let digits = b.label(digits, "Digits");
    let push_number = b.action(|ctx| {
        let text = ctx.match_text()?;
        // a resynchronized number may have no digits left
        if text.is_empty() && ctx.in_error_recovery() {
            ctx.push(0.0);
            return Ok(true);
        }
        match text.parse::<f64>() {
            Ok(n) => {
                ctx.push(n);
                Ok(true)
            }
            Err(e) => bail!(ActionFailure::new(format!("bad number {text:?}: {e}"))),
        }
    });
    let number = b.seq(&[digits, push_number]);
    let number = b.label(number, "Number");

    let open = b.ch('(');
    let close = b.ch(')');
    let parens = b.seq(&[open, expression, close]);
    let parens = b.label(parens, "Parens");
    let factor = b.first_of(&[number, parens]);
    let factor = b.label(factor, "Factor");

    let mul = binary_op(&mut b, '*', factor, |a, b| Ok(a * b));
    let div = binary_op(&mut b, '/', factor, |a, b| {
        if b == 0.0 {
            bail!(ActionFailure::new("division by zero"));
        }
        Ok(a / b)
    });
    let term_ops = b.first_of(&[mul, div]);
    let term_ops = b.zero_or_more(term_ops);
    let term = b.seq(&[factor, term_ops]);
    let term = b.label(term, "Term");

    let add = binary_op(&mut b, '+', term, |a, b| Ok(a + b));
    let sub = binary_op(&mut b, '-', term, |a, b| Ok(a - b));
    let expr_ops = b.first_of(&[add, sub]);
    let expr_ops = b.zero_or_more(expr_ops);
    let body = b.seq(&[term, expr_ops]);
    let body = b.label(body, "Expression");
    b.set_placeholder(expression, body)?;

    let eoi = b.eoi();
    let line = b.seq(&[expression, eoi]);
    let line = b.label(line, "InputLine");
    b.finalize(line)
}

fn binary_op(
    b: &mut GrammarBuilder<f64>,
    op: char,
    operand: MatcherId,
    f: impl Fn(f64, f64) -> Result<f64> + Send + Sync + 'static,
) -> MatcherId {
    let op_char = b.ch(op);
    let action = b.action(move |ctx| {
        // resynchronization may run this without both operands
        if ctx.value_stack().len() < 2 {
            return Ok(ctx.in_error_recovery());
        }
        let right = ctx.pop()?;
        let left = ctx.pop()?;
        ctx.push(f(left, right)?);
        Ok(true)
    });
    b.seq(&[op_char, operand, action])
}

/// Variables declared by the block grammar.
#[derive(Clone, Copy)]
pub struct BlockVars {
    /// Names seen directly inside the innermost open block.
    pub names: Var<Vec<String>>,
    /// Names seen anywhere; never framed, so it lives in the global frame.
    pub total: Var<usize>,
}

/// Nested blocks of single-letter names, e.g. `{a{bc}d}`. Every block gets
/// its own `names` frame and pushes the number of names directly inside it.
///
/// ```text
/// Block <- '{' (Block / Name)* '}'
/// Name  <- [a-z]
/// ```
pub fn block_grammar() -> Result<(Grammar<usize>, BlockVars)> {
    let mut b = GrammarBuilder::<usize>::new();
    let vars = BlockVars {
        names: b.var("names", Vec::new),
        total: b.var("total", || 0usize),
    };
    let block = b.placeholder();

    let letter = b.char_range('a', 'z')?;
    let record = b.action(move |ctx| {
        let name = ctx.match_text()?;
        ctx.var_mut(vars.names)?.push(name);
        *ctx.var_mut(vars.total)? += 1;
        Ok(true)
    });
    let name = b.seq(&[letter, record]);
    let name = b.label(name, "Name");

    let open = b.ch('{');
    let close = b.ch('}');
    let item = b.first_of(&[block, name]);
    let items = b.zero_or_more(item);
    let count = b.action(move |ctx| {
        let n = ctx.var(vars.names)?.len();
        ctx.push(n);
        Ok(true)
    });
    let body = b.seq(&[open, items, close, count]);
    let body = b.with_vars(body, &[vars.names.id()]);
    let body = b.label(body, "Block");
    b.set_placeholder(block, body)?;

    let eoi = b.eoi();
    let total = b.action(move |ctx| {
        let total = *ctx.var(vars.total)?;
        ctx.push(total);
        Ok(true)
    });
    let start = b.seq(&[block, eoi, total]);
    Ok((b.finalize(start)?, vars))
}

/// Comma-separated keyword list, exercising literal alternatives and
/// predicates.
///
/// ```text
/// List    <- Keyword (',' Keyword)* EOI
/// Keyword <- ("true" / "false" / "null") ![a-z]
/// ```
pub fn keyword_grammar() -> Result<Grammar<()>> {
    let mut b = GrammarBuilder::<()>::new();
    let t = b.string("true");
    let f = b.string("false");
    let n = b.string("null");
    let word = b.first_of(&[t, f, n]);
    let letter = b.char_range('a', 'z')?;
    let boundary = b.test_not(letter);
    let keyword = b.seq(&[word, boundary]);
    let keyword = b.memo_mismatches(keyword);
    let keyword = b.label(keyword, "Keyword");
    let comma = b.ch(',');
    let more = b.seq(&[comma, keyword]);
    let more = b.zero_or_more(more);
    let eoi = b.eoi();
    let list = b.seq(&[keyword, more, eoi]);
    let list = b.label(list, "List");
    b.finalize(list)
}

lazy_static! {
    pub static ref CALCULATOR: Arc<Grammar<f64>> =
        Arc::new(calculator_grammar().expect("calculator grammar"));
    pub static ref KEYWORDS: Arc<Grammar<()>> =
        Arc::new(keyword_grammar().expect("keyword grammar"));
}

pub fn parse_basic<V: Clone>(grammar: &Arc<Grammar<V>>, input: &str) -> ParsingResult<V> {
    BasicParseRunner::new(grammar.clone())
        .run_str(input)
        .unwrap_or_else(|e| panic!("basic run failed on {input:?}: {e}"))
}

pub fn parse_reporting<V: Clone>(grammar: &Arc<Grammar<V>>, input: &str) -> ParsingResult<V> {
    ReportingParseRunner::new(grammar.clone())
        .run_str(input)
        .unwrap_or_else(|e| panic!("reporting run failed on {input:?}: {e}"))
}

pub fn parse_recovering<V: Clone>(grammar: &Arc<Grammar<V>>, input: &str) -> ParsingResult<V> {
    RecoveringParseRunner::new(grammar.clone())
        .with_logger(Logger::buffered())
        .with_limits(RecoveryLimits::default())
        .run_str(input)
        .unwrap_or_else(|e| panic!("recovering run failed on {input:?}: {e}"))
}

/// Evaluates `input` with the calculator and checks the result.
pub fn check_calc(input: &str, expected: f64) {
    let r = parse_basic(&CALCULATOR, input);
    assert!(r.matched, "{input:?} did not match");
    assert!(!r.has_errors(), "{input:?}: {}", r.format_errors());
    assert_eq!(r.result_value(), Some(&expected), "value of {input:?}");
}

/// Runs the recovering runner and checks the repaired errors, given as
/// `(start, end)` offsets into `input`.
pub fn check_recovery<V: Clone>(
    grammar: &Arc<Grammar<V>>,
    input: &str,
    expected: &[(usize, usize)],
) -> ParsingResult<V> {
    let r = parse_recovering(grammar, input);
    println!("recovering {:?}:\n{}", input, r.format_errors());
    assert!(r.matched, "{input:?} not recovered");
    let spans: Vec<(usize, usize)> = r
        .parse_errors
        .iter()
        .map(|e| (e.start_index(), e.end_index()))
        .collect();
    assert_eq!(spans, expected, "error spans for {input:?}");
    r
}

/// JSON rendering of the tree; `null` when no tree was built.
pub fn tree_json<V: Clone + Serialize>(
    grammar: &Grammar<V>,
    r: &ParsingResult<V>,
) -> serde_json::Value {
    match &r.parse_tree_root {
        Some(root) => tree_to_json(root, grammar, &*r.input_buffer),
        None => serde_json::Value::Null,
    }
}
