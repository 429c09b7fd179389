use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use pegmatch::{
    errors::ParseError,
    peg::{Grammar, InputBuffer},
    BasicParseRunner, ErrorLocatingParseRunner, GrammarBuilder, GrammarError, Logger,
    ParseRunner, RecoveringParseRunner, RecoveryLimits, RunError,
};
use sample_parser::*;
use serde_json::json;

fn grammar<V>(build: impl FnOnce(&mut GrammarBuilder<V>) -> pegmatch::MatcherId) -> Arc<Grammar<V>> {
    let mut b = GrammarBuilder::new();
    let start = build(&mut b);
    Arc::new(b.finalize(start).unwrap())
}

// 'a' 'b'+ 'c'
fn abc_grammar() -> Arc<Grammar<()>> {
    grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        let bs = b.one_or_more(bb);
        b.seq(&[a, bs, c])
    })
}

#[test]
fn test_first_of_picks_matching_alternative() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        b.first_of(&[a, bb, c])
    });
    let r = parse_basic(&g, "b");
    assert!(r.matched);
    let root = r.parse_tree_root.as_ref().unwrap();
    assert_eq!(root.end_index(), 1);
    assert_eq!(root.children().len(), 1);
    assert_eq!(root.children()[0].label(&g), "'b'");
}

#[test]
fn test_lookahead_is_zero_width() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let t = b.test(a);
        b.seq(&[t, a])
    });
    let r = parse_basic(&g, "a");
    assert!(r.matched);
    assert_eq!(
        tree_json(&g, &r),
        json!({
            "label": "Sequence",
            "text": "a",
            "start": 0,
            "end": 1,
            "children": [{"label": "'a'", "text": "a", "start": 0, "end": 1}]
        })
    );

    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let not_a = b.test_not(a);
        let any = b.any();
        b.seq(&[not_a, any])
    });
    assert!(parse_basic(&g, "x").matched);
    assert!(!parse_basic(&g, "a").matched);
}

#[test]
fn test_node_flags_shape_the_tree() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let a = b.label(a, "A");
        let bb = b.ch('b');
        let bb = b.label(bb, "B");
        let bb = b.suppress_node(bb);
        let c = b.ch('c');
        let d = b.ch('d');
        let cd = b.seq(&[c, d]);
        let cd = b.label(cd, "CD");
        let cd = b.suppress_subnodes(cd);
        let e = b.ch('e');
        let f = b.ch('f');
        let ef = b.seq(&[e, f]);
        let ef = b.label(ef, "EF");
        let ef = b.skip_node(ef);
        b.seq(&[a, bb, cd, ef])
    });
    let r = parse_basic(&g, "abcdef");
    assert!(r.matched);
    assert_eq!(
        tree_json(&g, &r),
        json!({
            "label": "Sequence",
            "text": "abcdef",
            "start": 0,
            "end": 6,
            "children": [
                {"label": "A", "text": "a", "start": 0, "end": 1},
                {"label": "CD", "text": "cd", "start": 2, "end": 4},
                {"label": "'e'", "text": "e", "start": 4, "end": 5},
                {"label": "'f'", "text": "f", "start": 5, "end": 6}
            ]
        })
    );
}

#[test]
fn test_wrapped_rules_keep_label_and_flags() {
    let r = parse_basic(&KEYWORDS, "true,null");
    assert!(r.matched);
    let root = r.parse_tree_root.as_ref().unwrap();
    assert_eq!(root.label(&KEYWORDS), "List");
    let keywords = root.collect(|n| n.label(&KEYWORDS) == "Keyword");
    let texts: Vec<String> = keywords.iter().map(|n| r.node_text(n)).collect();
    assert_eq!(texts, vec!["true", "null"]);
    assert_eq!(root.children()[0].label(&KEYWORDS), "Keyword");

    let (blocks, _) = block_grammar().unwrap();
    let blocks = Arc::new(blocks);
    let r = parse_basic(&blocks, "{a{b}}");
    let root = r.parse_tree_root.as_ref().unwrap();
    assert_eq!(root.children()[0].label(&blocks), "Block");
    let texts: Vec<String> = root
        .collect(|n| n.label(&blocks) == "Block")
        .iter()
        .map(|n| r.node_text(n))
        .collect();
    assert_eq!(texts, vec!["{a{b}}", "{b}"]);

    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let x = b.ch('x');
        let y = b.ch('y');
        let xy = b.seq(&[x, y]);
        let xy = b.memo_mismatches(xy);
        b.suppress_subnodes(xy)
    });
    let r = parse_basic(&g, "xy");
    assert!(r.matched);
    assert_eq!(
        tree_json(&g, &r),
        json!({"label": "Sequence", "text": "xy", "start": 0, "end": 2})
    );
}

#[test]
fn test_ignore_case() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let kw = b.ignore_case_string("select");
        let x = b.ignore_case('x');
        let eoi = b.eoi();
        b.seq(&[kw, x, eoi])
    });
    assert!(parse_basic(&g, "selectx").matched);
    let r = parse_basic(&g, "SeLeCtX");
    assert!(r.matched);
    let kw = &r.parse_tree_root.as_ref().unwrap().children()[0];
    assert_eq!(kw.label(&g), "\"select\"");
    assert!(kw.children().is_empty());
    assert_eq!(r.node_text(kw), "SeLeCt");

    let r = parse_reporting(&g, "selecty");
    assert!(!r.matched);
    assert_eq!(r.parse_errors[0].start_index(), 6);
    assert_eq!(r.parse_errors[0].expected_labels(), vec!["'x/X'"]);
}

// ('a' 'b' with a call counter) tried by two alternatives at the same
// position before "ac" matches.
fn counting_grammar(memoize: bool, calls: Arc<AtomicUsize>) -> Arc<Grammar<()>> {
    grammar(|b: &mut GrammarBuilder<()>| {
        let count = b.action(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        let x = b.ch('x');
        let y = b.ch('y');
        let rule = b.seq(&[count, a, bb]);
        let rule = if memoize { b.memo_mismatches(rule) } else { rule };
        let first = b.seq(&[rule, x]);
        let second = b.seq(&[rule, y]);
        let third = b.seq(&[a, c]);
        b.first_of(&[first, second, third])
    })
}

#[test]
fn test_memoized_mismatch_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let g = counting_grammar(true, calls.clone());
    assert!(parse_basic(&g, "ac").matched);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let g = counting_grammar(false, calls.clone());
    assert!(parse_basic(&g, "ac").matched);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_actions_skipped_in_predicates() {
    for skip in [true, false] {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let g = grammar(move |b: &mut GrammarBuilder<()>| {
            let a = b.ch('a');
            let count = b.action(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            });
            let count = if skip { b.skip_in_predicates(count) } else { count };
            let body = b.seq(&[a, count]);
            let ahead = b.test(body);
            b.seq(&[ahead, body])
        });
        assert!(parse_basic(&g, "a").matched);
        let expected = if skip { 1 } else { 2 };
        assert_eq!(calls.load(Ordering::SeqCst), expected, "skip={skip}");
    }
}

#[test]
fn test_missing_char_is_inserted() {
    let g = abc_grammar();

    let r = parse_basic(&g, "ac");
    assert!(!r.matched);
    assert!(r.parse_tree_root.is_none());

    let r = check_recovery(&g, "ac", &[(1, 1)]);
    assert_eq!(r.parse_errors[0].expected_labels(), vec!["'b'"]);
    assert_eq!(
        r.format_errors(),
        "Invalid input 'c', expected 'b' (line 1, pos 2):\nac\n ^\n"
    );

    let root = r.parse_tree_root.as_ref().unwrap();
    assert!(root.has_error());
    let loop_node = root.find_by_label(&g, "OneOrMore").unwrap();
    assert!(loop_node.has_error());
    let buf = &r.input_buffer;
    assert_eq!(buf.original_index(loop_node.start_index()), 1);
    assert_eq!(buf.original_index(loop_node.end_index()), 1);
    assert_eq!(r.node_text(loop_node), "b");
    assert_eq!(r.node_text(root), "abc");
}

#[test]
fn test_reporting_runner() {
    let g = abc_grammar();
    let r = parse_reporting(&g, "ac");
    assert!(!r.matched);
    assert_eq!(r.parse_errors.len(), 1);
    assert_eq!(r.parse_errors[0].start_index(), 1);
    assert_eq!(r.parse_errors[0].end_index(), 2);
    assert_eq!(
        r.format_errors(),
        "Invalid input 'c', expected 'b' (line 1, pos 2):\nac\n ^\n"
    );

    // matching input goes through a single pass without errors
    let r = parse_reporting(&g, "abbc");
    assert!(r.matched);
    assert!(!r.has_errors());

    // an error at the end of the input does not span past it
    let r = parse_reporting(&g, "ab");
    assert_eq!(r.parse_errors[0].start_index(), 2);
    assert_eq!(r.parse_errors[0].end_index(), 2);

    let mut locating = ErrorLocatingParseRunner::new(g.clone());
    let r = locating.run_str("abxc").unwrap();
    assert!(!r.matched);
    assert_eq!(locating.error_index(), 2);
}

#[test]
fn test_expected_alternatives() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let bb = b.ch('b');
        let c = b.ch('c');
        let d = b.ch('d');
        let alt = b.first_of(&[bb, c]);
        b.seq(&[a, alt, d])
    });
    let r = parse_reporting(&g, "ad");
    assert_eq!(
        r.format_errors(),
        "Invalid input 'd', expected 'b' or 'c' (line 1, pos 2):\nad\n ^\n"
    );
    let r = check_recovery(&g, "ad", &[(1, 1)]);
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "abd");
}

#[test]
fn test_deletion_and_replacement() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let s = b.string("abc");
        let eoi = b.eoi();
        b.seq(&[s, eoi])
    });

    // stray character
    let r = check_recovery(&g, "axbc", &[(1, 2)]);
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "abc");

    // wrong character
    let r = check_recovery(&g, "axc", &[(1, 2)]);
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "abc");
}

#[test]
fn test_resync_to_end_of_input() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let eoi = b.eoi();
        b.seq(&[a, eoi])
    });
    let r = check_recovery(&g, "abc", &[(1, 3)]);
    assert_eq!(r.parse_errors[0].expected_labels(), vec!["EOI"]);
    assert_eq!(
        r.format_errors(),
        "Invalid input \"bc\", expected EOI (line 1, pos 2):\nabc\n ^^\n"
    );
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "a");
}

#[test]
fn test_calculator() {
    check_calc("1", 1.0);
    check_calc("1+2*3", 7.0);
    check_calc("(1+2)*3", 9.0);
    check_calc("10-4-3", 3.0);
    check_calc("8/(3-1)", 4.0);

    let r = parse_basic(&CALCULATOR, "1+2");
    let root = r.parse_tree_root.as_ref().unwrap();
    assert_eq!(root.label(&CALCULATOR), "InputLine");
    let number = root
        .find_by_path(&CALCULATOR, "Expression/Term/Factor/Number")
        .unwrap();
    assert_eq!(r.node_text(number), "1");
    assert_eq!(number.value(), Some(&1.0));
    let numbers = root.collect(|n| n.label(&CALCULATOR) == "Number");
    assert_eq!(numbers.len(), 2);
}

#[test]
fn test_calculator_recovery() {
    // superfluous operator
    let r = check_recovery(&CALCULATOR, "1+*2", &[(2, 3)]);
    assert_eq!(r.result_value(), Some(&3.0));
    assert_eq!(r.parse_errors[0].expected_labels(), vec!["0..9", "'('"]);

    // missing closing paren
    let r = check_recovery(&CALCULATOR, "(1+2", &[(4, 4)]);
    assert_eq!(r.result_value(), Some(&3.0));
}

#[test]
fn test_unclosed_groups_are_closed() {
    let r = check_recovery(&CALCULATOR, "((1", &[(3, 3), (3, 3)]);
    assert_eq!(r.result_value(), Some(&1.0));
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "((1))");

    let r = check_recovery(&CALCULATOR, "1+((2", &[(5, 5), (5, 5)]);
    assert_eq!(r.result_value(), Some(&3.0));

    check_recovery(&CALCULATOR, "(((1", &[(4, 4), (4, 4), (4, 4)]);

    let (blocks, _) = block_grammar().unwrap();
    let blocks = Arc::new(blocks);
    let r = check_recovery(&blocks, "{{", &[(2, 2), (2, 2)]);
    assert_eq!(r.value_stack.to_vec(), vec![0, 0, 0]);
    assert_eq!(r.node_text(r.parse_tree_root.as_ref().unwrap()), "{{}}");
}

fn check_total<V: Clone>(grammar: &Arc<Grammar<V>>, inputs: &[&str]) {
    for input in inputs {
        let r = parse_recovering(grammar, input);
        assert!(r.matched, "{input:?} not recovered");
        assert!(r.has_errors(), "{input:?} has no errors");
        let len = input.chars().count();
        for e in &r.parse_errors {
            assert!(e.start_index() <= e.end_index(), "{input:?}: {e:?}");
            assert!(e.end_index() <= len, "{input:?}: {e:?}");
        }
    }
}

#[test]
fn test_recovery_is_total() {
    check_total(
        &CALCULATOR,
        &[
            "", "+", "))", "1++2", "abc", "(((", "1+2)", "2*(3", "((1", "(((1", "1+((2",
        ],
    );
    let (blocks, _) = block_grammar().unwrap();
    check_total(&Arc::new(blocks), &["{{", "}{", "{a", "", "{a??}"]);
}

#[test]
fn test_action_failure() {
    let r = parse_basic(&CALCULATOR, "2/0");
    assert!(!r.matched);
    assert_eq!(r.parse_errors.len(), 1);
    match &r.parse_errors[0] {
        ParseError::Action { message, path, .. } => {
            assert_eq!(message, "division by zero");
            assert!(path.labels().contains(&"Term"));
        }
        e => panic!("unexpected error {e:?}"),
    }
}

#[test]
fn test_sequence_restores_values() {
    // the first alternative pushes a value and then fails
    let g = grammar(|b: &mut GrammarBuilder<i32>| {
        let push = b.action(|ctx| {
            ctx.push(1);
            Ok(true)
        });
        let x = b.ch('x');
        let y = b.ch('y');
        let first = b.seq(&[push, x]);
        let push2 = b.action(|ctx| {
            ctx.push(2);
            Ok(true)
        });
        let second = b.seq(&[push2, y]);
        b.first_of(&[first, second])
    });
    let r = parse_basic(&g, "y");
    assert!(r.matched);
    assert_eq!(r.value_stack.to_vec(), vec![2]);
}

#[test]
fn test_grammar_errors_are_fatal() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let opt = b.optional(a);
        b.one_or_more(opt)
    });
    let err = BasicParseRunner::new(g).run_str("b").unwrap_err();
    let err = err.into_fatal().unwrap();
    assert!(matches!(
        err.downcast_ref::<GrammarError>(),
        Some(GrammarError::EmptyLoop(_))
    ));

    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let text = b.action(|ctx| ctx.match_text().map(|_| true));
        let a = b.ch('a');
        b.seq(&[text, a])
    });
    let err = BasicParseRunner::new(g).run_str("a").unwrap_err();
    let err = err.into_fatal().unwrap();
    assert!(matches!(
        err.downcast_ref::<GrammarError>(),
        Some(GrammarError::IllegalAction(_))
    ));
}

#[test]
fn test_panicking_action() {
    let g = grammar(|b: &mut GrammarBuilder<()>| {
        let a = b.ch('a');
        let boom = b.action(|_| panic!("boom"));
        b.seq(&[a, boom])
    });
    let err = BasicParseRunner::new(g).run_str("a").unwrap_err();
    let msg = format!("{:#}", err.into_fatal().unwrap());
    assert!(msg.contains("panic: boom"), "{msg}");
}

#[test]
fn test_block_vars() {
    let (g, _) = block_grammar().unwrap();
    let g = Arc::new(g);
    let r = parse_basic(&g, "{a{bcx}d}");
    assert!(r.matched);
    let mut stack = r.value_stack.clone();
    // total, then the outer block, then the inner one
    assert_eq!(stack.pop().unwrap(), 5);
    assert_eq!(stack.pop().unwrap(), 2);
    assert_eq!(stack.pop().unwrap(), 3);
    assert!(stack.is_empty());
}

#[test]
fn test_keywords() {
    assert!(parse_basic(&KEYWORDS, "true,null,false").matched);
    assert!(!parse_basic(&KEYWORDS, "true,nullx").matched);

    let r = parse_reporting(&KEYWORDS, "true,nul");
    assert!(!r.matched);
    assert_eq!(r.parse_errors[0].start_index(), 8);
    assert_eq!(r.parse_errors[0].expected_labels(), vec!["'l'"]);
}

#[test]
fn test_timeout() {
    let mut runner = RecoveringParseRunner::new(CALCULATOR.clone()).with_limits(RecoveryLimits {
        timeout_ms: Some(0),
        ..RecoveryLimits::default()
    });
    match runner.run_str("1+*2") {
        Err(RunError::Timeout { last_result, .. }) => {
            assert!(!last_result.matched);
            assert_eq!(last_result.source.len(), 4);
        }
        r => panic!("expected a timeout, got {r:?}"),
    }

    // matching input never reaches the deadline
    let r = runner.run_str("1+2").unwrap();
    assert!(r.matched);
}

#[test]
fn test_error_fix_limit() {
    let mut runner = RecoveringParseRunner::new(CALCULATOR.clone())
        .with_logger(Logger::buffered())
        .with_limits(RecoveryLimits {
            max_error_fixes: 0,
            ..RecoveryLimits::default()
        });
    let r = runner.run_str("1+*2").unwrap();
    assert!(!r.matched);
    assert!(!r.has_errors());
    assert!(runner
        .logger
        .get_buffer()
        .contains("Warning: giving up error recovery after 0 fixes"));
}

#[test]
fn test_seeded_errors_are_kept() {
    let seeded = ParseError::Basic {
        index: 0,
        message: "from an earlier stage".to_string(),
    };
    let mut runner =
        RecoveringParseRunner::new(abc_grammar()).with_parse_errors(vec![seeded.clone()]);
    let r = runner.run_str("ac").unwrap();
    assert!(r.matched);
    assert_eq!(r.parse_errors.len(), 2);
    assert_eq!(r.parse_errors[0], seeded);
}
