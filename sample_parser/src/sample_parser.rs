use std::{env, fs::File, io::Read, sync::Arc};

use anyhow::{bail, Context, Result};
use pegmatch::{
    peg::Grammar, Logger, ParseRunner, ParsingResult, RecoveringParseRunner, RecoveryLimits,
    RunError,
};
use sample_parser::{block_grammar, tree_json, CALCULATOR, KEYWORDS};
use serde::Serialize;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!(
            "Usage: {} <calc|blocks|keywords> <input.txt> [timeout_ms]",
            args[0]
        );
        std::process::exit(1);
    }

    let input = read_file_to_string(&args[2])?;
    let limits = RecoveryLimits {
        timeout_ms: match args.get(3) {
            Some(ms) => Some(ms.parse().context("invalid timeout")?),
            None => None,
        },
        ..RecoveryLimits::default()
    };

    match args[1].as_str() {
        "calc" => run(&CALCULATOR, &input, limits),
        "blocks" => run(&Arc::new(block_grammar()?.0), &input, limits),
        "keywords" => run(&KEYWORDS, &input, limits),
        other => bail!("unknown grammar {other:?}"),
    }
}

fn run<V: Clone + Serialize>(
    grammar: &Arc<Grammar<V>>,
    input: &str,
    limits: RecoveryLimits,
) -> Result<()> {
    // set to 2 for the recovery log
    let stderr_log_level = 1;

    let mut runner = RecoveringParseRunner::new(grammar.clone())
        .with_limits(limits)
        .with_logger(Logger::new(0, stderr_log_level));
    let result = match runner.run_str(input) {
        Ok(r) => r,
        Err(RunError::Timeout {
            elapsed_ms,
            last_result,
        }) => {
            eprintln!("Timed out after {elapsed_ms}ms; showing partial result");
            *last_result
        }
        Err(RunError::Fatal(e)) => return Err(e),
    };
    report(grammar, &result)
}

fn report<V: Clone + Serialize>(grammar: &Grammar<V>, result: &ParsingResult<V>) -> Result<()> {
    eprintln!(
        "matched: {}, errors: {}",
        result.matched,
        result.parse_errors.len()
    );
    if result.has_errors() {
        eprint!("{}", result.format_errors());
    }
    if let Some(v) = result.result_value() {
        println!("value: {}", serde_json::to_string(v)?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&tree_json(grammar, result))?
    );
    Ok(())
}

fn read_file_to_string(filename: &str) -> Result<String> {
    let mut file = File::open(filename).with_context(|| format!("Unable to open {filename}"))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Unable to read {filename}"))?;
    Ok(content)
}
