pub mod api;
pub mod errors;
mod grammar_builder;
pub mod peg;
mod recovery;
mod runner;

mod logging;
mod panic_utils;
pub use logging::Logger;

pub use api::{MatcherId, ParsingResult, RecoveryLimits, VarId};
pub use errors::{ActionFailure, GrammarError, ParseError, RunError};
pub use grammar_builder::GrammarBuilder;
pub use recovery::{RecoveringMatchHandler, RecoveringParseRunner};
pub use runner::{
    BasicParseRunner, ErrorLocatingMatchHandler, ErrorLocatingParseRunner, ParseRunner,
    ReportingMatchHandler, ReportingParseRunner,
};

#[macro_export]
macro_rules! loginfo {
    ($s:expr, $($arg:tt)*) => {
        if $s.level_enabled(2) {
            use std::fmt::Write;
            writeln!($s.info_logger(), $($arg)*).unwrap();
        }
    };
}

#[macro_export]
macro_rules! infoln {
    ($s:expr, $($arg:tt)*) => {
        if $s.logger.level_enabled(2) {
            use std::fmt::Write;
            writeln!($s.logger.info_logger(), $($arg)*).unwrap();
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($s:expr, $($arg:tt)*) => {
        if $s.logger.level_enabled(1) {
            use std::fmt::Write;
            $s.logger.write_warning("Warning: ");
            writeln!($s.logger.warning_logger(), $($arg)*).unwrap();
        }
    };
}

/// Matcher-level tracing, compiled in only with the `logging` feature.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "logging") {
            eprintln!($($arg)*);
        }
    };
}
