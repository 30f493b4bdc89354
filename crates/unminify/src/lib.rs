#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "budget math rounds down intentionally")]
#![expect(clippy::cast_sign_loss, reason = "token and budget quantities are non-negative")]

mod cache;
mod coordinator;
mod deminify;
mod error;
mod graph;
mod mapping;
mod oracle;
mod parse;
mod progress;
mod prompt;
mod ratelimit;
mod rename;
mod schedule;
mod scope;
mod tokens;

pub use crate::{
    cache::{BatchState, CacheEntry, RenameCache},
    deminify::{Deminifier, DeminifyOptions, DeminifyOutput, RunStats},
    error::{DeminifyError, OracleError, ParseError, RenameWarning},
    graph::CallGraph,
    mapping::{KnownNames, RenameMapping},
    oracle::{AnthropicOracle, BatchJobStatus, OpenAiOracle, Oracle, OracleRequest, OracleResponse},
    parse::{parse_functions, FunctionInfo, FunctionKind, ParamInfo},
    progress::{
        ApproveAll, CollectProgress, CostGate, NoProgress, ProgressSink, ProgressUpdate,
    },
    rename::{apply_renames, is_safe_identifier, RenameOutcome},
    schedule::RunCounters,
    tokens::{CostEstimate, ModelSpec, Provider, DEFAULT_OUTPUT_RESERVE},
};
