//! Public interface for running the de-minification pipeline.

use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use crate::{
    cache::RenameCache,
    error::{DeminifyError, RenameWarning},
    graph::CallGraph,
    mapping::KnownNames,
    oracle::Oracle,
    parse::parse_functions,
    progress::{CostGate, ProgressSink},
    prompt,
    ratelimit::RateLimiter,
    rename::apply_renames,
    schedule::{RunCounters, RunEnd, Scheduler},
    tokens::{CostEstimate, DEFAULT_OUTPUT_RESERVE},
};

/// Options for one de-minification run.
///
/// Everything is plain data; callbacks (progress, cost gate, cancellation)
/// arrive separately so the options stay cloneable and loggable.
#[derive(Debug, Clone, Default)]
pub struct DeminifyOptions {
    /// Input file name, used for context in messages and batch state.
    pub file_name: String,
    /// Bypass the cost gate entirely.
    pub skip_confirmation: bool,
    /// Use the deferred batch API instead of interactive requests.
    pub use_batch: bool,
    /// Poll this batch ID instead of consulting the batch-state file.
    pub resume_batch_id: Option<String>,
    /// Override the computed per-batch token budget.
    pub max_batch_tokens: Option<usize>,
    /// Output path recorded in batch state for resumed runs.
    pub output_path: Option<PathBuf>,
    /// Concurrent batches in flight within a round (clamped to 1..=20).
    /// Zero means the default of 3.
    pub parallelism: usize,
    /// Dispatch rate limit; zero means the default of 60 per minute.
    pub rate_limit_per_minute: u32,
    /// Emit oracle descriptions as leading block comments.
    pub emit_descriptions: bool,
    /// Project working directory for batch-state namespacing; defaults to
    /// the process working directory.
    pub working_dir: Option<PathBuf>,
    /// Cooperative cancellation flag, checked between batches.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl DeminifyOptions {
    pub(crate) fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub(crate) fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 { 3 } else { self.parallelism }
    }

    pub(crate) fn effective_rate_limit(&self) -> u32 {
        if self.rate_limit_per_minute == 0 {
            60
        } else {
            self.rate_limit_per_minute
        }
    }
}

/// Cumulative statistics for one run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Functions found in the source.
    pub functions: usize,
    /// Scheduler counters: cache traffic, tokens, errors, rounds.
    pub counters: RunCounters,
    /// Bindings actually renamed in the final pass.
    pub renames_applied: usize,
    /// Rename entries skipped for safety.
    pub renames_skipped: usize,
}

/// What a run produced.
#[derive(Debug)]
pub struct DeminifyOutput {
    /// The rewritten source, or the original when the run was cancelled or
    /// the rename pass failed hard.
    pub source: String,
    /// Whether the run was cancelled before completion.
    pub cancelled: bool,
    /// Non-fatal problems from the rename pass.
    pub warnings: Vec<RenameWarning>,
    /// Run statistics.
    pub stats: RunStats,
}

/// Primary interface for de-minifying one source file.
///
/// Construction wires the oracle, the cache and the options together; the
/// run itself is [`Deminifier::deminify`], a pure pipeline over the input
/// string: parse, graph, scheduled oracle rounds, one final scope-aware
/// rename of the pristine source.
///
/// # Example
/// ```no_run
/// use unminify::{
///     ApproveAll, Deminifier, DeminifyOptions, ModelSpec, NoProgress, OpenAiOracle, Provider,
///     RenameCache,
/// };
///
/// # async fn run() -> Result<(), unminify::DeminifyError> {
/// let oracle = OpenAiOracle::new(
///     ModelSpec::new(Provider::Openai, "gpt-4o-mini"),
///     std::env::var("OPENAI_API_KEY").unwrap_or_default(),
/// );
/// let deminifier = Deminifier::new(
///     Box::new(oracle),
///     RenameCache::new(".unminify-cache"),
///     DeminifyOptions::default(),
/// );
/// let output = deminifier
///     .deminify("function a(x){return x+1;}", &ApproveAll, &mut NoProgress)
///     .await?;
/// println!("{}", output.source);
/// # Ok(())
/// # }
/// ```
pub struct Deminifier {
    oracle: Box<dyn Oracle>,
    cache: RenameCache,
    options: DeminifyOptions,
}

impl Deminifier {
    /// Wires an oracle, a cache and options into a runnable pipeline.
    #[must_use]
    pub fn new(oracle: Box<dyn Oracle>, cache: RenameCache, options: DeminifyOptions) -> Self {
        Self {
            oracle,
            cache,
            options,
        }
    }

    /// The options this instance runs with.
    #[must_use]
    pub fn options(&self) -> &DeminifyOptions {
        &self.options
    }

    /// Runs the full pipeline over `source`.
    ///
    /// # Errors
    /// Fatal errors only: the source does not parse, the cost gate
    /// declined, a pending batch collides, or the oracle failed after
    /// retries. Recoverable failures are absorbed and reflected in the
    /// stats and warnings instead.
    pub async fn deminify(
        &self,
        source: &str,
        gate: &dyn CostGate,
        progress: &mut dyn ProgressSink,
    ) -> Result<DeminifyOutput, DeminifyError> {
        let records = parse_functions(source)?;
        let function_count = records.len();
        if records.is_empty() {
            tracing::info!("no functions found; source returned unchanged");
            return Ok(DeminifyOutput {
                source: source.to_owned(),
                cancelled: false,
                warnings: Vec::new(),
                stats: RunStats::default(),
            });
        }
        let graph = CallGraph::build(records);

        // The cost gate runs before any oracle traffic; a fully cached run
        // costs nothing and asks nothing.
        let estimate = self.estimate(&graph, source);
        if estimate.request_count > 0
            && !self.options.skip_confirmation
            && !gate.confirm(&estimate)
        {
            return Err(DeminifyError::CostCancelled);
        }

        let limiter = RateLimiter::new(self.options.effective_rate_limit());
        let mut scheduler = Scheduler::new(
            self.oracle.as_ref(),
            &self.cache,
            &limiter,
            &graph,
            source,
            &self.options,
        );
        let end = if self.options.use_batch {
            scheduler.run_deferred(progress).await?
        } else {
            scheduler.run_interactive(progress).await?
        };

        let mut stats = RunStats {
            functions: function_count,
            counters: scheduler.counters.clone(),
            ..RunStats::default()
        };

        if end == RunEnd::Cancelled {
            tracing::info!("run cancelled; source returned unchanged");
            return Ok(DeminifyOutput {
                source: source.to_owned(),
                cancelled: true,
                warnings: Vec::new(),
                stats,
            });
        }

        match apply_renames(source, &scheduler.mappings, self.options.emit_descriptions) {
            Ok(outcome) => {
                stats.renames_applied = outcome.applied;
                stats.renames_skipped = outcome.skipped;
                for warning in &outcome.warnings {
                    tracing::warn!(%warning, "rename warning");
                }
                Ok(DeminifyOutput {
                    source: outcome.source,
                    cancelled: false,
                    warnings: outcome.warnings,
                    stats,
                })
            }
            Err(error) => {
                // A hard failure in the final pass must not destroy the
                // input: log it and hand the original back.
                tracing::error!(%error, "rename pass failed; source returned unchanged");
                Ok(DeminifyOutput {
                    source: source.to_owned(),
                    cancelled: false,
                    warnings: vec![RenameWarning::ReassemblyInvalid {
                        message: error.to_string(),
                    }],
                    stats,
                })
            }
        }
    }

    /// Projects what the run will send: cache misses only, batched under
    /// the same budget the scheduler will use.
    fn estimate(&self, graph: &CallGraph, source: &str) -> CostEstimate {
        let model = self.oracle.model();
        let known = KnownNames::new();
        let budget = self
            .options
            .max_batch_tokens
            .unwrap_or_else(|| model.batch_budget(DEFAULT_OUTPUT_RESERVE));
        let system_tokens = model.count_tokens(prompt::SYSTEM_PROMPT);
        let usable = budget.saturating_sub(system_tokens).max(1);

        let mut input_tokens = 0usize;
        let mut identifier_count = 0usize;
        let mut miss_count = 0usize;
        let mut request_count = 0usize;
        let mut current_cost = 0usize;
        for record in graph.functions() {
            let key = RenameCache::cache_key(record.source(source));
            if self.cache.get(&key, model.name()).is_some() {
                continue;
            }
            miss_count += 1;
            identifier_count += record.identifiers.len();
            let cost = model.count_tokens(&prompt::function_section(record, source, &known));
            input_tokens += cost;
            if current_cost == 0 || current_cost + cost > usable {
                request_count += 1;
                current_cost = cost.min(usable);
            } else {
                current_cost += cost;
            }
        }
        input_tokens += request_count * system_tokens;
        CostEstimate::for_run(model, input_tokens, identifier_count, miss_count, request_count)
    }
}
