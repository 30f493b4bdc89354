//! Round-based, bottom-up scheduling of oracle batches.
//!
//! Each round admits the ready set: every unprocessed function whose
//! callees are all either processed or external to the graph. Cycles
//! produce an empty ready set while work remains, at which point every
//! remaining function is admitted at once. Source positions are never
//! rewritten between rounds; parents "see" renamed callees only through
//! the advisory known-names channel in the prompt, which keeps the byte
//! spans recorded at extraction valid for the whole run.

use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use futures::StreamExt as _;

use crate::{
    cache::{BatchState, RenameCache},
    coordinator::{BatchOutcome, Coordinator},
    deminify::DeminifyOptions,
    error::{DeminifyError, OracleError},
    graph::CallGraph,
    mapping::{KnownNames, RenameMapping},
    oracle::{BatchJobStatus, Oracle, OracleRequest},
    parse::FunctionInfo,
    progress::{ProgressSink, ProgressUpdate},
    prompt,
    ratelimit::RateLimiter,
    tokens::DEFAULT_OUTPUT_RESERVE,
};

/// Hard upper bound on concurrent in-flight batches, respecting provider
/// rate limits regardless of configuration.
pub(crate) const MAX_PARALLELISM: usize = 20;

/// Interval between polls of a deferred batch job.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Cumulative run counters, surfaced through progress updates and the
/// final output.
#[derive(Debug, Default, Clone)]
pub struct RunCounters {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub errors: usize,
    pub rounds: usize,
}

/// How a scheduling run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEnd {
    Completed,
    Cancelled,
}

/// One unit of a deferred submission: the batch, which of its functions
/// actually went to the oracle, and the request that covers them.
struct DeferredUnit {
    functions: Vec<FunctionInfo>,
    miss_ids: Vec<String>,
    request: OracleRequest,
}

pub(crate) struct Scheduler<'a> {
    oracle: &'a dyn Oracle,
    cache: &'a RenameCache,
    limiter: &'a RateLimiter,
    graph: &'a CallGraph,
    source: &'a str,
    options: &'a DeminifyOptions,
    processed: AHashSet<String>,
    /// Sole mutable view of the accumulated decisions.
    pub mappings: AHashMap<String, RenameMapping>,
    /// Monotonically growing advisory dictionary; entries are never
    /// removed or overwritten.
    pub known_names: KnownNames,
    pub counters: RunCounters,
    started: Instant,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        oracle: &'a dyn Oracle,
        cache: &'a RenameCache,
        limiter: &'a RateLimiter,
        graph: &'a CallGraph,
        source: &'a str,
        options: &'a DeminifyOptions,
    ) -> Self {
        Self {
            oracle,
            cache,
            limiter,
            graph,
            source,
            options,
            processed: AHashSet::new(),
            mappings: AHashMap::new(),
            known_names: KnownNames::new(),
            counters: RunCounters::default(),
            started: Instant::now(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
    }

    /// Every unprocessed function whose callee names all resolve to
    /// processed functions or to nothing. A self-recursive call counts as
    /// satisfied; mutual recursion falls through to the admit-all round.
    fn ready_set(&self) -> Vec<FunctionInfo> {
        let mut ready: Vec<FunctionInfo> = self
            .graph
            .functions()
            .filter(|record| !self.processed.contains(&record.id))
            .filter(|record| {
                record.callees.iter().all(|callee| {
                    match self.graph.resolve_name(callee) {
                        Some(callee_id) => {
                            callee_id == record.id || self.processed.contains(callee_id)
                        }
                        None => true,
                    }
                })
            })
            .cloned()
            .collect();
        ready.sort_by_key(|record| (self.graph.depth(&record.id), record.start));
        ready
    }

    fn remaining(&self) -> Vec<FunctionInfo> {
        let mut remaining: Vec<FunctionInfo> = self
            .graph
            .functions()
            .filter(|record| !self.processed.contains(&record.id))
            .cloned()
            .collect();
        remaining.sort_by_key(|record| (self.graph.depth(&record.id), record.start));
        remaining
    }

    /// The input-token budget for one batch, from the override or the
    /// model's context table.
    fn batch_budget(&self) -> usize {
        self.options
            .max_batch_tokens
            .unwrap_or_else(|| self.oracle.model().batch_budget(DEFAULT_OUTPUT_RESERVE))
    }

    /// Partitions a round's admissions into ordered batches under the
    /// token budget. A function whose cost alone exceeds the budget rides
    /// in a singleton batch.
    fn partition(&self, ready: Vec<FunctionInfo>) -> Vec<Vec<FunctionInfo>> {
        let model = self.oracle.model();
        let budget = self.batch_budget();
        let overhead = model.count_tokens(prompt::SYSTEM_PROMPT);
        let usable = budget.saturating_sub(overhead).max(1);

        let mut batches: Vec<Vec<FunctionInfo>> = Vec::new();
        let mut current: Vec<FunctionInfo> = Vec::new();
        let mut current_cost = 0usize;
        for record in ready {
            let cost = model.count_tokens(&prompt::function_section(
                &record,
                self.source,
                &self.known_names,
            ));
            if cost > usable {
                if !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                    current_cost = 0;
                }
                batches.push(vec![record]);
                continue;
            }
            if current_cost + cost > usable && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_cost = 0;
            }
            current_cost += cost;
            current.push(record);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    fn record_outcome(&mut self, batch: &[FunctionInfo], mut outcome: BatchOutcome) {
        for record in batch {
            self.processed.insert(record.id.clone());
            let mapping = outcome.mappings.remove(&record.id).unwrap_or_default();
            self.note_known_name(record, &mapping);
            self.mappings.insert(record.id.clone(), mapping);
        }
        self.counters.cache_hits += outcome.cache_hits;
        self.counters.cache_misses += outcome.cache_misses;
        self.counters.input_tokens += outcome.input_tokens;
        self.counters.output_tokens += outcome.output_tokens;
    }

    /// A failed batch still marks its functions processed, with empty
    /// mappings, so the run can continue past it.
    fn record_failure(&mut self, batch: &[FunctionInfo], error: &OracleError) {
        tracing::warn!(%error, functions = batch.len(), "batch failed; recording empty mappings");
        self.counters.errors += 1;
        for record in batch {
            self.processed.insert(record.id.clone());
            self.mappings.insert(record.id.clone(), RenameMapping::default());
        }
    }

    fn note_known_name(&mut self, record: &FunctionInfo, mapping: &RenameMapping) {
        if record.original_name.is_empty() {
            return;
        }
        if let Some(new_name) = mapping.function_name.as_deref() {
            if !new_name.is_empty() {
                self.known_names
                    .entry(record.original_name.clone())
                    .or_insert_with(|| new_name.to_owned());
            }
        }
    }

    fn emit_progress(&self, progress: &mut dyn ProgressSink, label: String) {
        progress.update(&ProgressUpdate {
            current: self.processed.len(),
            total: self.graph.len(),
            cache_hits: self.counters.cache_hits,
            cache_misses: self.counters.cache_misses,
            input_tokens: self.counters.input_tokens,
            output_tokens: self.counters.output_tokens,
            errors: self.counters.errors,
            elapsed: self.started.elapsed(),
            label,
        });
    }

    /// Interactive mode: one oracle request per batch, dispatched with
    /// bounded concurrency within each round.
    pub(crate) async fn run_interactive(
        &mut self,
        progress: &mut dyn ProgressSink,
    ) -> Result<RunEnd, DeminifyError> {
        let total = self.graph.len();
        while self.processed.len() < total {
            if self.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            let round = self.counters.rounds;
            let mut fallback = false;
            let mut admitted = self.ready_set();
            if admitted.is_empty() {
                // A cycle: admit every remaining function in one round.
                fallback = true;
                admitted = self.remaining();
                tracing::debug!(
                    functions = admitted.len(),
                    "no ready functions; admitting remaining cycle members"
                );
            }
            let batches = self.partition(admitted);
            // Ready functions never call each other, so batches within a
            // round are independent and may fly concurrently. The cycle
            // fallback breaks that assumption, so it runs sequentially.
            let parallelism = if fallback {
                1
            } else {
                self.options.effective_parallelism().clamp(1, MAX_PARALLELISM)
            };

            let coordinator = Coordinator::new(self.oracle, self.cache, self.limiter);
            let source = self.source;
            let known = self.known_names.clone();
            let mut stream = futures::stream::iter(batches.into_iter().enumerate().map(
                |(index, batch)| {
                    let coordinator = &coordinator;
                    let known = known.clone();
                    let custom_id = format!("round{round}-batch{index}");
                    async move {
                        let result = coordinator
                            .process_batch(&custom_id, &batch, source, &known)
                            .await;
                        (batch, result)
                    }
                },
            ))
            .buffer_unordered(parallelism);

            let mut cancelled = false;
            while let Some((batch, result)) = stream.next().await {
                match result {
                    Ok(outcome) => self.record_outcome(&batch, outcome),
                    Err(error) => self.record_failure(&batch, &error),
                }
                self.emit_progress(progress, batch_label(&batch));
                if self.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
            drop(stream);
            if cancelled {
                return Ok(RunEnd::Cancelled);
            }
            self.counters.rounds += 1;
        }
        Ok(RunEnd::Completed)
    }

    /// Deferred mode: every cache miss goes up as one job; the saved batch
    /// state makes the poll resumable across process restarts.
    pub(crate) async fn run_deferred(
        &mut self,
        progress: &mut dyn ProgressSink,
    ) -> Result<RunEnd, DeminifyError> {
        let units = self.prepare_deferred_units();
        if units.is_empty() {
            return Ok(RunEnd::Completed);
        }

        let project_id = RenameCache::project_id(&self.options.working_dir());
        let source_hash = RenameCache::source_hash(self.source);
        let batch_id = self.resolve_batch_id(&units, &project_id, &source_hash).await?;

        loop {
            if self.is_cancelled() {
                // The job keeps running server-side and stays resumable;
                // the state file is deliberately left in place.
                return Ok(RunEnd::Cancelled);
            }
            match self.oracle.poll_batch(&batch_id).await? {
                BatchJobStatus::Completed => break,
                BatchJobStatus::Failed(reason) => {
                    self.cache.clear_batch_state(&project_id);
                    return Err(DeminifyError::Oracle(OracleError::BatchFailed(reason)));
                }
                BatchJobStatus::InProgress => {
                    tracing::debug!(%batch_id, "deferred batch still running");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        let results = self.oracle.fetch_batch(&batch_id).await?;
        let model = self.oracle.model().name().to_owned();
        for unit in units {
            match results.get(&unit.request.custom_id) {
                Some(response) => {
                    self.counters.input_tokens += response.input_tokens;
                    self.counters.output_tokens += response.output_tokens;
                    let outcome = distribute_deferred_response(
                        self.cache,
                        &model,
                        self.source,
                        &unit,
                        &response.text,
                    );
                    match outcome {
                        Ok(mappings) => {
                            for miss_id in &unit.miss_ids {
                                let mapping = mappings.get(miss_id).cloned().unwrap_or_default();
                                if let Some(record) =
                                    unit.functions.iter().find(|r| &r.id == miss_id)
                                {
                                    self.note_known_name(record, &mapping);
                                }
                                self.mappings.insert(miss_id.clone(), mapping);
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, "deferred batch response unusable");
                            self.counters.errors += 1;
                            self.record_empty_misses(&unit);
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        custom_id = %unit.request.custom_id,
                        "no result for submitted batch; recording empty mappings"
                    );
                    self.counters.errors += 1;
                    self.record_empty_misses(&unit);
                }
            }
            self.emit_progress(progress, batch_label(&unit.functions));
        }
        self.cache.clear_batch_state(&project_id);
        Ok(RunEnd::Completed)
    }

    /// Records empty mappings for a deferred unit's misses so they still
    /// count as processed.
    fn record_empty_misses(&mut self, unit: &DeferredUnit) {
        for miss_id in &unit.miss_ids {
            self.mappings
                .entry(miss_id.clone())
                .or_insert_with(RenameMapping::default);
        }
    }

    /// Simulates the round structure without oracle calls: cache hits are
    /// recorded immediately (so later batches see their names in the
    /// advisory channel) and every miss becomes part of one deferred job.
    fn prepare_deferred_units(&mut self) -> Vec<DeferredUnit> {
        let coordinator = Coordinator::new(self.oracle, self.cache, self.limiter);
        let total = self.graph.len();
        let mut units: Vec<DeferredUnit> = Vec::new();
        while self.processed.len() < total {
            let mut admitted = self.ready_set();
            if admitted.is_empty() {
                admitted = self.remaining();
            }
            for batch in self.partition(admitted) {
                let custom_id = format!("batch-{}", units.len());
                let prepared =
                    coordinator.prepare_batch(&custom_id, &batch, self.source, &self.known_names);
                self.counters.cache_hits += prepared.cached.len();
                self.counters.cache_misses += prepared.miss_ids.len();
                for record in &batch {
                    self.processed.insert(record.id.clone());
                    if let Some(mapping) = prepared.cached.get(&record.id) {
                        let mapping = mapping.clone();
                        self.note_known_name(record, &mapping);
                        self.mappings.insert(record.id.clone(), mapping);
                    }
                }
                if let Some(request) = prepared.request {
                    units.push(DeferredUnit {
                        functions: batch,
                        miss_ids: prepared.miss_ids,
                        request,
                    });
                }
            }
            self.counters.rounds += 1;
        }
        units
    }

    /// Picks the batch to poll: an explicit resume ID, a matching saved
    /// state, or a fresh submission. A saved state for a different source
    /// is a hard collision.
    async fn resolve_batch_id(
        &self,
        units: &[DeferredUnit],
        project_id: &str,
        source_hash: &str,
    ) -> Result<String, DeminifyError> {
        if let Some(resume) = self.options.resume_batch_id.as_ref() {
            tracing::info!(batch_id = %resume, "resuming explicitly named batch");
            return Ok(resume.clone());
        }
        if let Some(state) = self.cache.load_batch_state(project_id) {
            if state.source_hash == source_hash {
                tracing::info!(batch_id = %state.batch_id, "resuming pending batch from state file");
                return Ok(state.batch_id);
            }
            return Err(DeminifyError::BatchCollision {
                existing: state.batch_id,
                stored_hash: state.source_hash,
                current_hash: source_hash.to_owned(),
            });
        }
        let requests: Vec<OracleRequest> =
            units.iter().map(|unit| unit.request.clone()).collect();
        let batch_id = self.oracle.submit_batch(&requests).await?;
        let function_count = units.iter().map(|unit| unit.miss_ids.len()).sum();
        self.cache.save_batch_state(&BatchState {
            batch_id: batch_id.clone(),
            source_hash: source_hash.to_owned(),
            output_path: self
                .options
                .output_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            created_at: chrono::Utc::now(),
            model: self.oracle.model().name().to_owned(),
            function_count,
            file_name: self.options.file_name.clone(),
            project_id: project_id.to_owned(),
        });
        tracing::info!(%batch_id, function_count, "deferred batch submitted");
        Ok(batch_id)
    }
}

/// Validates one deferred response and caches its well-formed entries.
fn distribute_deferred_response(
    cache: &RenameCache,
    model: &str,
    source: &str,
    unit: &DeferredUnit,
    text: &str,
) -> Result<AHashMap<String, RenameMapping>, OracleError> {
    let entries = crate::coordinator::parse_response_object(text)?;
    let by_id: AHashMap<&str, &FunctionInfo> = unit
        .functions
        .iter()
        .map(|r| (r.id.as_str(), r))
        .collect();
    let mut mappings = AHashMap::new();
    for id in &unit.miss_ids {
        let mapping = match entries.get(id.as_str()) {
            Some(value) => match RenameMapping::from_value(value) {
                Ok(mapping) => {
                    if let Some(record) = by_id.get(id.as_str()) {
                        let key = RenameCache::cache_key(record.source(source));
                        cache.put(&key, &mapping, model);
                    }
                    mapping
                }
                Err(reason) => {
                    tracing::warn!(function = %id, %reason, "malformed oracle entry discarded");
                    RenameMapping::default()
                }
            },
            None => RenameMapping::default(),
        };
        mappings.insert(id.clone(), mapping);
    }
    Ok(mappings)
}

fn batch_label(batch: &[FunctionInfo]) -> String {
    let first = batch
        .first()
        .map(|record| {
            if record.original_name.is_empty() {
                record.id.clone()
            } else {
                record.original_name.clone()
            }
        })
        .unwrap_or_default();
    if batch.len() > 1 {
        format!("{first} (+{} more)", batch.len() - 1)
    } else {
        first
    }
}
