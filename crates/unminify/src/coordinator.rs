//! Per-batch coordination: cache lookups, prompt assembly, the interactive
//! retry policy, and response validation.
//!
//! The coordinator absorbs every recoverable failure mode: malformed
//! response entries are discarded per function, cache I/O never fails a
//! batch, and transient transport errors are retried before anything
//! surfaces to the scheduler. Per-function cache writes happen as soon as
//! an entry validates, so even an abandoned run keeps what it paid for.

use std::time::Duration;

use ahash::AHashMap;
use serde_json::Value;

use crate::{
    cache::RenameCache,
    error::OracleError,
    mapping::{KnownNames, RenameMapping},
    oracle::{Oracle, OracleRequest, OracleResponse},
    parse::FunctionInfo,
    prompt,
    ratelimit::RateLimiter,
};

/// How many attempts the interactive retry policy makes for transient
/// failures other than rate limits.
const MAX_ATTEMPTS: u32 = 3;

/// What one processed batch produced.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    /// Mapping per function ID; empty mappings for discarded entries.
    pub mappings: AHashMap<String, RenameMapping>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A batch split into its cached part and the request covering the rest.
pub(crate) struct PreparedBatch {
    /// Mappings served from cache, keyed by function ID.
    pub cached: AHashMap<String, RenameMapping>,
    /// IDs of the functions that still need the oracle, in batch order.
    pub miss_ids: Vec<String>,
    /// The request for the misses, or `None` when the cache covered
    /// everything.
    pub request: Option<OracleRequest>,
}

pub(crate) struct Coordinator<'a> {
    oracle: &'a dyn Oracle,
    cache: &'a RenameCache,
    limiter: &'a RateLimiter,
}

impl<'a> Coordinator<'a> {
    pub(crate) fn new(
        oracle: &'a dyn Oracle,
        cache: &'a RenameCache,
        limiter: &'a RateLimiter,
    ) -> Self {
        Self {
            oracle,
            cache,
            limiter,
        }
    }

    /// Checks the cache for every function of a batch and assembles the
    /// prompt for the remainder.
    pub(crate) fn prepare_batch(
        &self,
        custom_id: &str,
        batch: &[FunctionInfo],
        source: &str,
        known: &KnownNames,
    ) -> PreparedBatch {
        let model = self.oracle.model().name();
        let mut cached = AHashMap::new();
        let mut misses: Vec<FunctionInfo> = Vec::new();
        for record in batch {
            let key = RenameCache::cache_key(record.source(source));
            match self.cache.get(&key, model) {
                Some(mapping) => {
                    cached.insert(record.id.clone(), mapping);
                }
                None => misses.push(record.clone()),
            }
        }
        let miss_ids: Vec<String> = misses.iter().map(|r| r.id.clone()).collect();
        let request = (!misses.is_empty()).then(|| OracleRequest {
            custom_id: custom_id.to_owned(),
            system_prompt: prompt::SYSTEM_PROMPT.to_owned(),
            user_prompt: prompt::build_user_prompt(&misses, source, known),
        });
        PreparedBatch {
            cached,
            miss_ids,
            request,
        }
    }

    /// Runs one batch end to end: cache, oracle with retries, validation,
    /// durable cache writes.
    pub(crate) async fn process_batch(
        &self,
        custom_id: &str,
        batch: &[FunctionInfo],
        source: &str,
        known: &KnownNames,
    ) -> Result<BatchOutcome, OracleError> {
        let prepared = self.prepare_batch(custom_id, batch, source, known);
        let mut outcome = BatchOutcome {
            cache_hits: prepared.cached.len(),
            cache_misses: prepared.miss_ids.len(),
            mappings: prepared.cached,
            ..BatchOutcome::default()
        };
        let Some(request) = prepared.request else {
            return Ok(outcome);
        };

        self.limiter.acquire().await;
        let response = self.complete_with_retries(&request).await?;
        outcome.input_tokens = response.input_tokens;
        outcome.output_tokens = response.output_tokens;

        let entries = parse_response_object(&response.text)?;
        let by_id: AHashMap<&str, &FunctionInfo> =
            batch.iter().map(|r| (r.id.as_str(), r)).collect();
        for id in &prepared.miss_ids {
            let mapping = match entries.get(id.as_str()) {
                Some(value) => match RenameMapping::from_value(value) {
                    Ok(mapping) => {
                        // Durable per-function write: even if the run is
                        // later abandoned, this result is kept.
                        if let Some(record) = by_id.get(id.as_str()) {
                            let key = RenameCache::cache_key(record.source(source));
                            self.cache.put(&key, &mapping, self.oracle.model().name());
                        }
                        mapping
                    }
                    Err(reason) => {
                        tracing::warn!(function = %id, %reason, "malformed oracle entry discarded");
                        RenameMapping::default()
                    }
                },
                None => {
                    tracing::warn!(function = %id, "oracle response missing this function");
                    RenameMapping::default()
                }
            };
            outcome.mappings.insert(id.clone(), mapping);
        }
        Ok(outcome)
    }

    /// Interactive retry policy: a rate limit sleeps a full minute once;
    /// other transient failures back off `2^attempt` seconds for up to
    /// three attempts; anything else surfaces immediately.
    async fn complete_with_retries(
        &self,
        request: &OracleRequest,
    ) -> Result<OracleResponse, OracleError> {
        let mut slept_for_rate_limit = false;
        let mut attempt: u32 = 0;
        loop {
            match self.oracle.complete(request).await {
                Ok(response) => return Ok(response),
                Err(OracleError::RateLimited) if !slept_for_rate_limit => {
                    slept_for_rate_limit = true;
                    tracing::warn!("rate limited; sleeping 60s before retrying");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Err(error) if error.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = Duration::from_secs(1 << attempt);
                    attempt += 1;
                    tracing::warn!(%error, attempt, "transient oracle failure; backing off {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Accepts the payload as a bare JSON object or one wrapped in a Markdown
/// fenced code block, and nothing else.
pub(crate) fn parse_response_object(
    text: &str,
) -> Result<serde_json::Map<String, Value>, OracleError> {
    let trimmed = text.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim_start_matches(['\r', '\n'])
            .trim_end()
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };
    let parsed: Value = serde_json::from_str(candidate)
        .or_else(|_| {
            // Tolerate prose around the object by taking the outermost braces.
            let start = candidate.find('{');
            let end = candidate.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if start < end => {
                    serde_json::from_str(&candidate[start..=end])
                }
                _ => serde_json::from_str(candidate),
            }
        })
        .map_err(|e| OracleError::BadResponse(format!("response is not JSON: {e}")))?;
    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(OracleError::BadResponse(format!(
            "response is not a JSON object: {other}"
        ))),
    }
}
