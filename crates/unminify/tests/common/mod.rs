//! Shared test support: a scripted in-process oracle.
#![expect(dead_code, reason = "each test binary uses a different slice of the mock")]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::{json, Value};
use unminify::{
    BatchJobStatus, ModelSpec, Oracle, OracleError, OracleRequest, OracleResponse, Provider,
};

/// An oracle that answers from a table keyed by the function's original
/// name, parsing function IDs back out of the prompt it is given. Cloning
/// shares all state, so a test can hand one clone to the pipeline and keep
/// another for assertions.
#[derive(Clone)]
pub struct MockOracle {
    model: ModelSpec,
    inner: Arc<Inner>,
}

struct Inner {
    by_name: Mutex<AHashMap<String, Value>>,
    requests: Mutex<Vec<OracleRequest>>,
    submitted: Mutex<Vec<OracleRequest>>,
    poll_sequence: Mutex<VecDeque<BatchJobStatus>>,
    complete_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            model: ModelSpec::new(Provider::Openai, "mock-model"),
            inner: Arc::new(Inner {
                by_name: Mutex::new(AHashMap::new()),
                requests: Mutex::new(Vec::new()),
                submitted: Mutex::new(Vec::new()),
                poll_sequence: Mutex::new(VecDeque::new()),
                complete_calls: AtomicUsize::new(0),
                submit_calls: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
            }),
        }
    }

    /// Scripts the answer for every function whose original name is `name`.
    pub fn with_mapping(self, name: &str, mapping: Value) -> Self {
        self.inner
            .by_name
            .lock()
            .unwrap()
            .insert(name.to_owned(), mapping);
        self
    }

    /// Makes the next `n` interactive completions fail hard.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Interactive requests observed, in completion order.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn complete_calls(&self) -> usize {
        self.inner.complete_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.inner.submit_calls.load(Ordering::SeqCst)
    }

    /// IDs are lines of the form `### <id> (<kind>)` in the user prompt.
    fn ids_in_prompt(prompt: &str) -> Vec<String> {
        prompt
            .lines()
            .filter_map(|line| line.strip_prefix("### "))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(str::to_owned)
            .collect()
    }

    /// `name_start_end` back to `name` (which may itself contain
    /// underscores, so only the last two segments are offsets).
    fn name_of_id(id: &str) -> String {
        let mut it = id.rsplitn(3, '_');
        let _end = it.next();
        let _start = it.next();
        it.next().unwrap_or("").to_owned()
    }

    fn respond(&self, request: &OracleRequest) -> String {
        let table = self.inner.by_name.lock().unwrap();
        let mut reply = serde_json::Map::new();
        for id in Self::ids_in_prompt(&request.user_prompt) {
            let name = Self::name_of_id(&id);
            let mapping = table
                .get(&name)
                .cloned()
                .unwrap_or_else(|| json!({ "renames": {} }));
            reply.insert(id, mapping);
        }
        Value::Object(reply).to_string()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        self.inner.complete_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OracleError::Api {
                status: 400,
                message: "scripted failure".to_owned(),
            });
        }
        self.inner.requests.lock().unwrap().push(request.clone());
        Ok(OracleResponse {
            text: self.respond(request),
            input_tokens: 100,
            output_tokens: 25,
        })
    }

    async fn submit_batch(&self, requests: &[OracleRequest]) -> Result<String, OracleError> {
        self.inner.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .submitted
            .lock()
            .unwrap()
            .extend(requests.iter().cloned());
        Ok("mock-batch-0001".to_owned())
    }

    async fn poll_batch(&self, _batch_id: &str) -> Result<BatchJobStatus, OracleError> {
        let mut sequence = self.inner.poll_sequence.lock().unwrap();
        Ok(sequence.pop_front().unwrap_or(BatchJobStatus::Completed))
    }

    async fn fetch_batch(
        &self,
        _batch_id: &str,
    ) -> Result<AHashMap<String, OracleResponse>, OracleError> {
        let submitted = self.inner.submitted.lock().unwrap();
        let mut results = AHashMap::new();
        for request in submitted.iter() {
            results.insert(
                request.custom_id.clone(),
                OracleResponse {
                    text: self.respond(request),
                    input_tokens: 100,
                    output_tokens: 25,
                },
            );
        }
        Ok(results)
    }
}
