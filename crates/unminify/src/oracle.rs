//! The oracle interface and its provider bindings.
//!
//! The core depends on one abstract operation: hand over
//! `{custom_id, system_prompt, user_prompt}` triples and get raw response
//! text back, either synchronously per request or through a deferred
//! submit/poll/fetch job. The OpenAI and Anthropic bindings below are the
//! only code that knows either wire format; everything above the trait is
//! provider-agnostic.

use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{error::OracleError, tokens::ModelSpec};

/// One prepared oracle request.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    /// Caller-chosen ID echoed back with the response.
    pub custom_id: String,
    /// System prompt.
    pub system_prompt: String,
    /// User prompt.
    pub user_prompt: String,
}

/// A synchronous oracle response with token usage.
#[derive(Debug, Clone, Default)]
pub struct OracleResponse {
    /// Raw response text, expected to contain the JSON mapping.
    pub text: String,
    /// Prompt tokens as accounted by the provider.
    pub input_tokens: usize,
    /// Completion tokens as accounted by the provider.
    pub output_tokens: usize,
}

/// State of a deferred batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchJobStatus {
    /// Still validating or running; poll again later.
    InProgress,
    /// Finished; results can be fetched.
    Completed,
    /// Terminal failure, expiry or server-side cancellation.
    Failed(String),
}

/// An LLM provider able to answer rename prompts.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// The model this oracle is bound to.
    fn model(&self) -> &ModelSpec;

    /// One synchronous completion. The retry policy lives in the caller;
    /// implementations surface transport conditions faithfully instead.
    async fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;

    /// Uploads all requests as one deferred job and returns its batch ID.
    async fn submit_batch(&self, requests: &[OracleRequest]) -> Result<String, OracleError>;

    /// Reports the state of a previously submitted job.
    async fn poll_batch(&self, batch_id: &str) -> Result<BatchJobStatus, OracleError>;

    /// Downloads the results of a completed job, keyed by custom ID.
    async fn fetch_batch(
        &self,
        batch_id: &str,
    ) -> Result<AHashMap<String, OracleResponse>, OracleError>;
}

/// Default maximum completion tokens requested per response.
const DEFAULT_MAX_OUTPUT_TOKENS: usize = 16_384;

fn transport(e: &reqwest::Error) -> OracleError {
    OracleError::Transport(e.to_string())
}

async fn error_from_status(response: reqwest::Response) -> OracleError {
    let status = response.status().as_u16();
    if status == 429 {
        return OracleError::RateLimited;
    }
    let message = response.text().await.unwrap_or_default();
    // Anthropic signals overload with 529, which retries like a rate limit.
    if status == 529 {
        return OracleError::RateLimited;
    }
    OracleError::Api {
        status,
        message: message.chars().take(400).collect(),
    }
}

fn string_at<'v>(value: &'v Value, path: &[&str]) -> Option<&'v str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

fn usize_at(value: &Value, path: &[&str]) -> usize {
    let mut current = value;
    for key in path {
        match current.get(key) {
            Some(v) => current = v,
            None => return 0,
        }
    }
    current.as_u64().unwrap_or(0) as usize
}

// ---------------------------------------------------------------------------
// OpenAI binding
// ---------------------------------------------------------------------------

/// Chat-completions and batch-API binding for OpenAI-family endpoints.
pub struct OpenAiOracle {
    client: reqwest::Client,
    model: ModelSpec,
    api_key: String,
    base_url: String,
    max_output_tokens: usize,
}

impl OpenAiOracle {
    /// Binds to the public endpoint with the given key and model.
    #[must_use]
    pub fn new(model: ModelSpec, api_key: impl Into<String>) -> Self {
        Self::with_base_url(model, api_key, "https://api.openai.com/v1")
    }

    /// Binds to a compatible endpoint at a custom base URL.
    #[must_use]
    pub fn with_base_url(
        model: ModelSpec,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            api_key: api_key.into(),
            base_url: base_url.into(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    fn request_body(&self, request: &OracleRequest) -> Value {
        json!({
            "model": self.model.name(),
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "max_completion_tokens": self.max_output_tokens,
        })
    }

    fn response_from_body(body: &Value) -> Result<OracleResponse, OracleError> {
        let text = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| OracleError::BadResponse("no choices[0].message.content".to_owned()))?;
        Ok(OracleResponse {
            text,
            input_tokens: usize_at(body, &["usage", "prompt_tokens"]),
            output_tokens: usize_at(body, &["usage", "completion_tokens"]),
        })
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        Self::response_from_body(&body)
    }

    async fn submit_batch(&self, requests: &[OracleRequest]) -> Result<String, OracleError> {
        // One JSONL line per request, as the batch file format demands.
        let mut lines = String::new();
        for request in requests {
            let line = json!({
                "custom_id": request.custom_id,
                "method": "POST",
                "url": "/v1/chat/completions",
                "body": self.request_body(request),
            });
            lines.push_str(&line.to_string());
            lines.push('\n');
        }
        let part = reqwest::multipart::Part::bytes(lines.into_bytes())
            .file_name("unminify-batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);
        let upload = self
            .client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !upload.status().is_success() {
            return Err(error_from_status(upload).await);
        }
        let uploaded: Value = upload.json().await.map_err(|e| transport(&e))?;
        let file_id = string_at(&uploaded, &["id"])
            .ok_or_else(|| OracleError::BadResponse("file upload returned no id".to_owned()))?;

        let created = self
            .client
            .post(format!("{}/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }))
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !created.status().is_success() {
            return Err(error_from_status(created).await);
        }
        let body: Value = created.json().await.map_err(|e| transport(&e))?;
        string_at(&body, &["id"])
            .map(str::to_owned)
            .ok_or_else(|| OracleError::BadResponse("batch creation returned no id".to_owned()))
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchJobStatus, OracleError> {
        let response = self
            .client
            .get(format!("{}/batches/{batch_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        match string_at(&body, &["status"]).unwrap_or("") {
            "completed" => Ok(BatchJobStatus::Completed),
            "failed" | "expired" | "cancelled" | "cancelling" => Ok(BatchJobStatus::Failed(
                string_at(&body, &["status"]).unwrap_or("failed").to_owned(),
            )),
            _ => Ok(BatchJobStatus::InProgress),
        }
    }

    async fn fetch_batch(
        &self,
        batch_id: &str,
    ) -> Result<AHashMap<String, OracleResponse>, OracleError> {
        let response = self
            .client
            .get(format!("{}/batches/{batch_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        let output_file = string_at(&body, &["output_file_id"])
            .ok_or_else(|| OracleError::BadResponse("completed batch has no output file".to_owned()))?;

        let content = self
            .client
            .get(format!("{}/files/{output_file}/content", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !content.status().is_success() {
            return Err(error_from_status(content).await);
        }
        let text = content.text().await.map_err(|e| transport(&e))?;

        let mut results = AHashMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                tracing::warn!("undecodable batch result line skipped");
                continue;
            };
            let Some(custom_id) = string_at(&entry, &["custom_id"]) else {
                continue;
            };
            if let Some(inner) = entry.get("response").and_then(|r| r.get("body")) {
                match Self::response_from_body(inner) {
                    Ok(parsed) => {
                        results.insert(custom_id.to_owned(), parsed);
                    }
                    Err(e) => tracing::warn!(custom_id, error = %e, "batch result entry unusable"),
                }
            }
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Anthropic binding
// ---------------------------------------------------------------------------

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages and message-batches binding for Anthropic-family endpoints.
pub struct AnthropicOracle {
    client: reqwest::Client,
    model: ModelSpec,
    api_key: String,
    base_url: String,
    max_output_tokens: usize,
}

impl AnthropicOracle {
    /// Binds to the public endpoint with the given key and model.
    #[must_use]
    pub fn new(model: ModelSpec, api_key: impl Into<String>) -> Self {
        Self::with_base_url(model, api_key, "https://api.anthropic.com/v1")
    }

    /// Binds to a compatible endpoint at a custom base URL.
    #[must_use]
    pub fn with_base_url(
        model: ModelSpec,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            api_key: api_key.into(),
            base_url: base_url.into(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    fn request_params(&self, request: &OracleRequest) -> Value {
        json!({
            "model": self.model.name(),
            "max_tokens": self.max_output_tokens,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": request.user_prompt}],
        })
    }

    fn response_from_message(message: &Value) -> Result<OracleResponse, OracleError> {
        let text = message
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| string_at(b, &["type"]) == Some("text"))
            })
            .and_then(|b| string_at(b, &["text"]))
            .ok_or_else(|| OracleError::BadResponse("no text content block".to_owned()))?
            .to_owned();
        Ok(OracleResponse {
            text,
            input_tokens: usize_at(message, &["usage", "input_tokens"]),
            output_tokens: usize_at(message, &["usage", "output_tokens"]),
        })
    }
}

#[async_trait]
impl Oracle for AnthropicOracle {
    fn model(&self) -> &ModelSpec {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_params(request))
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        Self::response_from_message(&body)
    }

    async fn submit_batch(&self, requests: &[OracleRequest]) -> Result<String, OracleError> {
        let entries: Vec<Value> = requests
            .iter()
            .map(|request| {
                json!({
                    "custom_id": request.custom_id,
                    "params": self.request_params(request),
                })
            })
            .collect();
        let response = self
            .client
            .post(format!("{}/messages/batches", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({ "requests": entries }))
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        string_at(&body, &["id"])
            .map(str::to_owned)
            .ok_or_else(|| OracleError::BadResponse("batch creation returned no id".to_owned()))
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchJobStatus, OracleError> {
        let response = self
            .client
            .get(format!("{}/messages/batches/{batch_id}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        match string_at(&body, &["processing_status"]).unwrap_or("") {
            "ended" => Ok(BatchJobStatus::Completed),
            "canceling" => Ok(BatchJobStatus::Failed("canceling".to_owned())),
            _ => Ok(BatchJobStatus::InProgress),
        }
    }

    async fn fetch_batch(
        &self,
        batch_id: &str,
    ) -> Result<AHashMap<String, OracleResponse>, OracleError> {
        let response = self
            .client
            .get(format!("{}/messages/batches/{batch_id}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        let body: Value = response.json().await.map_err(|e| transport(&e))?;
        let results_url = string_at(&body, &["results_url"])
            .ok_or_else(|| OracleError::BadResponse("ended batch has no results_url".to_owned()))?;

        let content = self
            .client
            .get(results_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if !content.status().is_success() {
            return Err(error_from_status(content).await);
        }
        let text = content.text().await.map_err(|e| transport(&e))?;

        let mut results = AHashMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                tracing::warn!("undecodable batch result line skipped");
                continue;
            };
            let Some(custom_id) = string_at(&entry, &["custom_id"]) else {
                continue;
            };
            match string_at(&entry, &["result", "type"]) {
                Some("succeeded") => {
                    if let Some(message) = entry.get("result").and_then(|r| r.get("message")) {
                        match Self::response_from_message(message) {
                            Ok(parsed) => {
                                results.insert(custom_id.to_owned(), parsed);
                            }
                            Err(e) => {
                                tracing::warn!(custom_id, error = %e, "batch result entry unusable");
                            }
                        }
                    }
                }
                other => {
                    tracing::warn!(custom_id, result = ?other, "batch entry did not succeed");
                }
            }
        }
        Ok(results)
    }
}
