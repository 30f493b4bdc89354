//! Model metadata and token accounting.
//!
//! Batch sizing lives or dies on accurate token counts: a chars/4 heuristic
//! only worked with a large safety margin, while per-model tokenization
//! lets the scheduler fill 90% of the context window. OpenAI-family models
//! count through the tiktoken BPE; Claude-family models have no public
//! tokenizer, so a calibrated chars-per-token ratio stands in; anything
//! unknown falls back to `ceil(chars / 4)`.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// Default number of context tokens reserved for the model's output.
pub const DEFAULT_OUTPUT_RESERVE: usize = 16_384;

/// Fraction of the usable context a batch may fill.
const BUDGET_UTILIZATION: f64 = 0.9;

/// The oracle provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat-completions and batch APIs.
    Openai,
    /// Anthropic messages and message-batches APIs.
    Anthropic,
}

/// Documented input-context limits, keyed by model-name prefix so dated
/// snapshots (`gpt-4o-2024-11-20`) match their base entry.
const CONTEXT_LIMITS: &[(&str, usize)] = &[
    ("gpt-4.1", 1_047_576),
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-5-mini", 400_000),
    ("gpt-5", 400_000),
    ("o3-mini", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("o1", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-3-7-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
];

/// Published USD prices per million input/output tokens. Unknown models
/// take their family's mid-tier price so the cost gate errs on the side of
/// asking.
const PRICES_PER_MTOK: &[(&str, f64, f64)] = &[
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-5-mini", 0.25, 2.00),
    ("gpt-5", 1.25, 10.00),
    ("o3-mini", 1.10, 4.40),
    ("o3", 2.00, 8.00),
    ("o4-mini", 1.10, 4.40),
    ("claude-opus-4", 15.00, 75.00),
    ("claude-sonnet-4", 3.00, 15.00),
    ("claude-3-7-sonnet", 3.00, 15.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
];

/// A provider/model pair with its token accounting.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    provider: Provider,
    name: String,
}

impl ModelSpec {
    #[must_use]
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The model's documented input-context limit, with conservative
    /// family fallbacks for unknown names.
    #[must_use]
    pub fn context_limit(&self) -> usize {
        for (prefix, limit) in CONTEXT_LIMITS {
            if self.name.starts_with(prefix) {
                return *limit;
            }
        }
        match self.provider {
            Provider::Openai => 128_000,
            Provider::Anthropic => 200_000,
        }
    }

    /// Input-token budget for one batch:
    /// `floor(0.9 * (context_limit - output_reserve))`.
    #[must_use]
    pub fn batch_budget(&self, output_reserve: usize) -> usize {
        let usable = self.context_limit().saturating_sub(output_reserve);
        (usable as f64 * BUDGET_UTILIZATION).floor() as usize
    }

    /// Counts input tokens for `text` with the model's own tokenizer where
    /// one exists.
    #[must_use]
    pub fn count_tokens(&self, text: &str) -> usize {
        match self.provider {
            Provider::Openai => match openai_bpe(&self.name) {
                Some(bpe) => bpe.encode_with_special_tokens(text).len(),
                None => heuristic_quarter(text),
            },
            // ~3.5 characters per token measured on minified JavaScript.
            Provider::Anthropic => (text.chars().count() * 2).div_ceil(7),
        }
    }

    /// Published price per million input/output tokens.
    #[must_use]
    pub fn price_per_mtok(&self) -> (f64, f64) {
        for (prefix, input, output) in PRICES_PER_MTOK {
            if self.name.starts_with(prefix) {
                return (*input, *output);
            }
        }
        match self.provider {
            Provider::Openai => (2.00, 8.00),
            Provider::Anthropic => (3.00, 15.00),
        }
    }
}

fn heuristic_quarter(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The BPE for an OpenAI model, built once per process. Falls back from
/// the exact model lookup to the current-generation encoding, and to
/// nothing if the vocabulary cannot be loaded.
fn openai_bpe(model: &str) -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| {
        tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::o200k_base())
            .ok()
    })
    .as_ref()
}

/// What a run is about to spend, shown to the caller's cost gate before
/// any oracle traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    /// Total prompt tokens across all planned requests.
    pub input_tokens: usize,
    /// Estimated completion tokens across all planned requests.
    pub output_tokens: usize,
    /// Estimated spend in USD at the model's published prices.
    pub estimated_usd: f64,
    /// Functions that will be sent (cache hits excluded).
    pub function_count: usize,
    /// Number of oracle requests that will be issued.
    pub request_count: usize,
}

impl CostEstimate {
    /// Builds an estimate from planned prompt sizes.
    ///
    /// Output is estimated from the identifier volume of the batched
    /// functions: the response is a JSON object whose size tracks how many
    /// identifiers can be renamed, not the input length.
    #[must_use]
    pub fn for_run(
        model: &ModelSpec,
        input_tokens: usize,
        identifier_count: usize,
        function_count: usize,
        request_count: usize,
    ) -> Self {
        let output_tokens = function_count * 48 + identifier_count * 12;
        let (input_price, output_price) = model.price_per_mtok();
        let estimated_usd = (input_tokens as f64 / 1_000_000.0) * input_price
            + (output_tokens as f64 / 1_000_000.0) * output_price;
        Self {
            input_tokens,
            output_tokens,
            estimated_usd,
            function_count,
            request_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_leaves_output_reserve_and_margin() {
        let model = ModelSpec::new(Provider::Openai, "gpt-4o");
        let budget = model.batch_budget(DEFAULT_OUTPUT_RESERVE);
        assert_eq!(budget, ((128_000 - 16_384) as f64 * 0.9).floor() as usize);
    }

    #[test]
    fn unknown_models_fall_back_by_family() {
        let openai = ModelSpec::new(Provider::Openai, "experimental-new-model");
        assert_eq!(openai.context_limit(), 128_000);
        let anthropic = ModelSpec::new(Provider::Anthropic, "claude-99");
        assert_eq!(anthropic.context_limit(), 200_000);
    }

    #[test]
    fn anthropic_counting_is_monotonic_in_length(){
        let model = ModelSpec::new(Provider::Anthropic, "claude-sonnet-4-20250514");
        let short = model.count_tokens("function a(x) { return x; }");
        let long = model.count_tokens("function a(x) { return x; } function b(y) { return y * 2; }");
        assert!(short > 0, "token counts are never zero for non-empty text");
        assert!(long > short, "longer text must count more tokens");
    }
}
