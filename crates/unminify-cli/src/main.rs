//! Command-line front end for the de-minification engine.

use std::{
    io::{self, IsTerminal as _, Write as _},
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use unminify::{
    AnthropicOracle, CostEstimate, CostGate, Deminifier, DeminifyError, DeminifyOptions,
    ModelSpec, NoProgress, OpenAiOracle, Oracle, ProgressSink, ProgressUpdate, Provider,
    RenameCache,
};

/// Exit code for a rejected cost gate, distinct from ordinary failure.
const EXIT_COST_CANCELLED: u8 = 2;

/// Exit code for a Ctrl-C cancellation (conventional 128 + SIGINT). The
/// run is a flagged success that preserved the original source, so it must
/// not share the failure code.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "unminify", version, about = "Rename minified JavaScript with an LLM oracle")]
struct Cli {
    /// Minified JavaScript file to process.
    input: PathBuf,

    /// Where to write the renamed source (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// LLM provider family.
    #[arg(long, default_value = "openai")]
    provider: Provider,

    /// Model identifier; defaults per provider.
    #[arg(short, long)]
    model: Option<String>,

    /// Concurrent batches in flight within a round.
    #[arg(short = 'j', long, default_value_t = 3)]
    concurrency: usize,

    /// Submit one deferred batch job instead of interactive requests.
    #[arg(long)]
    batch: bool,

    /// Resume polling a previously submitted batch by ID.
    #[arg(long, value_name = "BATCH_ID")]
    resume: Option<String>,

    /// Disable the on-disk rename cache.
    #[arg(long)]
    no_cache: bool,

    /// Cache directory (defaults to .unminify-cache).
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Override the computed per-batch token budget.
    #[arg(long, value_name = "TOKENS")]
    max_batch_tokens: Option<usize>,

    /// Emit model-written descriptions as block comments.
    #[arg(long)]
    descriptions: bool,

    /// Oracle dispatch limit per minute.
    #[arg(long, default_value_t = 60)]
    rate_limit: u32,

    /// Verbose logging (repeat for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,

    /// Skip the cost confirmation prompt.
    #[arg(short = 'y', long)]
    yes: bool,
}

impl Cli {
    fn model_name(&self) -> String {
        self.model.clone().unwrap_or_else(|| match self.provider {
            Provider::Openai => "gpt-4o-mini".to_owned(),
            Provider::Anthropic => "claude-sonnet-4-20250514".to_owned(),
        })
    }

    fn build_oracle(&self) -> Result<Box<dyn Oracle>, String> {
        let spec = ModelSpec::new(self.provider, self.model_name());
        match self.provider {
            Provider::Openai => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| "OPENAI_API_KEY is not set".to_owned())?;
                Ok(Box::new(OpenAiOracle::new(spec, key)))
            }
            Provider::Anthropic => {
                let key = std::env::var("ANTHROPIC_API_KEY")
                    .map_err(|_| "ANTHROPIC_API_KEY is not set".to_owned())?;
                Ok(Box::new(AnthropicOracle::new(spec, key)))
            }
        }
    }

    fn build_cache(&self) -> RenameCache {
        if self.no_cache {
            RenameCache::disabled()
        } else {
            let dir = self
                .cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".unminify-cache"));
            RenameCache::new(dir)
        }
    }
}

/// Asks on stderr and reads one line from stdin. A non-interactive stdin
/// declines, so piped runs must pass `--yes` explicitly.
struct PromptGate;

impl CostGate for PromptGate {
    fn confirm(&self, estimate: &CostEstimate) -> bool {
        eprintln!(
            "About to send {} functions in {} request(s): ~{} input + ~{} output tokens, est. ${:.4}",
            estimate.function_count,
            estimate.request_count,
            estimate.input_tokens,
            estimate.output_tokens,
            estimate.estimated_usd,
        );
        if !io::stdin().is_terminal() {
            eprintln!("stdin is not a terminal; pass --yes to proceed without confirmation");
            return false;
        }
        eprint!("Proceed? [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

/// Always-approve gate for `--yes`.
struct YesGate;

impl CostGate for YesGate {
    fn confirm(&self, _estimate: &CostEstimate) -> bool {
        true
    }
}

/// Single-line progress rendering on stderr.
struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn update(&mut self, progress: &ProgressUpdate) {
        eprintln!(
            "[{}/{}] cache {}/{} | {} in / {} out | {} err | {:.1}s | {}",
            progress.current,
            progress.total,
            progress.cache_hits,
            progress.cache_hits + progress.cache_misses,
            progress.input_tokens,
            progress.output_tokens,
            progress.errors,
            progress.elapsed.as_secs_f64(),
            progress.label,
        );
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "unminify=error",
        (false, 0) => "unminify=warn",
        (false, 1) => "unminify=info",
        (false, 2) => "unminify=debug",
        (false, _) => "unminify=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let source = match std::fs::read_to_string(&cli.input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", cli.input.display());
            return ExitCode::FAILURE;
        }
    };

    let oracle = match cli.build_oracle() {
        Ok(oracle) => oracle,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received; finishing current batch");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let options = DeminifyOptions {
        file_name: cli.input.display().to_string(),
        skip_confirmation: cli.yes,
        use_batch: cli.batch,
        resume_batch_id: cli.resume.clone(),
        max_batch_tokens: cli.max_batch_tokens,
        output_path: cli.output.clone(),
        parallelism: cli.concurrency,
        rate_limit_per_minute: cli.rate_limit,
        emit_descriptions: cli.descriptions,
        working_dir: None,
        cancel: Some(Arc::clone(&cancel)),
    };

    let deminifier = Deminifier::new(oracle, cli.build_cache(), options);

    let result = if cli.quiet {
        deminifier
            .deminify(&source, gate(cli.yes).as_ref(), &mut NoProgress)
            .await
    } else {
        deminifier
            .deminify(&source, gate(cli.yes).as_ref(), &mut StderrProgress)
            .await
    };

    let output = match result {
        Ok(output) => output,
        Err(DeminifyError::CostCancelled) => {
            eprintln!("aborted: cost estimate rejected");
            return ExitCode::from(EXIT_COST_CANCELLED);
        }
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if output.cancelled {
        eprintln!("cancelled; original source left untouched");
        return ExitCode::from(EXIT_INTERRUPTED);
    }

    match cli.output.as_ref() {
        Some(path) => {
            if let Err(err) = std::fs::write(path, &output.source) {
                eprintln!("error: cannot write {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        }
        None => {
            print!("{}", output.source);
        }
    }

    if !cli.quiet {
        let stats = &output.stats;
        eprintln!(
            "done: {} functions, {} renames applied ({} skipped), cache {}/{} hits, {} errors",
            stats.functions,
            stats.renames_applied,
            stats.renames_skipped,
            stats.counters.cache_hits,
            stats.counters.cache_hits + stats.counters.cache_misses,
            stats.counters.errors,
        );
        for warning in &output.warnings {
            eprintln!("warning: {warning}");
        }
    }
    ExitCode::SUCCESS
}

fn gate(yes: bool) -> Box<dyn CostGate> {
    if yes {
        Box::new(YesGate)
    } else {
        Box::new(PromptGate)
    }
}
