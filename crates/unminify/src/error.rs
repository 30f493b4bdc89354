use std::fmt;

/// Error type for a de-minification run, separating failures by pipeline stage.
///
/// Keeping parse/cost/batch/oracle failures distinct lets callers handle
/// user feedback and recovery policies accurately without string matching.
/// Recoverable failures (transient transport errors, malformed per-function
/// oracle entries, cache I/O) are absorbed inside the pipeline and never
/// reach this type.
#[derive(Debug, Clone)]
pub enum DeminifyError {
    /// The input source failed to parse as JavaScript.
    Parse(ParseError),
    /// The caller's cost gate rejected the estimated spend.
    CostCancelled,
    /// A pending deferred batch exists for a different source and no resume
    /// was requested. Carries the stored batch ID so the message is actionable.
    BatchCollision {
        /// Batch ID found in the pending-batch state file.
        existing: String,
        /// Source hash recorded when that batch was submitted.
        stored_hash: String,
        /// Source hash of the current input.
        current_hash: String,
    },
    /// The oracle failed after retries were exhausted, or a deferred job
    /// ended in a terminal failure state.
    Oracle(OracleError),
}

impl fmt::Display for DeminifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(error) => write!(f, "parse error: {error}"),
            Self::CostCancelled => write!(f, "cost estimate rejected by caller"),
            Self::BatchCollision {
                existing,
                stored_hash,
                current_hash,
            } => write!(
                f,
                "a pending batch {existing} exists for source {stored_hash}, but the current \
                 source hashes to {current_hash}; pass the batch ID to resume it explicitly, \
                 or delete the pending-batch file from the cache directory"
            ),
            Self::Oracle(error) => write!(f, "oracle error: {error}"),
        }
    }
}

impl std::error::Error for DeminifyError {}

impl From<ParseError> for DeminifyError {
    fn from(error: ParseError) -> Self {
        Self::Parse(error)
    }
}

impl From<OracleError> for DeminifyError {
    fn from(error: OracleError) -> Self {
        Self::Oracle(error)
    }
}

/// The input could not be parsed as either a module or a script.
///
/// Fatal for the run: nothing downstream can operate without a syntax tree.
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Byte offset of the first syntax error, if one was located.
    pub offset: Option<usize>,
    /// 1-based line of the first syntax error, if located.
    pub line: Option<usize>,
    /// Human-readable description of the failure.
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.offset) {
            (Some(line), _) => write!(f, "{} (line {line})", self.message),
            (None, Some(offset)) => write!(f, "{} (byte {offset})", self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Errors from the oracle transport layer.
///
/// `RateLimited` is kept distinct from other transient failures because the
/// retry policy differs: a rate limit sleeps a full minute once, while other
/// transient errors use exponential backoff.
#[derive(Debug, Clone)]
pub enum OracleError {
    /// The provider returned HTTP 429 or an overload signal.
    RateLimited,
    /// A network or protocol failure before a response body was obtained.
    Transport(String),
    /// The provider returned a non-success status with a message.
    Api { status: u16, message: String },
    /// The response body did not contain the expected payload shape.
    BadResponse(String),
    /// A deferred batch job ended in a terminal non-success state.
    BatchFailed(String),
}

impl OracleError {
    /// Whether the interactive retry policy should attempt this error again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::BadResponse(_) | Self::BatchFailed(_) => false,
        }
    }
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited by provider"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::Api { status, message } => write!(f, "API error (status {status}): {message}"),
            Self::BadResponse(msg) => write!(f, "unexpected response shape: {msg}"),
            Self::BatchFailed(msg) => write!(f, "batch job failed: {msg}"),
        }
    }
}

impl std::error::Error for OracleError {}

/// A non-fatal problem encountered while applying renames.
///
/// These are collected and reported alongside the output rather than failing
/// the run; a hard failure of the whole rename pass returns the original
/// source instead.
#[derive(Debug, Clone)]
pub enum RenameWarning {
    /// The suggested name is not a valid identifier or is a reserved word.
    InvalidName { function_id: String, name: String },
    /// Applying the rename would capture or be captured by an existing
    /// binding or free reference of the same name.
    Collision {
        function_id: String,
        old: String,
        new: String,
    },
    /// The mapping referenced a name with no binding in the function's scope.
    UnknownBinding { function_id: String, old: String },
    /// The renamed output no longer parses cleanly. Last-line check only.
    ReassemblyInvalid { message: String },
}

impl fmt::Display for RenameWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName { function_id, name } => {
                write!(f, "{function_id}: suggested name {name:?} is not a usable identifier")
            }
            Self::Collision { function_id, old, new } => {
                write!(f, "{function_id}: renaming {old} -> {new} would collide; skipped")
            }
            Self::UnknownBinding { function_id, old } => {
                write!(f, "{function_id}: no binding named {old} in scope; skipped")
            }
            Self::ReassemblyInvalid { message } => {
                write!(f, "renamed output failed the re-parse check: {message}")
            }
        }
    }
}
