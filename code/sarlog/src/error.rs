/// The failure taxonomy of the pipeline.
///
/// Decode, timeout and parse failures are scoped to one (file, metric) pair, write failures to one
/// output artifact.  Only configuration errors are fatal to a run.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{file}: {metric}: decoder timed out after {seconds}s")]
    DecodeTimeout {
        file: String,
        metric: String,
        seconds: u64,
    },

    #[error("{file}: {metric}: decoder failed: {reason}")]
    Decode {
        file: String,
        metric: String,
        reason: String,
    },

    #[error("{file}: {metric}: malformed decoder output: {reason}")]
    Parse {
        file: String,
        metric: String,
        reason: String,
    },

    #[error("{path}: write failed: {reason}")]
    Write { path: String, reason: String },

    #[error("{0}")]
    Config(String),
}
