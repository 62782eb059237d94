use std::path::PathBuf;
use thiserror::Error;

/// Fatal error taxonomy for the moco pipeline.
///
/// Per-job registration failures are deliberately *not* represented here:
/// they are recorded as flags and resolved structurally by failure recovery.
/// Only exhaustion of fallback options, bad configuration or missing inputs
/// abort the pipeline.
#[derive(Error, Debug)]
pub enum MocoError {
    #[error("unknown parameter key '{0}'")]
    UnknownParam(String),

    #[error("invalid value '{value}' for parameter '{key}': {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing or unreadable input: {0}")]
    MissingInput(PathBuf),

    #[error("no good transformation exists for slice {slice}: every registration failed")]
    NoGoodTransform { slice: usize },

    #[error("{0}")]
    UnsupportedTransform(String),
}
