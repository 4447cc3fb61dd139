//! Typed error enums for the three core components.
//!
//! These are the errors that are part of the documented contract (see §7 of
//! the design doc): callers are expected to match on variant, not just
//! display the message. Glue code at the CLI boundary still uses
//! `anyhow::Result` the way the rest of this codebase's ancestry does.

use thiserror::Error;

/// Errors raised while decoding or interpolating a pipeline document.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The format could not be inferred from the filename or content, or the
    /// input was empty.
    #[error("unknown pipeline format{}", filename.as_deref().map(|f| format!(" for {f}")).unwrap_or_default())]
    FormatUnknown { filename: Option<String> },

    /// The underlying YAML/JSON decoder rejected the input.
    #[error("failed to parse {format} pipeline{}: {message}", filename.as_deref().map(|f| format!(" ({f})")).unwrap_or_default())]
    Parse {
        format: &'static str,
        filename: Option<String>,
        message: String,
    },

    /// A `${NAME?}` reference had no value bound in the environment.
    #[error("environment variable not set: {0}")]
    VariableNotSet(String),
}

/// Errors raised by the subprocess supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// `Start` was called on an instance that is already running or has
    /// already run to completion.
    #[error("process is already running")]
    AlreadyRunning,

    /// The child process could not be spawned or attached to a PTY/pipe.
    #[error("failed to spawn child process: {0}")]
    ChildSpawn(#[source] std::io::Error),

    /// A signal could not be delivered to a live PID.
    #[error("failed to deliver signal to pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the chunked log streamer.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// `maxChunkBytes` was zero (or negative before the cast).
    #[error("maxChunkBytes must be greater than 0")]
    InvalidChunkSize,

    /// Returned by a caller-supplied `upload` callback. The streamer itself
    /// never returns this to a `Write` caller — it is only ever recorded via
    /// `failed_chunks()` — but the type is shared so callbacks can construct
    /// a value with `?` internally.
    #[error("upload failed: {0}")]
    Upload(String),
}
