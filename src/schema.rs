//! JSON output schema for the demonstration CLI.
//!
//! All stdout output is JSON only; tracing logs go to stderr. Grounded in the
//! teacher's `schema.rs` envelope shape (`schema_version`/`ok`/`type`, plus a
//! distinct error envelope with a `code`/`message` pair), pared down to the
//! two sub-commands this crate demonstrates (`run`, `parse`).

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "0.1";

fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Response payload for the `run` sub-command.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunData {
    pub exit_status: String,
    pub output: String,
    pub chunk_count: u64,
    pub failed_chunks: u64,
    pub log_path: String,
}

/// Response payload for the `parse` sub-command.
#[derive(Debug, Serialize, Deserialize)]
pub struct ParseData {
    pub tree: crate::pipeline::PipelineValue,
}
