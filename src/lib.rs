//! pipeline-runtime — core library
//!
//! Three cooperating components (see DESIGN.md for the grounding ledger):
//! - [`pipeline`]: decode a YAML/JSON pipeline document into a generic tree
//!   and perform environment interpolation over it.
//! - [`process`]: launch a command under a PTY or pipe, capture its output,
//!   and terminate it gracefully-then-forcefully.
//! - [`streamer`]: split writes into ordered, fixed-size chunks and dispatch
//!   them to an upload callback through a worker pool.
//!
//! `schema` holds the JSON response envelope the demonstration CLI in
//! `main.rs` prints to stdout; it is not one of the three core components.

pub mod error;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod streamer;

pub use error::{PipelineError, ProcessError, StreamerError};
pub use pipeline::{parse, Environment, ParseOptions, PipelineValue};
pub use process::{Supervisor, SupervisorOptions};
pub use streamer::{Chunk, Streamer, StreamerOptions};
