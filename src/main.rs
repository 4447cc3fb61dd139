//! pipeline-runtime — demonstration entry point
//!
//! Wires the three core components together for manual exercise: `run`
//! spawns a command under the supervisor and streams its output through the
//! chunked log streamer to a local file (the stand-in for the out-of-scope
//! HTTPS log-upload client); `parse` decodes a pipeline document and prints
//! its interpolated JSON form. All stdout is JSON only; tracing logs go to
//! stderr, matching the teacher's contract.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline_runtime::pipeline::{parse as parse_pipeline, Environment, ParseOptions};
use pipeline_runtime::process::{Supervisor, SupervisorOptions};
use pipeline_runtime::schema::{ErrorResponse, ParseData, Response, RunData};
use pipeline_runtime::streamer::{Chunk, Streamer, StreamerOptions};
use pipeline_runtime::StreamerError;

#[derive(Debug, Parser)]
#[command(name = "pipeline-runtime")]
#[command(about = "Subprocess supervisor, chunked log streamer, and pipeline parser demonstration CLI", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn a command under the supervisor and stream its output through
    /// the chunked log streamer to a local log file.
    Run {
        /// Run the child under a pseudo-terminal instead of a plain pipe.
        #[arg(long)]
        pty: bool,

        /// Working directory for the child.
        #[arg(long)]
        cwd: Option<String>,

        /// Additional environment variables in KEY=VALUE form.
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,

        /// Number of concurrent uploader workers.
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Maximum bytes per chunk.
        #[arg(long, default_value = "65536")]
        max_chunk_bytes: usize,

        /// Path the streamed log is reassembled into, in chunk order.
        #[arg(long, default_value = "pipeline-runtime.log")]
        log: String,

        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Parse a pipeline file (YAML or JSON), interpolate it against the
    /// environment, and print the resulting tree as JSON.
    Parse {
        /// Path to the pipeline file. Format is inferred from its extension,
        /// falling back to content sniffing.
        file: String,

        /// Skip environment interpolation and print the decoded tree as-is.
        #[arg(long)]
        no_interpolation: bool,

        /// Additional environment variables in KEY=VALUE form, set before
        /// interpolation runs (override the inherited process environment).
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        ErrorResponse::new("internal_error", format!("{e:#}")).print();
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            pty,
            cwd,
            env_vars,
            concurrency,
            max_chunk_bytes,
            log,
            command,
        } => run_command(pty, cwd, env_vars, concurrency, max_chunk_bytes, log, command),

        Command::Parse {
            file,
            no_interpolation,
            env_vars,
        } => parse_command(file, no_interpolation, env_vars),
    }
}

/// Reassembles chunks delivered out-of-order (workers upload concurrently)
/// back into stream order before appending them to the log file, matching
/// §4.3's "consumers relying on global byte order must sort by `order` at
/// the sink" contract.
struct OrderedFileSink {
    file: Mutex<std::fs::File>,
    pending: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_order: Mutex<u64>,
}

impl OrderedFileSink {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Mutex::new(file),
            pending: Mutex::new(BTreeMap::new()),
            next_order: Mutex::new(1),
        }
    }

    fn accept(&self, chunk: &Chunk) -> Result<(), StreamerError> {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        pending.insert(chunk.order, chunk.data.clone());

        let mut next_order = self.next_order.lock().expect("next_order mutex poisoned");
        let mut file = self.file.lock().expect("file mutex poisoned");
        while let Some(data) = pending.remove(&*next_order) {
            file.write_all(&data)
                .map_err(|e| StreamerError::Upload(e.to_string()))?;
            *next_order += 1;
        }
        Ok(())
    }
}

fn run_command(
    pty: bool,
    cwd: Option<String>,
    env_vars: Vec<String>,
    concurrency: usize,
    max_chunk_bytes: usize,
    log: String,
    command: Vec<String>,
) -> Result<()> {
    let extra_env = parse_env_pairs(&env_vars)?;

    let log_file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&log)
        .with_context(|| format!("open log file {log}"))?;
    let sink = Arc::new(OrderedFileSink::new(log_file));

    let streamer = Streamer::new(
        StreamerOptions {
            concurrency: concurrency.max(1),
            max_chunk_bytes,
        },
        {
            let sink = Arc::clone(&sink);
            move |chunk: &Chunk| sink.accept(chunk)
        },
    );
    streamer.start().context("start log streamer")?;

    let streamer_for_sink = Arc::clone(&streamer);
    let supervisor = Supervisor::new(SupervisorOptions {
        command,
        cwd,
        extra_env,
        inherit_env: true,
        use_pty: pty,
        line_scanner: None,
        start_callback: None,
        external_sink: Some(Arc::new(move |bytes: &[u8]| {
            streamer_for_sink.write_blob(bytes);
        })),
    });

    supervisor.start().context("start supervised process")?;
    streamer.stop();

    let chunk_count = *sink.next_order.lock().expect("next_order mutex poisoned") - 1;
    let data = RunData {
        exit_status: supervisor.exit_status(),
        output: supervisor.output(),
        chunk_count,
        failed_chunks: streamer.failed_chunks(),
        log_path: log,
    };
    Response::new("run", data).print();

    Ok(())
}

fn parse_command(file: String, no_interpolation: bool, env_vars: Vec<String>) -> Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("read pipeline file {file}"))?;

    let mut env = Environment::from_current();
    for (k, v) in parse_env_pairs(&env_vars)? {
        env.set(k, v);
    }

    let opts = ParseOptions {
        filename: Some(&file),
        no_interpolation,
    };

    let tree = parse_pipeline(&bytes, &opts, Some(&mut env))
        .with_context(|| format!("parse pipeline file {file}"))?;

    Response::new("parse", ParseData { tree }).print();
    Ok(())
}

fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .with_context(|| format!("invalid KEY=VALUE environment pair: {pair}"))?;
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}
