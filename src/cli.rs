//! CLI argument parsing for the straggler tool

use crate::config::MonitorConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for call-site listings and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "straggler")]
#[command(version)]
#[command(about = "Catch calls that exceed their latency threshold", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a call-site file and print the resolved thresholds
    Check {
        /// Call-site file (`<call_site> <threshold> <unit>` per line)
        #[arg(value_name = "FILE")]
        config: PathBuf,

        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a synthetic workload against the configured call sites
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Call-site file (`<call_site> <threshold> <unit>` per line)
    #[arg(value_name = "FILE")]
    pub config: PathBuf,

    /// Program to invoke for every straggler caught
    #[arg(short = 's', long = "script", value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Report format when no script is given (text logs to stderr, json prints to stdout)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// TOML file with monitor tunables
    #[arg(long = "tunables", value_name = "PATH")]
    pub tunables: Option<PathBuf>,

    /// Scanner poll interval in milliseconds
    #[arg(short = 't', long = "poll-interval-ms", value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Initial thread-slot table capacity
    #[arg(long = "initial-capacity", value_name = "SLOTS")]
    pub initial_capacity: Option<usize>,

    /// Nested-call trace buffer size per thread, in bytes
    #[arg(long = "trace-buffer", value_name = "BYTES")]
    pub trace_buffer: Option<usize>,

    /// Disable nested-call tracing
    #[arg(long = "no-nested-tracing")]
    pub no_nested_tracing: bool,

    /// Number of worker threads
    #[arg(long = "threads", default_value = "1")]
    pub threads: usize,

    /// Calls per call site per thread
    #[arg(long = "iterations", default_value = "1")]
    pub iterations: usize,

    /// How long each simulated call runs, in milliseconds
    #[arg(long = "duration-ms", default_value = "0")]
    pub duration_ms: u64,

    /// Nested calls made inside each simulated call
    #[arg(long = "nested", default_value = "1")]
    pub nested: usize,
}

impl SimulateArgs {
    /// Apply command-line overrides on top of `base`
    pub fn apply_overrides(&self, mut base: MonitorConfig) -> MonitorConfig {
        if let Some(ms) = self.poll_interval_ms {
            base.poll_interval_ms = ms;
        }
        if let Some(capacity) = self.initial_capacity {
            base.initial_slot_capacity = capacity;
        }
        if let Some(bytes) = self.trace_buffer {
            base.trace_buffer_capacity = bytes;
        }
        if self.no_nested_tracing {
            base.nested_call_tracing = false;
        }
        base
    }
}
