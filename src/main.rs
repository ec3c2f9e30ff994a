use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use straggler::cli::{Cli, Command, OutputFormat, SimulateArgs};
use straggler::config::{self, CallSiteSpec, MonitorConfig};
use straggler::monitor::StragglerMonitor;
use straggler::report::{JsonLinesSink, LogSink, ReportSink, ScriptSink};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print the configured call sites
fn print_call_sites(specs: &[CallSiteSpec], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(specs)?);
        }
        OutputFormat::Text => {
            println!("{:<40} {:>14}  Nested calls", "Call site", "Threshold");
            println!("{}", "─".repeat(72));
            for spec in specs {
                let nested = if spec.nested_calls.is_empty() {
                    "-".to_string()
                } else {
                    spec.nested_calls.join(", ")
                };
                println!(
                    "{:<40} {:>14}  {}",
                    spec.name,
                    format!("{:?}", spec.threshold()),
                    nested
                );
            }
        }
    }
    Ok(())
}

fn build_sink(args: &SimulateArgs) -> Arc<dyn ReportSink> {
    match (&args.script, args.format) {
        (Some(script), _) => Arc::new(ScriptSink::new(script)),
        (None, OutputFormat::Json) => Arc::new(JsonLinesSink::new(std::io::stdout())),
        (None, OutputFormat::Text) => Arc::new(LogSink),
    }
}

/// Drive every configured call site from `args.threads` worker threads
fn run_simulation(args: SimulateArgs) -> Result<()> {
    let specs = config::load_call_sites(&args.config)?;
    let base = match &args.tunables {
        Some(path) => MonitorConfig::from_toml_file(path)?,
        None => MonitorConfig::default(),
    };
    let tunables = args.apply_overrides(base);

    let monitor = StragglerMonitor::from_specs(
        specs.clone(),
        tunables,
        Arc::new(straggler::clock::MonotonicClock::new()),
        build_sink(&args),
    )?;

    let mut sites = Vec::with_capacity(specs.len());
    for spec in &specs {
        if let Some(site) = monitor.on_call_site_resolved(&spec.name)? {
            sites.push((site, spec.nested_calls.clone()));
        }
    }
    let sites = Arc::new(sites);

    let mut workers = Vec::with_capacity(args.threads);
    for thread_id in 0..args.threads {
        monitor
            .on_thread_start(thread_id)
            .context("Failed to register worker thread")?;

        let monitor = monitor.clone();
        let sites = Arc::clone(&sites);
        let iterations = args.iterations;
        let nested = args.nested;
        let duration = Duration::from_millis(args.duration_ms);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", thread_id))
            .spawn(move || {
                for _ in 0..iterations {
                    for (site, nested_calls) in sites.iter() {
                        monitor.on_enter(*site, thread_id);
                        for _ in 0..nested {
                            for label in nested_calls {
                                monitor.on_nested_enter(thread_id, label);
                                monitor.on_nested_exit(thread_id, label);
                            }
                        }
                        thread::sleep(duration);
                        monitor.on_exit(*site, thread_id);
                    }
                }
                monitor.on_thread_end(thread_id);
            })
            .context("Failed to spawn worker thread")?;
        workers.push(handle);
    }

    for worker in workers {
        if worker.join().is_err() {
            anyhow::bail!("Worker thread panicked");
        }
    }
    monitor.shutdown();
    monitor.stats().print_summary();
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    match args.command {
        Command::Check { config, format } => {
            let specs = config::load_call_sites(&config)?;
            print_call_sites(&specs, format)?;
        }
        Command::Simulate(args) => run_simulation(args)?,
    }

    Ok(())
}
