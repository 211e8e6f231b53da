//! Shared building blocks for the NDT tools.
//!
//! This crate carries the pieces every other crate in the workspace leans on:
//!
//! - [`run`] builds the tokio runtime, installs the tracing subscriber and drives the
//!   async entry point of a binary.
//! - [`config`] holds the runtime, output, scheduler and test configuration structs.
//! - [`error`] defines the error taxonomy shared by the scheduler and the test phases.
//! - [`tcpstat`] abstracts reading kernel TCP instrumentation ("stats providers") and
//!   aggregating a sequence of snapshots into per-connection telemetry.
//! - [`version`] describes the server version announced to clients.
//!
//! # Logging
//!
//! Verbosity follows the `-v` count convention: 0 = ERROR, 1 = INFO, 2 = DEBUG,
//! 3 = TRACE. When `RUST_LOG` is set it takes precedence over the command line.

pub mod config;
pub mod error;
pub mod tcpstat;
pub mod version;

pub use config::OutputConfig;
pub use config::RuntimeConfig;
pub use config::SchedulerConfig;
pub use config::SchedulingMode;
pub use config::TestConfig;

fn verbosity_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(verbosity_directive(output.verbose))
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(output.verbose > 2)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder
        .thread_name("ndt-worker")
        .build()
        .map_err(|err| anyhow::anyhow!("failed to build tokio runtime: {err}"))
}

/// Runs the async entry point of a binary.
///
/// Sets up tracing and the tokio runtime, then blocks on `func`. Errors are printed to
/// stderr (unless `quiet`) and reported as `None`; the caller decides the exit status.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(err) = runtime.validate() {
        if !output.quiet {
            eprintln!("{err}");
        }
        return None;
    }
    if let Err(err) = init_tracing(&output) {
        if !output.quiet {
            eprintln!("{err:#}");
        }
        return None;
    }
    let rt = match build_runtime(&runtime) {
        Ok(rt) => rt,
        Err(err) => {
            if !output.quiet {
                eprintln!("{err:#}");
            }
            return None;
        }
    };
    let start = std::time::Instant::now();
    let res = rt.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                println!("walltime: {:?}", start.elapsed());
            }
            Some(summary)
        }
        Err(err) => {
            if !output.quiet {
                eprintln!("{err:#}");
            }
            None
        }
    }
}
