use anyhow::Context;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ndtd",
    version,
    about = "NDT network diagnostic server",
    long_about = "`ndtd` runs NDT diagnostic sessions for legacy clients.

Clients connect to the control port, negotiate a set of tests (middlebox, simple firewall, C2S and S2C throughput, META) and receive a diagnosis of the path: link type, duplex mismatch, congestion and cable faults. Sessions are queued and run one at a time, or up to --max-clients at once in bounded mode."
)]
struct Args {
    // Network
    /// Control port; data listeners use the next two ports unless --port-ranges is given
    ///
    /// Use 0 to let the kernel pick every port.
    #[arg(
        short,
        long,
        default_value = "3001",
        value_name = "PORT",
        help_heading = "Network"
    )]
    port: u16,

    /// Address to listen on
    #[arg(
        long,
        default_value = "0.0.0.0",
        value_name = "IP",
        help_heading = "Network"
    )]
    bind_ip: std::net::IpAddr,

    /// Restrict data listeners to specific port ranges (e.g., "3010-3099,4000")
    #[arg(long, value_name = "RANGES", help_heading = "Network")]
    port_ranges: Option<String>,

    // Scheduling
    /// Run sessions one at a time, or up to --max-clients concurrently
    #[arg(
        long,
        value_enum,
        default_value = "single",
        value_name = "MODE",
        help_heading = "Scheduling"
    )]
    mode: common::SchedulingMode,

    /// Queue bound in single mode, concurrency bound in bounded mode
    #[arg(
        long,
        default_value = "50",
        value_name = "N",
        help_heading = "Scheduling"
    )]
    max_clients: usize,

    /// Longest a session may wait in the queue before it is turned away
    ///
    /// Accepts human-readable durations like "70s" or "2min".
    #[arg(
        long,
        default_value = "70s",
        value_name = "DURATION",
        help_heading = "Scheduling"
    )]
    max_queue_wait: humantime::Duration,

    /// Longest a started session may run
    #[arg(
        long,
        default_value = "300s",
        value_name = "DURATION",
        help_heading = "Scheduling"
    )]
    session_lifetime: humantime::Duration,

    // Tests
    /// Length of each throughput transfer
    #[arg(
        long,
        default_value = "10s",
        value_name = "DURATION",
        help_heading = "Tests"
    )]
    throughput_duration: humantime::Duration,

    /// Interval between kernel telemetry samples
    #[arg(
        long,
        default_value = "5ms",
        value_name = "DURATION",
        help_heading = "Tests"
    )]
    sample_interval: humantime::Duration,

    /// Hold back S2C writes while the send queue is full
    #[arg(long, help_heading = "Tests")]
    avoid_sndblock_up: bool,

    /// Where kernel TCP counters are read from
    #[arg(
        long,
        value_enum,
        default_value = "tcpinfo",
        value_name = "PROVIDER",
        help_heading = "Tests"
    )]
    stats_provider: common::tcpstat::ProviderKind,

    /// JSON file overriding the diagnosis thresholds
    #[arg(long, value_name = "PATH", help_heading = "Tests")]
    thresholds: Option<std::path::PathBuf>,

    /// Record telemetry samples and session summaries as JSON lines under this directory
    #[arg(long, value_name = "DIR", help_heading = "Tests")]
    data_dir: Option<std::path::PathBuf>,

    // Output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Print session statistics on shutdown
    #[arg(long, help_heading = "Output")]
    summary: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Print the protocol version as JSON and exit
    #[arg(long, help_heading = "Advanced settings")]
    protocol_version: bool,
}

impl Args {
    fn scheduler_config(&self) -> common::SchedulerConfig {
        common::SchedulerConfig {
            mode: self.mode,
            max_clients: self.max_clients,
            max_queue_wait: self.max_queue_wait.into(),
            session_lifetime: self.session_lifetime.into(),
            ..Default::default()
        }
    }

    fn test_config(&self) -> common::TestConfig {
        common::TestConfig {
            base_port: self.port,
            port_ranges: self.port_ranges.clone(),
            throughput_duration: self.throughput_duration.into(),
            sample_interval: self.sample_interval.into(),
            avoid_sndblock_up: self.avoid_sndblock_up,
            ..Default::default()
        }
    }
}

#[instrument(skip_all)]
async fn async_main(args: Args) -> anyhow::Result<ndtd::StatsSummary> {
    let scheduler = args.scheduler_config();
    scheduler.validate().map_err(anyhow::Error::msg)?;
    let tests = args.test_config();
    tests.validate().map_err(anyhow::Error::msg)?;
    let mut ctx = ndtd::ServerContext::new(scheduler, tests, args.stats_provider.build())?;
    if let Some(path) = &args.thresholds {
        ctx = ctx.with_thresholds(diagnostics::Thresholds::from_file(path)?);
    }
    if let Some(dir) = &args.data_dir {
        let recorder = ndtd::collab::JsonRecorder::new(dir)
            .with_context(|| format!("failed to set up recording in {}", dir.display()))?;
        ctx = ctx.with_recorder(std::sync::Arc::new(recorder));
    }
    let addr = std::net::SocketAddr::new(args.bind_ip, args.port);
    let listener = control::port_ranges::bind_listener(addr, None)
        .with_context(|| format!("failed to open control port {addr}"))?;
    tracing::info!(
        "ndtd listening on {}, stats provider {}",
        listener.local_addr()?,
        ctx.provider.name()
    );
    let cancel = tokio_util::sync::CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupted, shutting down"),
                Err(err) => tracing::error!("failed to wait for ctrl-c: {err}"),
            }
            cancel.cancel();
        }
    });
    ndtd::serve(listener, std::sync::Arc::new(ctx), cancel).await
}

fn main() -> Result<(), anyhow::Error> {
    // handle --protocol-version flag before parsing full arguments
    // respect -- separator: only check args before --
    let args: Vec<String> = std::env::args().collect();
    let separator_pos = args.iter().position(|arg| arg == "--");
    let args_to_check = if let Some(pos) = separator_pos {
        &args[..pos]
    } else {
        &args[..]
    };
    if args_to_check.iter().any(|arg| arg == "--protocol-version") {
        let version = common::version::ProtocolVersion::current();
        let json = version.to_json()?;
        println!("{}", json);
        return Ok(());
    }

    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
