//! blelog CLI
//!
//! Downloads logged data from, or streams live data off, wireless sensor boards.

use anyhow::{bail, Context};
use blelog_agent::{
    cache::DeviceCache,
    capture::CaptureStore,
    cloud::CloudLink,
    config::{parse_sensor_rate, Config, DeviceEntry},
    connection::ConnectionManager,
    download::{BarReporter, DeviceOutcome, DownloadOrchestrator},
    sensor::SensorKind,
    stats::{create_shared_stats, SharedCaptureStats},
    stream::{StreamOptions, StreamSession},
    transport::{NoopScanner, Scanner, SimScanner},
    VERSION,
};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blelog")]
#[command(version = VERSION)]
#[command(about = "Log download and live capture for wireless sensor boards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the on-board log of every device
    Download(CaptureArgs),

    /// Stream live sensor data until Enter or Ctrl+C is pressed
    Stream(CaptureArgs),

    /// List the sensors that can be configured
    Sensors,

    /// Show configuration
    Config,
}

#[derive(Args)]
struct CaptureArgs {
    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device to capture from, optionally with a display name
    #[arg(long = "device", value_name = "MAC[=NAME]")]
    devices: Vec<String>,

    /// Sensor to stream and its output data rate in Hz
    #[arg(long = "sensor", value_name = "NAME=HZ")]
    sensors: Vec<String>,

    /// Directory capture files are written to
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Device state cache file
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Cloud username (requires the cloud feature)
    #[arg(long)]
    cloud_user: Option<String>,

    /// Cloud password (requires the cloud feature)
    #[arg(long)]
    cloud_passwd: Option<String>,

    /// Cloud service base URL (requires the cloud feature)
    #[arg(long)]
    cloud_endpoint: Option<String>,

    /// Use simulated boards instead of a radio
    #[arg(long)]
    simulate: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Download(args) => block_on(cmd_download(args)),
        Commands::Stream(args) => block_on(cmd_stream(args)),
        Commands::Sensors => {
            cmd_sensors();
            Ok(())
        }
        Commands::Config => {
            cmd_config();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn block_on<F: Future<Output = anyhow::Result<()>>>(command: F) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?
        .block_on(command)
}

async fn cmd_download(args: CaptureArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let cancel = CancellationToken::new();
    install_ctrlc(cancel.clone())?;

    println!("blelog v{VERSION}");
    println!();
    println!("Downloading from {} device(s)", config.devices.len());
    println!("  Output: {:?}", config.output);
    println!("  Cache: {:?}", config.cache);
    println!();

    let stats = create_shared_stats();
    if args.simulate {
        let scanner = SimScanner::demo(config.devices.iter().map(|d| d.mac.clone()));
        download_with(scanner, &config, cancel, Arc::clone(&stats)).await?;
    } else {
        warn_no_radio();
        download_with(NoopScanner::new(), &config, cancel, Arc::clone(&stats)).await?;
    }
    Ok(())
}

async fn download_with<S: Scanner>(
    scanner: S,
    config: &Config,
    cancel: CancellationToken,
    stats: SharedCaptureStats,
) -> anyhow::Result<()> {
    let connections = ConnectionManager::new(
        scanner,
        DeviceCache::load_or_empty(&config.cache),
        config.connection.settings(),
    );
    let store = CaptureStore::new(&config.output, Arc::clone(&stats))?;
    let mut orchestrator =
        DownloadOrchestrator::new(connections, store, config.connection.download_options())
            .with_reporter(BarReporter::new())
            .with_cancellation(cancel);
    if let Some(link) = cloud_link(config)? {
        orchestrator = orchestrator.with_cloud(link);
    }

    let summary = orchestrator.run(&config.devices).await?;

    println!();
    for report in &summary.devices {
        let status = match &report.outcome {
            DeviceOutcome::Completed => "completed".to_string(),
            DeviceOutcome::NothingLogged => "nothing logged".to_string(),
            DeviceOutcome::Failed(e) => format!("failed: {e}"),
        };
        println!("{} - {status}", report.address);
        for artifact in report.finalized() {
            println!("  {} ({} samples)", artifact.path.display(), artifact.samples);
        }
    }
    println!();
    println!("{}", stats.summary());

    let failures: Vec<String> = summary
        .integrity_failures()
        .map(|(address, e)| format!("{address}: {e}"))
        .collect();
    if !failures.is_empty() {
        bail!("capture files may be inconsistent:\n{}", failures.join("\n"));
    }
    Ok(())
}

async fn cmd_stream(args: CaptureArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    if config.sensors.is_empty() {
        bail!("at least one '--sensor NAME=HZ' is required to stream");
    }
    let cancel = CancellationToken::new();
    install_ctrlc(cancel.clone())?;

    println!("blelog v{VERSION}");
    println!();
    println!("Streaming from {} device(s)", config.devices.len());
    for (sensor, hz) in &config.sensors {
        println!("  {sensor}: {hz} Hz");
    }
    println!();

    let stats = create_shared_stats();
    if args.simulate {
        let scanner = SimScanner::demo(config.devices.iter().map(|d| d.mac.clone()));
        stream_with(scanner, &config, cancel, Arc::clone(&stats)).await?;
    } else {
        warn_no_radio();
        stream_with(NoopScanner::new(), &config, cancel, Arc::clone(&stats)).await?;
    }
    Ok(())
}

async fn stream_with<S: Scanner>(
    scanner: S,
    config: &Config,
    cancel: CancellationToken,
    stats: SharedCaptureStats,
) -> anyhow::Result<()> {
    let connections = ConnectionManager::new(
        scanner,
        DeviceCache::load_or_empty(&config.cache),
        config.connection.settings(),
    );
    let store = CaptureStore::new(&config.output, Arc::clone(&stats))?;
    let options = StreamOptions {
        reconnect_attempts: config.connection.stream_reconnect_attempts,
        settle: config.connection.download_options().settle,
    };
    let mut session = StreamSession::new(connections, store, options).with_cancellation(cancel.clone());
    if let Some(link) = cloud_link(config)? {
        session = session.with_cloud(link);
    }

    println!("Press Enter or Ctrl+C to stop");
    println!();
    stop_on_enter(cancel);

    let summary = session.run(&config.devices, &config.sensors).await?;

    println!();
    for (address, e) in &summary.skipped {
        println!("{address} - skipped: {e}");
    }
    for report in &summary.devices {
        match &report.error {
            None => println!("{} ({}) - stopped", report.address, report.name),
            Some(e) => println!("{} ({}) - failed: {e}", report.address, report.name),
        }
    }
    println!();
    println!("{}", stats.summary());

    let failures: Vec<String> = summary
        .integrity_failures()
        .map(|(address, e)| format!("{address}: {e}"))
        .collect();
    if !failures.is_empty() {
        bail!("capture files may be inconsistent:\n{}", failures.join("\n"));
    }
    Ok(())
}

fn cmd_sensors() {
    println!("Available sensors");
    println!("=================");
    println!();
    for kind in SensorKind::ALL {
        println!("  {:<20} {}", kind.name(), kind.csv_columns());
    }
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Merge the config file with command line arguments.
fn resolve_config(args: &CaptureArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None if !args.devices.is_empty() => Config::default(),
        None => bail!("either '--config' or '--device' options must be used"),
    };

    for device in &args.devices {
        config.devices.push(DeviceEntry::parse(device)?);
    }
    for sensor in &args.sensors {
        let (name, hz) = parse_sensor_rate(sensor)?;
        config.sensors.insert(name, hz);
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(cache) = &args.cache {
        config.cache = cache.clone();
    }

    match (&args.cloud_user, &args.cloud_passwd) {
        (Some(username), Some(password)) => {
            config.cloud_login = Some(blelog_agent::cloud::CloudCredentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        (None, None) => {}
        _ => bail!("'--cloud-user' and '--cloud-passwd' are both required to sync to the cloud"),
    }
    if let Some(endpoint) = &args.cloud_endpoint {
        config.cloud_endpoint = Some(endpoint.clone());
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "cloud")]
fn cloud_link(config: &Config) -> anyhow::Result<Option<CloudLink>> {
    use blelog_agent::cloud::{CloudConfig, HttpCloud};

    let Some(credentials) = config.cloud_login.clone() else {
        return Ok(None);
    };
    let Some(endpoint) = config.cloud_endpoint.clone() else {
        eprintln!("Warning: cloud login given without a cloud endpoint, sync disabled");
        return Ok(None);
    };
    let service = HttpCloud::new(CloudConfig::new(endpoint))?;
    println!("Cloud sync: enabled");
    Ok(Some(CloudLink::new(Arc::new(service), credentials)))
}

#[cfg(not(feature = "cloud"))]
fn cloud_link(config: &Config) -> anyhow::Result<Option<CloudLink>> {
    if config.cloud_login.is_some() || config.cloud_endpoint.is_some() {
        eprintln!("Warning: cloud settings ignored (cloud feature not enabled at compile time)");
    }
    Ok(None)
}

fn warn_no_radio() {
    eprintln!("Warning: no radio backend is linked into this build; devices will not be found.");
    eprintln!("Use --simulate for a dry run against simulated boards.");
}

/// Set up Ctrl+C handler.
fn install_ctrlc(cancel: CancellationToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .context("Error setting Ctrl+C handler")
}

/// Cancel once a line is read from stdin. A closed stdin never cancels.
fn stop_on_enter(cancel: CancellationToken) {
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            cancel.cancel();
        }
    });
}
