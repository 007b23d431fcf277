use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use fieldgate::agent::{EventDescription, Forwarder, ForwarderOptions};
use fieldgate::buffer::{EventBuffer, ValueBuffer};
use fieldgate::config::Config;
use fieldgate::format::NumberFormatter;
use fieldgate::sender::{Credentials, HttpSinkClient, Uplink};
use fieldgate::spool::Spool;
use fieldgate::store::JsonRowStore;

/// Telemetry gateway: buffers field samples and forwards them to a cloud
/// sink, surviving outages via a durable on-disk spool.
#[derive(Parser)]
#[command(name = "fieldgate", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("fieldgate {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main gateway run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting fieldgate",
    );

    // The pipeline has one owner; a current-thread runtime is all the
    // cooperative tick loop needs.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    // Data directories for the persisted files.
    for file in [&cfg.values.file, &cfg.events.file] {
        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating data directory {}", parent.display()))?;
            }
        }
    }

    let store = JsonRowStore::open(&cfg.values.file)
        .await
        .context("opening row store")?;
    let mut values = ValueBuffer::new(store, &cfg.values.file, cfg.values.buffer_size);

    let mut formatter = NumberFormatter::new();
    for point in &cfg.values.data_points {
        values
            .add_data_point(&point.id)
            .await
            .with_context(|| format!("registering data point {}", point.id))?;

        if let Some(format) = &point.format {
            let parsed = format
                .parse()
                .with_context(|| format!("invalid format for data point {}", point.id))?;
            formatter.set_format(&point.id, parsed);
        }
    }

    // Event buffer and spool.
    let events = EventBuffer::open(&cfg.events.file, cfg.events.buffer_size)
        .await
        .context("opening event buffer")?;

    let spool = Spool::open(&cfg.spool.dir).await.context("opening spool")?;

    // Uplink over the HTTP sink adapter.
    let client = HttpSinkClient::new(&cfg.sink.endpoint, cfg.sink.timeout)
        .context("building sink client")?;
    let mut uplink = Uplink::new(client, cfg.sink.sending_retries);
    uplink.set_credentials(Credentials {
        tenant: cfg.sink.tenant.clone(),
        client_id: cfg.sink.client_id.clone(),
        shared_secret: cfg.sink.shared_secret.clone(),
    });
    uplink
        .enable_sending()
        .await
        .context("enabling sending (onboarding with the sink)")?;

    info!(endpoint = %cfg.sink.endpoint, "gateway boarded and sending enabled");

    let event_descriptions: Vec<EventDescription> = cfg
        .events
        .descriptions
        .iter()
        .map(|d| EventDescription {
            value: d.value,
            description: d.description.clone(),
        })
        .collect();

    let mut forwarder = Forwarder::new(
        values,
        events,
        spool,
        uplink,
        formatter,
        ForwarderOptions {
            send_interval: cfg.sink.send_interval,
            send_file_limit: cfg.spool.send_file_limit,
            send_event_limit: cfg.spool.send_event_limit,
        },
        event_descriptions,
    );

    // Tick loop. Tick ids increase by one per interval; the forwarder's
    // send pacing decides which ticks actually transmit.
    let mut ticker = tokio::time::interval(cfg.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick_id: u64 = 0;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    info!(interval = ?cfg.tick_interval, "gateway running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tick_id += 1;
                forwarder.refresh(tick_id).await;
            }
        }
    }

    // Final drain so a short outage right before shutdown does not leave
    // deliverable units behind.
    forwarder.drain_spools().await;
    info!("gateway stopped");

    Ok(())
}
