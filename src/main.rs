use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use hitchhiker::config::Config;
use hitchhiker::destination;
use hitchhiker::discovery;
use hitchhiker::probe::ScamperLauncher;
use hitchhiker::Engine;

/// Rate-controlled hop-limited path probing.
#[derive(Parser)]
#[command(name = "hitchhiker", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a destination table in paced rounds.
    Run {
        /// Destination table CSV (dst, hop_count, sec_last_ip, sec_last_hop).
        #[arg(short, long)]
        destinations: PathBuf,

        /// Number of rounds; 0 runs until interrupted.
        #[arg(short = 'n', long)]
        num_probes: Option<u64>,

        /// Interval between rounds, e.g. `1s` or `500ms`.
        #[arg(short = 'i', long, value_parser = humantime_serde::re::humantime::parse_duration)]
        probe_interval: Option<Duration>,
    },
    /// Derive a destination table from one full trace per target.
    Discover {
        /// Newline-delimited address list.
        #[arg(short, long)]
        targets: PathBuf,

        /// Where to write the destination table CSV.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

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

    if let Command::Version = cli.command {
        println!("hitchhiker {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting hitchhiker",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Command::Run {
                destinations,
                num_probes,
                probe_interval,
            } => run(cfg, destinations, num_probes, probe_interval).await,
            Command::Discover { targets, output } => discover(cfg, targets, output).await,
            Command::Version => Ok(()),
        }
    })
}

async fn run(
    mut cfg: Config,
    destinations: PathBuf,
    num_probes: Option<u64>,
    probe_interval: Option<Duration>,
) -> Result<()> {
    if let Some(n) = num_probes {
        cfg.num_probes = n;
    }
    if let Some(interval) = probe_interval {
        cfg.probe_interval = interval;
    }
    cfg.validate().context("invalid configuration")?;

    let launcher = ScamperLauncher::from_config(&cfg.probe).context("probe preflight")?;
    let table = destination::load_table(&destinations)?;

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    let engine = Engine::new(cfg, Arc::new(launcher));
    let summary = engine.run(&table, stop).await?;

    tracing::info!(
        rounds = summary.rounds,
        endpoint_rows = summary.endpoint_rows,
        secondary_rows = summary.secondary_rows,
        parse_failures = summary.parse_failures,
        "hitchhiker stopped",
    );

    Ok(())
}

async fn discover(cfg: Config, targets: PathBuf, output: PathBuf) -> Result<()> {
    let launcher = ScamperLauncher::from_config(&cfg.probe).context("probe preflight")?;
    discovery::discover(&cfg, Arc::new(launcher), &targets, &output).await?;
    Ok(())
}

/// Cancel `stop` on SIGINT or SIGTERM. Probes already running are left to
/// finish and are drained by the engine.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received SIGINT, shutting down");
                }
            }
        }

        stop.cancel();
    });
}
