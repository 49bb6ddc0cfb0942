// BBD bridge driver for Linux: runs the robot client or the simulator server over TCP.

mod config;
mod runner;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bbd_core::ErrorPolicy;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Role;

/// How long a stopped session gets to finish its cycle before the process exits anyway.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $BBD_CONFIG, ~/.config/bbd/config.toml, /etc/bbd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    role: Option<Role>,

    /// Server host (client role)
    #[arg(long)]
    host: Option<String>,

    /// Data port
    #[arg(short, long)]
    port: Option<u16>,

    /// Cycles to run, 0 for no limit
    #[arg(short = 'n', long)]
    cycles: Option<u64>,

    #[arg(long)]
    buffer_size: Option<usize>,

    /// Client role: connect, refuse the session with REASON, and exit
    #[arg(long, value_name = "REASON")]
    refuse: Option<i32>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(role) = args.role {
        cfg.role = role;
    }
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.data_port = port;
    }
    if let Some(cycles) = args.cycles {
        cfg.cycles = cycles;
    }
    if let Some(n) = args.buffer_size {
        cfg.buffer_size = n;
    }

    init_logging(&cfg.log_level);
    info!(role = ?cfg.role, devices = cfg.devices.len(), "starting");

    let stop = Arc::new(AtomicBool::new(false));
    let refuse = args.refuse;
    let rt = tokio::runtime::Runtime::new()?;
    let (result, policy) = rt.block_on(async {
        let session_stop = stop.clone();
        let mut session = tokio::task::spawn_blocking(move || runner::run(&cfg, refuse, &session_stop));
        let signalled = tokio::select! {
            joined = &mut session => return anyhow::Ok((joined?, ErrorPolicy::AbortLoud)),
            signalled = shutdown_signal() => signalled,
        };
        signalled?;
        info!("stopping after the current cycle");
        stop.store(true, Ordering::Relaxed);
        match tokio::time::timeout(STOP_GRACE, session).await {
            // A failure while tearing down after a stop request only sets the exit status.
            Ok(joined) => Ok((joined?, ErrorPolicy::AbortSilent)),
            Err(_) => {
                warn!("session did not stop in time");
                std::process::exit(1)
            }
        }
    })?;

    let outcome = policy.apply("run", result)?;
    info!(?outcome, "done");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
