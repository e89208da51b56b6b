mod audio;
mod channel;
mod config;
mod delivery;
mod error;
mod hal;
mod http;
mod mp4;
mod nightmode;
mod orchestrator;
mod osd;
mod pidfile;
mod record;
mod rtsp;
mod udp_stream;
mod util;
mod watchdog;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "camerad")]
#[command(about = "Application-layer firmware for a networked IP camera", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Load the resolved configuration, print it as JSON, and exit.
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let hal: Arc<dyn hal::Hal> = Arc::new(hal::null::NullHal::new());

    let orchestrator = Orchestrator::start(config, cli.config.clone(), hal).context("startup failed")?;
    install_signal_handlers(&orchestrator);
    orchestrator.run();

    Ok(())
}

static KEEP_RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static GRACEFUL: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_graceful_signal(_sig: libc::c_int) {
    if let Some(flag) = GRACEFUL.get() {
        flag.store(true, Ordering::SeqCst);
    }
    if let Some(flag) = KEEP_RUNNING.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

extern "C" fn on_fail_fast_signal(_sig: libc::c_int) {
    if let Some(flag) = GRACEFUL.get() {
        flag.store(false, Ordering::SeqCst);
    }
    if let Some(flag) = KEEP_RUNNING.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Wires every signal the original firmware distinguishes to the
/// orchestrator's `(keep_running, graceful)` flag pair: SIGINT/SIGQUIT/SIGTERM
/// unwind the main loop into a graceful [`Orchestrator::shutdown`], while
/// SIGABRT/SIGBUS/SIGSEGV/SIGFPE unwind it without teardown so a process
/// that's already corrupted doesn't touch hardware state on its way out.
/// SIGPIPE and SIGILL are ignored outright, matching the firmware's table.
fn install_signal_handlers(orchestrator: &Orchestrator) {
    let (keep_running, graceful) = orchestrator.signal_flags();
    let _ = KEEP_RUNNING.set(keep_running);
    let _ = GRACEFUL.set(graceful);

    unsafe {
        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            libc::signal(sig, on_graceful_signal as libc::sighandler_t);
        }
        for sig in [libc::SIGABRT, libc::SIGBUS, libc::SIGSEGV, libc::SIGFPE] {
            libc::signal(sig, on_fail_fast_signal as libc::sighandler_t);
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGILL, libc::SIG_IGN);
    }
}
