//! Sandbox executable.
//!
//! Spawned by the client with the shared segment ids on the command line:
//!
//! ```text
//! soundproof-sbox --group <shmid> --sandbox <shmid> --sr <rate>
//! ```
//!
//! Exit code 0 on clean shutdown, nonzero on fatal error.

use anyhow::{Context, Result};
use clap::Parser;
use soundproof_core::{HEARTBEAT_TIMEOUT_MS, POLL_SLEEP_MS};
use soundproof_sbox::app::App;
use soundproof_sbox::{audio, msgproc};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sandbox process hosting plugin instances for a soundproof client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Group shared segment id
    #[arg(long)]
    group: String,

    /// Sandbox shared segment id
    #[arg(long)]
    sandbox: String,

    /// Sample rate
    #[arg(long)]
    sr: f64,

    /// Client instance id (informational)
    #[arg(long)]
    instance_id: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soundproof=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if args.sr < 1.0 {
        anyhow::bail!("--sr must be a positive sample rate");
    }
    tracing::info!(
        group = %args.group,
        sandbox = %args.sandbox,
        sr = args.sr,
        "sandbox starting"
    );

    let app = Arc::new(
        App::new(&args.group, &args.sandbox, args.sr)
            .context("failed to attach shared segments")?,
    );
    app.send(soundproof_ipc::msg::SandboxMsg::ReportInfo { text: "sandbox ready".to_string() });

    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut clean = true;
    loop {
        msgproc::process_messages(&app);
        if app.schedule_terminate.load(Ordering::Acquire) {
            break;
        }
        if app.heartbeat_age() > heartbeat_timeout {
            // The client is gone; don't linger as a zombie.
            tracing::error!("no heartbeat for {heartbeat_timeout:?}, terminating");
            clean = false;
            break;
        }
        std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
    }

    audio::stop(&app);
    // Final flush so a clean shutdown's replies still reach the client.
    let _ = app.poll_messages();
    tracing::info!("sandbox exiting (clean={clean})");
    if clean { Ok(()) } else { std::process::exit(1) }
}
