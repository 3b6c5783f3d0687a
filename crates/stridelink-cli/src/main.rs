//! # stridelink-cli
//!
//! Daemon binary for the stridelink dual-shoe session manager.
//!
//! This binary provides:
//! - Coordinator startup against the real btleplug transport, or a
//!   simulated pair of shoes with `--simulate`
//! - TOML configuration loading with sensible defaults
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, against real hardware
//! cargo run --package stridelink-cli
//!
//! # Without hardware
//! cargo run --package stridelink-cli -- --simulate
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use stridelink_core::{
    BleTransport, BtleplugTransport, Coordinator, CoordinatorConfig, DualState, FakePeripheral,
    FakeTransport,
};

mod logging;

struct Args {
    simulate: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        simulate: false,
        config: None,
    };
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--config" => {
                let path = raw
                    .next()
                    .context("--config requires a path argument")?;
                args.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!(
                "unknown argument `{other}`\nusage: stridelink [--simulate] [--config <path>]"
            ),
        }
    }
    Ok(args)
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "stridelink")
        .map(|dirs| dirs.config_dir().join("stridelink.toml"))
        .unwrap_or_else(|| PathBuf::from("./stridelink.toml"))
}

/// A simulated transport advertising both configured shoes, each with one
/// canned frame so state changes show up in the logs.
fn simulated_transport(config: &CoordinatorConfig) -> FakeTransport {
    let transport = FakeTransport::new();
    let mut left = FakePeripheral::matching(&config.left);
    left.queued_notifications =
        vec![br#"{"roll": 1.2, "fsr_left": [10, 20, 30, 40, 50]}"#.to_vec()];
    let mut right = FakePeripheral::matching(&config.right);
    right.queued_notifications =
        vec![br#"{"roll": -0.8, "fsr_right": [12, 18, 33, 41, 47]}"#.to_vec()];
    transport.add_peripheral(left);
    transport.add_peripheral(right);
    transport
}

fn log_state(state: &DualState) {
    info!(
        measuring = state.measuring,
        left = %state.left.state,
        right = %state.right.state,
        "session state"
    );
    for (role, role_state) in [("left", &state.left), ("right", &state.right)] {
        if !role_state.frame.is_empty() {
            debug!(role, frame = ?role_state.frame, "latest frame");
        }
        if let Some(error) = &role_state.last_error {
            warn!(role, error, "role error");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let is_production = std::env::var("STRIDELINK_ENV").is_ok_and(|v| v == "production");
    logging::init(is_production)?;

    info!("Starting stridelink");

    let config_path = args.config.unwrap_or_else(default_config_path);
    let config =
        CoordinatorConfig::load(&config_path).context("failed to load configuration")?;
    info!(path = %config_path.display(), "configuration loaded");

    let transport: Arc<dyn BleTransport> = if args.simulate {
        info!("using simulated transport");
        Arc::new(simulated_transport(&config))
    } else {
        Arc::new(
            BtleplugTransport::new()
                .await
                .context("failed to open Bluetooth adapter")?,
        )
    };

    let coordinator = Coordinator::new(config, transport)?;
    let mut states = coordinator.subscribe();
    coordinator.start_measurement().await?;

    let mut terminal_failure = None;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow().clone();
                log_state(&state);
                if let Some(failure) = state.failure {
                    terminal_failure = Some(failure);
                    break;
                }
            }
        }
    }

    coordinator.stop_measurement().await?;
    coordinator.shutdown().await;

    if let Some(failure) = terminal_failure {
        anyhow::bail!("measurement failed: {failure}");
    }
    info!("stopped cleanly");
    Ok(())
}
