/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod buildrequest;
pub mod changes;
pub mod chroot;
pub mod consts;
pub mod debversion;
pub mod distribution;
pub mod email;
pub mod executer;
pub mod ftp;
pub mod ftpd;
pub mod gnupg;
pub mod input;
pub mod keyring;
pub mod porter;
pub mod reprepro;
pub mod repository;
pub mod sources;
pub mod state;
pub mod status;
pub mod types;

use anyhow::Result;
use clap::Parser;
use state::load_state;
use std::sync::{Arc, Once};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use types::*;

static INIT_LOGGING: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str, json: bool) {
    INIT_LOGGING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    });
}

pub fn init_state() -> Result<Arc<ServerState>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    info!(home = %cli.home, ftpd = %cli.ftpd_bind, "Starting aptforge");

    let config = load_state(cli.state_file.as_deref())?;
    Ok(Arc::new(ServerState::new(cli, config)?))
}
