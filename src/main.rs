/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aptforge_core::init_state;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

/// Entities are re-checked this often; failed ones recover on a later pass.
const CHECK_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let state = init_state()?;

    let mut daemon = builder::start_daemon(Arc::clone(&state)).await?;

    if state.cli.build_keyring_packages {
        if let Err(e) = daemon.build_keyring_packages().await {
            error!(error = %format!("{:#}", e), "Failed to build keyring packages");
        }
    }

    let mut check = time::interval_at(time::Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            _ = check.tick() => {
                let failed = daemon.check().await;
                if !failed.is_empty() {
                    warn!(entities = %failed.join(" "), "Entities failed their check");
                }
            }
        }
    }

    info!("Shutting down");
    daemon.stop().await
}
