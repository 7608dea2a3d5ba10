/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod daemon;
pub mod packager;
pub mod sbuild;
pub mod scheduler;


use anyhow::Result;
use aptforge_core::types::ServerState;
use daemon::Daemon;
use std::sync::Arc;
use tracing::warn;

/// Activate everything configured and start the daemon's workers.
pub async fn start_daemon(state: Arc<ServerState>) -> Result<Daemon> {
    let mut daemon = Daemon::from_state(state).await?;

    let failed = daemon.activate_all().await;
    if !failed.is_empty() {
        warn!(entities = %failed.join(" "), "Some entities could not be activated");
    }

    daemon.start().await?;
    Ok(daemon)
}
