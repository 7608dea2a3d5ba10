/*
 * SPDX-FileCopyrightText: 2025 Wavelens GmbH <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use aptforge_core::changes::Changes;
use aptforge_core::email::NotificationSink;
use aptforge_core::input::HoPo;
use aptforge_core::reprepro::{ArchiveDriver, ListedPackage};
use aptforge_core::repository::ArchiveCommand;
use aptforge_core::state::StateConfiguration;
use aptforge_core::types::{Cli, ServerState};
use async_trait::async_trait;
use builder::daemon::Daemon;
use builder::scheduler::{Archives, BundleTransport};
use clap::Parser;
use entity::repository::{Layout, Repository};
use std::path::Path;
use std::sync::Arc;

struct EmptyArchive;

#[async_trait]
impl ArchiveDriver for EmptyArchive {
    async fn include(&self, _: &str, _: &Path) -> Result<String> {
        Ok(String::new())
    }

    async fn copysrc(&self, _: &str, _: &str, _: &str, _: Option<String>) -> Result<String> {
        Ok(String::new())
    }

    async fn removesrc(&self, _: &str, _: &str, _: Option<String>) -> Result<String> {
        Ok(String::new())
    }

    async fn listmatched(&self, _: &str, _: &str) -> Result<Vec<ListedPackage>> {
        Ok(Vec::new())
    }

    async fn reindex(&self) -> Result<()> {
        Ok(())
    }

    async fn check(&self) -> Result<String> {
        Ok(String::new())
    }
}

struct NoTransport;

#[async_trait]
impl BundleTransport for NoTransport {
    async fn upload(&self, _: &Changes, _: &HoPo) -> Result<()> {
        Ok(())
    }
}

struct NoNotifier;

#[async_trait]
impl NotificationSink for NoNotifier {
    async fn notify(&self, _: &str, _: &str, _: &[String]) -> Result<()> {
        Ok(())
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn create_mock_state(home: &Path) -> Arc<ServerState> {
    let cli = Cli::parse_from([
        "aptforge-server",
        "--home",
        &home.display().to_string(),
        "--disable-signing",
        "--ftpd-bind",
        &format!("127.0.0.1:{}", free_port()),
    ]);
    let config = StateConfiguration {
        layouts: vec![Layout::default_layout()],
        repositories: vec![Repository {
            identity: "myid".to_string(),
            layout: "Default".to_string(),
            distributions: Vec::new(),
            allow_unauthenticated_uploads: false,
            extra_uploader_key_files: Vec::new(),
            notify: Vec::new(),
            notify_changed_by: false,
            notify_maintainer: false,
            reprepro_morguedir: false,
            internal_apt_priority: 500,
        }],
        ..Default::default()
    };
    Arc::new(ServerState::new(cli, config).unwrap())
}

fn create_daemon(state: Arc<ServerState>) -> Daemon {
    let archives = Arc::new(Archives::new(Box::new(|_| {
        Arc::new(EmptyArchive) as Arc<dyn ArchiveDriver>
    })));
    Daemon::new(state, archives, Arc::new(NoTransport), Arc::new(NoNotifier))
}

fn search() -> ArchiveCommand {
    ArchiveCommand::Search {
        repository: "myid".to_string(),
        codename: None,
        pattern: "foo".to_string(),
    }
}

#[tokio::test]
async fn test_daemon_start_command_stop() {
    let home = tempfile::tempdir().unwrap();
    let mut daemon = create_daemon(create_mock_state(home.path()));

    assert!(daemon.command(search()).await.is_err());

    daemon.start().await.unwrap();
    assert!(daemon.is_running());

    let output = daemon.command(search()).await.unwrap();
    assert_eq!(output.trim(), "{}");

    daemon.stop().await.unwrap();
    assert!(!daemon.is_running());
    assert!(daemon.command(search()).await.is_err());
}

#[tokio::test]
async fn test_daemon_restart() {
    let home = tempfile::tempdir().unwrap();
    let mut daemon = create_daemon(create_mock_state(home.path()));

    daemon.start().await.unwrap();
    daemon.restart().await.unwrap();
    assert!(daemon.is_running());

    let unknown = ArchiveCommand::Search {
        repository: "other".to_string(),
        codename: None,
        pattern: "foo".to_string(),
    };
    assert!(daemon.command(unknown).await.is_err());

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_model_lists_configured_entities() {
    let home = tempfile::tempdir().unwrap();
    let daemon = create_daemon(create_mock_state(home.path()));

    let ids = daemon.status_model().ids();
    assert!(ids.contains(&"daemon".to_string()));
    assert!(ids.contains(&"repository:myid".to_string()));
}
