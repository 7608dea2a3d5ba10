/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The process-wide daemon: owns the ingest task, the build loop and the
//! FTP server, and drives the status model of everything configured.

use anyhow::{anyhow, bail, Context, Result};
use aptforge_core::changes::Changes;
use aptforge_core::chroot::ChrootLifecycle;
use aptforge_core::email::{EmailService, NotificationSink};
use aptforge_core::ftpd::Ftpd;
use aptforge_core::gnupg::GnuPg;
use aptforge_core::input::HoPo;
use aptforge_core::keyring::build_keyring_packages;
use aptforge_core::repository::{ArchiveCommand, ArchiveContext, RepositoryLifecycle, RepositoryView};
use aptforge_core::sources::SourceLifecycle;
use aptforge_core::status::{Lifecycle, StatusModel};
use aptforge_core::types::*;
use async_trait::async_trait;
use entity::remote::Remote;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::scheduler::*;

pub const DAEMON_STATUS_ID: &str = "daemon";

const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The daemon's own archive signing key.
pub struct DaemonKeyLifecycle {
    pub gnupg: Option<Arc<GnuPg>>,
    pub email: String,
}

#[async_trait]
impl Lifecycle for DaemonKeyLifecycle {
    fn status_id(&self) -> String {
        DAEMON_STATUS_ID.to_string()
    }

    async fn prepare(&self) -> Result<()> {
        match &self.gnupg {
            Some(gnupg) => gnupg.gen_secret_key(&self.email).await,
            None => Ok(()),
        }
    }

    async fn unprepare(&self) -> Result<()> {
        if let Some(home) = self.gnupg.as_ref().map(|g| g.home()).filter(|h| h.exists()) {
            std::fs::remove_dir_all(home)
                .with_context(|| format!("Failed to remove {}", home.display()))?;
        }
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        match &self.gnupg {
            Some(gnupg) if !gnupg.has_secret_key().await? => bail!("No signing key"),
            _ => Ok(()),
        }
    }
}

/// A peer daemon; prepare validates its key, check reaches its FTP port.
pub struct RemoteLifecycle {
    pub remote: Remote,
    pub binpath_gpg: String,
}

#[async_trait]
impl Lifecycle for RemoteLifecycle {
    fn status_id(&self) -> String {
        self.remote.status_id()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![DAEMON_STATUS_ID.to_string()]
    }

    async fn prepare(&self) -> Result<()> {
        if let Some(file) = &self.remote.key_file {
            GnuPg::tmp(&self.binpath_gpg)?
                .import_file(Path::new(file))
                .await?;
        }
        Ok(())
    }

    async fn unprepare(&self) -> Result<()> {
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        let hopo = HoPo::parse(&self.remote.ftp).map_err(|e| anyhow!(e))?;
        tokio::time::timeout(
            REMOTE_CONNECT_TIMEOUT,
            TcpStream::connect((hopo.host.as_str(), hopo.port)),
        )
        .await
        .map_err(|_| anyhow!("Timeout connecting to {}", hopo))?
        .with_context(|| format!("Failed to connect to {}", hopo))?;
        Ok(())
    }
}

/// Checks and activation walk entities in this order.
fn rank(id: &str) -> u8 {
    match id.split(':').next() {
        Some(DAEMON_STATUS_ID) => 0,
        Some("source") => 1,
        Some("chroot") => 2,
        Some("repository") => 3,
        _ => 4,
    }
}

struct Running {
    events: mpsc::Sender<IngestEvent>,
    cancel: CancellationToken,
    ftpd: JoinHandle<()>,
    coordinator: JoinHandle<()>,
    builder: JoinHandle<()>,
}

pub struct Daemon {
    state: Arc<ServerState>,
    archives: Arc<Archives>,
    transport: Arc<dyn BundleTransport>,
    notifier: Arc<dyn NotificationSink>,
    running: Option<Running>,
}

impl Daemon {
    pub fn new(
        state: Arc<ServerState>,
        archives: Arc<Archives>,
        transport: Arc<dyn BundleTransport>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            state,
            archives,
            transport,
            notifier,
            running: None,
        }
    }

    /// reprepro archives, FTP transport and SMTP notifications.
    pub async fn from_state(state: Arc<ServerState>) -> Result<Self> {
        let notifier = Arc::new(EmailService::new(&state.cli).await?);
        let archives = Arc::new(Archives::reprepro(&state.dirs, &state.cli.binpath_reprepro));
        Ok(Self::new(state, archives, Arc::new(FtpTransport), notifier))
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn email(&self) -> String {
        format!("aptforge@{}", self.state.cli.hostname)
    }

    fn context(&self) -> ArchiveContext {
        ArchiveContext {
            origin: self.state.cli.archive_origin.clone(),
            http_url: self.state.cli.http_url.clone(),
        }
    }

    /// Every configured entity with its lifecycle hooks.
    pub fn status_model(&self) -> StatusModel<'_> {
        let state = &self.state;
        let config = state.config();
        let mut model = StatusModel::new(&state.statuses);

        model.register(Box::new(DaemonKeyLifecycle {
            gnupg: state.gnupg.clone(),
            email: self.email(),
        }));

        for source in &config.sources {
            model.register(Box::new(SourceLifecycle {
                source: source.clone(),
                store: &state.statuses,
                binpath_gpg: state.cli.binpath_gpg.clone(),
            }));
        }

        for chroot in &config.chroots {
            let Some(source) = config.source(&chroot.source) else {
                warn!(chroot = %chroot.name(), "Chroot without source (skipping)");
                continue;
            };
            model.register(Box::new(ChrootLifecycle {
                chroot: chroot.clone(),
                source: source.clone(),
                dir: state.dirs.chroot(chroot.codename(), &chroot.architecture),
                binpath_debootstrap: state.cli.binpath_debootstrap.clone(),
                binpath_schroot: state.cli.binpath_schroot.clone(),
                binpath_gpg: state.cli.binpath_gpg.clone(),
            }));
        }

        for repository in &config.repositories {
            model.register(Box::new(RepositoryLifecycle {
                config: Arc::clone(&config),
                identity: repository.identity.clone(),
                archive: self.archives.get(&repository.identity),
                basedir: state.dirs.repository(&repository.identity),
                context: self.context(),
                gnupg_home: state.gnupg.as_ref().map(|g| g.home().to_path_buf()),
            }));
        }

        for remote in &config.remotes {
            model.register(Box::new(RemoteLifecycle {
                remote: remote.clone(),
                binpath_gpg: state.cli.binpath_gpg.clone(),
            }));
        }

        model
    }

    fn ordered_ids(model: &StatusModel<'_>) -> Vec<String> {
        let mut ids = model.ids();
        ids.sort_by_key(|id| rank(id));
        ids
    }

    /// Re-derive the configuration snapshot so prepared release data shows.
    fn refresh(&self) {
        self.state.set_config((*self.state.config()).clone());
    }

    /// Prepare and activate every entity. Sources go first so later
    /// entities see their release data. Returns the ids that failed.
    pub async fn activate_all(&self) -> Vec<String> {
        let mut failed = Vec::new();

        {
            let model = self.status_model();
            for id in Self::ordered_ids(&model).into_iter().filter(|id| rank(id) <= 1) {
                if let Err(e) = model.activate(&id).await {
                    error!(entity = %id, error = %format!("{:#}", e), "Activation failed");
                    failed.push(id);
                }
            }
        }
        self.refresh();

        let model = self.status_model();
        for id in Self::ordered_ids(&model).into_iter().filter(|id| rank(id) > 1) {
            if let Err(e) = model.activate(&id).await {
                error!(entity = %id, error = %format!("{:#}", e), "Activation failed");
                failed.push(id);
            }
        }
        failed
    }

    /// Check every active entity along with its dependencies. Failing
    /// entities are deactivated for automatic reactivation, and come back
    /// once their check passes. Returns the ids that failed.
    pub async fn check(&self) -> Vec<String> {
        let failed = {
            let model = self.status_model();
            model
                .check_all()
                .await
                .into_iter()
                .filter_map(|(id, result)| {
                    let e = result.err()?;
                    warn!(entity = %id, error = %format!("{:#}", e), "Check failed");
                    Some(id)
                })
                .collect()
        };
        self.refresh();
        failed
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        if let Some(gnupg) = state.signer() {
            gnupg.gen_secret_key(&self.email()).await?;
        }
        let keyrings = Arc::new(Keyrings::load(&state).await?);

        let (events_tx, events_rx) = mpsc::channel(state.cli.incoming_queue_size);
        let (build_tx, build_rx) = mpsc::channel(state.cli.build_queue_size);
        let cancel = CancellationToken::new();

        let ftpd = Ftpd::bind(&state.cli.ftpd_bind, &state.dirs.home, events_tx.clone()).await?;
        let ftpd_cancel = cancel.child_token();
        let ftpd = tokio::spawn(async move {
            if let Err(e) = ftpd.run(ftpd_cancel).await {
                error!(error = %format!("{:#}", e), "ftpd stopped");
            }
        });

        let builder = tokio::spawn(schedule_build_loop(
            Arc::clone(&state),
            build_rx,
            Arc::clone(&self.transport),
            Arc::clone(&keyrings),
        ));

        let coordinator = Coordinator::new(
            Arc::clone(&state),
            Arc::clone(&self.archives),
            Arc::clone(&self.transport),
            Arc::clone(&self.notifier),
            keyrings,
            build_tx,
        );
        let coordinator = tokio::spawn(coordinator.run(events_rx));

        info!(ftpd = %state.cli.ftpd_bind, builds = state.cli.build_queue_size, "Daemon started");
        self.running = Some(Running {
            events: events_tx,
            cancel,
            ftpd,
            coordinator,
            builder,
        });
        Ok(())
    }

    /// Stop accepting uploads, let the ingest task drain and the builders
    /// finish their current builds.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        if let Err(e) = running.ftpd.await {
            warn!(error = %e, "ftpd task failed");
        }

        if running.events.send(IngestEvent::Shutdown).await.is_err() {
            warn!("Ingest task already gone");
        }
        if let Err(e) = running.coordinator.await {
            warn!(error = %e, "Ingest task failed");
        }
        if let Err(e) = running.builder.await {
            warn!(error = %e, "Build loop failed");
        }

        info!("Daemon stopped");
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.state.reload()?;
        self.start().await
    }

    /// Queue an archive command on the ingest task and wait for its output.
    pub async fn command(&self, command: ArchiveCommand) -> Result<String> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| anyhow!("Daemon is not running"))?;

        let (reply, result) = oneshot::channel();
        running
            .events
            .send(IngestEvent::Command(command, reply))
            .await
            .context("Ingest queue closed")?;
        result.await.context("Ingest task dropped the command")?
    }

    /// Build the archive keyring packages of every active repository and
    /// upload them to ourselves.
    pub async fn build_keyring_packages(&self) -> Result<()> {
        let gnupg = self
            .state
            .signer()
            .ok_or_else(|| anyhow!("Signing is disabled, no archive key"))?;
        let config = self.state.config();
        let maintainer = format!("aptforge <{}>", self.email());
        let own = self.state.cli.ftp_hopo();

        for repository in &config.repositories {
            if !self.state.statuses.is_active(&repository.status_id()) {
                warn!(repository = %repository.identity, "Repository not active, no keyring packages");
                continue;
            }

            let view = RepositoryView::new(&config, &repository.identity)?;
            let tmp = tempfile::tempdir()?;
            let built = build_keyring_packages(
                &view,
                gnupg,
                &maintainer,
                &self.state.cli.binpath_dpkg_buildpackage,
                tmp.path(),
            )
            .await?;

            for path in built {
                let changes = Changes::parse(&path)?;
                self.transport.upload(&changes, &own).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_orders_dependencies_first() {
        let mut ids = vec![
            "remote:peer:8067".to_string(),
            "repository:myid".to_string(),
            "chroot:wheezy:amd64".to_string(),
            "source:Debian:wheezy".to_string(),
            "daemon".to_string(),
        ];
        ids.sort_by_key(|id| rank(id));
        assert_eq!(
            ids,
            vec![
                "daemon",
                "source:Debian:wheezy",
                "chroot:wheezy:amd64",
                "repository:myid",
                "remote:peer:8067",
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_check_fails_for_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let remote = RemoteLifecycle {
            remote: Remote {
                ftp: format!("127.0.0.1:{}", port),
                key_file: None,
            },
            binpath_gpg: "gpg".to_string(),
        };
        assert_eq!(remote.dependencies(), vec!["daemon".to_string()]);
        assert!(remote.check().await.is_err());
    }

    #[tokio::test]
    async fn test_remote_check_reaches_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = RemoteLifecycle {
            remote: Remote {
                ftp: format!("127.0.0.1:{}", port),
                key_file: None,
            },
            binpath_gpg: "gpg".to_string(),
        };
        remote.check().await.unwrap();
    }
}
