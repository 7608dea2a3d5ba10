/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::input::{greater_than_zero, hopo_parser, HoPo};
use crate::gnupg::GnuPg;
use crate::repository::ArchiveCommand;
use crate::state::StateConfiguration;
use crate::status::StatusStore;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

fn default_build_queue_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "aptforge", display_name = "aptforge", bin_name = "aptforge-server", author = "Wavelens", version, about, long_about = None)]
pub struct Cli {
    #[arg(long, env = "APTFORGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "APTFORGE_LOG_JSON", default_value = "false")]
    pub log_json: bool,
    #[arg(long, env = "APTFORGE_HOME", default_value = "/var/lib/aptforge")]
    pub home: String,
    #[arg(long, env = "APTFORGE_HOSTNAME", default_value = "localhost")]
    pub hostname: String,
    #[arg(long, env = "APTFORGE_FTPD_BIND", value_parser = hopo_parser, default_value = "0.0.0.0:8067")]
    pub ftpd_bind: HoPo,
    #[arg(long, env = "APTFORGE_HTTP_URL", default_value = "http://localhost:8066")]
    pub http_url: String,
    #[arg(long, env = "APTFORGE_ARCHIVE_ORIGIN", default_value = "aptforge")]
    pub archive_origin: String,
    #[arg(long, env = "APTFORGE_INCOMING_QUEUE_SIZE", value_parser = greater_than_zero::<usize>, default_value = "256")]
    pub incoming_queue_size: usize,
    #[arg(long, env = "APTFORGE_BUILD_QUEUE_SIZE", value_parser = greater_than_zero::<usize>, default_value_t = default_build_queue_size())]
    pub build_queue_size: usize,
    #[arg(long, env = "APTFORGE_SBUILD_JOBS", value_parser = greater_than_zero::<usize>, default_value = "1")]
    pub sbuild_jobs: usize,
    /// Per-call timeout for builds, in seconds.
    #[arg(long, env = "APTFORGE_BUILD_TIMEOUT", value_parser = greater_than_zero::<u64>)]
    pub build_timeout: Option<u64>,
    /// Days to wait for outstanding build results before a package is closed.
    #[arg(long, env = "APTFORGE_WAIT_FOR_BUILD_RESULTS", value_parser = greater_than_zero::<i64>, default_value = "3")]
    pub wait_for_build_results: i64,
    /// Seconds between stale package sweeps; defaults to the wait window.
    #[arg(long, env = "APTFORGE_STALE_SWEEP_INTERVAL", value_parser = greater_than_zero::<u64>)]
    pub stale_sweep_interval: Option<u64>,
    /// Hours a build result that failed to upload is retried.
    #[arg(long, env = "APTFORGE_UPLOAD_RETENTION", value_parser = greater_than_zero::<u64>, default_value = "24")]
    pub upload_retention: u64,
    #[arg(long, env = "APTFORGE_UPLOAD_RETRY_INTERVAL", value_parser = greater_than_zero::<u64>, default_value = "60")]
    pub upload_retry_interval: u64,
    #[arg(long, env = "APTFORGE_BINPATH_REPREPRO", default_value = "reprepro")]
    pub binpath_reprepro: String,
    #[arg(long, env = "APTFORGE_BINPATH_SBUILD", default_value = "sbuild")]
    pub binpath_sbuild: String,
    #[arg(long, env = "APTFORGE_BINPATH_GPG", default_value = "gpg")]
    pub binpath_gpg: String,
    #[arg(long, env = "APTFORGE_BINPATH_SCHROOT", default_value = "schroot")]
    pub binpath_schroot: String,
    #[arg(long, env = "APTFORGE_BINPATH_DEBOOTSTRAP", default_value = "debootstrap")]
    pub binpath_debootstrap: String,
    #[arg(long, env = "APTFORGE_BINPATH_DPKG_BUILDPACKAGE", default_value = "dpkg-buildpackage")]
    pub binpath_dpkg_buildpackage: String,
    #[arg(long, env = "APTFORGE_BINPATH_DPKG_SOURCE", default_value = "dpkg-source")]
    pub binpath_dpkg_source: String,
    /// Do not sign or verify build requests and results.
    #[arg(long, env = "APTFORGE_DISABLE_SIGNING", default_value = "false")]
    pub disable_signing: bool,
    #[arg(long, env = "APTFORGE_REPORT_ERRORS", default_value = "false")]
    pub report_errors: bool,
    #[arg(long, env = "APTFORGE_SENTRY_DSN")]
    pub sentry_dsn: Option<String>,
    #[arg(long, env = "APTFORGE_EMAIL_ENABLED", default_value = "false")]
    pub email_enabled: bool,
    #[arg(long, env = "APTFORGE_EMAIL_SMTP_HOST")]
    pub email_smtp_host: Option<String>,
    #[arg(long, env = "APTFORGE_EMAIL_SMTP_PORT", default_value = "25")]
    pub email_smtp_port: u16,
    #[arg(long, env = "APTFORGE_EMAIL_SMTP_USERNAME")]
    pub email_smtp_username: Option<String>,
    #[arg(long, env = "APTFORGE_EMAIL_SMTP_PASSWORD_FILE")]
    pub email_smtp_password_file: Option<String>,
    #[arg(long, env = "APTFORGE_EMAIL_FROM_ADDRESS")]
    pub email_from_address: Option<String>,
    #[arg(long, env = "APTFORGE_EMAIL_FROM_NAME", default_value = "aptforge")]
    pub email_from_name: String,
    #[arg(long, env = "APTFORGE_EMAIL_DISABLE_TLS", default_value = "false")]
    pub email_disable_tls: bool,
    /// Only addresses matching this regex receive notifications.
    #[arg(long, env = "APTFORGE_EMAIL_ALLOW_REGEX", default_value = ".*")]
    pub email_allow_regex: String,
    /// Addresses notified about every package.
    #[arg(long, env = "APTFORGE_NOTIFY", value_delimiter = ',')]
    pub notify: Vec<String>,
    #[arg(long, env = "APTFORGE_STATE_FILE")]
    pub state_file: Option<String>,
    /// Build and upload archive keyring packages after startup.
    #[arg(long, env = "APTFORGE_BUILD_KEYRING_PACKAGES", default_value = "false")]
    pub build_keyring_packages: bool,
}

impl Cli {
    /// Where this daemon receives uploads, as seen by builders.
    pub fn ftp_hopo(&self) -> HoPo {
        HoPo {
            host: self.hostname.clone(),
            port: self.ftpd_bind.port,
        }
    }

    pub fn wait_for_build_results(&self) -> Duration {
        Duration::from_secs(self.wait_for_build_results.max(0) as u64 * 24 * 3600)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        self.stale_sweep_interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.wait_for_build_results())
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout.map(Duration::from_secs)
    }
}

/// On-disk layout below the daemon home.
#[derive(Debug, Clone)]
pub struct HomeDirs {
    pub home: PathBuf,
}

impl HomeDirs {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }

    pub fn incoming(&self) -> PathBuf {
        self.home.join("incoming")
    }

    pub fn spool(&self) -> PathBuf {
        self.home.join("spool")
    }

    pub fn repositories(&self) -> PathBuf {
        self.home.join("repositories")
    }

    pub fn repository(&self, identity: &str) -> PathBuf {
        self.repositories().join(identity)
    }

    pub fn log(&self) -> PathBuf {
        self.home.join("log")
    }

    pub fn chroots(&self) -> PathBuf {
        self.home.join("chroots")
    }

    pub fn chroot(&self, codename: &str, arch: &str) -> PathBuf {
        self.chroots().join(codename).join(arch)
    }

    pub fn gnupg(&self) -> PathBuf {
        self.home.join(".gnupg")
    }

    pub fn status_file(&self) -> PathBuf {
        self.home.join("status.json")
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            self.incoming(),
            self.spool(),
            self.repositories(),
            self.log(),
            self.chroots(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Events consumed by the single ingest task.
#[derive(Debug)]
pub enum IngestEvent {
    Changes(PathBuf),
    Command(ArchiveCommand, oneshot::Sender<Result<String>>),
    Shutdown,
}

#[derive(Debug)]
pub struct ServerState {
    pub cli: Cli,
    pub dirs: HomeDirs,
    pub statuses: StatusStore,
    pub gnupg: Option<Arc<GnuPg>>,
    config: RwLock<Arc<StateConfiguration>>,
}

impl ServerState {
    pub fn new(cli: Cli, config: StateConfiguration) -> Result<Self> {
        let dirs = HomeDirs::new(Path::new(&cli.home));
        dirs.create_all()?;
        let statuses = StatusStore::load(&dirs.status_file())?;
        let gnupg = if cli.disable_signing {
            None
        } else {
            Some(Arc::new(GnuPg::new(&dirs.gnupg(), &cli.binpath_gpg)))
        };
        let config = statuses.apply_releases(config);

        Ok(Self {
            cli,
            dirs,
            statuses,
            gnupg,
            config: RwLock::new(Arc::new(config)),
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<StateConfiguration> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn set_config(&self, config: StateConfiguration) {
        let config = Arc::new(self.statuses.apply_releases(config));
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Re-read the state file, if any, and swap the snapshot.
    pub fn reload(&self) -> Result<()> {
        let config = match &self.cli.state_file {
            Some(path) => StateConfiguration::from_file(path)?,
            None => (*self.config()).clone(),
        };
        self.set_config(config);
        Ok(())
    }

    pub fn signer(&self) -> Option<&GnuPg> {
        self.gnupg.as_deref()
    }
}
