/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, bail, Context, Result};
use aptforge_core::buildrequest::{gen_buildrequests, BuildRequestInput};
use aptforge_core::changes::{Changes, ChangesKind};
use aptforge_core::consts::SBUILD_RETVAL_INTERNAL_ERROR;
use aptforge_core::distribution::DistributionString;
use aptforge_core::email::NotificationSink;
use aptforge_core::gnupg::GnuPg;
use aptforge_core::input::HoPo;
use aptforge_core::porter::{build_port, PortTools};
use aptforge_core::reprepro::{ArchiveDriver, Reprepro};
use aptforge_core::repository::{
    resolve_distribution, ArchiveCommand, ArchiveContext, RepositoryView,
};
use aptforge_core::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use super::packager::*;
use super::sbuild::*;

/// Finished packages remembered to recognise late duplicate results.
const FINISHED_HISTORY: usize = 256;

/// Moves a bundle to a daemon's ingest endpoint.
#[async_trait]
pub trait BundleTransport: Send + Sync {
    async fn upload(&self, changes: &Changes, hopo: &HoPo) -> Result<()>;
}

pub struct FtpTransport;

#[async_trait]
impl BundleTransport for FtpTransport {
    async fn upload(&self, changes: &Changes, hopo: &HoPo) -> Result<()> {
        changes.upload(hopo).await
    }
}

pub type ArchiveFactory = Box<dyn Fn(&str) -> Arc<dyn ArchiveDriver> + Send + Sync>;

/// One archive driver per repository, created on first use.
pub struct Archives {
    factory: ArchiveFactory,
    drivers: Mutex<BTreeMap<String, Arc<dyn ArchiveDriver>>>,
}

impl Archives {
    pub fn new(factory: ArchiveFactory) -> Self {
        Self {
            factory,
            drivers: Mutex::new(BTreeMap::new()),
        }
    }

    /// reprepro trees below `<home>/repositories/<identity>`.
    pub fn reprepro(dirs: &HomeDirs, binpath: &str) -> Self {
        let dirs = dirs.clone();
        let binpath = binpath.to_string();
        Self::new(Box::new(move |identity| {
            Arc::new(Reprepro::new(&dirs.repository(identity), &binpath)) as Arc<dyn ArchiveDriver>
        }))
    }

    pub fn get(&self, identity: &str) -> Arc<dyn ArchiveDriver> {
        let mut drivers = match self.drivers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            drivers
                .entry(identity.to_string())
                .or_insert_with(|| (self.factory)(identity)),
        )
    }
}

/// Keys bundles are checked against. Empty when signing is disabled.
#[derive(Default)]
pub struct Keyrings {
    uploaders: BTreeMap<String, GnuPg>,
    remotes: Option<GnuPg>,
}

impl Keyrings {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Per-repository uploader keyrings and the remotes keyring, each
    /// seeded with this daemon's key.
    pub async fn load(state: &ServerState) -> Result<Self> {
        let Some(gnupg) = state.signer() else {
            return Ok(Self::disabled());
        };
        let own_key = gnupg.pub_key().await?;
        let config = state.config();

        let mut uploaders = BTreeMap::new();
        for repository in &config.repositories {
            let keyring = GnuPg::tmp(&state.cli.binpath_gpg)?;
            keyring.add_pub_key(&own_key).await?;
            for file in &repository.extra_uploader_key_files {
                keyring.import_file(Path::new(file)).await?;
            }
            uploaders.insert(repository.identity.clone(), keyring);
        }

        let remotes = GnuPg::tmp(&state.cli.binpath_gpg)?;
        remotes.add_pub_key(&own_key).await?;
        for remote in &config.remotes {
            if let Some(file) = &remote.key_file {
                remotes.import_file(Path::new(file)).await?;
                info!(remote = %remote.ftp, "Remote key added");
            }
        }

        Ok(Self {
            uploaders,
            remotes: Some(remotes),
        })
    }

    pub async fn verify_upload(&self, identity: &str, path: &Path) -> Result<()> {
        if self.remotes.is_none() {
            return Ok(());
        }
        let keyring = self
            .uploaders
            .get(identity)
            .ok_or_else(|| anyhow!("No uploader keyring for repository '{}'", identity))?;
        keyring.verify(path).await
    }

    pub async fn verify_remote(&self, path: &Path) -> Result<()> {
        match &self.remotes {
            Some(keyring) => keyring.verify(path).await,
            None => Ok(()),
        }
    }
}

/// The single consumer of the ingest queue. Owns the in-flight packages.
pub struct Coordinator {
    state: Arc<ServerState>,
    archives: Arc<Archives>,
    transport: Arc<dyn BundleTransport>,
    notifier: Arc<dyn NotificationSink>,
    keyrings: Arc<Keyrings>,
    build_queue: mpsc::Sender<PathBuf>,
    packages: HashMap<String, Package>,
    strays: Vec<(Changes, DateTime<Utc>)>,
    finished: VecDeque<FinishedPackage>,
}

impl Coordinator {
    pub fn new(
        state: Arc<ServerState>,
        archives: Arc<Archives>,
        transport: Arc<dyn BundleTransport>,
        notifier: Arc<dyn NotificationSink>,
        keyrings: Arc<Keyrings>,
        build_queue: mpsc::Sender<PathBuf>,
    ) -> Self {
        Self {
            state,
            archives,
            transport,
            notifier,
            keyrings,
            build_queue,
            packages: HashMap::new(),
            strays: Vec::new(),
            finished: VecDeque::new(),
        }
    }

    pub fn package(&self, pid: &str) -> Option<&Package> {
        self.packages.get(pid)
    }

    pub fn in_flight(&self) -> usize {
        self.packages.len()
    }

    pub fn strays(&self) -> usize {
        self.strays.len()
    }

    pub fn finished(&self) -> impl Iterator<Item = &FinishedPackage> {
        self.finished.iter()
    }

    /// Consume ingest events until `Shutdown` or the queue closes. Dropping
    /// the coordinator closes the build queue.
    pub async fn run(mut self, mut events: mpsc::Receiver<IngestEvent>) {
        let _guard = self
            .state
            .cli
            .sentry_dsn
            .as_deref()
            .filter(|_| self.state.cli.report_errors)
            .map(sentry::init);

        let period = self.state.cli.stale_sweep_interval();
        let mut sweep = time::interval_at(time::Instant::now() + period, period);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None | Some(IngestEvent::Shutdown) => {
                        info!("Ingest loop shutting down");
                        break;
                    }
                    Some(IngestEvent::Changes(path)) => {
                        if let Err(e) = self.handle_changes(&path).await {
                            error!(changes = %path.display(), error = %format!("{:#}", e), "Failed to process changes");
                        }
                    }
                    Some(IngestEvent::Command(command, reply)) => {
                        let result = self.execute(&command).await;
                        if reply.send(result).is_err() {
                            debug!("Command caller went away");
                        }
                    }
                },
                _ = sweep.tick() => self.sweep_stale(Utc::now()).await,
            }
        }
    }

    #[instrument(skip(self), fields(changes = %path.display()))]
    pub async fn handle_changes(&mut self, path: &Path) -> Result<()> {
        let changes = match Changes::parse(path) {
            Ok(changes) => changes,
            Err(e) => {
                if let Err(remove) = std::fs::remove_file(path) {
                    warn!(error = %remove, "Failed to remove unparsable changes");
                }
                return Err(e);
            }
        };

        match changes.kind() {
            ChangesKind::BuildRequest => {
                if let Err(e) = self.keyrings.verify_remote(path).await {
                    remove_rejected(&changes);
                    return Err(e);
                }
                info!("Queuing build request");
                self.build_queue
                    .send(path.to_path_buf())
                    .await
                    .context("Build queue closed")?;
            }
            ChangesKind::BuildResult => {
                if let Err(e) = self.keyrings.verify_remote(path).await {
                    remove_rejected(&changes);
                    return Err(e);
                }
                self.add_result(changes).await;
            }
            ChangesKind::UserUpload => self.add_upload(changes).await,
        }
        Ok(())
    }

    async fn add_result(&mut self, bres: Changes) {
        let pid = match bres.pkg_id() {
            Ok(pid) => pid,
            Err(e) => {
                error!(bres = %bres.file_name(), error = %e, "Build result without package id");
                return;
            }
        };

        if self.packages.contains_key(&pid) {
            self.update(&pid, bres).await;
        } else if self.finished.iter().any(|f| f.pid == pid) {
            warn!(pid = %pid, bres = %bres.file_name(), "Build result for finished package (orphan)");
            self.archive_orphan(&bres);
        } else {
            info!(pid = %pid, bres = %bres.file_name(), "Stray build result, holding back");
            self.strays.push((bres, Utc::now()));
        }
    }

    async fn update(&mut self, pid: &str, bres: Changes) {
        let Some(package) = self.packages.get_mut(pid) else {
            return;
        };

        match package.update(&bres) {
            Ok(UpdateOutcome::Incomplete) => {}
            Ok(UpdateOutcome::Complete) => {
                if let Some(package) = self.packages.remove(pid) {
                    self.finalize(package).await;
                }
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Build result not accepted");
                self.archive_orphan(&bres);
            }
        }
    }

    fn archive_orphan(&self, bres: &Changes) {
        if let Err(e) = bres.archive(&self.state.dirs.log()) {
            error!(bres = %bres.file_name(), error = %e, "Failed to archive orphan");
        }
    }

    async fn finalize(&mut self, package: Package) {
        let archive = self.archives.get(&package.dist().identity);
        let log_dir = self.state.dirs.log();
        let spool_dir = self.state.dirs.spool();
        let ctx = FinalizeContext {
            archive: archive.as_ref(),
            notifier: self.notifier.as_ref(),
            log_dir: &log_dir,
            spool_dir: &spool_dir,
            http_url: &self.state.cli.http_url,
            notify: &self.state.cli.notify,
        };

        let finished = package.finalize(&ctx).await;
        info!(pid = %finished.pid, installed = finished.installed, "Package done");
        self.finished.push_front(finished);
        self.finished.truncate(FINISHED_HISTORY);
    }

    async fn add_upload(&mut self, upload: Changes) {
        let pid = match upload.pkg_id() {
            Ok(pid) => pid,
            Err(e) => {
                self.discard(&upload, "unknown", &e).await;
                return;
            }
        };

        if self.packages.contains_key(&pid) {
            let e = anyhow!("Package is already being built");
            self.discard(&upload, &pid, &e).await;
            return;
        }

        match self.accept_upload(&upload).await {
            Ok(package) => {
                info!(pid = %pid, dist = %package.dist(), expected = package.expected(), "Package accepted");
                self.packages.insert(pid.clone(), package);
                self.replay_strays(&pid).await;
            }
            Err(e) => self.discard(&upload, &pid, &e).await,
        }
    }

    async fn replay_strays(&mut self, pid: &str) {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.strays)
            .into_iter()
            .partition(|(bres, _)| bres.pkg_id().is_ok_and(|p| p == pid));
        self.strays = rest;

        for (bres, _) in matching {
            info!(pid = %pid, bres = %bres.file_name(), "Replaying stray build result");
            if self.packages.contains_key(pid) {
                self.update(pid, bres).await;
            } else {
                self.archive_orphan(&bres);
            }
        }
    }

    /// Resolve, check and fan out a user upload into build requests.
    async fn accept_upload(&mut self, upload: &Changes) -> Result<Package> {
        let config = self.state.config();
        let dist = resolve_distribution(&config, upload.distribution()?)?;
        let view = RepositoryView::new(&config, &dist.identity)?;

        if !self.state.statuses.is_active(&view.repository.status_id()) {
            bail!("Repository '{}' is not active", dist.identity);
        }

        if view.repository.allow_unauthenticated_uploads {
            warn!(upload = %upload.file_name(), "Unauthenticated uploads allowed, not checking signature");
        } else {
            self.keyrings
                .verify_upload(&dist.identity, upload.path())
                .await?;
        }

        let archive = self.archives.get(&dist.identity);
        view.precheck(archive.as_ref(), upload.source()?, upload.version()?, &dist)
            .await?;

        let target = view.resolve(&dist)?;
        let signer = self.state.signer();
        let archive_key = match signer {
            Some(gnupg) => gnupg.pub_key().await?,
            None => String::new(),
        };
        let context = ArchiveContext {
            origin: self.state.cli.archive_origin.clone(),
            http_url: self.state.cli.http_url.clone(),
        };
        let own = self.state.cli.ftp_hopo();
        let repository_dir = self.state.dirs.repository(&dist.identity);
        let spool_dir = self.state.dirs.spool();
        let chroots_dir = self.state.dirs.chroots();
        let input = BuildRequestInput {
            context: &context,
            archive_key: &archive_key,
            upload_result_to: &own,
            repository_dir: &repository_dir,
            spool_dir: &spool_dir,
            chroots_dir: &chroots_dir,
        };

        let requests = gen_buildrequests(upload, &view, &target, &input, signer).await?;
        for (arch, breq) in &requests {
            if let Err(e) = self.transport.upload(breq, &own).await {
                error!(arch = %arch, error = %format!("{:#}", e), "Build request upload failed");
                let bres = breq
                    .gen_failed_buildresult(
                        &breq.dir(),
                        SBUILD_RETVAL_INTERNAL_ERROR,
                        "upload-failed",
                        &format!("{:#}", e),
                        signer,
                    )
                    .await?;
                self.strays.push((bres, Utc::now()));
            }
        }

        Package::new(upload.clone(), dist, Arc::clone(&config), requests)
    }

    async fn discard(&self, upload: &Changes, pid: &str, e: &anyhow::Error) {
        let subject = format!("DISCARD: {}: {:#}", pid, e);
        warn!(upload = %upload.file_name(), "{}", subject);

        if let Err(e) = self
            .notifier
            .notify(&subject, &upload.dump(), &self.state.cli.notify)
            .await
        {
            warn!(error = %e, "Discard notification failed");
        }
        if let Err(e) = upload.remove() {
            warn!(upload = %upload.file_name(), error = %e, "Failed to remove discarded upload");
        }
    }

    /// Close packages that waited longer than the configured window, and
    /// drop strays nobody claimed in that time.
    pub async fn sweep_stale(&mut self, now: DateTime<Utc>) {
        let wait = self.state.cli.wait_for_build_results();

        let stale: Vec<String> = self
            .packages
            .iter()
            .filter(|(_, p)| p.is_stale(now, wait))
            .map(|(pid, _)| pid.clone())
            .collect();
        for pid in stale {
            if let Some(mut package) = self.packages.remove(&pid) {
                warn!(pid = %pid, missing = package.missing(), "Package stale, closing");
                package.mark_stale();
                self.finalize(package).await;
            }
        }

        let (expired, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.strays)
            .into_iter()
            .partition(|(_, seen)| {
                now.signed_duration_since(*seen)
                    .to_std()
                    .is_ok_and(|age| age > wait)
            });
        self.strays = rest;
        for (bres, _) in expired {
            warn!(bres = %bres.file_name(), "Stray build result expired");
            self.archive_orphan(&bres);
        }
    }

    pub async fn execute(&self, command: &ArchiveCommand) -> Result<String> {
        let config = self.state.config();
        let view = RepositoryView::new(&config, command.repository())?;
        let archive = self.archives.get(command.repository());
        info!(command = ?command, "Executing archive command");
        if let ArchiveCommand::Port {
            package,
            from,
            to,
            version,
            ..
        } = command
        {
            let from: DistributionString = from.parse()?;
            let to: DistributionString = to.parse()?;
            return self
                .port(&view, archive.as_ref(), package, &from, &to, version.clone())
                .await;
        }
        view.execute(archive.as_ref(), command).await
    }

    /// Rebuild an installed source for `to` and upload it to ourselves; it
    /// comes back through incoming as a regular upload.
    async fn port(
        &self,
        view: &RepositoryView<'_>,
        archive: &dyn ArchiveDriver,
        package: &str,
        from: &DistributionString,
        to: &DistributionString,
        version: Option<String>,
    ) -> Result<String> {
        let repository_dir = self.state.dirs.repository(view.identity());
        let plan = view
            .plan_port(archive, &repository_dir, package, from, to, version)
            .await?;

        let tmp = tempfile::tempdir()?;
        let tools = PortTools {
            dpkg_source: &self.state.cli.binpath_dpkg_source,
            dpkg_buildpackage: &self.state.cli.binpath_dpkg_buildpackage,
        };
        let maintainer = format!("aptforge <aptforge@{}>", self.state.cli.hostname);
        let path = build_port(&plan, &tools, &maintainer, tmp.path(), self.state.signer()).await?;

        let changes = Changes::parse(&path)?;
        self.transport
            .upload(&changes, &self.state.cli.ftp_hopo())
            .await?;
        info!(package = %package, from = %from, to = %to, version = %plan.version, "Port requested");
        Ok(format!("{}_{} -> {}", package, plan.version, to))
    }
}

/// A build result waiting to be delivered.
pub struct PendingUpload {
    pub build: Build,
    pub bres: Changes,
    pub hopo: HoPo,
    pub since: DateTime<Utc>,
}

impl PendingUpload {
    fn expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now.signed_duration_since(self.since)
            .to_std()
            .is_ok_and(|age| age > retention)
    }
}

struct BuildContext {
    state: Arc<ServerState>,
    transport: Arc<dyn BundleTransport>,
    keyrings: Arc<Keyrings>,
    options: SbuildOptions,
}

impl BuildContext {
    async fn deliver(&self, build: Build, bres: Changes, hopo: HoPo) -> Option<PendingUpload> {
        match self.transport.upload(&bres, &hopo).await {
            Ok(()) => {
                if let Err(e) = build.clean() {
                    warn!(build = %build.key(), error = %e, "Failed to clean build");
                }
                None
            }
            Err(e) => {
                warn!(build = %build.key(), error = %format!("{:#}", e), "Build result upload failed, will retry");
                Some(PendingUpload {
                    build,
                    bres,
                    hopo,
                    since: Utc::now(),
                })
            }
        }
    }

    async fn run_build(self: Arc<Self>, path: PathBuf) -> Option<PendingUpload> {
        let prepared = async {
            self.keyrings.verify_remote(&path).await?;
            let breq = Changes::parse(&path)?;
            let hopo = HoPo::parse(breq.require("Upload-Result-To")?).map_err(|e| anyhow!(e))?;
            let build = Build::new(breq, &self.state.dirs.spool())?;
            anyhow::Ok((build, hopo))
        }
        .await;

        let (build, hopo) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(breq = %path.display(), error = %format!("{:#}", e), "Rejecting build request");
                match Changes::parse(&path) {
                    Ok(breq) => remove_rejected(&breq),
                    Err(_) => {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(breq = %path.display(), error = %e, "Failed to remove build request");
                        }
                    }
                }
                return None;
            }
        };

        let signer = self.state.signer();
        let bres = match build.build(&self.options, signer).await {
            Ok(bres) => bres,
            Err(e) => {
                error!(build = %build.key(), error = %format!("{:#}", e), "Build failed internally");
                match build
                    .breq
                    .gen_failed_buildresult(
                        &build.dir,
                        SBUILD_RETVAL_INTERNAL_ERROR,
                        "internal-error",
                        &format!("{:#}", e),
                        signer,
                    )
                    .await
                {
                    Ok(bres) => bres,
                    Err(e) => {
                        error!(build = %build.key(), error = %e, "Failed to write internal error result");
                        return None;
                    }
                }
            }
        };

        self.deliver(build, bres, hopo).await
    }

    async fn retry_uploads(&self, pending: Vec<PendingUpload>) -> Vec<PendingUpload> {
        let retention = Duration::from_secs(self.state.cli.upload_retention * 3600);
        let now = Utc::now();

        stream::iter(pending)
            .filter_map(|upload| async move {
                if upload.expired(now, retention) {
                    error!(build = %upload.build.key(), since = %upload.since, "Giving up on build result upload");
                    if let Err(e) = upload.build.clean() {
                        warn!(error = %e, "Failed to clean build");
                    }
                    return None;
                }

                let since = upload.since;
                self.deliver(upload.build, upload.bres, upload.hopo)
                    .await
                    .map(|mut again| {
                        again.since = since;
                        again
                    })
            })
            .collect()
            .await
    }
}

pub(crate) fn remove_rejected(changes: &Changes) {
    if let Err(e) = changes.remove() {
        warn!(changes = %changes.file_name(), error = %format!("{:#}", e), "Failed to remove rejected changes");
    }
}

/// Drain the build queue with at most `build_queue_size` concurrent builds,
/// retrying undelivered results. Returns once the queue is closed and every
/// running build is done.
pub async fn schedule_build_loop(
    state: Arc<ServerState>,
    mut queue: mpsc::Receiver<PathBuf>,
    transport: Arc<dyn BundleTransport>,
    keyrings: Arc<Keyrings>,
) {
    let _guard = state
        .cli
        .sentry_dsn
        .as_deref()
        .filter(|_| state.cli.report_errors)
        .map(sentry::init);

    let context = Arc::new(BuildContext {
        options: SbuildOptions {
            binpath_sbuild: state.cli.binpath_sbuild.clone(),
            jobs: state.cli.sbuild_jobs,
            timeout: state.cli.build_timeout(),
        },
        state: Arc::clone(&state),
        transport,
        keyrings,
    });

    let max_builds = state.cli.build_queue_size;
    let retry_period = Duration::from_secs(state.cli.upload_retry_interval);
    let mut retry = time::interval_at(time::Instant::now() + retry_period, retry_period);
    let mut builds: JoinSet<Option<PendingUpload>> = JoinSet::new();
    let mut pending: Vec<PendingUpload> = Vec::new();
    let mut closed = false;

    loop {
        if closed && builds.is_empty() {
            break;
        }

        tokio::select! {
            next = queue.recv(), if !closed && builds.len() < max_builds => match next {
                Some(path) => {
                    info!(breq = %path.display(), running = builds.len(), "Starting build");
                    builds.spawn(Arc::clone(&context).run_build(path));
                }
                None => {
                    info!("Build queue closed, waiting for running builds");
                    closed = true;
                }
            },
            Some(done) = builds.join_next(), if !builds.is_empty() => match done {
                Ok(Some(upload)) => pending.push(upload),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Build task failed"),
            },
            _ = retry.tick() => {
                if !pending.is_empty() {
                    pending = context.retry_uploads(std::mem::take(&mut pending)).await;
                }
            }
        }
    }

    if !pending.is_empty() {
        warn!(count = pending.len(), "Undelivered build results stay in the spool");
    }
}
