/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The per-upload aggregate: one user upload, its build requests and the
//! build results that come back for them.

use anyhow::{bail, Result};
use aptforge_core::changes::Changes;
use aptforge_core::consts::SBUILD_RETVAL_INTERNAL_ERROR;
use aptforge_core::distribution::DistributionString;
use aptforge_core::email::NotificationSink;
use aptforge_core::reprepro::ArchiveDriver;
use aptforge_core::repository::RepositoryView;
use aptforge_core::state::StateConfiguration;
use chrono::{DateTime, Utc};
use entity::repository::LintianMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackageState {
    AwaitResults,
    Completing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Incomplete,
    Complete,
}

/// What is remembered about a package after it is done.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedPackage {
    pub pid: String,
    pub distribution: String,
    pub installed: bool,
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub error: Option<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// Everything finalization touches outside the package itself.
pub struct FinalizeContext<'a> {
    pub archive: &'a dyn ArchiveDriver,
    pub notifier: &'a dyn NotificationSink,
    pub log_dir: &'a Path,
    pub spool_dir: &'a Path,
    pub http_url: &'a str,
    /// Daemon-wide recipients.
    pub notify: &'a [String],
}

pub struct Package {
    pid: String,
    upload: Changes,
    dist: DistributionString,
    config: Arc<StateConfiguration>,
    experimental: bool,
    lintian_mode: LintianMode,
    requests: BTreeMap<String, Changes>,
    success: BTreeMap<String, Changes>,
    failed: BTreeMap<String, Changes>,
    error: Option<String>,
    started: DateTime<Utc>,
    state: PackageState,
}

/// Bare address of an RFC 822 `Name <address>` value.
pub fn parse_address(value: &str) -> Option<String> {
    let value = value.trim();
    let address = match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value,
    };
    let address = address.trim();
    address.contains('@').then(|| address.to_string())
}

impl Package {
    pub fn new(
        upload: Changes,
        dist: DistributionString,
        config: Arc<StateConfiguration>,
        requests: BTreeMap<String, Changes>,
    ) -> Result<Self> {
        if requests.is_empty() {
            bail!("No build requests for {}", dist);
        }

        let view = RepositoryView::new(&config, &dist.identity)?;
        let target = view.resolve(&dist)?;
        let experimental = target.suite.experimental;
        let lintian_mode = target.view.distribution.lintian_mode;

        Ok(Self {
            pid: upload.pkg_id()?,
            upload,
            dist,
            experimental,
            lintian_mode,
            config,
            requests,
            success: BTreeMap::new(),
            failed: BTreeMap::new(),
            error: None,
            started: Utc::now(),
            state: PackageState::AwaitResults,
        })
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn dist(&self) -> &DistributionString {
        &self.dist
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    pub fn expected(&self) -> usize {
        self.requests.len()
    }

    pub fn success(&self) -> &BTreeMap<String, Changes> {
        &self.success
    }

    pub fn failed(&self) -> &BTreeMap<String, Changes> {
        &self.failed
    }

    pub fn missing(&self) -> usize {
        self.expected()
            .saturating_sub(self.success.len() + self.failed.len())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, wait: std::time::Duration) -> bool {
        now.signed_duration_since(self.started)
            .to_std()
            .is_ok_and(|age| age > wait)
    }

    /// Close the package with whatever results are in; missing mandatory
    /// results keep it from being installed.
    pub fn mark_stale(&mut self) {
        self.error = Some(format!(
            "Timed out waiting for {} of {} build results",
            self.missing(),
            self.expected()
        ));
    }

    fn lintian_ok(&self, bres: &Changes) -> bool {
        bres.get("Sbuild-Lintian") == Some("pass")
            || self.experimental
            || self.lintian_mode < LintianMode::FailOnError
    }

    /// Record one build result. Results for unknown or already answered
    /// architectures are rejected.
    pub fn update(&mut self, bres: &Changes) -> Result<UpdateOutcome> {
        if self.state != PackageState::AwaitResults {
            bail!("{}: not awaiting build results", self.pid);
        }

        let arch = bres.architecture()?.to_string();
        if !self.requests.contains_key(&arch) {
            bail!("{}: unexpected build result for '{}'", self.pid, arch);
        }
        if self.success.contains_key(&arch) || self.failed.contains_key(&arch) {
            bail!("{}: duplicate build result for '{}'", self.pid, arch);
        }

        let retval = match bres.get("Sbuildretval").map(str::parse::<i32>) {
            Some(Ok(retval)) => retval,
            _ => {
                warn!(pid = %self.pid, arch = %arch, "Build result without valid Sbuildretval");
                SBUILD_RETVAL_INTERNAL_ERROR
            }
        };
        let status = bres.get("Sbuild-Status").unwrap_or("n/a");
        info!(
            pid = %self.pid,
            arch = %arch,
            retval,
            status = %status,
            lintian = bres.get("Sbuild-Lintian").unwrap_or("n/a"),
            "Got build result"
        );

        if retval == 0 && (status == "skipped" || self.lintian_ok(bres)) {
            self.success.insert(arch, bres.clone());
        } else {
            self.failed.insert(arch, bres.clone());
        }

        let missing = self.missing();
        if missing > 0 {
            debug!(pid = %self.pid, missing, "Architectures still missing");
            return Ok(UpdateOutcome::Incomplete);
        }

        info!(pid = %self.pid, "All build results received");
        self.state = PackageState::Completing;
        Ok(UpdateOutcome::Complete)
    }

    async fn install(&self, view: &RepositoryView<'_>, archive: &dyn ArchiveDriver) -> Result<()> {
        let distribution = view.distribution(&self.dist.codename)?.distribution;
        let failed_mandatory: Vec<&String> = self
            .failed
            .keys()
            .filter(|arch| distribution.is_mandatory(arch))
            .collect();
        if !failed_mandatory.is_empty() {
            let names: Vec<&str> = failed_mandatory.iter().map(|a| a.as_str()).collect();
            bail!("Mandatory architectures failed: {}", names.join(" "));
        }
        for arch in self.failed.keys() {
            warn!(pid = %self.pid, arch = %arch, "Optional architecture failed (ignoring)");
        }

        view.install(archive, &self.dist, self.upload.source()?, &self.success)
            .await
    }

    fn archive_bundles(&self, log_dir: &Path, spool_dir: &Path) {
        for bundle in self
            .success
            .values()
            .chain(self.failed.values())
            .chain(self.requests.values())
            .chain(std::iter::once(&self.upload))
        {
            if let Err(e) = bundle.archive(log_dir) {
                error!(pid = %self.pid, changes = %bundle.file_name(), error = %e, "Failed to archive");
            }
        }

        match self.upload.spool_dir(spool_dir) {
            Ok(spool) if spool.exists() => {
                if let Err(e) = std::fs::remove_dir_all(&spool) {
                    warn!(spool = %spool.display(), error = %e, "Failed to remove spool");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(pid = %self.pid, error = %e, "No spool for upload"),
        }
    }

    pub fn subject(&self, installed: bool) -> String {
        format!(
            "{}: {} ({}/{} failed)",
            if self.failed.is_empty() && installed {
                "Build"
            } else {
                "Failed"
            },
            self.pid,
            self.failed.len(),
            self.expected()
        )
    }

    /// Per-architecture status lines with buildlog URLs, then the upload.
    pub fn body(&self, http_url: &str) -> String {
        let mut body = String::new();
        if let Some(error) = &self.error {
            body.push_str(&format!("{}\n\n", error));
        }

        for (arch, bres) in self.failed.iter().chain(self.success.iter()) {
            let status = bres.get("Sbuild-Status").unwrap_or("n/a");
            for file in bres.files().iter().filter(|f| f.name.ends_with(".buildlog")) {
                body.push_str(&format!(
                    "{}({}): {}/log/{}/{}/{}/{}/{}\n",
                    status,
                    arch,
                    http_url.trim_end_matches('/'),
                    bres.get("Distribution").unwrap_or_default(),
                    bres.get("Source").unwrap_or_default(),
                    bres.get("Version").unwrap_or_default(),
                    arch,
                    file.name
                ));
            }
        }
        body.push('\n');
        body.push_str(&self.upload.dump());
        body
    }

    fn recipients(&self, view: &RepositoryView<'_>, notify: &[String]) -> Vec<String> {
        let mut recipients: Vec<String> = notify.to_vec();
        recipients.extend(view.repository.notify.iter().cloned());

        let repository = view.repository;
        for (enabled, field) in [
            (repository.notify_maintainer, "Maintainer"),
            (repository.notify_changed_by, "Changed-By"),
        ] {
            if let Some(address) = enabled
                .then(|| self.upload.get(field))
                .flatten()
                .and_then(parse_address)
            {
                recipients.push(address);
            }
        }
        recipients
    }

    /// Install (unless something mandatory failed), archive every bundle,
    /// drop the spool and notify. Never fails: problems are logged and
    /// reported in the notification.
    #[instrument(skip_all, fields(pid = %self.pid))]
    pub async fn finalize(mut self, ctx: &FinalizeContext<'_>) -> FinishedPackage {
        self.state = PackageState::Completing;

        let config = Arc::clone(&self.config);
        let view = RepositoryView::new(&config, &self.dist.identity);

        let installed = match &view {
            Ok(view) => match self.install(view, ctx.archive).await {
                Ok(()) => {
                    info!(dist = %self.dist, "Package installed");
                    true
                }
                Err(e) => {
                    error!(dist = %self.dist, error = %format!("{:#}", e), "Package not installed");
                    self.error.get_or_insert_with(|| format!("{:#}", e));
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "Repository vanished");
                self.error.get_or_insert_with(|| format!("{:#}", e));
                false
            }
        };

        self.archive_bundles(ctx.log_dir, ctx.spool_dir);

        let recipients = match &view {
            Ok(view) => self.recipients(view, ctx.notify),
            Err(_) => ctx.notify.to_vec(),
        };
        let subject = self.subject(installed);
        if let Err(e) = ctx
            .notifier
            .notify(&subject, &self.body(ctx.http_url), &recipients)
            .await
        {
            warn!(error = %e, "Notification failed");
        }

        self.state = PackageState::Done;
        FinishedPackage {
            pid: self.pid.clone(),
            distribution: self.dist.to_string(),
            installed,
            success: self.success.keys().cloned().collect(),
            failed: self.failed.keys().cloned().collect(),
            error: self.error.take(),
            started: self.started,
            finished: Utc::now(),
        }
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("pid", &self.pid)
            .field("dist", &self.dist.to_string())
            .field("state", &self.state)
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("success", &self.success.keys().collect::<Vec<_>>())
            .field("failed", &self.failed.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_mock_config;

    fn changes(fields: &[(&str, &str)]) -> Changes {
        let mut changes = Changes::new(Path::new("/nonexistent/foo.changes"));
        for (key, value) in fields {
            changes.set(key, *value);
        }
        changes
    }

    fn bres(arch: &str, retval: &str, lintian: &str) -> Changes {
        changes(&[
            ("Distribution", "wheezy-myid-unstable"),
            ("Source", "foo"),
            ("Version", "1.0~myid70+1"),
            ("Architecture", arch),
            ("Sbuildretval", retval),
            ("Sbuild-Status", "successful"),
            ("Sbuild-Lintian", lintian),
        ])
    }

    fn package(dist: &str) -> Package {
        let upload = changes(&[
            ("Distribution", dist),
            ("Source", "foo"),
            ("Version", "1.0~myid70+1"),
            ("Architecture", "source"),
        ]);
        let requests = ["amd64", "armel", "i386"]
            .into_iter()
            .map(|arch| (arch.to_string(), changes(&[("Architecture", arch)])))
            .collect();
        Package::new(
            upload,
            dist.parse().unwrap(),
            Arc::new(create_mock_config()),
            requests,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("Jane Doe <jane@example.org>"),
            Some("jane@example.org".to_string())
        );
        assert_eq!(parse_address(" jane@example.org "), Some("jane@example.org".to_string()));
        assert_eq!(parse_address("Jane Doe"), None);
    }

    #[test]
    fn test_update_tracks_results() {
        let mut package = package("wheezy-myid-unstable");
        assert_eq!(package.expected(), 3);

        assert_eq!(
            package.update(&bres("amd64", "0", "pass")).unwrap(),
            UpdateOutcome::Incomplete
        );
        assert!(package.update(&bres("sparc", "0", "pass")).is_err());
        assert!(package.update(&bres("amd64", "0", "pass")).is_err());

        assert_eq!(
            package.update(&bres("i386", "garbage", "pass")).unwrap(),
            UpdateOutcome::Incomplete
        );
        assert!(package.failed().contains_key("i386"));

        assert_eq!(
            package.update(&bres("armel", "0", "fail")).unwrap(),
            UpdateOutcome::Complete
        );
        assert!(package.failed().contains_key("armel"));
        assert_eq!(package.state(), PackageState::Completing);
        assert_eq!(package.missing(), 0);
        assert!(package.update(&bres("armel", "0", "pass")).is_err());
    }

    #[test]
    fn test_lintian_ignored_in_experimental() {
        let mut package = package("wheezy-myid-experimental");
        package.update(&bres("amd64", "0", "fail")).unwrap();
        assert!(package.success().contains_key("amd64"));
    }

    #[test]
    fn test_skipped_build_is_a_success() {
        let mut package = package("wheezy-myid-unstable");
        let mut skipped = bres("armel", "0", "fail");
        skipped.set("Sbuild-Status", "skipped");
        package.update(&skipped).unwrap();
        assert!(package.success().contains_key("armel"));
    }

    #[test]
    fn test_subject_and_body() {
        let mut package = package("wheezy-myid-unstable");
        assert_eq!(package.subject(true), "Build: foo_1.0~myid70+1 (0/3 failed)");

        let tmp = tempfile::tempdir().unwrap();
        let buildlog = tmp.path().join("foo_1.0~myid70+1_amd64.buildlog");
        std::fs::write(&buildlog, "Status: failed\n").unwrap();
        let mut failed = bres("amd64", "2", "n/a");
        failed.set("Sbuild-Status", "failed");
        failed.add_file(&buildlog).unwrap();
        package.update(&failed).unwrap();

        assert_eq!(package.subject(true), "Failed: foo_1.0~myid70+1 (1/3 failed)");
        let body = package.body("http://build.example.org:8066/");
        assert!(body.contains(
            "failed(amd64): http://build.example.org:8066/log/wheezy-myid-unstable/foo/1.0~myid70+1/amd64/foo_1.0~myid70+1_amd64.buildlog"
        ));
        assert!(body.contains("Source: foo"));
    }

    #[test]
    fn test_stale_after_wait_window() {
        let mut package = package("wheezy-myid-unstable");
        let wait = std::time::Duration::from_secs(3600);
        assert!(!package.is_stale(Utc::now(), wait));
        assert!(package.is_stale(Utc::now() + chrono::Duration::hours(2), wait));

        package.update(&bres("amd64", "0", "pass")).unwrap();
        package.mark_stale();
        assert_eq!(
            package.error.as_deref(),
            Some("Timed out waiting for 2 of 3 build results")
        );
    }

    #[test]
    fn test_finished_package_serializes() {
        let finished = FinishedPackage {
            pid: "foo_1.0".to_string(),
            distribution: "wheezy-myid-unstable".to_string(),
            installed: true,
            success: vec!["amd64".to_string()],
            failed: Vec::new(),
            error: None,
            started: Utc::now(),
            finished: Utc::now(),
        };
        let json = serde_json::to_value(&finished).unwrap();
        assert_eq!(json["pid"], "foo_1.0");
        assert_eq!(json["installed"], true);
    }
}
