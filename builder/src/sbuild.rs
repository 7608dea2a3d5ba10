/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use aptforge_core::changes::Changes;
use aptforge_core::consts::{
    APT_KEYS, APT_PREFERENCES, APT_SOURCES_LIST, CHROOT_SETUP_SCRIPT, SBUILDRC_SNIPPET,
    SBUILD_RETVAL_TIMEOUT, SBUILD_SUMMARY_RE, SIGNING_KEY_NAME,
};
use aptforge_core::executer::{call, CallError, CallOptions};
use aptforge_core::gnupg::GnuPg;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct SbuildOptions {
    pub binpath_sbuild: String,
    pub jobs: usize,
    pub timeout: Option<Duration>,
}

/// One build request being worked on in `<spool>/<sha1 of request>/`.
#[derive(Debug)]
pub struct Build {
    pub breq: Changes,
    pub dir: PathBuf,
}

/// `Key: value` summary lines of a buildlog as `Sbuild-Key` fields.
pub fn parse_buildlog_summary(buildlog: &str) -> Vec<(String, String)> {
    buildlog
        .lines()
        .filter(|l| SBUILD_SUMMARY_RE.is_match(l))
        .filter_map(|l| l.split_once(':'))
        .map(|(key, value)| (format!("Sbuild-{}", key), value.trim().to_string()))
        .collect()
}

impl Build {
    pub fn new(breq: Changes, spool_root: &Path) -> Result<Self> {
        let dir = breq.spool_dir(spool_root)?;
        Ok(Self { breq, dir })
    }

    /// `<source>_<version>:<arch>`
    pub fn key(&self) -> String {
        format!(
            "{}:{}",
            self.breq.pkg_id().unwrap_or_default(),
            self.breq.get("Architecture").unwrap_or("?")
        )
    }

    pub fn chroot_name(&self) -> Result<String> {
        Ok(format!(
            "aptforge-{}-{}",
            self.breq.require("Base-Distribution")?,
            self.breq.architecture()?
        ))
    }

    pub fn sbuildrc_path(&self) -> PathBuf {
        self.dir.join(".sbuildrc")
    }

    pub fn result_path(&self) -> Result<PathBuf> {
        Ok(self.dir.join(self.breq.gen_file_name(
            self.breq.architecture()?,
            aptforge_core::changes::ChangesKind::BuildResult,
        )?))
    }

    /// The `.changes` sbuild leaves behind on success.
    pub fn build_changes_path(&self) -> Result<PathBuf> {
        Ok(self.dir.join(format!(
            "{}_{}_{}.changes",
            self.breq.source()?,
            self.breq.version()?,
            self.breq.architecture()?
        )))
    }

    pub fn sbuildrc(&self, snippet: &str) -> String {
        format!(
            "# Sources are updated by the chroot setup commands.
$apt_update = 0;

$apt_allow_unauthenticated = {};

$pgp_options = ['-us', '-k {}'];

{}

1;
",
            self.breq.get("Apt-Allow-Unauthenticated").unwrap_or("0"),
            SIGNING_KEY_NAME,
            snippet.trim_end()
        )
    }

    pub fn sbuild_argv(&self, opts: &SbuildOptions) -> Result<Vec<String>> {
        let dir = self.dir.display();
        let mut args = vec![
            opts.binpath_sbuild.clone(),
            format!("-j{}", opts.jobs),
            format!("--dist={}", self.breq.distribution()?),
            format!("--arch={}", self.breq.architecture()?),
            format!("--chroot={}", self.chroot_name()?),
            format!("--chroot-setup-command=sudo cp {}/{} /etc/apt/sources.list", dir, APT_SOURCES_LIST),
            "--chroot-setup-command=cat /etc/apt/sources.list".to_string(),
            format!("--chroot-setup-command=sudo cp {}/{} /etc/apt/preferences", dir, APT_PREFERENCES),
            "--chroot-setup-command=cat /etc/apt/preferences".to_string(),
            format!("--chroot-setup-command=sudo apt-key add {}/{}", dir, APT_KEYS),
            "--chroot-setup-command=sudo apt-get update".to_string(),
            format!("--chroot-setup-command=sudo {}/{}", dir, CHROOT_SETUP_SCRIPT),
            format!("--build-dep-resolver={}", self.breq.get("Build-Dep-Resolver").unwrap_or("apt")),
            "--nolog".to_string(),
            "--log-external-command-output".to_string(),
            "--log-external-command-error".to_string(),
        ];

        if self.breq.get("Arch-All").is_some() {
            args.extend([
                "--arch-all".to_string(),
                "--source".to_string(),
                "--debbuildopt=-sa".to_string(),
            ]);
        }

        if let Some(lintian) = self.breq.get("Run-Lintian") {
            args.push("--run-lintian".to_string());
            args.push("--lintian-opts=--suppress-tags=bad-distribution-in-changes-file".to_string());
            if !lintian.is_empty() {
                args.push(format!("--lintian-opts={}", lintian));
            }
        }

        args.push(
            aptforge_core::changes::gen_dsc_file_name(self.breq.source()?, self.breq.version()?),
        );
        Ok(args)
    }

    /// Run sbuild for the request and write the signed build result. An
    /// existing result is returned as is.
    #[instrument(skip_all, fields(build = %self.key()))]
    pub async fn build(&self, opts: &SbuildOptions, signer: Option<&GnuPg>) -> Result<Changes> {
        let result_path = self.result_path()?;
        if result_path.exists() {
            info!(bres = %result_path.display(), "Build result already present, not rebuilding");
            return Changes::parse(&result_path);
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        self.breq.unpack(&self.dir)?;

        let snippet = fs::read_to_string(self.dir.join(SBUILDRC_SNIPPET)).unwrap_or_default();
        fs::write(self.sbuildrc_path(), self.sbuildrc(&snippet))?;

        let buildlog = self.dir.join(self.breq.buildlog_name()?);
        let args = self.sbuild_argv(opts)?;
        info!(command = %args.join(" "), "Running sbuild");

        let home = self.dir.display().to_string();
        let call_opts = CallOptions::default()
            .with_cwd(&self.dir)
            .with_env("HOME", &home)
            .with_log_file(&buildlog)
            .with_timeout(opts.timeout);

        let (retval, timed_out) = match call(&args, &call_opts).await {
            Ok(_) => (0, false),
            Err(CallError::Failed { status, .. }) => (status, false),
            Err(CallError::Timeout { seconds, .. }) => {
                let mut log = fs::OpenOptions::new().create(true).append(true).open(&buildlog)?;
                writeln!(log, "\nBuild timed out after {}s", seconds)?;
                (SBUILD_RETVAL_TIMEOUT, true)
            }
            Err(e) => return Err(e.into()),
        };

        let mut bres = self.breq.gen_buildresult(&self.dir)?;
        bres.set("Sbuildretval", retval.to_string());
        let log = fs::read_to_string(&buildlog).unwrap_or_default();
        for (key, value) in parse_buildlog_summary(&log) {
            debug!(key = %key, value = %value, "Build log status line");
            bres.set(&key, value);
        }
        if timed_out {
            bres.set("Sbuild-Status", "timeout");
        }
        info!(
            retval,
            status = bres.get("Sbuild-Status").unwrap_or("n/a"),
            "sbuild finished"
        );

        if !buildlog.exists() {
            fs::write(&buildlog, "")?;
        }
        bres.add_file(&buildlog)?;

        let build_changes = self.build_changes_path()?;
        if build_changes.exists() {
            let tar_path = bres.tar_path();
            Changes::parse(&build_changes)?.pack(&tar_path, &[])?;
            bres.add_file(&tar_path)?;
        }

        bres.save(signer).await?;
        Ok(bres)
    }

    /// Drop the build spool and the request from incoming.
    pub fn clean(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("Failed to remove {}", self.dir.display()))?;
        }
        if self.breq.path().exists() {
            self.breq.remove()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breq(dir: &Path) -> Changes {
        let path = dir.join("foo_1.0~myid70+1_mini-buildd-buildrequest_amd64.changes");
        fs::write(
            &path,
            "Distribution: wheezy-myid-unstable
Source: foo
Version: 1.0~myid70+1
Architecture: amd64
Base-Distribution: wheezy
Upload-Result-To: localhost:8067
Build-Dep-Resolver: aptitude
Apt-Allow-Unauthenticated: 1
Arch-All: Yes
Run-Lintian: --fail-on-warning --info
",
        )
        .unwrap();
        Changes::parse(&path).unwrap()
    }

    #[test]
    fn test_sbuild_argv() {
        let tmp = tempfile::tempdir().unwrap();
        let build = Build::new(breq(tmp.path()), &tmp.path().join("spool")).unwrap();
        let opts = SbuildOptions {
            binpath_sbuild: "sbuild".to_string(),
            jobs: 4,
            timeout: None,
        };

        let args = build.sbuild_argv(&opts).unwrap();
        assert_eq!(args[0], "sbuild");
        assert_eq!(args[1], "-j4");
        assert!(args.contains(&"--dist=wheezy-myid-unstable".to_string()));
        assert!(args.contains(&"--arch=amd64".to_string()));
        assert!(args.contains(&"--chroot=aptforge-wheezy-amd64".to_string()));
        assert!(args.contains(&"--build-dep-resolver=aptitude".to_string()));
        assert!(args.contains(&"--arch-all".to_string()));
        assert!(args.contains(&"--lintian-opts=--fail-on-warning --info".to_string()));
        assert_eq!(args.last().unwrap(), "foo_1.0~myid70+1.dsc");

        let setup = format!(
            "--chroot-setup-command=sudo cp {}/apt_sources.list /etc/apt/sources.list",
            build.dir.display()
        );
        assert!(args.contains(&setup));
    }

    #[test]
    fn test_sbuildrc_contains_snippet() {
        let tmp = tempfile::tempdir().unwrap();
        let build = Build::new(breq(tmp.path()), tmp.path()).unwrap();
        let rc = build.sbuildrc("$build_environment = { 'X' => 1 };\n");
        assert!(rc.contains("$apt_allow_unauthenticated = 1;"));
        assert!(rc.contains("$build_environment = { 'X' => 1 };"));
        assert!(rc.trim_end().ends_with("1;"));
    }

    #[test]
    fn test_parse_buildlog_summary() {
        let log = "Some noise here\nStatus: successful\nLintian: pass\nBuild-Time: 12\nNot a: status line\n";
        let summary = parse_buildlog_summary(log);
        assert_eq!(
            summary,
            vec![
                ("Sbuild-Status".to_string(), "successful".to_string()),
                ("Sbuild-Lintian".to_string(), "pass".to_string()),
                ("Sbuild-Build-Time".to_string(), "12".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_with_failing_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let build = Build::new(breq(tmp.path()), &tmp.path().join("spool")).unwrap();
        let opts = SbuildOptions {
            binpath_sbuild: "false".to_string(),
            jobs: 1,
            timeout: None,
        };

        let bres = build.build(&opts, None).await.unwrap();
        assert_eq!(bres.get("Sbuildretval"), Some("1"));
        assert_eq!(bres.architecture().unwrap(), "amd64");
        assert!(bres.has_file("foo_1.0~myid70+1_amd64.buildlog"));
        assert!(build.sbuildrc_path().exists());

        let again = build.build(&opts, None).await.unwrap();
        assert_eq!(again.sha1(), bres.sha1());

        build.clean().unwrap();
        assert!(!build.dir.exists());
        assert!(!build.breq.path().exists());
    }
}
