/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! No-change ports: an installed source package is unpacked, given a new
//! changelog entry for another distribution and rebuilt as a source upload.

use crate::changes::{gen_dsc_file_name, gen_file_name, ChangesKind};
use crate::executer::{argv, call, CallOptions};
use crate::gnupg::GnuPg;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// What to rebuild, and as what.
#[derive(Debug, Clone, PartialEq)]
pub struct PortPlan {
    pub package: String,
    pub dsc: PathBuf,
    pub distribution: String,
    pub version: String,
}

pub struct PortTools<'a> {
    pub dpkg_source: &'a str,
    pub dpkg_buildpackage: &'a str,
}

/// `version` with everything from the last match of `strip` on removed, and
/// `apdx` appended.
pub fn port_version(version: &str, apdx: &str, strip: &Regex) -> String {
    let base = match strip.find_iter(version).last() {
        Some(m) => &version[..m.start()],
        None => version,
    };
    format!("{}{}", base, apdx)
}

/// A Debian changelog entry with one bullet per line of `text`.
pub fn changelog_entry(
    package: &str,
    version: &str,
    distribution: &str,
    text: &[&str],
    maintainer: &str,
    now: DateTime<Utc>,
) -> String {
    let bullets: String = text.iter().map(|line| format!("  * {}\n", line)).collect();
    format!(
        "{} ({}) {}; urgency=medium\n\n{}\n -- {}  {}\n",
        package,
        version,
        distribution,
        bullets,
        maintainer,
        now.format("%a, %d %b %Y %H:%M:%S +0000")
    )
}

/// The `.dsc` of `package`/`version` in a repository's pool.
pub fn find_pool_dsc(repository_dir: &Path, package: &str, version: &str) -> Result<PathBuf> {
    let pattern = format!(
        "{}/pool/*/*/{}/{}",
        repository_dir.display(),
        package,
        gen_dsc_file_name(package, version)
    );
    let mut found = glob::glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => bail!("No dsc for {}-{} in {}", package, version, repository_dir.display()),
        n => bail!("{} dscs for {}-{} in {}", n, package, version, repository_dir.display()),
    }
}

fn only_dir_in(dir: &Path) -> Result<PathBuf> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    if dirs.len() != 1 {
        bail!("Expected exactly one dir after unpacking dsc, got {}", dirs.len());
    }
    Ok(dirs.remove(0))
}

/// Unpack, re-version and rebuild `plan` below `out_dir`; returns the signed
/// source `.changes`.
pub async fn build_port(
    plan: &PortPlan,
    tools: &PortTools<'_>,
    maintainer: &str,
    out_dir: &Path,
    signer: Option<&GnuPg>,
) -> Result<PathBuf> {
    let unpack_dir = out_dir.join("src");
    fs::create_dir_all(&unpack_dir)?;
    call(
        &argv(&[tools.dpkg_source, "-x", &plan.dsc.display().to_string()]),
        &CallOptions::default().with_cwd(&unpack_dir),
    )
    .await
    .with_context(|| format!("Failed to unpack {}", plan.dsc.display()))?;
    let tree = only_dir_in(&unpack_dir)?;

    let changelog = tree.join("debian/changelog");
    let previous = fs::read_to_string(&changelog)
        .with_context(|| format!("Failed to read {}", changelog.display()))?;
    let entry = changelog_entry(
        &plan.package,
        &plan.version,
        &plan.distribution,
        &["Automated port via aptforge (no changes)."],
        maintainer,
        Utc::now(),
    );
    fs::write(&changelog, format!("{}\n{}", entry, previous))?;

    call(
        &argv(&[tools.dpkg_buildpackage, "-S", "-sa", "-us", "-uc", "-d"]),
        &CallOptions::default().with_cwd(&tree),
    )
    .await
    .with_context(|| format!("Failed to build {} {}", plan.package, plan.version))?;

    let changes = unpack_dir.join(gen_file_name(
        &plan.package,
        &plan.version,
        "source",
        ChangesKind::UserUpload,
    ));
    if let Some(gnupg) = signer {
        gnupg.sign(&changes).await?;
    }
    info!(changes = %changes.display(), distribution = %plan.distribution, "Built port");
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_port_version() {
        let strip = Regex::new(r"~myid70\+[1-9]").unwrap();
        assert_eq!(port_version("1.0~myid70+1", "~myid60+1", &strip), "1.0~myid60+1");
        assert_eq!(port_version("1.0~myid70+12", "~myid60+1", &strip), "1.0~myid60+1");
        assert_eq!(port_version("2:1.0-3", "~myid60+1", &strip), "2:1.0-3~myid60+1");
    }

    #[test]
    fn test_changelog_entry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let entry = changelog_entry(
            "foo",
            "1.0~myid60+1",
            "squeeze-myid-unstable",
            &["First.", "Second."],
            "aptforge <aptforge@localhost>",
            now,
        );
        assert_eq!(
            entry,
            "foo (1.0~myid60+1) squeeze-myid-unstable; urgency=medium\n\n  * First.\n  * Second.\n\n -- aptforge <aptforge@localhost>  Tue, 05 Mar 2024 07:08:09 +0000\n"
        );
    }

    #[test]
    fn test_find_pool_dsc() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pool/main/f/foo");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("foo_1.0~myid70+1.dsc"), "Source: foo\n").unwrap();

        assert_eq!(
            find_pool_dsc(tmp.path(), "foo", "1.0~myid70+1").unwrap(),
            dir.join("foo_1.0~myid70+1.dsc")
        );
        assert!(find_pool_dsc(tmp.path(), "foo", "2.0").is_err());
    }
}
