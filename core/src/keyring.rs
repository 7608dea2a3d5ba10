/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! `<identity>-archive-keyring` source packages carrying the current archive
//! key, built for every keyring-enabled suite and uploaded back into the
//! repository.

use crate::executer::{argv, call, CallOptions};
use crate::gnupg::GnuPg;
use crate::porter::changelog_entry;
use crate::repository::RepositoryView;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn package_name(identity: &str) -> String {
    format!("{}-archive-keyring", identity)
}

pub fn timestamp_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

fn control(package: &str, identity: &str, maintainer: &str) -> String {
    format!(
        "Source: {package}
Section: misc
Priority: optional
Maintainer: {maintainer}
Build-Depends: debhelper-compat (= 12)
Standards-Version: 4.5.0

Package: {package}
Architecture: all
Depends: ${{misc:Depends}}
Description: Archive keyring for the {identity} repository
 The public key used to sign the {identity} package archive.
"
    )
}

pub fn changelog(package: &str, version: &str, distribution: &str, maintainer: &str, now: DateTime<Utc>) -> String {
    changelog_entry(
        package,
        version,
        distribution,
        &["Archive key automated build."],
        maintainer,
        now,
    )
}

/// Write the package tree into `dir` (changelog excluded).
async fn write_tree(dir: &Path, package: &str, identity: &str, maintainer: &str, gnupg: &GnuPg) -> Result<()> {
    let debian = dir.join("debian");
    fs::create_dir_all(debian.join("source"))?;
    fs::create_dir_all(dir.join("keyrings"))?;

    fs::write(debian.join("control"), control(package, identity, maintainer))?;
    fs::write(debian.join("source/format"), "3.0 (native)\n")?;
    fs::write(
        debian.join("install"),
        format!("keyrings/{}.gpg usr/share/keyrings/\n", package),
    )?;
    fs::write(debian.join("rules"), "#!/usr/bin/make -f\n%:\n\tdh $@\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(debian.join("rules"), fs::Permissions::from_mode(0o755))?;
    }

    gnupg
        .export_keyring(&dir.join("keyrings").join(format!("{}.gpg", package)))
        .await
}

/// Build one keyring source package per (distribution, keyring suite) into
/// `out_dir`; returns the resulting `.changes` files.
pub async fn build_keyring_packages(
    view: &RepositoryView<'_>,
    gnupg: &GnuPg,
    maintainer: &str,
    binpath_dpkg_buildpackage: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let identity = view.identity();
    let package = package_name(identity);
    let now = Utc::now();
    let base_version = timestamp_version(now);
    let mut built = Vec::new();

    for dist in &view.distributions {
        for suite in view
            .layout
            .suites
            .iter()
            .filter(|s| s.build_keyring_package && s.uploadable)
        {
            let version = format!("{}{}", base_version, view.default_version(dist, suite));
            let distribution = view.dist_string(dist.codename(), &suite.name, None)?;
            let tree = out_dir.join(format!("{}-{}", package, version));
            write_tree(&tree, &package, identity, maintainer, gnupg).await?;
            fs::write(
                tree.join("debian/changelog"),
                changelog(&package, &version, &distribution, maintainer, now),
            )?;

            call(
                &argv(&[binpath_dpkg_buildpackage, "-S", "-sa", "-us", "-uc", "-d"]),
                &CallOptions::default().with_cwd(&tree),
            )
            .await
            .with_context(|| format!("Failed to build {} {}", package, version))?;

            let changes = out_dir.join(format!("{}_{}_source.changes", package, version));
            gnupg.sign(&changes).await?;
            info!(changes = %changes.display(), distribution = %distribution, "Built keyring package");
            built.push(changes);
        }
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_and_changelog() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(timestamp_version(now), "20240305070809");
        assert_eq!(package_name("myid"), "myid-archive-keyring");

        let entry = changelog(
            "myid-archive-keyring",
            "20240305070809~myid70+1",
            "wheezy-myid-unstable",
            "aptforge <aptforge@localhost>",
            now,
        );
        assert!(entry.starts_with(
            "myid-archive-keyring (20240305070809~myid70+1) wheezy-myid-unstable; urgency=medium\n"
        ));
        assert!(entry.ends_with(" -- aptforge <aptforge@localhost>  Tue, 05 Mar 2024 07:08:09 +0000\n"));
    }
}
