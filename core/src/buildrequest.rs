/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::changes::{md5_of_file, parse_dsc_files, Changes, ChangesKind, Control};
use crate::consts::{
    APT_KEYS, APT_PREFERENCES, APT_SOURCES_LIST, CHROOT_SETUP_SCRIPT, SBUILDRC_SNIPPET,
};
use crate::gnupg::GnuPg;
use crate::input::HoPo;
use crate::repository::{ArchiveContext, RepositoryView, Target};
use anyhow::{anyhow, bail, Context, Result};
use entity::repository::LintianMode;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Everything besides the upload itself that shapes its build requests.
pub struct BuildRequestInput<'a> {
    pub context: &'a ArchiveContext,
    /// The daemon's armored archive key.
    pub archive_key: &'a str,
    pub upload_result_to: &'a HoPo,
    /// Root of the repository's reprepro tree (for `pool/`).
    pub repository_dir: &'a Path,
    pub spool_dir: &'a Path,
    /// `<home>/chroots`, used for the per-chroot `%LIBDIR%`.
    pub chroots_dir: &'a Path,
}

/// Source files the `.dsc` names that are missing from the upload but
/// present, with a matching MD5, in the repository pool.
pub fn files_from_pool(upload: &Changes, repository_dir: &Path) -> Result<Vec<PathBuf>> {
    let dsc_path = upload.dsc_path()?;
    let text = fs::read_to_string(&dsc_path)
        .with_context(|| format!("Failed to read {}", dsc_path.display()))?;
    let dsc = Control::parse(&text)
        .with_context(|| format!("Failed to parse {}", dsc_path.display()))?;
    let source = upload.source()?;

    let mut from_pool = Vec::new();
    for (md5, _size, name) in parse_dsc_files(&dsc)? {
        let in_changes = upload.has_file(&name);
        let mut found = false;

        let pattern = format!(
            "{}/pool/*/*/{}/{}",
            repository_dir.display(),
            source,
            name
        );
        for entry in glob::glob(&pattern)? {
            let path = entry?;
            if md5_of_file(&path)? != md5 {
                bail!("MD5 mismatch in uploaded dsc vs. pool: {}", name);
            }
            if !in_changes {
                info!(file = %path.display(), "Buildrequest: file added from pool");
                from_pool.push(path);
                found = true;
            }
        }

        if !in_changes && !found {
            bail!(
                "Missing file '{}' neither in upload, nor in pool (use '-sa' for uploads with new upstream)",
                name
            );
        }
    }
    Ok(from_pool)
}

pub fn run_lintian_field(mode: LintianMode, extra_options: &str) -> Option<String> {
    let flag = match mode {
        LintianMode::Disabled => return None,
        LintianMode::FailOnWarning => "--fail-on-warning",
        LintianMode::RunOnly | LintianMode::FailOnError => "",
    };
    Some(format!("{} {}", flag, extra_options).trim().to_string())
}

/// One build request per architecture of the target distribution, placed in
/// `<spool>/<arch>/`. Requests already on disk are reused.
#[instrument(skip_all, fields(upload = %upload.file_name(), dist = %target.dist))]
pub async fn gen_buildrequests(
    upload: &Changes,
    view: &RepositoryView<'_>,
    target: &Target<'_, '_>,
    input: &BuildRequestInput<'_>,
    signer: Option<&GnuPg>,
) -> Result<BTreeMap<String, Changes>> {
    let pool_files = files_from_pool(upload, input.repository_dir)?;
    let spool = upload.spool_dir(input.spool_dir)?;
    let distribution = target.view.distribution;

    let mut requests = BTreeMap::new();
    for arch in &distribution.architectures {
        let name = &arch.architecture;
        let dir = spool.join(name);
        let path = dir.join(upload.gen_file_name(name, ChangesKind::BuildRequest)?);

        let mut breq = Changes::open_or_new(&path)?;
        if !breq.is_new() {
            debug!(breq = %breq.file_name(), "Re-using existing build request");
            requests.insert(name.clone(), breq);
            continue;
        }

        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        breq.set("Distribution", target.dist.to_string());
        for key in ["Source", "Version"] {
            breq.set(key, upload.require(key)?);
        }

        let libdir = input
            .chroots_dir
            .join(target.view.codename())
            .join(name)
            .join("libdir");
        let generated = [
            (
                APT_SOURCES_LIST,
                view.apt_sources_list(input.context, target.view, target.suite)?,
            ),
            (
                APT_PREFERENCES,
                view.apt_preferences(input.context, target.view, target.suite)?,
            ),
            (APT_KEYS, view.apt_keys(target.view, input.archive_key)?),
            (CHROOT_SETUP_SCRIPT, view.chroot_setup_script(target.view)),
            (
                SBUILDRC_SNIPPET,
                view.sbuildrc_snippet(target.view, &libdir.display().to_string()),
            ),
        ];

        let mut extra = Vec::new();
        for (file, content) in generated {
            let file_path = dir.join(file);
            fs::write(&file_path, content)
                .with_context(|| format!("Failed to write {}", file_path.display()))?;
            extra.push(file_path);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                dir.join(CHROOT_SETUP_SCRIPT),
                fs::Permissions::from_mode(0o700),
            )?;
        }
        extra.extend(pool_files.iter().cloned());

        let tar_path = breq.tar_path();
        upload.pack(&tar_path, &extra)?;
        breq.add_file(&tar_path)?;

        breq.set("Upload-Result-To", input.upload_result_to.to_string());
        breq.set("Base-Distribution", target.view.codename());
        breq.set("Architecture", name.as_str());
        if arch.build_architecture_all {
            breq.set("Arch-All", "Yes");
        }
        breq.set(
            "Build-Dep-Resolver",
            distribution.build_dep_resolver.to_string(),
        );
        breq.set(
            "Apt-Allow-Unauthenticated",
            if distribution.apt_allow_unauthenticated { "1" } else { "0" },
        );
        if let Some(lintian) =
            run_lintian_field(distribution.lintian_mode, &distribution.lintian_extra_options)
        {
            breq.set("Run-Lintian", lintian);
        }

        breq.save(signer).await?;
        info!(breq = %breq.file_name(), "Generated build request");
        requests.insert(name.clone(), breq);
    }

    if requests.is_empty() {
        return Err(anyhow!("Distribution {} has no architectures", target.dist));
    }
    Ok(requests)
}
