/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Archive semantics of one repository: upload policy, generated APT and
//! reprepro configuration, and the package operations (install, propagate,
//! migrate, remove, search) on top of an [`ArchiveDriver`].

use crate::changes::{Changes, ChangesKind};
use crate::debversion;
use crate::distribution::DistributionString;
use crate::input::{fromdos, subst_placeholders};
use crate::porter::{find_pool_dsc, port_version, PortPlan};
use crate::reprepro::{ArchiveDriver, ListedPackage};
use crate::state::StateConfiguration;
use crate::status::Lifecycle;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use entity::repository::{Distribution, Layout, Repository, SuiteOption};
use entity::source::{PrioritySource, Source};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Values of this daemon that end up in generated configuration.
#[derive(Debug, Clone)]
pub struct ArchiveContext {
    pub origin: String,
    pub http_url: String,
}

/// Administrative archive operations, executed on the ingest task.
#[derive(Debug, Clone)]
pub enum ArchiveCommand {
    Remove {
        repository: String,
        distribution: String,
        package: String,
        version: Option<String>,
    },
    Propagate {
        repository: String,
        to: String,
        from: String,
        package: String,
        version: Option<String>,
    },
    Migrate {
        repository: String,
        package: String,
        codename: String,
        suite: String,
        version: Option<String>,
        rollback: Option<u32>,
    },
    Search {
        repository: String,
        codename: Option<String>,
        pattern: String,
    },
    /// No-change rebuild of an installed source for another distribution.
    Port {
        repository: String,
        package: String,
        from: String,
        to: String,
        version: Option<String>,
    },
}

impl ArchiveCommand {
    pub fn repository(&self) -> &str {
        match self {
            ArchiveCommand::Remove { repository, .. }
            | ArchiveCommand::Propagate { repository, .. }
            | ArchiveCommand::Migrate { repository, .. }
            | ArchiveCommand::Search { repository, .. }
            | ArchiveCommand::Port { repository, .. } => repository,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchEntry {
    pub migrates_to: Option<String>,
}

/// `package -> distribution -> version -> entry`
pub type SearchResult = BTreeMap<String, BTreeMap<String, BTreeMap<String, SearchEntry>>>;

/// A configured distribution with its sources looked up.
#[derive(Debug, Clone)]
pub struct DistView<'a> {
    pub distribution: &'a Distribution,
    pub source: &'a Source,
    pub extras: Vec<(&'a PrioritySource, &'a Source)>,
}

impl DistView<'_> {
    pub fn codename(&self) -> &str {
        self.distribution.codename()
    }
}

/// A distribution string resolved against a repository.
#[derive(Debug, Clone)]
pub struct Target<'v, 'a> {
    pub dist: DistributionString,
    pub view: &'v DistView<'a>,
    pub suite: &'a SuiteOption,
}

/// Problems of a single distribution record.
pub fn check_distribution(distribution: &Distribution) -> Vec<String> {
    let mut problems = Vec::new();

    if distribution.architectures.is_empty() {
        problems.push("No architectures configured".to_string());
    }
    if !distribution.components.iter().any(|c| c == "main") {
        problems.push("Component 'main' missing".to_string());
    }
    if distribution.architectures.iter().all(|a| a.optional) {
        problems.push("At least one architecture must be mandatory".to_string());
    }

    let mut seen = BTreeSet::new();
    for arch in &distribution.architectures {
        if !seen.insert(arch.architecture.as_str()) {
            problems.push(format!("Duplicate architecture '{}'", arch.architecture));
        }
    }

    let archall: Vec<_> = distribution
        .architectures
        .iter()
        .filter(|a| a.build_architecture_all)
        .collect();
    match archall.len() {
        0 => problems.push("No architecture builds arch-all packages".to_string()),
        1 => {}
        _ => problems.push("More than one architecture builds arch-all packages".to_string()),
    }
    if archall.iter().any(|a| a.optional) {
        problems.push("The arch-all architecture must not be optional".to_string());
    }

    problems
}

/// Problems of the suites of a layout.
pub fn check_layout(layout: &Layout) -> Vec<String> {
    let mut problems = Vec::new();

    for suite in &layout.suites {
        if suite.experimental && !suite.uploadable {
            problems.push(format!("Experimental suite '{}' must be uploadable", suite.name));
        }
        if suite.build_keyring_package && !suite.uploadable {
            problems.push(format!(
                "Suite '{}' builds keyring packages but is not uploadable",
                suite.name
            ));
        }
        let Some(target) = suite.migrates_to.as_deref() else {
            continue;
        };
        if suite.experimental {
            problems.push(format!("Experimental suite '{}' must not migrate", suite.name));
        }
        match layout.suite(target) {
            None => problems.push(format!(
                "Suite '{}' migrates to unknown suite '{}'",
                suite.name, target
            )),
            Some(to) if to.uploadable => problems.push(format!(
                "Suite '{}' migrates to uploadable suite '{}'",
                suite.name, target
            )),
            Some(_) => {}
        }
    }

    problems
}

/// Resolve meta distribution aliases; everything else passes through.
pub fn resolve_distribution(config: &StateConfiguration, name: &str) -> Result<DistributionString> {
    let resolved = match config.resolve_meta_distribution(name) {
        Some(full) => {
            info!(alias = %name, distribution = %full, "Resolved meta distribution");
            full
        }
        None => name.to_string(),
    };
    Ok(resolved.parse::<DistributionString>()?)
}

pub struct RepositoryView<'a> {
    pub repository: &'a Repository,
    pub layout: &'a Layout,
    pub distributions: Vec<DistView<'a>>,
}

impl<'a> RepositoryView<'a> {
    pub fn new(config: &'a StateConfiguration, identity: &str) -> Result<Self> {
        let repository = config
            .repository(identity)
            .ok_or_else(|| anyhow!("Unknown repository '{}'", identity))?;
        let layout = config
            .layout(&repository.layout)
            .ok_or_else(|| anyhow!("Unknown layout '{}'", repository.layout))?;

        let mut distributions = Vec::new();
        for codename in &repository.distributions {
            let distribution = config
                .distribution(codename)
                .ok_or_else(|| anyhow!("Unknown distribution '{}'", codename))?;
            let source = config.source(&distribution.base_source).ok_or_else(|| {
                anyhow!(
                    "Unknown source {}/{}",
                    distribution.base_source.origin,
                    distribution.base_source.codename
                )
            })?;
            let extras = distribution
                .extra_sources
                .iter()
                .map(|extra| {
                    config
                        .source(&extra.source_ref())
                        .map(|s| (extra, s))
                        .ok_or_else(|| {
                            anyhow!("Unknown extra source {}/{}", extra.origin, extra.codename)
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            distributions.push(DistView {
                distribution,
                source,
                extras,
            });
        }

        Ok(Self {
            repository,
            layout,
            distributions,
        })
    }

    pub fn identity(&self) -> &str {
        &self.repository.identity
    }

    pub fn distribution(&self, codename: &str) -> Result<&DistView<'a>> {
        self.distributions
            .iter()
            .find(|d| d.codename() == codename)
            .ok_or_else(|| {
                anyhow!(
                    "Unknown distribution '{}' in repository '{}'",
                    codename,
                    self.identity()
                )
            })
    }

    pub fn suite(&self, name: &str) -> Result<&'a SuiteOption> {
        self.layout.suite(name).ok_or_else(|| {
            anyhow!("Unknown suite '{}' in layout '{}'", name, self.layout.name)
        })
    }

    pub fn dist_string(&self, codename: &str, suite: &str, rollback: Option<u32>) -> Result<String> {
        let option = self.suite(suite)?;
        let dist = DistributionString::new(codename, self.identity(), suite);
        match rollback {
            None => Ok(dist.to_string()),
            Some(r) if r < option.rollback => Ok(dist.with_rollback(r).to_string()),
            Some(r) => bail!(
                "Rollback number out of range: {} (suite '{}' keeps {})",
                r,
                suite,
                option.rollback
            ),
        }
    }

    pub fn resolve(&self, dist: &DistributionString) -> Result<Target<'_, 'a>> {
        if dist.identity != self.identity() {
            bail!(
                "Distribution {} does not belong to repository '{}'",
                dist,
                self.identity()
            );
        }
        let view = self.distribution(&dist.codename)?;
        let suite = self.suite(&dist.suite)?;
        if let Some(r) = dist.rollback {
            if r >= suite.rollback {
                bail!("Rollback number out of range: {}", dist);
            }
        }
        Ok(Target {
            dist: dist.clone(),
            view,
            suite,
        })
    }

    /// Every distribution string this repository serves, rollbacks included.
    pub fn all_distributions(&self) -> Vec<String> {
        let mut result = Vec::new();
        for view in &self.distributions {
            for suite in &self.layout.suites {
                let live = DistributionString::new(view.codename(), self.identity(), &suite.name);
                result.push(live.to_string());
                for r in 0..suite.rollback {
                    result.push(live.with_rollback(r).to_string());
                }
            }
        }
        result
    }

    fn placeholders(&self, view: &DistView<'_>) -> (String, String) {
        (self.identity().to_string(), view.source.codeversion())
    }

    fn subst(&self, template: &str, view: &DistView<'_>) -> String {
        let (identity, codeversion) = self.placeholders(view);
        let mut map = BTreeMap::new();
        map.insert("IDENTITY", identity.as_str());
        map.insert("CODEVERSION", codeversion.as_str());
        subst_placeholders(template, &map)
    }

    pub fn mandatory_version_regex(&self, view: &DistView<'_>, suite: &SuiteOption) -> String {
        let template = if suite.experimental {
            &self.layout.experimental_mandatory_version_regex
        } else {
            &self.layout.mandatory_version_regex
        };
        self.subst(template, view)
    }

    pub fn default_version(&self, view: &DistView<'_>, suite: &SuiteOption) -> String {
        let template = if suite.experimental {
            &self.layout.experimental_default_version
        } else {
            &self.layout.default_version
        };
        self.subst(template, view)
    }

    pub fn check_version(&self, version: &str, view: &DistView<'_>, suite: &SuiteOption) -> Result<()> {
        let pattern = self.mandatory_version_regex(view, suite);
        let regex = regex::Regex::new(&pattern)
            .with_context(|| format!("Invalid version regex '{}'", pattern))?;
        if !regex.is_match(version) {
            bail!(
                "Version {} does not match the mandatory regex '{}' of suite '{}'",
                version,
                pattern,
                suite.name
            );
        }
        Ok(())
    }

    /// Suites whose packages a build for `suite` may see: the suite itself
    /// plus its migration chain, or all regular suites for experimental ones.
    pub fn internal_suites(&self, suite: &SuiteOption) -> Vec<&'a SuiteOption> {
        let mut result: Vec<&SuiteOption> = Vec::new();
        let Ok(own) = self.suite(&suite.name) else {
            return result;
        };
        result.push(own);

        if suite.experimental {
            result.extend(self.layout.suites.iter().filter(|s| !s.experimental));
        } else {
            let mut current = own;
            while let Some(next) = current.migrates_to.as_deref() {
                match self.layout.suite(next) {
                    Some(s) if !result.iter().any(|r| r.name == s.name) => {
                        result.push(s);
                        current = s;
                    }
                    _ => break,
                }
            }
        }
        result
    }

    pub fn apt_sources_list(&self, ctx: &ArchiveContext, view: &DistView<'_>, suite: &SuiteOption) -> Result<String> {
        let components = view.distribution.components.join(" ");
        let mut out = String::new();

        let mirror = view.source.mirror().ok_or_else(|| {
            anyhow!(
                "No archive known for source {}/{}",
                view.source.origin,
                view.source.codename
            )
        })?;
        out.push_str(&format!(
            "# Base: release n={}, o={}\ndeb {} {} {}\n",
            view.source.codename, view.source.origin, mirror, view.source.codename, components
        ));

        for (_, source) in &view.extras {
            let mirror = source.mirror().ok_or_else(|| {
                anyhow!("No archive known for source {}/{}", source.origin, source.codename)
            })?;
            out.push_str(&format!(
                "\n# Extra: release n={}, o={}\ndeb {} {} {}\n",
                source.codename, source.origin, mirror, source.codename, components
            ));
        }

        out.push_str("\n# aptforge: Internal sources\n");
        for s in self.internal_suites(suite) {
            out.push_str(&format!(
                "deb {}/repositories/{}/ {} {}\n",
                ctx.http_url.trim_end_matches('/'),
                self.identity(),
                self.dist_string(view.codename(), &s.name, None)?,
                components
            ));
        }
        Ok(out)
    }

    pub fn apt_preferences(&self, ctx: &ArchiveContext, view: &DistView<'_>, suite: &SuiteOption) -> Result<String> {
        let mut stanzas = Vec::new();
        for (extra, source) in &view.extras {
            stanzas.push(format!(
                "Package: *\nPin: release n={}, o={}\nPin-Priority: {}\n",
                source.codename, source.origin, extra.priority
            ));
        }
        for s in self.internal_suites(suite) {
            stanzas.push(format!(
                "Package: *\nPin: release n={}, o={}\nPin-Priority: {}\n",
                self.dist_string(view.codename(), &s.name, None)?,
                ctx.origin,
                self.repository.internal_apt_priority
            ));
        }
        Ok(stanzas.join("\n"))
    }

    /// The archive key followed by every key file of the extra sources.
    pub fn apt_keys(&self, view: &DistView<'_>, archive_key: &str) -> Result<String> {
        let mut out = archive_key.to_string();
        for (_, source) in &view.extras {
            for key_file in &source.apt_key_files {
                let key = fs::read_to_string(key_file)
                    .with_context(|| format!("Failed to read apt key {}", key_file))?;
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&key);
            }
        }
        Ok(out)
    }

    pub fn chroot_setup_script(&self, view: &DistView<'_>) -> String {
        fromdos(&view.distribution.chroot_setup_script)
    }

    pub fn sbuildrc_snippet(&self, view: &DistView<'_>, libdir: &str) -> String {
        let mut map = BTreeMap::new();
        map.insert("LIBDIR", libdir);
        fromdos(&subst_placeholders(&view.distribution.sbuildrc_snippet, &map))
    }

    /// Full distribution string -> aliases accepted for it.
    pub fn meta_distributions(&self) -> BTreeMap<String, Vec<String>> {
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (alias, target) in &self.layout.meta_distributions {
            let Some((codename, suite)) = target.split_once('-') else {
                warn!(alias = %alias, target = %target, "Ignoring malformed meta distribution");
                continue;
            };
            if self.distribution(codename).is_err() || self.layout.suite(suite).is_none() {
                continue;
            }
            let full = DistributionString::new(codename, self.identity(), suite).to_string();
            result.entry(full).or_default().push(alias.clone());
        }
        result
    }

    /// Contents of reprepro's `conf/distributions`.
    pub fn reprepro_distributions(&self, ctx: &ArchiveContext, sign: bool) -> String {
        let meta = self.meta_distributions();
        let mut stanzas = Vec::new();
        let yes_no = |b: bool| if b { "yes" } else { "no" };

        for view in &self.distributions {
            let components = view.distribution.components.join(" ");
            let architectures = view
                .distribution
                .architectures
                .iter()
                .map(|a| a.architecture.as_str())
                .collect::<Vec<_>>()
                .join(" ");

            for suite in &self.layout.suites {
                let live = DistributionString::new(view.codename(), self.identity(), &suite.name);
                let mut slots = vec![(live.to_string(), None)];
                slots.extend((0..suite.rollback).map(|r| (live.with_rollback(r).to_string(), Some(r))));

                for (name, rollback) in slots {
                    let mut stanza = format!("Codename: {name}\nSuite: {name}\nLabel: {name}\n");
                    if rollback.is_none() {
                        if let Some(aliases) = meta.get(&name) {
                            stanza.push_str(&format!("AlsoAcceptFor: {}\n", aliases.join(" ")));
                        }
                    }
                    let (description, not_automatic, but_automatic_upgrades) = match rollback {
                        None => (name.clone(), suite.not_automatic, suite.but_automatic_upgrades),
                        Some(r) => (
                            format!("{}: Automatic rollback distribution #{}", live, r),
                            true,
                            false,
                        ),
                    };
                    stanza.push_str(&format!(
                        "Origin: {}\nComponents: {}\nUDebComponents: {}\nArchitectures: source {}\nDescription: {}\n",
                        ctx.origin, components, components, architectures, description
                    ));
                    if sign {
                        stanza.push_str("SignWith: default\n");
                    }
                    stanza.push_str(&format!(
                        "NotAutomatic: {}\nButAutomaticUpgrades: {}\n",
                        yes_no(not_automatic),
                        yes_no(but_automatic_upgrades)
                    ));
                    stanza.push_str("DebIndices: Packages Release . .gz .bz2\n");
                    stanza.push_str("DscIndices: Sources Release . .gz .bz2\n");
                    stanzas.push(stanza);
                }
            }
        }
        stanzas.join("\n")
    }

    /// Contents of reprepro's `conf/options`.
    pub fn reprepro_options(&self, gnupg_home: Option<&Path>) -> String {
        let mut out = String::new();
        if let Some(home) = gnupg_home {
            out.push_str(&format!("gnupghome {}\n", home.display()));
        }
        if self.repository.reprepro_morguedir {
            out.push_str("morguedir +b/morguedir\n");
        }
        out
    }

    pub fn write_reprepro_config(&self, basedir: &Path, ctx: &ArchiveContext, gnupg_home: Option<&Path>) -> Result<()> {
        let conf = basedir.join("conf");
        fs::create_dir_all(&conf).with_context(|| format!("Failed to create {}", conf.display()))?;
        fs::write(
            conf.join("distributions"),
            self.reprepro_distributions(ctx, gnupg_home.is_some()),
        )?;
        fs::write(conf.join("options"), self.reprepro_options(gnupg_home))?;
        Ok(())
    }

    /// Reject an upload of `source`/`version` to `dist` that the archive
    /// must not take.
    #[instrument(skip(self, archive), fields(repository = %self.identity()))]
    pub async fn precheck(
        &self,
        archive: &dyn ArchiveDriver,
        source: &str,
        version: &str,
        dist: &DistributionString,
    ) -> Result<()> {
        let target = self.resolve(dist)?;
        if dist.rollback.is_some() {
            bail!("Cannot upload to rollback distribution {}", dist);
        }
        if !target.suite.uploadable {
            bail!("Suite '{}' is not uploadable", target.suite.name);
        }
        self.check_version(version, target.view, target.suite)?;

        for name in self.all_distributions() {
            let listed = archive.listmatched(&name, source).await?;
            if listed.iter().any(|p| p.source == source && p.version == version) {
                bail!("{}-{} already installed in {}", source, version, name);
            }
        }

        let live = dist.live().to_string();
        for listed in archive.listmatched(&live, source).await? {
            if listed.source == source
                && debversion::compare(&listed.version, version) == Ordering::Greater
            {
                bail!(
                    "{}-{} is greater than {} already in {}",
                    source,
                    listed.version,
                    version,
                    live
                );
            }
        }
        Ok(())
    }

    async fn find(archive: &dyn ArchiveDriver, dist: &str, package: &str) -> Option<ListedPackage> {
        match archive.listmatched(dist, package).await {
            Ok(listed) => listed.into_iter().find(|p| p.source == package),
            Err(e) => {
                warn!(distribution = %dist, package = %package, error = %e, "Listing failed");
                None
            }
        }
    }

    /// Move `package` one rollback slot down in every slot of `dist`'s
    /// suite. The oldest slot's contents are dropped. Failures only warn.
    pub async fn shift_rollbacks(
        &self,
        archive: &dyn ArchiveDriver,
        dist: &DistributionString,
        package: &str,
    ) -> Result<()> {
        let suite = self.suite(&dist.suite)?;
        let live = dist.live();

        for r in (0..suite.rollback).rev() {
            let slot = live.with_rollback(r).to_string();
            let from = match r {
                0 => live.to_string(),
                _ => live.with_rollback(r - 1).to_string(),
            };

            let result = if Self::find(archive, &from, package).await.is_some() {
                archive.copysrc(&slot, &from, package, None).await
            } else if Self::find(archive, &slot, package).await.is_some() {
                archive.removesrc(&slot, package, None).await
            } else {
                continue;
            };

            if let Err(e) = result {
                warn!(package = %package, slot = %slot, error = %e, "Rollback shift failed (ignoring)");
            }
        }
        Ok(())
    }

    /// Install the build results of one upload into `dist`. Every mandatory
    /// architecture needs a result; the arch-all result goes first.
    #[instrument(skip(self, archive, results), fields(repository = %self.identity()))]
    pub async fn install(
        &self,
        archive: &dyn ArchiveDriver,
        dist: &DistributionString,
        package: &str,
        results: &BTreeMap<String, Changes>,
    ) -> Result<()> {
        let target = self.resolve(dist)?;
        let distribution = target.view.distribution;

        let missing: Vec<String> = distribution
            .mandatory_architectures()
            .into_iter()
            .filter(|a| !results.contains_key(a))
            .collect();
        if !missing.is_empty() {
            bail!("Mandatory architectures missing: {}", missing.join(" "));
        }

        self.shift_rollbacks(archive, dist, package).await?;

        let archall = distribution.archall_architecture();
        let mut order: Vec<&String> = archall.iter().filter(|a| results.contains_key(*a)).collect();
        order.extend(results.keys().filter(|a| Some(*a) != archall.as_ref()));

        let live = dist.live().to_string();
        for arch in order {
            let bres = &results[arch];
            if bres.get("Sbuild-Status") == Some("skipped") {
                info!(arch = %arch, "Build skipped, nothing to install");
                continue;
            }

            let tmp = tempfile::tempdir()?;
            bres.unpack(tmp.path())?;
            for changes in build_changes_in(tmp.path())? {
                archive
                    .include(&live, &changes)
                    .await
                    .with_context(|| format!("Failed to install {} ({})", package, arch))?;
            }
        }
        Ok(())
    }

    /// Copy a package between two distributions of this repository.
    pub async fn propagate(
        &self,
        archive: &dyn ArchiveDriver,
        to: &DistributionString,
        from: &DistributionString,
        package: &str,
        version: Option<String>,
    ) -> Result<String> {
        self.resolve(to)?;
        self.resolve(from)?;
        self.shift_rollbacks(archive, to, package).await?;
        archive
            .copysrc(&to.to_string(), &from.to_string(), package, version)
            .await
    }

    /// Migrate `package` from `codename`/`suite` to the suite it migrates
    /// to, or restore it from rollback slot `rollback` into the live suite.
    #[instrument(skip(self, archive), fields(repository = %self.identity()))]
    pub async fn migrate(
        &self,
        archive: &dyn ArchiveDriver,
        package: &str,
        codename: &str,
        suite: &str,
        version: Option<String>,
        rollback: Option<u32>,
    ) -> Result<String> {
        let option = self.suite(suite)?;
        self.distribution(codename)?;
        let live = DistributionString::new(codename, self.identity(), suite);

        if let Some(r) = rollback {
            let from = self.dist_string(codename, suite, Some(r))?;
            if Self::find(archive, &from, package).await.is_none() {
                bail!("Package '{}' not in {}", package, from);
            }
            if Self::find(archive, &live.to_string(), package).await.is_some() {
                bail!("Package '{}' exists in {}: remove first to restore rollback", package, live);
            }
            return archive.copysrc(&live.to_string(), &from, package, version).await;
        }

        let to_suite = option
            .migrates_to
            .as_deref()
            .ok_or_else(|| anyhow!("Suite '{}' does not migrate", suite))?;
        let to = DistributionString::new(codename, self.identity(), to_suite);

        let present = Self::find(archive, &live.to_string(), package)
            .await
            .ok_or_else(|| anyhow!("Package '{}' not in {}", package, live))?;
        let version = version.unwrap_or(present.version);

        if let Some(migrated) = Self::find(archive, &to.to_string(), package).await {
            if migrated.version == version {
                bail!("Package '{}-{}' already migrated to {}", package, version, to);
            }
            self.shift_rollbacks(archive, &to, package).await?;
        }

        archive
            .copysrc(&to.to_string(), &live.to_string(), package, Some(version))
            .await
    }

    /// Remove `package` from `dist`. Removing from a live distribution
    /// shifts first; removing from a rollback slot closes the gap.
    #[instrument(skip(self, archive), fields(repository = %self.identity()))]
    pub async fn remove(
        &self,
        archive: &dyn ArchiveDriver,
        dist: &DistributionString,
        package: &str,
        version: Option<String>,
    ) -> Result<String> {
        let target = self.resolve(dist)?;
        let name = dist.to_string();

        let Some(r) = dist.rollback else {
            self.shift_rollbacks(archive, dist, package).await?;
            return archive.removesrc(&name, package, version).await;
        };

        let output = archive.removesrc(&name, package, version).await?;
        let live = dist.live();
        for slot in r..target.suite.rollback.saturating_sub(1) {
            let here = live.with_rollback(slot).to_string();
            let next = live.with_rollback(slot + 1).to_string();
            if Self::find(archive, &next, package).await.is_none() {
                continue;
            }
            if let Err(e) = archive.copysrc(&here, &next, package, None).await {
                warn!(package = %package, slot = %here, error = %e, "Rollback compaction failed");
                continue;
            }
            if let Err(e) = archive.removesrc(&next, package, None).await {
                warn!(package = %package, slot = %next, error = %e, "Rollback compaction failed");
            }
        }
        Ok(output)
    }

    pub async fn search(
        &self,
        archive: &dyn ArchiveDriver,
        codename: Option<&str>,
        pattern: &str,
    ) -> Result<SearchResult> {
        let mut result = SearchResult::new();

        for view in &self.distributions {
            if codename.is_some_and(|c| c != view.codename()) {
                continue;
            }
            for suite in &self.layout.suites {
                let live = DistributionString::new(view.codename(), self.identity(), &suite.name);
                let migrates_to = suite.migrates_to.as_deref().map(|to| {
                    DistributionString::new(view.codename(), self.identity(), to).to_string()
                });

                let mut slots = vec![(live.to_string(), true)];
                slots.extend((0..suite.rollback).map(|r| (live.with_rollback(r).to_string(), false)));

                for (name, is_live) in slots {
                    for listed in archive.listmatched(&name, pattern).await? {
                        result
                            .entry(listed.source)
                            .or_default()
                            .entry(name.clone())
                            .or_default()
                            .insert(
                                listed.version,
                                SearchEntry {
                                    migrates_to: if is_live { migrates_to.clone() } else { None },
                                },
                            );
                    }
                }
            }
        }
        Ok(result)
    }

    /// Work out a no-change port of `package` from `from` to `to`: the
    /// installed `.dsc` and the version it gets in the target suite. The new
    /// version must pass the usual upload checks.
    #[instrument(skip(self, archive), fields(repository = %self.identity()))]
    pub async fn plan_port(
        &self,
        archive: &dyn ArchiveDriver,
        repository_dir: &Path,
        package: &str,
        from: &DistributionString,
        to: &DistributionString,
        version: Option<String>,
    ) -> Result<PortPlan> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;

        let installed = archive
            .listmatched(&from.to_string(), package)
            .await?
            .into_iter()
            .find(|p| p.source == package && version.as_deref().map_or(true, |v| v == p.version))
            .ok_or_else(|| anyhow!("Package '{}' not in {}", package, from))?;

        let pattern = self.mandatory_version_regex(source.view, source.suite);
        let strip = regex::Regex::new(&pattern)
            .with_context(|| format!("Invalid version regex '{}'", pattern))?;
        let new_version = port_version(
            &installed.version,
            &self.default_version(target.view, target.suite),
            &strip,
        );
        self.precheck(archive, package, &new_version, to).await?;

        Ok(PortPlan {
            package: package.to_string(),
            dsc: find_pool_dsc(repository_dir, package, &installed.version)?,
            distribution: to.to_string(),
            version: new_version,
        })
    }

    pub async fn execute(&self, archive: &dyn ArchiveDriver, command: &ArchiveCommand) -> Result<String> {
        match command {
            ArchiveCommand::Remove {
                distribution,
                package,
                version,
                ..
            } => {
                let dist: DistributionString = distribution.parse()?;
                self.remove(archive, &dist, package, version.clone()).await
            }
            ArchiveCommand::Propagate {
                to,
                from,
                package,
                version,
                ..
            } => {
                let to: DistributionString = to.parse()?;
                let from: DistributionString = from.parse()?;
                self.propagate(archive, &to, &from, package, version.clone()).await
            }
            ArchiveCommand::Migrate {
                package,
                codename,
                suite,
                version,
                rollback,
                ..
            } => {
                self.migrate(archive, package, codename, suite, version.clone(), *rollback)
                    .await
            }
            ArchiveCommand::Search {
                codename, pattern, ..
            } => {
                let result = self.search(archive, codename.as_deref(), pattern).await?;
                Ok(serde_json::to_string_pretty(&result)?)
            }
            ArchiveCommand::Port { .. } => {
                bail!("Ports are built and uploaded by the ingest coordinator")
            }
        }
    }
}

/// Package `.changes` files found in an unpacked build result.
fn build_changes_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.changes", dir.display());
    let mut found = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if ChangesKind::from_file_name(&name) == ChangesKind::UserUpload {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Status-model entry for a repository: prepare writes the reprepro
/// configuration and exports the indices.
pub struct RepositoryLifecycle {
    pub config: Arc<StateConfiguration>,
    pub identity: String,
    pub archive: Arc<dyn ArchiveDriver>,
    pub basedir: PathBuf,
    pub context: ArchiveContext,
    pub gnupg_home: Option<PathBuf>,
}

#[async_trait]
impl Lifecycle for RepositoryLifecycle {
    fn status_id(&self) -> String {
        format!("repository:{}", self.identity)
    }

    fn dependencies(&self) -> Vec<String> {
        let Ok(view) = RepositoryView::new(&self.config, &self.identity) else {
            return Vec::new();
        };
        let mut ids = BTreeSet::new();
        for dist in &view.distributions {
            ids.insert(dist.source.status_id());
            for (_, extra) in &dist.extras {
                ids.insert(extra.status_id());
            }
        }
        ids.into_iter().collect()
    }

    async fn prepare(&self) -> Result<()> {
        let view = RepositoryView::new(&self.config, &self.identity)?;
        let problems = check_layout(view.layout);
        if !problems.is_empty() {
            bail!("Layout {}: {}", view.layout.name, problems.join("; "));
        }
        for dist in &view.distributions {
            let problems = check_distribution(dist.distribution);
            if !problems.is_empty() {
                bail!("Distribution {}: {}", dist.codename(), problems.join("; "));
            }
        }
        view.write_reprepro_config(&self.basedir, &self.context, self.gnupg_home.as_deref())?;
        self.archive.reindex().await?;
        info!(repository = %self.identity, "Repository prepared");
        Ok(())
    }

    async fn unprepare(&self) -> Result<()> {
        if self.basedir.exists() {
            fs::remove_dir_all(&self.basedir)
                .with_context(|| format!("Failed to remove {}", self.basedir.display()))?;
        }
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        RepositoryView::new(&self.config, &self.identity)?;
        if let Err(e) = self.archive.check().await {
            error!(repository = %self.identity, error = %e, "Archive check failed");
            return Err(e);
        }
        Ok(())
    }
}
