/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Declarative archive configuration, loaded from a JSON state file.

use crate::consts::DIST_PART_RE;
use crate::distribution::DistributionString;
use crate::repository::{check_distribution, check_layout};
use anyhow::{Context, Result};
use entity::chroot::Chroot;
use entity::remote::Remote;
use entity::repository::{Distribution, Layout, Repository};
use entity::source::{Source, SourceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StateConfiguration {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub layouts: Vec<Layout>,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub chroots: Vec<Chroot>,
    #[serde(default)]
    pub remotes: Vec<Remote>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Validation error in field '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub is_valid: bool,
}

/// Keep the last of several entries sharing a key, at the position of the
/// last occurrence.
fn dedup_last<T, K: Ord>(items: &mut Vec<T>, key: impl Fn(&T) -> K, what: &str) {
    let mut seen = BTreeSet::new();
    let before = items.len();
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items.drain(..).rev() {
        if seen.insert(key(&item)) {
            kept.push(item);
        }
    }
    kept.reverse();
    if kept.len() != before {
        warn!(kind = %what, dropped = before - kept.len(), "Duplicate definitions, later ones win");
    }
    *items = kept;
}

impl StateConfiguration {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path))?;
        Ok(config.normalized())
    }

    /// Collapse duplicate definitions (the later one wins) and make sure
    /// the stock layout exists.
    pub fn normalized(mut self) -> Self {
        dedup_last(&mut self.sources, |s| s.source_ref(), "source");
        dedup_last(&mut self.layouts, |l| l.name.clone(), "layout");
        dedup_last(
            &mut self.distributions,
            |d| d.base_source.codename.clone(),
            "distribution",
        );
        dedup_last(&mut self.repositories, |r| r.identity.clone(), "repository");
        dedup_last(
            &mut self.chroots,
            |c| (c.source.codename.clone(), c.architecture.clone()),
            "chroot",
        );
        dedup_last(&mut self.remotes, |r| r.ftp.clone(), "remote");

        let default = Layout::default_layout();
        if self.layout(&default.name).is_none() {
            self.layouts.push(default);
        }
        self
    }

    pub fn source(&self, source: &SourceRef) -> Option<&Source> {
        self.sources
            .iter()
            .find(|s| s.origin == source.origin && s.codename == source.codename)
    }

    pub fn layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.name == name)
    }

    pub fn distribution(&self, codename: &str) -> Option<&Distribution> {
        self.distributions
            .iter()
            .find(|d| d.base_source.codename == codename)
    }

    pub fn repository(&self, identity: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.identity == identity)
    }

    pub fn chroot(&self, codename: &str, architecture: &str) -> Option<&Chroot> {
        self.chroots
            .iter()
            .find(|c| c.source.codename == codename && c.architecture == architecture)
    }

    /// Map a meta distribution alias to its full distribution string.
    pub fn resolve_meta_distribution(&self, name: &str) -> Option<String> {
        let mut result = None;
        for repository in &self.repositories {
            let Some(layout) = self.layout(&repository.layout) else {
                continue;
            };
            if let Some(target) = layout.meta_distributions.get(name) {
                if let Some((codename, suite)) = target.split_once('-') {
                    if repository.distributions.iter().any(|d| d == codename) {
                        result = Some(
                            DistributionString::new(codename, &repository.identity, suite)
                                .to_string(),
                        );
                    }
                }
            }
        }
        result
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut error = |field: String, message: String| {
            errors.push(ValidationError { field, message });
        };

        for layout in &self.layouts {
            let field = format!("layouts.{}", layout.name);
            let mut names = BTreeSet::new();
            for suite in &layout.suites {
                if !DIST_PART_RE.is_match(&suite.name) {
                    error(field.clone(), format!("Invalid suite name '{}'", suite.name));
                }
                if !names.insert(suite.name.clone()) {
                    error(field.clone(), format!("Duplicate suite '{}'", suite.name));
                }
            }
            for message in check_layout(layout) {
                error(field.clone(), message);
            }
            for regex in [
                &layout.mandatory_version_regex,
                &layout.experimental_mandatory_version_regex,
            ] {
                if let Err(e) = regex::Regex::new(regex) {
                    error(field.clone(), format!("Invalid version regex '{}': {}", regex, e));
                }
            }
        }

        for distribution in &self.distributions {
            let field = format!("distributions.{}", distribution.codename());
            if self.source(&distribution.base_source).is_none() {
                error(
                    field.clone(),
                    format!(
                        "Unknown base source {}/{}",
                        distribution.base_source.origin, distribution.base_source.codename
                    ),
                );
            }
            for extra in &distribution.extra_sources {
                if self.source(&extra.source_ref()).is_none() {
                    error(
                        field.clone(),
                        format!("Unknown extra source {}/{}", extra.origin, extra.codename),
                    );
                }
            }
            for message in check_distribution(distribution) {
                error(field.clone(), message);
            }
        }

        for repository in &self.repositories {
            let field = format!("repositories.{}", repository.identity);
            if !DIST_PART_RE.is_match(&repository.identity) {
                error(
                    field.clone(),
                    format!("Invalid identity '{}'", repository.identity),
                );
            }
            if self.layout(&repository.layout).is_none() {
                error(field.clone(), format!("Unknown layout '{}'", repository.layout));
            }
            let mut codenames = BTreeSet::new();
            for codename in &repository.distributions {
                if self.distribution(codename).is_none() {
                    error(field.clone(), format!("Unknown distribution '{}'", codename));
                }
                if !codenames.insert(codename) {
                    error(field.clone(), format!("Multiple distribution codename '{}'", codename));
                }
            }
        }

        for chroot in &self.chroots {
            if self.source(&chroot.source).is_none() {
                error(
                    format!("chroots.{}", chroot.name()),
                    format!(
                        "Unknown source {}/{}",
                        chroot.source.origin, chroot.source.codename
                    ),
                );
            }
        }

        let is_valid = errors.is_empty();
        ValidationResult { errors, is_valid }
    }
}

/// Load the state file named on the command line, if any, and validate it.
pub fn load_state(path: Option<&str>) -> Result<StateConfiguration> {
    let Some(path) = path else {
        info!("No state file configured, starting with an empty archive configuration");
        return Ok(StateConfiguration::default().normalized());
    };

    let config = StateConfiguration::from_file(path)?;
    let validation = config.validate();
    if !validation.is_valid {
        for e in &validation.errors {
            tracing::error!(field = %e.field, message = %e.message, "Invalid configuration");
        }
        anyhow::bail!(
            "State file {} has {} validation error(s)",
            path,
            validation.errors.len()
        );
    }

    info!(
        sources = config.sources.len(),
        distributions = config.distributions.len(),
        repositories = config.repositories.len(),
        chroots = config.chroots.len(),
        "Loaded state file {}",
        path
    );
    Ok(config)
}
