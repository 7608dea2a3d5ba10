/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::source::{PrioritySource, SourceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SuiteOption {
    pub name: String,
    #[serde(default = "default_true")]
    pub uploadable: bool,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub migrates_to: Option<String>,
    #[serde(default)]
    pub build_keyring_package: bool,
    #[serde(default)]
    pub rollback: u32,
    #[serde(default = "default_true")]
    pub not_automatic: bool,
    #[serde(default = "default_true")]
    pub but_automatic_upgrades: bool,
}

impl SuiteOption {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uploadable: true,
            experimental: false,
            migrates_to: None,
            build_keyring_package: false,
            rollback: 0,
            not_automatic: true,
            but_automatic_upgrades: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Layout {
    pub name: String,
    pub suites: Vec<SuiteOption>,
    #[serde(default = "default_version")]
    pub default_version: String,
    #[serde(default = "default_mandatory_version_regex")]
    pub mandatory_version_regex: String,
    #[serde(default = "default_experimental_version")]
    pub experimental_default_version: String,
    #[serde(default = "default_experimental_mandatory_version_regex")]
    pub experimental_mandatory_version_regex: String,
    /// Short aliases (`unstable`) mapped to full distribution strings.
    #[serde(default)]
    pub meta_distributions: BTreeMap<String, String>,
}

impl Layout {
    pub fn suite(&self, name: &str) -> Option<&SuiteOption> {
        self.suites.iter().find(|s| s.name == name)
    }

    /// The stock layout: stable <- testing <- unstable, plus snapshot and
    /// experimental side suites.
    pub fn default_layout() -> Self {
        let mut stable = SuiteOption::new("stable");
        stable.uploadable = false;
        stable.rollback = 6;
        stable.not_automatic = false;
        stable.but_automatic_upgrades = false;

        let mut testing = SuiteOption::new("testing");
        testing.uploadable = false;
        testing.migrates_to = Some("stable".to_string());
        testing.rollback = 3;

        let mut unstable = SuiteOption::new("unstable");
        unstable.migrates_to = Some("testing".to_string());
        unstable.build_keyring_package = true;
        unstable.rollback = 9;

        let mut snapshot = SuiteOption::new("snapshot");
        snapshot.experimental = true;
        snapshot.rollback = 12;

        let mut experimental = SuiteOption::new("experimental");
        experimental.experimental = true;
        experimental.rollback = 6;
        experimental.but_automatic_upgrades = false;

        Self {
            name: "Default".to_string(),
            suites: vec![stable, testing, unstable, snapshot, experimental],
            default_version: default_version(),
            mandatory_version_regex: default_mandatory_version_regex(),
            experimental_default_version: default_experimental_version(),
            experimental_mandatory_version_regex: default_experimental_mandatory_version_regex(),
            meta_distributions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ArchitectureOption {
    pub architecture: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub build_architecture_all: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildDepResolver {
    #[default]
    Apt,
    Aptitude,
    Internal,
}

impl std::str::FromStr for BuildDepResolver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apt" => Ok(BuildDepResolver::Apt),
            "aptitude" => Ok(BuildDepResolver::Aptitude),
            "internal" => Ok(BuildDepResolver::Internal),
            _ => Err(format!("Unknown build dependency resolver: {}", s)),
        }
    }
}

impl fmt::Display for BuildDepResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildDepResolver::Apt => "apt",
            BuildDepResolver::Aptitude => "aptitude",
            BuildDepResolver::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// How lintian results weigh on a build. Ordered by strictness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LintianMode {
    Disabled,
    RunOnly,
    #[default]
    FailOnError,
    FailOnWarning,
}

impl std::str::FromStr for LintianMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(LintianMode::Disabled),
            "run-only" => Ok(LintianMode::RunOnly),
            "fail-on-error" => Ok(LintianMode::FailOnError),
            "fail-on-warning" => Ok(LintianMode::FailOnWarning),
            _ => Err(format!("Unknown lintian mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Distribution {
    pub base_source: SourceRef,
    #[serde(default)]
    pub extra_sources: Vec<PrioritySource>,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    pub architectures: Vec<ArchitectureOption>,
    #[serde(default)]
    pub build_dep_resolver: BuildDepResolver,
    #[serde(default)]
    pub apt_allow_unauthenticated: bool,
    #[serde(default)]
    pub lintian_mode: LintianMode,
    #[serde(default = "default_lintian_extra_options")]
    pub lintian_extra_options: String,
    #[serde(default)]
    pub chroot_setup_script: String,
    #[serde(default)]
    pub sbuildrc_snippet: String,
}

impl Distribution {
    pub fn codename(&self) -> &str {
        &self.base_source.codename
    }

    pub fn architecture(&self, name: &str) -> Option<&ArchitectureOption> {
        self.architectures.iter().find(|a| a.architecture == name)
    }

    pub fn mandatory_architectures(&self) -> Vec<String> {
        self.architectures
            .iter()
            .filter(|a| !a.optional)
            .map(|a| a.architecture.clone())
            .collect()
    }

    pub fn archall_architecture(&self) -> Option<String> {
        self.architectures
            .iter()
            .find(|a| a.build_architecture_all)
            .map(|a| a.architecture.clone())
    }

    pub fn is_mandatory(&self, architecture: &str) -> bool {
        self.architecture(architecture).is_some_and(|a| !a.optional)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Repository {
    pub identity: String,
    #[serde(default = "default_layout_name")]
    pub layout: String,
    /// Codenames of the distributions served by this repository.
    pub distributions: Vec<String>,
    #[serde(default)]
    pub allow_unauthenticated_uploads: bool,
    #[serde(default)]
    pub extra_uploader_key_files: Vec<String>,
    #[serde(default)]
    pub notify: Vec<String>,
    #[serde(default)]
    pub notify_changed_by: bool,
    #[serde(default)]
    pub notify_maintainer: bool,
    #[serde(default)]
    pub reprepro_morguedir: bool,
    #[serde(default = "default_internal_apt_priority")]
    pub internal_apt_priority: i32,
}

impl Repository {
    pub fn status_id(&self) -> String {
        format!("repository:{}", self.identity)
    }
}

fn default_true() -> bool {
    true
}

fn default_layout_name() -> String {
    "Default".to_string()
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

fn default_lintian_extra_options() -> String {
    "--info".to_string()
}

fn default_internal_apt_priority() -> i32 {
    500
}

fn default_version() -> String {
    "~%IDENTITY%%CODEVERSION%+1".to_string()
}

fn default_mandatory_version_regex() -> String {
    r"~%IDENTITY%%CODEVERSION%\+[1-9]".to_string()
}

fn default_experimental_version() -> String {
    "~%IDENTITY%%CODEVERSION%+0".to_string()
}

fn default_experimental_mandatory_version_regex() -> String {
    r"~%IDENTITY%%CODEVERSION%\+0".to_string()
}
