/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Identifies an upstream source by its Release `Origin` and `Codename`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct SourceRef {
    pub origin: String,
    pub codename: String,
}

impl SourceRef {
    pub fn status_id(&self) -> String {
        format!("source:{}:{}", self.origin, self.codename)
    }
}

/// Values read from a source's Release file while preparing it.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Archive URLs that served a matching Release file.
    #[serde(default)]
    pub archives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Source {
    pub origin: String,
    pub codename: String,
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub apt_key_files: Vec<String>,
    #[serde(default)]
    pub codeversion_override: Option<String>,
    #[serde(default)]
    pub release: Option<ReleaseInfo>,
}

impl Source {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            origin: self.origin.clone(),
            codename: self.codename.clone(),
        }
    }

    pub fn status_id(&self) -> String {
        self.source_ref().status_id()
    }

    /// Short version string used in version regexes: `7.0` becomes `70`,
    /// anything else falls back to the upper-cased codename.
    pub fn codeversion(&self) -> String {
        if let Some(codeversion) = &self.codeversion_override {
            return codeversion.clone();
        }

        let version = self.release.as_ref().and_then(|r| r.version.as_deref());
        codeversion_from_release(version, &self.codename)
    }

    /// First archive known to serve this source.
    pub fn mirror(&self) -> Option<&str> {
        self.release
            .as_ref()
            .and_then(|r| r.archives.first())
            .or_else(|| self.archives.first())
            .map(|s| s.as_str())
    }
}

pub fn codeversion_from_release(version: Option<&str>, codename: &str) -> String {
    if let Some(version) = version {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() >= 2
            && parts[..2]
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            return format!("{}{}", parts[0], parts[1]);
        }
    }

    codename.to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PrioritySource {
    pub origin: String,
    pub codename: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl PrioritySource {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            origin: self.origin.clone(),
            codename: self.codename.clone(),
        }
    }
}

fn default_priority() -> i32 {
    1
}
