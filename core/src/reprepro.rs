/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::executer::{argv, call, CallOptions};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

/// One source package version present in a distribution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListedPackage {
    pub source: String,
    pub version: String,
    pub distribution: String,
}

/// Operations on one repository's package archive. Implementations
/// serialize their calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveDriver: Send + Sync {
    /// Install the packages of a `.changes` file into `distribution`.
    async fn include(&self, distribution: &str, changes: &Path) -> Result<String>;

    /// Copy a source package and its binaries from `from` to `to`.
    async fn copysrc(
        &self,
        to: &str,
        from: &str,
        package: &str,
        version: Option<String>,
    ) -> Result<String>;

    async fn removesrc(
        &self,
        distribution: &str,
        package: &str,
        version: Option<String>,
    ) -> Result<String>;

    async fn listmatched(&self, distribution: &str, pattern: &str) -> Result<Vec<ListedPackage>>;

    /// Drop vanished distributions and re-export all indices.
    async fn reindex(&self) -> Result<()>;

    async fn check(&self) -> Result<String>;
}

pub struct Reprepro {
    basedir: PathBuf,
    binpath: String,
    lock: Mutex<()>,
}

const LIST_FORMAT: &str = "${$source}|${$sourceversion}|${$codename};";

impl Reprepro {
    pub fn new(basedir: &Path, binpath: &str) -> Self {
        Self {
            basedir: basedir.to_path_buf(),
            binpath: binpath.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let _guard = self.lock.lock().await;
        let basedir = format!("--basedir={}", self.basedir.display());
        let mut full = argv(&[&self.binpath, "--verbose", &basedir]);
        full.extend(argv(args));
        Ok(call(&full, &CallOptions::default()).await?)
    }
}

/// Parse `listmatched` output in [`LIST_FORMAT`]; binaries of one source
/// collapse into a single entry.
pub fn parse_list_output(output: &str) -> Vec<ListedPackage> {
    let entries: BTreeSet<ListedPackage> = output
        .split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.split('|');
            let source = parts.next()?.trim();
            let version = parts.next()?.trim();
            let distribution = parts.next()?.trim();
            Some(ListedPackage {
                source: source.to_string(),
                version: version.to_string(),
                distribution: distribution.to_string(),
            })
        })
        .collect();
    entries.into_iter().collect()
}

#[async_trait]
impl ArchiveDriver for Reprepro {
    async fn include(&self, distribution: &str, changes: &Path) -> Result<String> {
        let changes = changes.display().to_string();
        info!(distribution = %distribution, changes = %changes, "Installing");
        self.run(&["include", distribution, &changes]).await
    }

    async fn copysrc(
        &self,
        to: &str,
        from: &str,
        package: &str,
        version: Option<String>,
    ) -> Result<String> {
        info!(package = %package, from = %from, to = %to, "Copying source package");
        match version.as_deref() {
            Some(version) => self.run(&["copysrc", to, from, package, version]).await,
            None => self.run(&["copysrc", to, from, package]).await,
        }
    }

    async fn removesrc(
        &self,
        distribution: &str,
        package: &str,
        version: Option<String>,
    ) -> Result<String> {
        info!(package = %package, distribution = %distribution, "Removing source package");
        match version.as_deref() {
            Some(version) => self.run(&["removesrc", distribution, package, version]).await,
            None => self.run(&["removesrc", distribution, package]).await,
        }
    }

    async fn listmatched(&self, distribution: &str, pattern: &str) -> Result<Vec<ListedPackage>> {
        let format = format!("--list-format={}", LIST_FORMAT);
        let output = self
            .run(&[&format, "listmatched", distribution, pattern])
            .await?;
        Ok(parse_list_output(&output))
    }

    async fn reindex(&self) -> Result<()> {
        self.run(&["clearvanished"]).await?;
        self.run(&["export"]).await?;
        Ok(())
    }

    async fn check(&self) -> Result<String> {
        self.run(&["check"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_output() {
        let output = "foo|1.0|wheezy-myid-unstable;foo|1.0|wheezy-myid-unstable;\nbar|2.0|wheezy-myid-unstable;";
        let listed = parse_list_output(output);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].source, "bar");
        assert_eq!(listed[1].version, "1.0");
        assert!(parse_list_output("").is_empty());
    }
}
