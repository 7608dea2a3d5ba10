/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::changes::Control;
use crate::gnupg::GnuPg;
use crate::status::{Lifecycle, StatusStore};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use entity::source::{ReleaseInfo, Source};
use std::time::Duration;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn release_url(archive: &str, codename: &str) -> String {
    format!("{}/dists/{}/Release", archive.trim_end_matches('/'), codename)
}

/// Read a Release file and make sure it describes `source`.
pub fn parse_release(text: &str, source: &Source) -> Result<ReleaseInfo> {
    let release = Control::parse(text).context("Failed to parse Release file")?;

    let origin = release.get("Origin").unwrap_or_default();
    let codename = release.get("Codename").unwrap_or_default();
    if origin != source.origin || codename != source.codename {
        bail!(
            "Release mismatch: expected {}/{}, got {}/{}",
            source.origin,
            source.codename,
            origin,
            codename
        );
    }

    let words = |key: &str| -> Vec<String> {
        release
            .get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    };

    Ok(ReleaseInfo {
        description: release.get("Description").unwrap_or_default().to_string(),
        version: release.get("Version").map(str::to_string),
        components: words("Components"),
        architectures: words("Architectures"),
        archives: Vec::new(),
    })
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Failed to fetch {}", url))?;
    Ok(response.bytes().await?.to_vec())
}

/// Status-model entry for an upstream apt source.
pub struct SourceLifecycle<'a> {
    pub source: Source,
    pub store: &'a StatusStore,
    pub binpath_gpg: String,
}

impl SourceLifecycle<'_> {
    fn client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?)
    }

    async fn verify(&self, client: &reqwest::Client, archive: &str, release: &[u8]) -> Result<()> {
        if self.source.apt_key_files.is_empty() {
            return Ok(());
        }

        let gnupg = GnuPg::tmp(&self.binpath_gpg)?;
        for key_file in &self.source.apt_key_files {
            gnupg.import_file(std::path::Path::new(key_file)).await?;
        }

        let url = format!("{}.gpg", release_url(archive, &self.source.codename));
        let signature = fetch(client, &url).await?;
        let dir = tempfile::tempdir()?;
        let release_path = dir.path().join("Release");
        let signature_path = dir.path().join("Release.gpg");
        std::fs::write(&release_path, release)?;
        std::fs::write(&signature_path, signature)?;
        gnupg.verify_detached(&signature_path, &release_path).await
    }

    /// Release info merged over every archive that serves a matching,
    /// verified Release file.
    async fn probe(&self) -> Result<ReleaseInfo> {
        let client = Self::client()?;
        let mut info: Option<ReleaseInfo> = None;
        let mut archives = Vec::new();

        for archive in &self.source.archives {
            let url = release_url(archive, &self.source.codename);
            let result = async {
                let body = fetch(&client, &url).await?;
                let release = parse_release(&String::from_utf8_lossy(&body), &self.source)?;
                self.verify(&client, archive, &body).await?;
                Ok::<_, anyhow::Error>(release)
            }
            .await;

            match result {
                Ok(release) => {
                    info!(url = %url, "Release file accepted");
                    archives.push(archive.clone());
                    info.get_or_insert(release);
                }
                Err(e) => warn!(url = %url, error = %e, "Archive rejected"),
            }
        }

        let mut info = info.ok_or_else(|| {
            anyhow!(
                "No archive serves a valid Release for {}/{}",
                self.source.origin,
                self.source.codename
            )
        })?;
        info.archives = archives;
        Ok(info)
    }
}

#[async_trait]
impl Lifecycle for SourceLifecycle<'_> {
    fn status_id(&self) -> String {
        self.source.status_id()
    }

    async fn prepare(&self) -> Result<()> {
        let info = self.probe().await?;
        info!(
            source = %self.status_id(),
            archives = info.archives.len(),
            codeversion = %entity::source::codeversion_from_release(info.version.as_deref(), &self.source.codename),
            "Source prepared"
        );
        self.store.set_release(&self.status_id(), Some(info))
    }

    async fn unprepare(&self) -> Result<()> {
        self.store.set_release(&self.status_id(), None)
    }

    async fn check(&self) -> Result<()> {
        let client = Self::client()?;
        let archive = self
            .source
            .mirror()
            .ok_or_else(|| anyhow!("Source {} has no archive", self.status_id()))?;
        fetch(&client, &release_url(archive, &self.source.codename)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Source {
        Source {
            origin: "Debian".to_string(),
            codename: "wheezy".to_string(),
            archives: vec!["http://deb.example.org/debian/".to_string()],
            apt_key_files: Vec::new(),
            codeversion_override: None,
            release: None,
        }
    }

    const RELEASE: &str = "Origin: Debian
Label: Debian
Suite: oldstable
Version: 7.11
Codename: wheezy
Architectures: amd64 armel i386
Components: main contrib non-free
Description: Debian 7.11 Released 04 June 2016
";

    #[test]
    fn test_release_url() {
        assert_eq!(
            release_url("http://deb.example.org/debian/", "wheezy"),
            "http://deb.example.org/debian/dists/wheezy/Release"
        );
    }

    #[test]
    fn test_parse_release() {
        let info = parse_release(RELEASE, &source()).unwrap();
        assert_eq!(info.version.as_deref(), Some("7.11"));
        assert_eq!(info.architectures, vec!["amd64", "armel", "i386"]);
        assert_eq!(info.components.len(), 3);

        let mut other = source();
        other.codename = "jessie".to_string();
        assert!(parse_release(RELEASE, &other).is_err());
    }
}
