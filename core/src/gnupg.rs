/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Thin wrapper around `gpg` with its own home directory. Calls on one
//! instance are serialized.

use crate::consts::SIGNING_KEY_NAME;
use crate::executer::{argv, call, CallOptions};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug)]
pub struct GnuPg {
    home: PathBuf,
    binpath: String,
    lock: Mutex<()>,
    _tmp: Option<TempDir>,
}

impl GnuPg {
    pub fn new(home: &Path, binpath: &str) -> Self {
        Self {
            home: home.to_path_buf(),
            binpath: binpath.to_string(),
            lock: Mutex::new(()),
            _tmp: None,
        }
    }

    /// A throw-away keyring, removed on drop.
    pub fn tmp(binpath: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("aptforge-gnupg-")
            .tempdir()
            .context("Failed to create temporary GnuPG home")?;
        Ok(Self {
            home: dir.path().to_path_buf(),
            binpath: binpath.to_string(),
            lock: Mutex::new(()),
            _tmp: Some(dir),
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    async fn gpg(&self, args: &[&str]) -> Result<String> {
        let _guard = self.lock.lock().await;
        std::fs::create_dir_all(&self.home)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.home, std::fs::Permissions::from_mode(0o700))?;
        }

        let home = self.home.display().to_string();
        let mut full = argv(&[
            &self.binpath,
            "--homedir",
            &home,
            "--batch",
            "--no-tty",
            "--trust-model",
            "always",
        ]);
        full.extend(argv(args));
        Ok(call(&full, &CallOptions::default()).await?)
    }

    pub async fn has_secret_key(&self) -> Result<bool> {
        let out = self.gpg(&["--list-secret-keys", "--with-colons"]).await?;
        Ok(out.lines().any(|l| l.starts_with("sec")))
    }

    /// Generate the daemon's signing key unless one exists.
    pub async fn gen_secret_key(&self, email: &str) -> Result<()> {
        if self.has_secret_key().await? {
            return Ok(());
        }

        let template = self.home.join("key.template");
        std::fs::create_dir_all(&self.home)?;
        std::fs::write(
            &template,
            format!(
                "Key-Type: RSA\nKey-Length: 4096\nName-Real: {}\nName-Email: {}\nExpire-Date: 0\n%no-protection\n%commit\n",
                SIGNING_KEY_NAME, email
            ),
        )?;

        info!(home = %self.home.display(), "Generating signing key");
        let template = template.display().to_string();
        self.gpg(&["--gen-key", &template])
            .await
            .context("Failed to generate signing key")?;
        Ok(())
    }

    pub async fn pub_key(&self) -> Result<String> {
        self.gpg(&["--armor", "--export"]).await
    }

    pub async fn import_file(&self, path: &Path) -> Result<()> {
        let path = path.display().to_string();
        self.gpg(&["--import", &path])
            .await
            .with_context(|| format!("Failed to import key {}", path))?;
        Ok(())
    }

    pub async fn add_pub_key(&self, key: &str) -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), key)?;
        self.import_file(file.path()).await
    }

    /// Binary keyring of all public keys, as used by debootstrap and
    /// archive keyring packages.
    pub async fn export_keyring(&self, dest: &Path) -> Result<()> {
        let dest_str = dest.display().to_string();
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        self.gpg(&["--output", &dest_str, "--export"]).await?;
        Ok(())
    }

    pub async fn verify(&self, path: &Path) -> Result<()> {
        let path_str = path.display().to_string();
        self.gpg(&["--verify", &path_str])
            .await
            .with_context(|| format!("Signature check failed for {}", path.display()))?;
        Ok(())
    }

    /// Check a detached `signature` over `data`.
    pub async fn verify_detached(&self, signature: &Path, data: &Path) -> Result<()> {
        let signature_str = signature.display().to_string();
        let data_str = data.display().to_string();
        self.gpg(&["--verify", &signature_str, &data_str])
            .await
            .with_context(|| format!("Signature check failed for {}", data.display()))?;
        Ok(())
    }

    /// Clear-sign `path` in place.
    pub async fn sign(&self, path: &Path) -> Result<()> {
        let signed = path.with_extension("signed");
        let path_str = path.display().to_string();
        let signed_str = signed.display().to_string();
        self.gpg(&["--yes", "--clearsign", "--output", &signed_str, &path_str])
            .await
            .with_context(|| format!("Failed to sign {}", path.display()))?;
        std::fs::rename(&signed, path)?;
        Ok(())
    }
}
