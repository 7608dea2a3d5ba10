/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Changes bundles: a Debian control file plus the files it lists.
//!
//! Three kinds share the format. User uploads come from developers, build
//! requests carry a source package to a builder, and build results carry
//! the build outcome back. Kinds are told apart by file name only.

use crate::consts::*;
use crate::ftp;
use crate::gnupg::GnuPg;
use crate::input::{strip_epoch, HoPo};
use anyhow::{anyhow, bail, Context, Result};
use md5::Md5;
use sha1::Sha1;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangesKind {
    UserUpload,
    BuildRequest,
    BuildResult,
}

impl ChangesKind {
    pub fn from_file_name(name: &str) -> Self {
        if BUILDREQUEST_RE.is_match(name) {
            ChangesKind::BuildRequest
        } else if BUILDRESULT_RE.is_match(name) {
            ChangesKind::BuildResult
        } else {
            ChangesKind::UserUpload
        }
    }

    fn infix(&self) -> &'static str {
        match self {
            ChangesKind::UserUpload => "",
            ChangesKind::BuildRequest => BUILDREQUEST_INFIX,
            ChangesKind::BuildResult => BUILDRESULT_INFIX,
        }
    }
}

impl fmt::Display for ChangesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangesKind::UserUpload => "upload",
            ChangesKind::BuildRequest => "buildrequest",
            ChangesKind::BuildResult => "buildresult",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("line {line}: continuation line without a field")]
    OrphanContinuation { line: usize },
    #[error("line {line}: not a field: '{text}'")]
    NotAField { line: usize, text: String },
    #[error("malformed Files entry: '{0}'")]
    BadFilesEntry(String),
    #[error("missing field '{0}'")]
    MissingField(String),
}

/// Ordered RFC822-style fields. Multi-line values keep their lines joined by
/// `\n`, without the leading continuation whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Control {
    fields: Vec<(String, String)>,
}

fn strip_signature(text: &str) -> String {
    let mut lines = text.lines();
    match lines.clone().next() {
        Some(first) if first.starts_with("-----BEGIN PGP SIGNED MESSAGE-----") => {}
        _ => return text.to_string(),
    }

    // Armor headers end at the first empty line.
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }

    let mut body = String::new();
    for line in lines {
        if line.starts_with("-----BEGIN PGP SIGNATURE-----") {
            break;
        }
        body.push_str(line.strip_prefix("- ").unwrap_or(line));
        body.push('\n');
    }
    body
}

impl Control {
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let text = strip_signature(text);
        let mut fields: Vec<(String, String)> = Vec::new();

        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                let (_, value) = fields
                    .last_mut()
                    .ok_or(ControlError::OrphanContinuation { line: i + 1 })?;
                let content = &line[1..];
                value.push('\n');
                if content != "." {
                    value.push_str(content);
                }
                continue;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| ControlError::NotAField {
                line: i + 1,
                text: line.to_string(),
            })?;
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self
            .fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.fields.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            let mut lines = value.split('\n');
            let first = lines.next().unwrap_or_default();
            out.push_str(key);
            out.push(':');
            if !first.is_empty() {
                out.push(' ');
                out.push_str(first);
            }
            out.push('\n');
            for line in lines {
                out.push(' ');
                out.push_str(if line.is_empty() { "." } else { line });
                out.push('\n');
            }
        }
        out
    }
}

/// One line of a `Files` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub md5: String,
    pub size: u64,
    pub section: String,
    pub priority: String,
    pub name: String,
}

/// Listed files live beside their control file: a single path component.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl FileEntry {
    fn parse(line: &str) -> Result<Self, ControlError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 5 || !is_plain_file_name(parts[4]) {
            return Err(ControlError::BadFilesEntry(line.to_string()));
        }

        Ok(Self {
            md5: parts[0].to_string(),
            size: parts[1]
                .parse()
                .map_err(|_| ControlError::BadFilesEntry(line.to_string()))?,
            section: parts[2].to_string(),
            priority: parts[3].to_string(),
            name: parts[4].to_string(),
        })
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.md5, self.size, self.section, self.priority, self.name
        )
    }
}

/// `Files` entries of a `.dsc`: `<md5> <size> <name>`.
pub fn parse_dsc_files(control: &Control) -> Result<Vec<(String, u64, String)>, ControlError> {
    let Some(value) = control.get("Files") else {
        return Ok(Vec::new());
    };

    value
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 || !is_plain_file_name(parts[2]) {
                return Err(ControlError::BadFilesEntry(line.to_string()));
            }
            let size = parts[1]
                .parse()
                .map_err(|_| ControlError::BadFilesEntry(line.to_string()))?;
            Ok((parts[0].to_string(), size, parts[2].to_string()))
        })
        .collect()
}

fn digest_file<D: sha1::Digest>(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = D::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn md5_of_file(path: &Path) -> Result<String> {
    digest_file::<Md5>(path)
}

pub fn sha1_of_file(path: &Path) -> Result<String> {
    digest_file::<Sha1>(path)
}

pub fn gen_file_name(package: &str, version: &str, arch: &str, kind: ChangesKind) -> String {
    format!(
        "{}_{}{}_{}.changes",
        package,
        strip_epoch(version),
        kind.infix(),
        arch
    )
}

pub fn gen_dsc_file_name(package: &str, version: &str) -> String {
    format!("{}_{}.dsc", package, strip_epoch(version))
}

fn append_deterministic<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("No file name in {}", path.display()))?;
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)?.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = 0o644;

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder
        .append_data(&mut header, name, data.as_slice())
        .with_context(|| format!("Failed to add {} to tar", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Changes {
    path: PathBuf,
    control: Control,
    files: Vec<FileEntry>,
    sha1: Option<String>,
}

impl Changes {
    /// A bundle that does not exist on disk yet.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            control: Control::default(),
            files: Vec::new(),
            sha1: None,
        }
    }

    pub fn parse(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read changes {}", path.display()))?;
        let mut control = Control::parse(&text)
            .with_context(|| format!("Failed to parse changes {}", path.display()))?;

        let files = match control.remove("Files") {
            Some(value) => value
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(FileEntry::parse)
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Bad Files field in {}", path.display()))?,
            None => Vec::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            control,
            files,
            sha1: Some(sha1_of_file(path)?),
        })
    }

    /// Open an existing bundle, or start a new one at `path`.
    pub fn open_or_new(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::parse(path)
        } else {
            Ok(Self::new(path))
        }
    }

    pub fn is_new(&self) -> bool {
        self.sha1.is_none()
    }

    pub fn kind(&self) -> ChangesKind {
        ChangesKind::from_file_name(&self.file_name())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn sha1(&self) -> Option<&str> {
        self.sha1.as_deref()
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.control.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.control
            .get(key)
            .ok_or_else(|| ControlError::MissingField(key.to_string()))
            .with_context(|| format!("Invalid changes {}", self.file_name()))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.control.set(key, value);
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.name == name)
    }

    pub fn source(&self) -> Result<&str> {
        self.require("Source")
    }

    pub fn version(&self) -> Result<&str> {
        self.require("Version")
    }

    pub fn distribution(&self) -> Result<&str> {
        self.require("Distribution")
    }

    pub fn architecture(&self) -> Result<&str> {
        self.require("Architecture")
    }

    /// `<source>_<version>`, shared by an upload and all its requests and
    /// results.
    pub fn pkg_id(&self) -> Result<String> {
        Ok(format!("{}_{}", self.source()?, self.version()?))
    }

    pub fn buildlog_name(&self) -> Result<String> {
        Ok(format!(
            "{}_{}_{}.buildlog",
            self.source()?,
            self.version()?,
            self.architecture()?
        ))
    }

    pub fn dsc_path(&self) -> Result<PathBuf> {
        Ok(self
            .dir()
            .join(gen_dsc_file_name(self.source()?, self.version()?)))
    }

    /// File name of a derived bundle of `kind` for `arch`.
    pub fn gen_file_name(&self, arch: &str, kind: ChangesKind) -> Result<String> {
        Ok(gen_file_name(self.source()?, self.version()?, arch, kind))
    }

    pub fn spool_dir(&self, spool_root: &Path) -> Result<PathBuf> {
        let sha1 = self
            .sha1
            .as_deref()
            .ok_or_else(|| anyhow!("Changes {} has not been saved", self.file_name()))?;
        Ok(spool_root.join(sha1))
    }

    pub fn archive_dir(&self, log_root: &Path) -> Result<PathBuf> {
        Ok(log_root
            .join(self.distribution()?)
            .join(self.source()?)
            .join(self.version()?)
            .join(self.architecture()?))
    }

    /// Path of the `.tar` sibling created by [`Changes::pack`].
    pub fn tar_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tar");
        PathBuf::from(name)
    }

    pub fn dump(&self) -> String {
        let mut out = self.control.dump();
        if !self.files.is_empty() {
            out.push_str("Files:\n");
            for file in &self.files {
                out.push_str(&format!(" {}\n", file));
            }
        }
        out
    }

    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("No file name in {}", path.display()))?;
        let entry = FileEntry {
            md5: md5_of_file(path)?,
            size: fs::metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len(),
            section: CHANGES_FILE_SECTION.to_string(),
            priority: CHANGES_FILE_PRIORITY.to_string(),
            name: name.clone(),
        };

        match self.files.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = entry,
            None => self.files.push(entry),
        }
        Ok(())
    }

    async fn write_signed(&self, signer: Option<&GnuPg>) -> Result<String> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, self.dump())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        if let Some(gnupg) = signer {
            gnupg.sign(&self.path).await?;
        }
        sha1_of_file(&self.path)
    }

    /// Write the bundle, clear-sign it when a key is given, and refresh its
    /// identity. A failed save leaves no file behind.
    pub async fn save(&mut self, signer: Option<&GnuPg>) -> Result<()> {
        info!(changes = %self.path.display(), "Saving changes");

        match self.write_signed(signer).await {
            Ok(sha1) => {
                self.sha1 = Some(sha1);
                Ok(())
            }
            Err(e) => {
                if self.path.exists() {
                    if let Err(remove) = fs::remove_file(&self.path) {
                        warn!(changes = %self.path.display(), error = %remove, "Failed to remove unsaved changes");
                    }
                }
                Err(e)
            }
        }
    }

    /// Tar the control file, every listed file and `extra` into `tar_path`,
    /// each under its base name.
    pub fn pack(&self, tar_path: &Path, extra: &[PathBuf]) -> Result<()> {
        let file = fs::File::create(tar_path)
            .with_context(|| format!("Failed to create {}", tar_path.display()))?;
        let mut builder = tar::Builder::new(file);

        append_deterministic(&mut builder, &self.path)?;
        for entry in &self.files {
            append_deterministic(&mut builder, &self.dir().join(&entry.name))?;
        }
        for path in extra {
            append_deterministic(&mut builder, path)?;
        }

        builder.finish()?;
        Ok(())
    }

    /// Extract the `.tar` sibling into `dest`; absent tarballs are skipped.
    pub fn unpack(&self, dest: &Path) -> Result<()> {
        let tar_path = self.tar_path();
        if !tar_path.exists() {
            info!(tar = %tar_path.display(), "No tar file (skipping)");
            return Ok(());
        }

        fs::create_dir_all(dest)?;
        let file = fs::File::open(&tar_path)?;
        tar::Archive::new(file)
            .unpack(dest)
            .with_context(|| format!("Failed to unpack {}", tar_path.display()))?;
        Ok(())
    }

    fn upload_marker(&self) -> PathBuf {
        self.path.with_extension("upload")
    }

    /// Send all listed files, then the control file, to `hopo`. A marker
    /// file makes repeated calls no-ops.
    pub async fn upload(&self, hopo: &HoPo) -> Result<()> {
        let marker = self.upload_marker();
        if marker.exists() {
            let target = fs::read_to_string(&marker).unwrap_or_default();
            info!(changes = %self.file_name(), target = %target, "Already uploaded");
            return Ok(());
        }

        let mut names: Vec<String> = self.files.iter().map(|f| f.name.clone()).collect();
        names.push(self.file_name());
        ftp::upload(hopo, &self.dir(), &names)
            .await
            .with_context(|| format!("Failed to upload {} to {}", self.file_name(), hopo))?;

        fs::write(&marker, hopo.to_string())?;
        info!(changes = %self.file_name(), target = %hopo, "Uploaded");
        Ok(())
    }

    /// Move the control file and its files to `<log>/<dist>/<src>/<ver>/<arch>/`.
    pub fn archive(&self, log_root: &Path) -> Result<PathBuf> {
        let dir = self.archive_dir(log_root)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        info!(changes = %self.file_name(), dir = %dir.display(), "Archiving changes");
        let mut names: Vec<String> = self.files.iter().map(|f| f.name.clone()).collect();
        names.push(self.file_name());
        for name in names {
            let from = self.dir().join(&name);
            if !from.exists() {
                warn!(file = %from.display(), "Missing file while archiving");
                continue;
            }
            move_file(&from, &dir.join(&name))?;
        }

        self.remove_upload_marker();
        Ok(dir)
    }

    fn remove_upload_marker(&self) {
        let marker = self.upload_marker();
        if marker.exists() {
            if let Err(e) = fs::remove_file(&marker) {
                warn!(file = %marker.display(), error = %e, "Failed to remove upload marker");
            }
        }
    }

    pub fn remove(&self) -> Result<()> {
        info!(changes = %self.file_name(), "Removing changes");
        for entry in &self.files {
            let path = self.dir().join(&entry.name);
            debug!(file = %path.display(), "Removing");
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Failed to remove file");
            }
        }
        self.remove_upload_marker();
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove {}", self.path.display()))
    }

    /// A fresh build result for this build request, placed in `dir`.
    pub fn gen_buildresult(&self, dir: &Path) -> Result<Changes> {
        if self.kind() != ChangesKind::BuildRequest {
            bail!("{} is not a build request", self.file_name());
        }

        let mut bres = Changes::new(&dir.join(
            self.gen_file_name(self.architecture()?, ChangesKind::BuildResult)?,
        ));
        for key in ["Distribution", "Source", "Version", "Architecture"] {
            bres.set(key, self.require(key)?);
        }
        Ok(bres)
    }

    /// Write a failed build result for this request into `dir`, carrying a
    /// short buildlog that explains `error`.
    pub async fn gen_failed_buildresult(
        &self,
        dir: &Path,
        retval: i32,
        status: &str,
        error: &str,
        signer: Option<&GnuPg>,
    ) -> Result<Changes> {
        fs::create_dir_all(dir)?;
        let mut bres = self.gen_buildresult(dir)?;
        bres.set("Sbuildretval", retval.to_string());
        bres.set("Sbuild-Status", status);

        let buildlog = dir.join(self.buildlog_name()?);
        fs::write(
            &buildlog,
            format!("\nBuild request failed: {} ({}): {}\n", retval, status, error),
        )?;
        bres.add_file(&buildlog)?;
        bres.save(signer).await?;
        Ok(bres)
    }
}

/// `rename`, falling back to copy and remove across file systems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    fs::remove_file(from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPLOAD: &str = "Format: 1.8
Date: Mon, 01 Jan 2024 00:00:00 +0000
Source: foo
Binary: foo
Architecture: source
Version: 1.0~myid70+1
Distribution: wheezy-myid-unstable
Maintainer: Jane Doe <jane@example.org>
Changes:
 foo (1.0~myid70+1) wheezy-myid-unstable; urgency=low
 .
   * Initial release.
Files:
 d41d8cd98f00b204e9800998ecf8427e 0 devel optional foo_1.0~myid70+1.dsc
";

    #[test]
    fn test_classify_by_file_name() {
        assert_eq!(
            ChangesKind::from_file_name("foo_1.0_mini-buildd-buildrequest_amd64.changes"),
            ChangesKind::BuildRequest
        );
        assert_eq!(
            ChangesKind::from_file_name("foo_1.0_mini-buildd-buildresult_i386.changes"),
            ChangesKind::BuildResult
        );
        assert_eq!(
            ChangesKind::from_file_name("foo_1.0_source.changes"),
            ChangesKind::UserUpload
        );
    }

    #[test]
    fn test_gen_file_name_strips_epoch() {
        assert_eq!(
            gen_file_name("foo", "2:1.0-1", "amd64", ChangesKind::BuildRequest),
            "foo_1.0-1_mini-buildd-buildrequest_amd64.changes"
        );
        assert_eq!(
            gen_file_name("foo", "1.0-1", "i386", ChangesKind::UserUpload),
            "foo_1.0-1_i386.changes"
        );
    }

    #[test]
    fn test_parse_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo_1.0~myid70+1_source.changes");
        fs::write(&path, UPLOAD).unwrap();

        let changes = Changes::parse(&path).unwrap();
        assert_eq!(changes.kind(), ChangesKind::UserUpload);
        assert_eq!(changes.pkg_id().unwrap(), "foo_1.0~myid70+1");
        assert_eq!(changes.files().len(), 1);
        assert_eq!(changes.files()[0].name, "foo_1.0~myid70+1.dsc");
        assert_eq!(changes.get("Changes").unwrap().lines().count(), 4);
        assert_eq!(changes.sha1().unwrap(), sha1_of_file(&path).unwrap());
        assert_eq!(
            changes.spool_dir(Path::new("/spool")).unwrap(),
            Path::new("/spool").join(changes.sha1().unwrap())
        );
    }

    #[test]
    fn test_parse_signed() {
        let signed = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{}\n-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n",
            UPLOAD
        );
        let control = Control::parse(&signed).unwrap();
        assert_eq!(control.get("source"), Some("foo"));
        assert_eq!(control.get("Hash"), None);
    }

    #[test]
    fn test_control_errors() {
        assert_eq!(
            Control::parse(" orphan").unwrap_err(),
            ControlError::OrphanContinuation { line: 1 }
        );
        assert!(matches!(
            Control::parse("no colon here").unwrap_err(),
            ControlError::NotAField { line: 1, .. }
        ));
    }

    #[test]
    fn test_files_must_stay_beside_the_control_file() {
        let home = tempfile::tempdir().unwrap();
        let incoming = home.path().join("incoming");
        fs::create_dir_all(&incoming).unwrap();
        let status = home.path().join("status.json");
        fs::write(&status, "{}").unwrap();

        for name in ["../status.json", "/etc/passwd", "..", "sub/foo.dsc"] {
            let path = incoming.join("evil_1.0_source.changes");
            fs::write(
                &path,
                format!(
                    "Source: evil\nVersion: 1.0\nFiles:\n d41d8cd98f00b204e9800998ecf8427e 0 devel optional {}\n",
                    name
                ),
            )
            .unwrap();

            let err = Changes::parse(&path).unwrap_err();
            assert!(
                err.chain().any(|e| matches!(
                    e.downcast_ref::<ControlError>(),
                    Some(ControlError::BadFilesEntry(_))
                )),
                "{} accepted",
                name
            );
        }
        assert!(status.exists());

        let mut dsc = Control::default();
        dsc.set("Files", "\nd41d8cd98f00b204e9800998ecf8427e 0 ../foo.orig.tar.gz");
        assert!(matches!(
            parse_dsc_files(&dsc).unwrap_err(),
            ControlError::BadFilesEntry(_)
        ));
    }

    #[tokio::test]
    async fn test_save_and_parse_again() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("foo.buildlog");
        fs::write(&log, "Status: successful\n").unwrap();

        let path = dir.path().join("foo_1.0_mini-buildd-buildresult_amd64.changes");
        let mut bres = Changes::new(&path);
        assert!(bres.is_new());
        bres.set("Distribution", "wheezy-myid-unstable");
        bres.set("Source", "foo");
        bres.set("Version", "1.0");
        bres.set("Architecture", "amd64");
        bres.set("Description", "first\nsecond\n\nfourth");
        bres.add_file(&log).unwrap();
        bres.add_file(&log).unwrap();
        bres.save(None).await.unwrap();

        let parsed = Changes::parse(&path).unwrap();
        assert_eq!(parsed.control(), bres.control());
        assert_eq!(parsed.files(), bres.files());
        assert_eq!(parsed.files().len(), 1);
        assert_eq!(parsed.files()[0].section, "mini-buildd");
        assert_eq!(parsed.files()[0].priority, "extra");
        assert_eq!(parsed.files()[0].size, 19);
        assert_eq!(parsed.kind(), ChangesKind::BuildResult);
        assert_eq!(parsed.sha1(), bres.sha1());
    }

    #[tokio::test]
    async fn test_pack_unpack_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dsc = dir.path().join("foo_1.0.dsc");
        fs::write(&dsc, "Source: foo\n").unwrap();
        let extra = dir.path().join("apt_keys");
        fs::write(&extra, "").unwrap();

        let mut changes = Changes::new(&dir.path().join("foo_1.0_source.changes"));
        changes.set("Distribution", "wheezy-myid-unstable");
        changes.set("Source", "foo");
        changes.set("Version", "1.0");
        changes.set("Architecture", "source");
        changes.add_file(&dsc).unwrap();
        changes.save(None).await.unwrap();

        let tar_path = changes.tar_path();
        changes.pack(&tar_path, &[extra.clone()]).unwrap();
        let first = fs::read(&tar_path).unwrap();
        changes.pack(&tar_path, &[extra]).unwrap();
        assert_eq!(first, fs::read(&tar_path).unwrap());

        let out = dir.path().join("out");
        changes.unpack(&out).unwrap();
        assert!(out.join("foo_1.0_source.changes").exists());
        assert!(out.join("foo_1.0.dsc").exists());
        assert!(out.join("apt_keys").exists());

        let marker = dir.path().join("foo_1.0_source.upload");
        fs::write(&marker, "build.example.org:8067").unwrap();

        let log_root = dir.path().join("log");
        let archived = changes.archive(&log_root).unwrap();
        assert!(!marker.exists());
        assert_eq!(
            archived,
            log_root.join("wheezy-myid-unstable/foo/1.0/source")
        );
        assert!(archived.join("foo_1.0.dsc").exists());
        assert!(archived.join("foo_1.0_source.changes").exists());
        assert!(!dsc.exists());
    }

    #[tokio::test]
    async fn test_remove_clears_marker_and_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let dsc = dir.path().join("foo_1.0.dsc");
        fs::write(&dsc, "Source: foo\n").unwrap();

        let mut changes = Changes::new(&dir.path().join("foo_1.0_source.changes"));
        changes.set("Source", "foo");
        changes.set("Version", "1.0");
        changes.add_file(&dsc).unwrap();
        changes.save(None).await.unwrap();
        fs::remove_file(&dsc).unwrap();
        let marker = dir.path().join("foo_1.0_source.upload");
        fs::write(&marker, "build.example.org:8067").unwrap();

        changes.remove().unwrap();
        assert!(!marker.exists());
        assert!(!changes.path().exists());
        assert!(changes.remove().is_err());
    }

    #[test]
    fn test_unpack_without_tar_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let changes = Changes::new(&dir.path().join("foo_1.0_source.changes"));
        changes.unpack(&dir.path().join("out")).unwrap();
    }
}
