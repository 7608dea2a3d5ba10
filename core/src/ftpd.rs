/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Anonymous FTP server for the daemon home. Only `/incoming` is
//! writable; every arriving `.changes` file becomes an ingest event.

use crate::changes::{Changes, ChangesKind};
use crate::input::HoPo;
use crate::types::IngestEvent;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INCOMING: &str = "/incoming";
const DATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Normalize `arg` relative to the virtual directory `cwd`. `..` never
/// leaves `/`.
pub fn resolve_virtual(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{}/{}", cwd, arg)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// A file `STOR` may create: directly inside `/incoming`.
pub fn incoming_file_name(virtual_path: &str) -> Option<&str> {
    let name = virtual_path.strip_prefix(INCOMING)?.strip_prefix('/')?;
    (!name.is_empty() && !name.contains('/')).then_some(name)
}

pub struct Ftpd {
    listener: TcpListener,
    home: PathBuf,
    queue: mpsc::Sender<IngestEvent>,
    arrivals: mpsc::UnboundedSender<PathBuf>,
    arrived: mpsc::UnboundedReceiver<PathBuf>,
}

impl Ftpd {
    pub async fn bind(hopo: &HoPo, home: &Path, queue: mpsc::Sender<IngestEvent>) -> Result<Self> {
        let listener = TcpListener::bind((hopo.host.as_str(), hopo.port))
            .await
            .with_context(|| format!("Failed to bind ftpd to {}", hopo))?;
        let (arrivals, arrived) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            home: home.to_path_buf(),
            queue,
            arrivals,
            arrived,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn incoming(&self) -> PathBuf {
        self.home.join("incoming")
    }

    /// Drop leftovers, then feed every `.changes` already in incoming back
    /// into the queue (user uploads first). Returns the number re-queued.
    pub fn recover(&self) -> Result<usize> {
        let incoming = self.incoming();
        std::fs::create_dir_all(&incoming)?;
        remove_cruft(&incoming)?;
        let pending = pending_changes(&incoming)?;
        for path in &pending {
            info!(changes = %path.display(), "Re-queuing incoming changes");
            self.arrivals
                .send(path.clone())
                .context("ftpd arrival queue closed")?;
        }
        Ok(pending.len())
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.recover()?;
        info!(addr = %self.local_addr()?, "ftpd listening");

        let Self {
            listener,
            home,
            queue,
            arrivals,
            arrived,
        } = self;
        let forwarder = tokio::spawn(forward(arrived, queue, cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ftpd shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session::new(stream, home.clone(), arrivals.clone());
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = session.run() => {
                                    if let Err(e) = result {
                                        debug!(peer = %peer, error = %e, "FTP session ended with error");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "ftpd accept failed"),
                },
            }
        }

        if let Err(e) = forwarder.await {
            warn!(error = %e, "ftpd forwarder failed");
        }
        Ok(())
    }
}

/// Hand arrived `.changes` files to the ingest queue. Sessions never wait
/// on the queue; a full queue only holds up this task. Whatever is pending
/// at shutdown stays in incoming for the next `recover`.
async fn forward(
    mut arrived: mpsc::UnboundedReceiver<PathBuf>,
    queue: mpsc::Sender<IngestEvent>,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = arrived.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = queue.send(IngestEvent::Changes(path)) => {
                if sent.is_err() {
                    error!("Ingest queue closed, dropping changes");
                    break;
                }
            }
        }
    }
}

/// Remove files in `incoming` that are neither a `.changes` nor listed by
/// one.
pub fn remove_cruft(incoming: &Path) -> Result<()> {
    let mut referenced = BTreeSet::new();
    let mut all = Vec::new();
    for entry in std::fs::read_dir(incoming)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.ends_with(".changes") {
            referenced.insert(name.clone());
            match Changes::parse(&path) {
                Ok(changes) => {
                    referenced.extend(changes.files().iter().map(|f| f.name.clone()));
                }
                Err(e) => warn!(changes = %path.display(), error = %e, "Unparsable changes in incoming"),
            }
        }
        all.push((name, path));
    }

    for (name, path) in all {
        if !referenced.contains(&name) {
            info!(file = %path.display(), "Removing cruft from incoming");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Failed to remove cruft");
            }
        }
    }
    Ok(())
}

/// Every `.changes` in `incoming`, user uploads before requests and results.
pub fn pending_changes(incoming: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(incoming)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "changes"))
        .collect();
    found.sort_by_key(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        (ChangesKind::from_file_name(&name) != ChangesKind::UserUpload, name)
    });
    Ok(found)
}

struct Session {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
    local_ip: IpAddr,
    home: PathBuf,
    cwd: String,
    passive: Option<TcpListener>,
    arrivals: mpsc::UnboundedSender<PathBuf>,
}

impl Session {
    fn new(stream: TcpStream, home: PathBuf, arrivals: mpsc::UnboundedSender<PathBuf>) -> Self {
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
            local_ip,
            home,
            cwd: "/".to_string(),
            passive: None,
            arrivals,
        }
    }

    async fn reply(&mut self, code: u16, text: &str) -> Result<()> {
        self.writer
            .write_all(format!("{} {}\r\n", code, text).as_bytes())
            .await?;
        Ok(())
    }

    fn real_path(&self, virtual_path: &str) -> PathBuf {
        self.home.join(virtual_path.trim_start_matches('/'))
    }

    async fn run(mut self) -> Result<()> {
        self.reply(220, "aptforge ftpd ready").await?;

        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            let (command, arg) = match line.split_once(' ') {
                Some((c, a)) => (c.to_ascii_uppercase(), a.trim().to_string()),
                None => (line.to_ascii_uppercase(), String::new()),
            };
            debug!(command = %command, arg = %arg, "FTP command");

            match command.as_str() {
                "USER" => self.reply(331, "Anonymous login ok, send any password").await?,
                "PASS" => self.reply(230, "Login successful").await?,
                "SYST" => self.reply(215, "UNIX Type: L8").await?,
                "FEAT" => {
                    self.writer
                        .write_all(b"211-Features:\r\n EPSV\r\n PASV\r\n211 End\r\n")
                        .await?
                }
                "PWD" | "XPWD" => {
                    let text = format!("\"{}\" is the current directory", self.cwd);
                    self.reply(257, &text).await?
                }
                "CWD" => self.change_dir(&arg).await?,
                "CDUP" => self.change_dir("..").await?,
                "TYPE" => self.reply(200, "Type set").await?,
                "MODE" if arg.eq_ignore_ascii_case("S") => self.reply(200, "Mode set to S").await?,
                "STRU" if arg.eq_ignore_ascii_case("F") => self.reply(200, "Structure set to F").await?,
                "MODE" | "STRU" => self.reply(504, "Unsupported parameter").await?,
                "PASV" => self.enter_passive(false).await?,
                "EPSV" => self.enter_passive(true).await?,
                "STOR" => self.store(&arg).await?,
                "NLST" | "LIST" => self.list(&arg, command == "LIST").await?,
                "NOOP" => self.reply(200, "OK").await?,
                "QUIT" => {
                    self.reply(221, "Goodbye").await?;
                    return Ok(());
                }
                "RETR" | "DELE" | "RMD" | "MKD" | "RNFR" | "RNTO" | "APPE" => {
                    self.reply(550, "Permission denied").await?
                }
                _ => self.reply(502, "Command not implemented").await?,
            }
        }
    }

    async fn change_dir(&mut self, arg: &str) -> Result<()> {
        let target = resolve_virtual(&self.cwd, arg);
        if self.real_path(&target).is_dir() {
            self.cwd = target;
            self.reply(250, "Directory changed").await
        } else {
            self.reply(550, "No such directory").await
        }
    }

    async fn enter_passive(&mut self, extended: bool) -> Result<()> {
        let listener = TcpListener::bind((self.local_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        self.passive = Some(listener);

        if extended {
            let text = format!("Entering Extended Passive Mode (|||{}|)", port);
            return self.reply(229, &text).await;
        }
        let octets = match self.local_ip {
            IpAddr::V4(ip) => ip.octets(),
            IpAddr::V6(_) => [127, 0, 0, 1],
        };
        let text = format!(
            "Entering Passive Mode ({},{},{},{},{},{})",
            octets[0],
            octets[1],
            octets[2],
            octets[3],
            port / 256,
            port % 256
        );
        self.reply(227, &text).await
    }

    async fn data_connection(&mut self) -> Result<Option<TcpStream>> {
        let Some(listener) = self.passive.take() else {
            self.reply(425, "Use PASV or EPSV first").await?;
            return Ok(None);
        };
        match tokio::time::timeout(DATA_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(Some(stream)),
            _ => {
                self.reply(425, "Can't open data connection").await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(cwd = %self.cwd))]
    async fn store(&mut self, arg: &str) -> Result<()> {
        let target = resolve_virtual(&self.cwd, arg);
        let Some(name) = incoming_file_name(&target).map(str::to_string) else {
            warn!(path = %target, "Rejected upload outside incoming");
            self.passive = None;
            return self.reply(553, "Uploads only allowed to /incoming").await;
        };

        let path = self.real_path(INCOMING).join(&name);
        if path.exists() {
            self.passive = None;
            return self.reply(553, "File exists").await;
        }

        let Some(mut stream) = self.data_connection().await? else {
            return Ok(());
        };
        self.reply(150, "Ok to send data").await?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to create upload");
                return self.reply(553, "Could not create file").await;
            }
        };

        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o440)).await?;
        }
        info!(file = %path.display(), "Upload complete");
        self.reply(226, "Transfer complete").await?;

        if name.ends_with(".changes") {
            if self.arrivals.send(path).is_err() {
                error!("ftpd arrival queue closed, dropping changes");
            }
        }
        Ok(())
    }

    async fn list(&mut self, arg: &str, long: bool) -> Result<()> {
        let arg = if arg.starts_with('-') { "" } else { arg };
        let dir = self.real_path(&resolve_virtual(&self.cwd, arg));
        let mut names = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if long {
                    let meta = entry.metadata().await.ok();
                    let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
                    let size = meta.map(|m| m.len()).unwrap_or(0);
                    names.push(format!(
                        "{} 1 aptforge aptforge {:>12} Jan  1 00:00 {}",
                        if is_dir { "dr-xr-xr-x" } else { "-r--r--r--" },
                        size,
                        name
                    ));
                } else {
                    names.push(name);
                }
            }
        }
        names.sort();

        let Some(mut stream) = self.data_connection().await? else {
            return Ok(());
        };
        self.reply(150, "Here comes the directory listing").await?;
        for name in names {
            stream.write_all(format!("{}\r\n", name).as_bytes()).await?;
        }
        stream.shutdown().await?;
        self.reply(226, "Directory send OK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_virtual() {
        assert_eq!(resolve_virtual("/", "incoming"), "/incoming");
        assert_eq!(resolve_virtual("/incoming", "../log"), "/log");
        assert_eq!(resolve_virtual("/", "../../etc"), "/etc");
        assert_eq!(resolve_virtual("/log", "/incoming/./a.dsc"), "/incoming/a.dsc");
    }

    #[test]
    fn test_incoming_file_name() {
        assert_eq!(incoming_file_name("/incoming/foo.changes"), Some("foo.changes"));
        assert_eq!(incoming_file_name("/incoming"), None);
        assert_eq!(incoming_file_name("/incomingx/foo"), None);
        assert_eq!(incoming_file_name("/log/foo"), None);
        assert_eq!(incoming_file_name("/incoming/sub/foo"), None);
    }

    #[test]
    fn test_pending_changes_order() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "a_1_mini-buildd-buildresult_amd64.changes",
            "b_1_source.changes",
            "c_1_mini-buildd-buildrequest_i386.changes",
            "d_1.dsc",
        ] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }

        let names: Vec<String> = pending_changes(tmp.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "b_1_source.changes",
                "a_1_mini-buildd-buildresult_amd64.changes",
                "c_1_mini-buildd-buildrequest_i386.changes",
            ]
        );
    }

    #[test]
    fn test_remove_cruft_keeps_referenced_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("foo_1.dsc"), "dsc").unwrap();
        std::fs::write(tmp.path().join("stray.deb"), "deb").unwrap();
        std::fs::write(
            tmp.path().join("foo_1_source.changes"),
            "Source: foo\nVersion: 1\nFiles:\n d41d8cd98f00b204e9800998ecf8427e 3 devel optional foo_1.dsc\n",
        )
        .unwrap();

        remove_cruft(tmp.path()).unwrap();
        assert!(tmp.path().join("foo_1.dsc").exists());
        assert!(tmp.path().join("foo_1_source.changes").exists());
        assert!(!tmp.path().join("stray.deb").exists());
    }

    #[tokio::test]
    async fn test_upload_emits_changes_event() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("incoming")).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let hopo = HoPo {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let ftpd = Ftpd::bind(&hopo, home.path(), tx).await.unwrap();
        let port = ftpd.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(ftpd.run(cancel.clone()));

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("foo_1.dsc"), "dsc").unwrap();
        std::fs::write(src.path().join("foo_1_source.changes"), "Source: foo\n").unwrap();

        let target = HoPo::parse(&format!("127.0.0.1:{}", port)).unwrap();
        crate::ftp::upload(
            &target,
            src.path(),
            &["foo_1.dsc".to_string(), "foo_1_source.changes".to_string()],
        )
        .await
        .unwrap();

        match rx.recv().await {
            Some(IngestEvent::Changes(path)) => {
                assert!(path.ends_with("incoming/foo_1_source.changes"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(home.path().join("incoming/foo_1.dsc").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(home.path().join("incoming/foo_1.dsc"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o440);
        }

        // A second upload of the same file is refused.
        let again = crate::ftp::upload(&target, src.path(), &["foo_1.dsc".to_string()]).await;
        assert!(again.is_err());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_ingest_queue_does_not_stall_uploads() {
        let home = tempfile::tempdir().unwrap();
        let incoming = home.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        for name in ["a_1_source.changes", "b_1_source.changes"] {
            std::fs::write(incoming.join(name), "Source: a\n").unwrap();
        }

        let (tx, mut rx) = mpsc::channel(1);
        let hopo = HoPo {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let ftpd = Ftpd::bind(&hopo, home.path(), tx).await.unwrap();
        let port = ftpd.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(ftpd.run(cancel.clone()));

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("c_1_source.changes"), "Source: c\n").unwrap();
        let target = HoPo::parse(&format!("127.0.0.1:{}", port)).unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            crate::ftp::upload(&target, src.path(), &["c_1_source.changes".to_string()]),
        )
        .await
        .expect("upload stalled on a full ingest queue")
        .unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(IngestEvent::Changes(path)) => {
                    names.push(path.file_name().unwrap().to_string_lossy().to_string());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(
            names,
            vec!["a_1_source.changes", "b_1_source.changes", "c_1_source.changes"]
        );

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
