/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Minimal anonymous FTP client: passive-mode `STOR` into `/incoming`.

use crate::input::HoPo;
use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

const FTP_TIMEOUT: Duration = Duration::from_secs(600);

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl ControlConnection {
    async fn connect(hopo: &HoPo) -> Result<Self> {
        let stream = TcpStream::connect((hopo.host.as_str(), hopo.port))
            .await
            .with_context(|| format!("Failed to connect to {}", hopo))?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let mut connection = Self {
            reader: BufReader::new(read),
            writer: write,
            peer,
        };
        connection.expect(&[220]).await?;
        Ok(connection)
    }

    async fn read_reply(&mut self) -> Result<(u16, String)> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("FTP connection closed");
        }
        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| anyhow!("Malformed FTP reply: {}", line.trim_end()))?;

        let mut text = line.get(4..).unwrap_or_default().trim_end().to_string();
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let mut next = String::new();
                if self.reader.read_line(&mut next).await? == 0 {
                    bail!("FTP connection closed in multi-line reply");
                }
                text.push('\n');
                text.push_str(next.trim_end());
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }

        debug!(code, reply = %text, "FTP reply");
        Ok((code, text))
    }

    async fn expect(&mut self, codes: &[u16]) -> Result<(u16, String)> {
        let (code, text) = self.read_reply().await?;
        if !codes.contains(&code) {
            bail!("Unexpected FTP reply {}: {}", code, text);
        }
        Ok((code, text))
    }

    async fn command(&mut self, command: &str, codes: &[u16]) -> Result<(u16, String)> {
        debug!(command = %command, "FTP command");
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await?;
        self.expect(codes).await
    }

    async fn passive(&mut self) -> Result<SocketAddr> {
        let (_, text) = self.command("PASV", &[227]).await?;
        let port = parse_pasv_port(&text)?;
        Ok(SocketAddr::new(self.peer.ip(), port))
    }
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply. The
/// host part is ignored in favour of the control connection's peer.
pub fn parse_pasv_port(text: &str) -> Result<u16> {
    let start = text.find('(').ok_or_else(|| anyhow!("Malformed PASV reply: {}", text))?;
    let end = text[start..]
        .find(')')
        .map(|e| start + e)
        .ok_or_else(|| anyhow!("Malformed PASV reply: {}", text))?;
    let numbers: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow!("Malformed PASV reply: {}", text))?;

    if numbers.len() != 6 || numbers[4] > 255 || numbers[5] > 255 {
        bail!("Malformed PASV reply: {}", text);
    }
    Ok(numbers[4] * 256 + numbers[5])
}

async fn upload_inner(hopo: &HoPo, dir: &Path, names: &[String]) -> Result<()> {
    let mut control = ControlConnection::connect(hopo).await?;

    let (code, _) = control.command("USER anonymous", &[230, 331]).await?;
    if code == 331 {
        control.command("PASS aptforge@", &[230]).await?;
    }
    control.command("TYPE I", &[200]).await?;
    control.command("CWD /incoming", &[250]).await?;

    for name in names {
        let data = tokio::fs::read(dir.join(name))
            .await
            .with_context(|| format!("Failed to read {}", dir.join(name).display()))?;

        let addr = control.passive().await?;
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to open FTP data connection to {}", addr))?;
        control.command(&format!("STOR {}", name), &[125, 150]).await?;
        stream.write_all(&data).await?;
        stream.shutdown().await?;
        drop(stream);
        control.expect(&[226, 250]).await?;
        debug!(file = %name, target = %hopo, "FTP upload done");
    }

    if let Err(e) = control.command("QUIT", &[221]).await {
        debug!(target = %hopo, error = %e, "FTP QUIT not acknowledged");
    }
    Ok(())
}

/// Upload `names` (relative to `dir`) in order to `hopo:/incoming`.
pub async fn upload(hopo: &HoPo, dir: &Path, names: &[String]) -> Result<()> {
    tokio::time::timeout(FTP_TIMEOUT, upload_inner(hopo, dir, names))
        .await
        .map_err(|_| anyhow!("FTP upload to {} timed out", hopo))?
}
