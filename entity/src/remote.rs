/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// A peer daemon that may exchange build requests and results with us.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Remote {
    /// `host:port` of the peer's FTP ingest endpoint.
    pub ftp: String,
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Remote {
    pub fn status_id(&self) -> String {
        format!("remote:{}", self.ftp)
    }
}
