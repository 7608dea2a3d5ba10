/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::source::SourceRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    #[default]
    Xz,
}

impl Compression {
    pub fn tar_option(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("--gzip"),
            Compression::Bzip2 => Some("--bzip2"),
            Compression::Xz => Some("--xz"),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "tar",
            Compression::Gzip => "tar.gz",
            Compression::Bzip2 => "tar.bz2",
            Compression::Xz => "tar.xz",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            _ => Err(format!("Unknown compression: {}", s)),
        }
    }
}

/// Storage backend of a build chroot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChrootBackend {
    FileBacked {
        #[serde(default)]
        compression: Compression,
    },
    LvmSnapshot {
        volume_group: String,
        #[serde(default = "default_filesystem")]
        filesystem: String,
        /// Snapshot size in GiB.
        #[serde(default = "default_snapshot_size")]
        snapshot_size: u32,
    },
    LvmOnLoopfile {
        #[serde(default = "default_filesystem")]
        filesystem: String,
        #[serde(default = "default_snapshot_size")]
        snapshot_size: u32,
        /// Loop file size in GiB.
        #[serde(default = "default_loop_size")]
        loop_size: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Chroot {
    pub source: SourceRef,
    pub architecture: String,
    pub backend: ChrootBackend,
    #[serde(default)]
    pub personality_override: Option<String>,
    #[serde(default)]
    pub debootstrap_command: Option<String>,
}

impl Chroot {
    pub fn codename(&self) -> &str {
        &self.source.codename
    }

    pub fn name(&self) -> String {
        format!("aptforge-{}-{}", self.source.codename, self.architecture)
    }

    pub fn status_id(&self) -> String {
        format!("chroot:{}:{}", self.source.codename, self.architecture)
    }

    pub fn personality(&self) -> String {
        if let Some(personality) = &self.personality_override {
            return personality.clone();
        }

        match self.architecture.as_str() {
            "i386" => "linux32".to_string(),
            _ => "linux".to_string(),
        }
    }
}

fn default_filesystem() -> String {
    "ext2".to_string()
}

fn default_snapshot_size() -> u32 {
    4
}

fn default_loop_size() -> u32 {
    100
}
