/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle position of a status-bearing record. Ordered: a record that is
/// `Active` is also prepared.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unprepared,
    Prepared,
    Active,
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprepared" => Ok(Status::Unprepared),
            "prepared" => Ok(Status::Prepared),
            "active" => Ok(Status::Active),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unprepared => "unprepared",
            Status::Prepared => "prepared",
            Status::Active => "active",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusRecord {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub auto_reactivate: bool,
    #[serde(default)]
    pub last_checked: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl StatusRecord {
    pub fn active() -> Self {
        Self {
            status: Status::Active,
            ..Default::default()
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.status >= Status::Prepared
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}
