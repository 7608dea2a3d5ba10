/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Distribution strings: `<codename>-<identity>-<suite>[-rollback<N>]`.

use crate::consts::DIST_PART_RE;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DistributionError {
    #[error("Malformed distribution '{0}': expected <codename>-<identity>-<suite>[-rollback<N>]")]
    Malformed(String),
    #[error("Malformed distribution '{dist}': invalid part '{part}'")]
    InvalidPart { dist: String, part: String },
    #[error("Malformed distribution '{dist}': invalid rollback suffix '{suffix}'")]
    InvalidRollback { dist: String, suffix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistributionString {
    pub codename: String,
    pub identity: String,
    pub suite: String,
    pub rollback: Option<u32>,
}

impl DistributionString {
    pub fn new(codename: &str, identity: &str, suite: &str) -> Self {
        Self {
            codename: codename.to_string(),
            identity: identity.to_string(),
            suite: suite.to_string(),
            rollback: None,
        }
    }

    pub fn with_rollback(&self, rollback: u32) -> Self {
        Self {
            rollback: Some(rollback),
            ..self.clone()
        }
    }

    /// The distribution without its rollback suffix.
    pub fn live(&self) -> Self {
        Self {
            rollback: None,
            ..self.clone()
        }
    }
}

impl FromStr for DistributionString {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(DistributionError::Malformed(s.to_string()));
        }

        for part in &parts[..3] {
            if !DIST_PART_RE.is_match(part) {
                return Err(DistributionError::InvalidPart {
                    dist: s.to_string(),
                    part: part.to_string(),
                });
            }
        }

        let rollback = match parts.get(3) {
            None => None,
            Some(suffix) => {
                let number = suffix
                    .strip_prefix("rollback")
                    .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| DistributionError::InvalidRollback {
                        dist: s.to_string(),
                        suffix: suffix.to_string(),
                    })?;
                Some(number)
            }
        };

        Ok(Self {
            codename: parts[0].to_string(),
            identity: parts[1].to_string(),
            suite: parts[2].to_string(),
            rollback,
        })
    }
}

impl fmt::Display for DistributionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.codename, self.identity, self.suite)?;
        if let Some(rollback) = self.rollback {
            write!(f, "-rollback{}", rollback)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_live() {
        let dist: DistributionString = "wheezy-myid-unstable".parse().unwrap();
        assert_eq!(dist, DistributionString::new("wheezy", "myid", "unstable"));
        assert_eq!(dist.to_string(), "wheezy-myid-unstable");
    }

    #[test]
    fn test_parse_rollback() {
        let dist: DistributionString = "wheezy-myid-unstable-rollback3".parse().unwrap();
        assert_eq!(dist.rollback, Some(3));
        assert_eq!(dist.live().to_string(), "wheezy-myid-unstable");
        assert_eq!(dist.to_string(), "wheezy-myid-unstable-rollback3");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "wheezy-unstable".parse::<DistributionString>(),
            Err(DistributionError::Malformed(_))
        ));
        assert!(matches!(
            "wheezy-my id-unstable".parse::<DistributionString>(),
            Err(DistributionError::InvalidPart { .. })
        ));
        assert!(matches!(
            "wheezy-myid-unstable-rollbackx".parse::<DistributionString>(),
            Err(DistributionError::InvalidRollback { .. })
        ));
        assert!("a-b-c-d-e".parse::<DistributionString>().is_err());
    }
}
