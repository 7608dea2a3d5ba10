/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::BTreeMap;
use std::fmt;

use super::consts::*;

pub fn port_in_range(s: &str) -> Result<u16, String> {
    let port: usize = s
        .parse()
        .map_err(|_| format!("`{s}` is not a port number"))?;

    if PORT_RANGE.contains(&port) {
        Ok(port as u16)
    } else {
        Err(format!(
            "port not in range {}-{}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ))
    }
}

pub fn greater_than_zero<
    T: std::str::FromStr + std::cmp::PartialOrd + std::fmt::Display + Default,
>(
    s: &str,
) -> Result<T, String> {
    let num: T = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid number", s))?;

    if num > T::default() {
        Ok(num)
    } else {
        Err(format!("`{}` is not larger than 0", s))
    }
}

/// A `host:port` pair as used for FTP endpoints and `Upload-Result-To`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoPo {
    pub host: String,
    pub port: u16,
}

impl HoPo {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("`{}` is not of the form host:port", s))?;

        if host.is_empty() {
            return Err(format!("`{}` has an empty host", s));
        }

        Ok(Self {
            host: host.to_string(),
            port: port_in_range(port)?,
        })
    }
}

impl fmt::Display for HoPo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub fn hopo_parser(s: &str) -> Result<HoPo, String> {
    HoPo::parse(s)
}

/// Replace every `%KEY%` with its value.
pub fn subst_placeholders(template: &str, placeholders: &BTreeMap<&str, &str>) -> String {
    placeholders
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("%{}%", key), value)
        })
}

/// Debian versions carry an optional `epoch:` prefix that never appears in
/// file names.
pub fn strip_epoch(version: &str) -> &str {
    match version.split_once(':') {
        Some((epoch, rest)) if !epoch.is_empty() && epoch.chars().all(|c| c.is_ascii_digit()) => {
            rest
        }
        _ => version,
    }
}

pub fn fromdos(text: &str) -> String {
    text.replace("\r\n", "\n")
}
