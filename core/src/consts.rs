/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use regex::Regex;
use std::ops::RangeInclusive;
use std::sync::LazyLock;

pub const PORT_RANGE: RangeInclusive<usize> = 1..=65535;

pub const BUILDREQUEST_INFIX: &str = "_mini-buildd-buildrequest";
pub const BUILDRESULT_INFIX: &str = "_mini-buildd-buildresult";

pub static BUILDREQUEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+_mini-buildd-buildrequest_[^_]+\.changes$").expect("static regex")
});
pub static BUILDRESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+_mini-buildd-buildresult_[^_]+\.changes$").expect("static regex")
});
pub static CHANGES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+\.changes$").expect("static regex"));

/// Buildlog lines of the form `Key: value` become `Sbuild-Key` fields.
pub static SBUILD_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+: [^ ]+$").expect("static regex"));

/// Section and priority written for files attached by the daemon.
pub const CHANGES_FILE_SECTION: &str = "mini-buildd";
pub const CHANGES_FILE_PRIORITY: &str = "extra";

pub const APT_SOURCES_LIST: &str = "apt_sources.list";
pub const APT_PREFERENCES: &str = "apt_preferences";
pub const APT_KEYS: &str = "apt_keys";
pub const CHROOT_SETUP_SCRIPT: &str = "chroot_setup_script";
pub const SBUILDRC_SNIPPET: &str = "sbuildrc_snippet";

pub const SBUILD_RETVAL_INTERNAL_ERROR: i32 = 100;
pub const SBUILD_RETVAL_TIMEOUT: i32 = 124;

pub const SIGNING_KEY_NAME: &str = "aptforge Automatic Signing Key";

/// Environment variables passed through to external commands.
pub const ENV_WHITELIST: [&str; 4] = ["PATH", "LANG", "LC_ALL", "TZ"];

/// Suites used to identify a distribution string part: `[A-Za-z0-9._]+`.
pub static DIST_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._]+$").expect("static regex"));
