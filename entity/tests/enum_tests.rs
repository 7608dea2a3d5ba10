/*
 * SPDX-FileCopyrightText: 2026 Wavelens GmbH <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tests for entity enums

use entity::chroot::Compression;
use entity::repository::{BuildDepResolver, LintianMode};
use entity::status::{Status, StatusRecord};
use std::str::FromStr;

#[test]
fn test_status_from_str() {
    assert_eq!(Status::from_str("unprepared").unwrap(), Status::Unprepared);
    assert_eq!(Status::from_str("prepared").unwrap(), Status::Prepared);
    assert_eq!(Status::from_str("active").unwrap(), Status::Active);
    assert!(Status::from_str("broken").is_err());
    assert_eq!(Status::Active.to_string(), "active");
}

#[test]
fn test_status_record_ordering() {
    let record = StatusRecord::default();
    assert_eq!(record.status, Status::Unprepared);
    assert!(!record.is_prepared());

    let active = StatusRecord::active();
    assert!(active.is_prepared());
    assert!(active.is_active());
    assert!(Status::Prepared < Status::Active);
}

#[test]
fn test_lintian_mode() {
    assert_eq!(LintianMode::default(), LintianMode::FailOnError);
    assert_eq!(
        LintianMode::from_str("fail-on-warning").unwrap(),
        LintianMode::FailOnWarning
    );
    assert!(LintianMode::Disabled < LintianMode::RunOnly);
    assert!(LintianMode::RunOnly < LintianMode::FailOnError);
    assert!(LintianMode::from_str("strict").is_err());

    let mode: LintianMode = serde_json::from_str("\"run-only\"").unwrap();
    assert_eq!(mode, LintianMode::RunOnly);
}

#[test]
fn test_build_dep_resolver() {
    assert_eq!(BuildDepResolver::default(), BuildDepResolver::Apt);
    assert_eq!(
        BuildDepResolver::from_str("aptitude").unwrap(),
        BuildDepResolver::Aptitude
    );
    assert_eq!(BuildDepResolver::Internal.to_string(), "internal");
    assert!(BuildDepResolver::from_str("pbuilder").is_err());
}

#[test]
fn test_compression() {
    assert_eq!(Compression::default(), Compression::Xz);
    assert_eq!(Compression::from_str("gzip").unwrap(), Compression::Gzip);
    assert_eq!(Compression::Gzip.extension(), "tar.gz");
    assert_eq!(Compression::None.tar_option(), None);
    assert_eq!(Compression::Bzip2.tar_option(), Some("--bzip2"));
}
