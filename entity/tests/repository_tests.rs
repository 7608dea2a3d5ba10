/*
 * SPDX-FileCopyrightText: 2026 Wavelens GmbH <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tests for layouts, distributions and repositories

use entity::remote::Remote;
use entity::repository::*;

#[test]
fn test_default_layout() {
    let layout = Layout::default_layout();
    assert_eq!(layout.name, "Default");

    let names: Vec<&str> = layout.suites.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["stable", "testing", "unstable", "snapshot", "experimental"]);

    let unstable = layout.suite("unstable").unwrap();
    assert!(unstable.uploadable);
    assert!(unstable.build_keyring_package);
    assert_eq!(unstable.migrates_to.as_deref(), Some("testing"));
    assert_eq!(unstable.rollback, 9);

    let stable = layout.suite("stable").unwrap();
    assert!(!stable.uploadable);
    assert!(!stable.not_automatic);

    assert!(layout.suite("experimental").unwrap().experimental);
    assert!(layout.suite("sid").is_none());
}

#[test]
fn test_suite_option_defaults() {
    let suite: SuiteOption = serde_json::from_str(r#"{"name": "hotfix"}"#).unwrap();
    assert_eq!(suite, SuiteOption::new("hotfix"));
    assert!(suite.uploadable);
    assert!(suite.not_automatic);
    assert_eq!(suite.rollback, 0);
}

#[test]
fn test_distribution_architectures() {
    let distribution: Distribution = serde_json::from_str(
        r#"{
            "base_source": {"origin": "Debian", "codename": "wheezy"},
            "architectures": [
                {"architecture": "amd64"},
                {"architecture": "i386", "build_architecture_all": true},
                {"architecture": "armel", "optional": true}
            ]
        }"#,
    )
    .unwrap();

    assert_eq!(distribution.codename(), "wheezy");
    assert_eq!(distribution.components, vec!["main"]);
    assert_eq!(distribution.lintian_extra_options, "--info");
    assert_eq!(distribution.mandatory_architectures(), vec!["amd64", "i386"]);
    assert_eq!(distribution.archall_architecture().as_deref(), Some("i386"));
    assert!(distribution.is_mandatory("amd64"));
    assert!(!distribution.is_mandatory("armel"));
    assert!(!distribution.is_mandatory("sparc"));
}

#[test]
fn test_repository_defaults() {
    let repository: Repository =
        serde_json::from_str(r#"{"identity": "myid", "distributions": ["wheezy"]}"#).unwrap();

    assert_eq!(repository.layout, "Default");
    assert_eq!(repository.internal_apt_priority, 500);
    assert!(!repository.allow_unauthenticated_uploads);
    assert_eq!(repository.status_id(), "repository:myid");
}

#[test]
fn test_remote_status_id() {
    let remote: Remote = serde_json::from_str(r#"{"ftp": "peer.example.org:8067"}"#).unwrap();
    assert_eq!(remote.key_file, None);
    assert_eq!(remote.status_id(), "remote:peer.example.org:8067");
}
