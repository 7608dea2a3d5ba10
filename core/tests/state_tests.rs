/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tests for loading and validating the state file

use aptforge_core::state::*;
use std::io::Write;

const STATE: &str = r#"{
    "sources": [
        {"origin": "Debian", "codename": "wheezy", "archives": ["http://old.example.org/debian"]},
        {"origin": "Debian", "codename": "wheezy", "archives": ["http://deb.example.org/debian"]}
    ],
    "distributions": [
        {
            "base_source": {"origin": "Debian", "codename": "wheezy"},
            "architectures": [
                {"architecture": "amd64", "build_architecture_all": true},
                {"architecture": "i386"}
            ]
        }
    ],
    "repositories": [
        {"identity": "myid", "distributions": ["wheezy"], "notify": ["old@example.org"]},
        {"identity": "myid", "distributions": ["wheezy"]}
    ],
    "remotes": [
        {"ftp": "peer.example.org:8067"}
    ]
}"#;

fn write_state(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_state_later_definitions_win() {
    let file = write_state(STATE);
    let config = load_state(file.path().to_str()).unwrap();

    assert_eq!(config.sources.len(), 1);
    assert_eq!(config.sources[0].archives, vec!["http://deb.example.org/debian"]);
    assert_eq!(config.repositories.len(), 1);
    assert!(config.repositories[0].notify.is_empty());
    assert_eq!(config.repositories[0].layout, "Default");
    assert!(config.layout("Default").is_some());
    assert_eq!(config.remotes.len(), 1);

    let distribution = config.distribution("wheezy").unwrap();
    assert_eq!(distribution.components, vec!["main"]);
    assert_eq!(distribution.archall_architecture().as_deref(), Some("amd64"));
}

#[test]
fn test_load_state_without_file() {
    let config = load_state(None).unwrap();
    assert!(config.repositories.is_empty());
    assert!(config.layout("Default").is_some());
}

#[test]
fn test_load_state_rejects_invalid() {
    let file = write_state(
        r#"{
            "repositories": [
                {"identity": "my-id", "layout": "Missing", "distributions": ["sid", "sid"]}
            ]
        }"#,
    );
    assert!(load_state(file.path().to_str()).is_err());

    let config = StateConfiguration::from_file(file.path().to_str().unwrap()).unwrap();
    let validation = config.validate();
    assert!(!validation.is_valid);

    let messages: Vec<String> = validation.errors.iter().map(|e| e.message.clone()).collect();
    assert!(messages.contains(&"Invalid identity 'my-id'".to_string()));
    assert!(messages.contains(&"Unknown layout 'Missing'".to_string()));
    assert!(messages.contains(&"Unknown distribution 'sid'".to_string()));
    assert!(messages.contains(&"Multiple distribution codename 'sid'".to_string()));
    assert!(validation.errors.iter().all(|e| e.field == "repositories.my-id"));
}

#[test]
fn test_load_state_rejects_malformed_json() {
    let file = write_state("{ not json");
    assert!(load_state(file.path().to_str()).is_err());
}

#[test]
fn test_resolve_meta_distribution() {
    let file = write_state(STATE);
    let mut config = load_state(file.path().to_str()).unwrap();
    for layout in &mut config.layouts {
        layout
            .meta_distributions
            .insert("unstable".to_string(), "wheezy-unstable".to_string());
    }

    assert_eq!(
        config.resolve_meta_distribution("unstable").as_deref(),
        Some("wheezy-myid-unstable")
    );
    assert_eq!(config.resolve_meta_distribution("stable"), None);
}

#[test]
fn test_validate_reports_distribution_and_suite_invariants() {
    let file = write_state(
        r#"{
            "sources": [
                {"origin": "Debian", "codename": "wheezy", "archives": ["http://deb.example.org/debian"]}
            ],
            "layouts": [
                {
                    "name": "Broken",
                    "suites": [
                        {"name": "stable", "uploadable": false, "build_keyring_package": true},
                        {"name": "unstable", "migrates_to": "stable"},
                        {"name": "experimental", "experimental": true, "migrates_to": "unstable"}
                    ]
                }
            ],
            "distributions": [
                {
                    "base_source": {"origin": "Debian", "codename": "wheezy"},
                    "components": ["contrib"],
                    "architectures": [
                        {"architecture": "amd64", "optional": true},
                        {"architecture": "i386", "optional": true}
                    ]
                }
            ]
        }"#,
    );
    assert!(load_state(file.path().to_str()).is_err());

    let config = StateConfiguration::from_file(file.path().to_str().unwrap()).unwrap();
    let validation = config.validate();
    assert!(!validation.is_valid);

    let messages = |field: &str| -> Vec<String> {
        validation
            .errors
            .iter()
            .filter(|e| e.field == field)
            .map(|e| e.message.clone())
            .collect()
    };

    let distribution = messages("distributions.wheezy");
    assert!(distribution.contains(&"No architecture builds arch-all packages".to_string()));
    assert!(distribution.contains(&"At least one architecture must be mandatory".to_string()));
    assert!(distribution.contains(&"Component 'main' missing".to_string()));

    let layout = messages("layouts.Broken");
    assert!(layout.contains(&"Suite 'stable' builds keyring packages but is not uploadable".to_string()));
    assert!(layout.contains(&"Experimental suite 'experimental' must not migrate".to_string()));
    assert!(layout.contains(&"Suite 'experimental' migrates to uploadable suite 'unstable'".to_string()));
    assert!(messages("layouts.Default").is_empty());
}
