/*
 * SPDX-FileCopyrightText: 2026 Wavelens GmbH <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tests for chroot and source entities

use entity::chroot::*;
use entity::source::Source;

fn chroot(json: &str) -> Chroot {
    serde_json::from_str(json).unwrap()
}

#[test]
fn test_chroot_names() {
    let chroot = chroot(
        r#"{
            "source": {"origin": "Debian", "codename": "wheezy"},
            "architecture": "i386",
            "backend": {"type": "file_backed"}
        }"#,
    );

    assert_eq!(chroot.codename(), "wheezy");
    assert_eq!(chroot.name(), "aptforge-wheezy-i386");
    assert_eq!(chroot.status_id(), "chroot:wheezy:i386");
    assert_eq!(chroot.personality(), "linux32");
    assert_eq!(
        chroot.backend,
        ChrootBackend::FileBacked {
            compression: Compression::Xz
        }
    );
}

#[test]
fn test_chroot_personality_override() {
    let chroot = chroot(
        r#"{
            "source": {"origin": "Debian", "codename": "wheezy"},
            "architecture": "amd64",
            "backend": {"type": "lvm_snapshot", "volume_group": "vg0"},
            "personality_override": "linux64"
        }"#,
    );

    assert_eq!(chroot.personality(), "linux64");
    assert_eq!(
        chroot.backend,
        ChrootBackend::LvmSnapshot {
            volume_group: "vg0".to_string(),
            filesystem: "ext2".to_string(),
            snapshot_size: 4,
        }
    );
}

#[test]
fn test_source_ids() {
    let source: Source =
        serde_json::from_str(r#"{"origin": "Debian", "codename": "wheezy"}"#).unwrap();
    assert_eq!(source.status_id(), "source:Debian:wheezy");
    assert_eq!(source.source_ref().codename, "wheezy");
    assert!(source.release.is_none());
}
