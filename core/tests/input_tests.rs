/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tests for input validation and parsing functions

use aptforge_core::input::*;
use std::collections::BTreeMap;

#[test]
fn test_port_in_range() {
    assert_eq!(port_in_range("8067").unwrap(), 8067);
    assert_eq!(port_in_range("1").unwrap(), 1);
    assert_eq!(port_in_range("65535").unwrap(), 65535);

    assert_eq!(
        port_in_range("0").unwrap_err(),
        "port not in range 1-65535"
    );
    assert_eq!(
        port_in_range("65536").unwrap_err(),
        "port not in range 1-65535"
    );
    assert_eq!(
        port_in_range("ftp").unwrap_err(),
        "`ftp` is not a port number"
    );
}

#[test]
fn test_greater_than_zero() {
    assert_eq!(greater_than_zero::<usize>("4").unwrap(), 4);
    assert_eq!(greater_than_zero::<i64>("3").unwrap(), 3);

    assert_eq!(
        greater_than_zero::<usize>("0").unwrap_err(),
        "`0` is not larger than 0"
    );
    assert_eq!(
        greater_than_zero::<i64>("-1").unwrap_err(),
        "`-1` is not larger than 0"
    );
    assert_eq!(
        greater_than_zero::<u64>("many").unwrap_err(),
        "`many` is not a valid number"
    );
}

#[test]
fn test_hopo_parse() {
    let hopo = HoPo::parse("build.example.org:8067").unwrap();
    assert_eq!(hopo.host, "build.example.org");
    assert_eq!(hopo.port, 8067);
    assert_eq!(hopo.to_string(), "build.example.org:8067");

    let hopo = hopo_parser("::1:8067").unwrap();
    assert_eq!(hopo.host, "::1");

    assert!(HoPo::parse("build.example.org").is_err());
    assert!(HoPo::parse(":8067").is_err());
    assert!(HoPo::parse("build.example.org:0").is_err());
}

#[test]
fn test_subst_placeholders() {
    let map = BTreeMap::from([("IDENTITY", "myid"), ("CODEVERSION", "70")]);
    assert_eq!(
        subst_placeholders("~%IDENTITY%%CODEVERSION%+1", &map),
        "~myid70+1"
    );
    assert_eq!(subst_placeholders("%UNKNOWN%", &map), "%UNKNOWN%");
}

#[test]
fn test_strip_epoch() {
    assert_eq!(strip_epoch("1:2.0-1"), "2.0-1");
    assert_eq!(strip_epoch("2.0-1"), "2.0-1");
    assert_eq!(strip_epoch(":2.0"), ":2.0");
    assert_eq!(strip_epoch("a:2.0"), "a:2.0");
}

#[test]
fn test_fromdos() {
    assert_eq!(fromdos("echo a\r\necho b\r\n"), "echo a\necho b\n");
    assert_eq!(fromdos("plain\n"), "plain\n");
}
