/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod chroot;
pub mod remote;
pub mod repository;
pub mod source;
pub mod status;
