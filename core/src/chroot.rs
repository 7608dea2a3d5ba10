/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Build chroots for schroot/sbuild. Every backend shares one transactional
//! setup sequence: make a tmp dir, backend pre steps, debootstrap, backend
//! post steps, install the schroot config.

use crate::executer::{argv, call, call_sequence, CallOptions, SequenceStep};
use crate::gnupg::GnuPg;
use crate::status::Lifecycle;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use entity::chroot::{Chroot, ChrootBackend};
use entity::source::Source;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const SYSTEM_SCHROOT_DIR: &str = "/etc/schroot/chroot.d";

pub struct ChrootLifecycle {
    pub chroot: Chroot,
    pub source: Source,
    /// `<home>/chroots/<codename>/<arch>`
    pub dir: PathBuf,
    pub binpath_debootstrap: String,
    pub binpath_schroot: String,
    pub binpath_gpg: String,
}

impl ChrootLifecycle {
    fn path(&self, name: &str) -> String {
        self.dir.join(name).display().to_string()
    }

    pub fn tmp_dir(&self) -> String {
        self.path("tmp")
    }

    pub fn libdir(&self) -> PathBuf {
        self.dir.join("libdir")
    }

    pub fn keyring_file(&self) -> String {
        self.path("keyring.gpg")
    }

    pub fn schroot_conf_file(&self) -> String {
        self.path("schroot.conf")
    }

    pub fn system_schroot_conf_file(&self) -> String {
        format!("{}/{}.conf", SYSTEM_SCHROOT_DIR, self.chroot.name())
    }

    pub fn tar_file(&self) -> Option<String> {
        match &self.chroot.backend {
            ChrootBackend::FileBacked { compression } => {
                Some(self.path(&format!("source.{}", compression.extension())))
            }
            _ => None,
        }
    }

    pub fn volume_group(&self) -> Option<String> {
        match &self.chroot.backend {
            ChrootBackend::FileBacked { .. } => None,
            ChrootBackend::LvmSnapshot { volume_group, .. } => Some(volume_group.clone()),
            ChrootBackend::LvmOnLoopfile { .. } => Some(format!(
                "aptforge-loop-{}-{}",
                self.chroot.codename(),
                self.chroot.architecture
            )),
        }
    }

    pub fn lvm_device(&self) -> Option<String> {
        self.volume_group()
            .map(|vg| format!("/dev/{}/{}", vg, self.chroot.name()))
    }

    pub fn backing_file(&self) -> String {
        self.path("lvmloop.image")
    }

    fn lvm_options(&self) -> Option<(&str, u32)> {
        match &self.chroot.backend {
            ChrootBackend::LvmSnapshot {
                filesystem,
                snapshot_size,
                ..
            }
            | ChrootBackend::LvmOnLoopfile {
                filesystem,
                snapshot_size,
                ..
            } => Some((filesystem.as_str(), *snapshot_size)),
            ChrootBackend::FileBacked { .. } => None,
        }
    }

    pub fn schroot_conf(&self) -> String {
        let name = self.chroot.name();
        let backend = match (&self.chroot.backend, self.lvm_options(), self.lvm_device()) {
            (ChrootBackend::FileBacked { .. }, _, _) => format!(
                "type=file\nfile={}\n",
                self.tar_file().unwrap_or_default()
            ),
            (_, Some((filesystem, snapshot_size)), Some(device)) => format!(
                "type=lvm-snapshot\ndevice={}\nmount-options=-t {} -o noatime,user_xattr\nlvm-snapshot-options=--size {}G\n",
                device, filesystem, snapshot_size
            ),
            _ => String::new(),
        };

        format!(
            "[{name}]\ndescription=aptforge chroot {name}\ngroups=sbuild\nroot-groups=sbuild\npersonality={personality}\n\n{backend}",
            name = name,
            personality = self.chroot.personality(),
            backend = backend
        )
    }

    fn pre_sequence(&self, loop_device: Option<&str>) -> Vec<SequenceStep> {
        let mut steps = Vec::new();
        let tmp = self.tmp_dir();

        if let (ChrootBackend::LvmOnLoopfile { loop_size, .. }, Some(loop_device), Some(vg)) =
            (&self.chroot.backend, loop_device, self.volume_group())
        {
            let backing = self.backing_file();
            steps.push(SequenceStep::new(
                argv(&[
                    "dd",
                    "if=/dev/zero",
                    &format!("of={}", backing),
                    &format!("bs={}M", loop_size),
                    "seek=1024",
                    "count=0",
                ]),
                argv(&["rm", "--verbose", &backing]),
            ));
            steps.push(SequenceStep::new(
                argv(&["losetup", "--verbose", loop_device, &backing]),
                argv(&["losetup", "--verbose", "--detach", loop_device]),
            ));
            steps.push(SequenceStep::new(
                argv(&["pvcreate", "--verbose", loop_device]),
                argv(&["pvremove", "--verbose", loop_device]),
            ));
            steps.push(SequenceStep::new(
                argv(&["vgcreate", "--verbose", &vg, loop_device]),
                argv(&["vgremove", "--verbose", "--force", &vg]),
            ));
        }

        if let (Some((filesystem, snapshot_size)), Some(device), Some(vg)) =
            (self.lvm_options(), self.lvm_device(), self.volume_group())
        {
            steps.push(SequenceStep::new(
                argv(&[
                    "lvcreate",
                    &format!("--size={}G", snapshot_size),
                    &format!("--name={}", self.chroot.name()),
                    &vg,
                ]),
                argv(&["lvremove", "--verbose", "--force", &device]),
            ));
            steps.push(SequenceStep::run_only(argv(&[
                "mkfs",
                &format!("-t{}", filesystem),
                &device,
            ])));
            steps.push(SequenceStep::new(
                argv(&["mount", "-v", &format!("-t{}", filesystem), &device, &tmp]),
                argv(&["umount", "-v", &tmp]),
            ));
        }
        steps
    }

    fn post_sequence(&self) -> Vec<SequenceStep> {
        let tmp = self.tmp_dir();
        match &self.chroot.backend {
            ChrootBackend::FileBacked { compression } => {
                let mut create = argv(&[
                    "tar",
                    "--create",
                    &format!("--directory={}", tmp),
                    &format!("--file={}", self.tar_file().unwrap_or_default()),
                ]);
                if let Some(option) = compression.tar_option() {
                    create.push(option.to_string());
                }
                create.push(".".to_string());
                vec![
                    SequenceStep::run_only(create),
                    SequenceStep::run_only(argv(&[
                        "rm",
                        "--recursive",
                        "--one-file-system",
                        "--force",
                        &tmp,
                    ])),
                ]
            }
            _ => vec![SequenceStep::run_only(argv(&["umount", "-v", &tmp]))],
        }
    }

    /// The complete setup transaction.
    pub fn sequence(&self, loop_device: Option<&str>) -> Result<Vec<SequenceStep>> {
        let tmp = self.tmp_dir();
        let archive = self
            .source
            .mirror()
            .ok_or_else(|| anyhow!("Source {} has no archive", self.source.status_id()))?;
        let debootstrap = self
            .chroot
            .debootstrap_command
            .clone()
            .unwrap_or_else(|| self.binpath_debootstrap.clone());

        let mut steps = vec![SequenceStep::new(
            argv(&["mkdir", "--verbose", &tmp]),
            argv(&["rm", "--recursive", "--one-file-system", "--force", &tmp]),
        )];
        steps.extend(self.pre_sequence(loop_device));
        steps.push(SequenceStep::new(
            argv(&[
                &debootstrap,
                "--variant=buildd",
                &format!("--keyring={}", self.keyring_file()),
                &format!("--arch={}", self.chroot.architecture),
                self.chroot.codename(),
                &tmp,
                archive,
            ]),
            argv(&[
                "umount",
                "-v",
                &format!("{}/proc", tmp),
                &format!("{}/sys", tmp),
            ]),
        ));
        steps.extend(self.post_sequence());
        steps.push(SequenceStep::new(
            argv(&[
                "cp",
                "--verbose",
                &self.schroot_conf_file(),
                &self.system_schroot_conf_file(),
            ]),
            argv(&["rm", "--verbose", &self.system_schroot_conf_file()]),
        ));
        Ok(steps)
    }

    /// The loop device bound to our backing file, or the next free one.
    async fn loop_device(&self) -> Result<Option<String>> {
        if !matches!(self.chroot.backend, ChrootBackend::LvmOnLoopfile { .. }) {
            return Ok(None);
        }

        let backing = fs::canonicalize(self.backing_file()).ok();
        if let Some(backing) = &backing {
            for entry in glob::glob("/sys/block/loop[0-9]*/loop/backing_file")? {
                let entry = entry?;
                let Ok(content) = fs::read_to_string(&entry) else {
                    continue;
                };
                if fs::canonicalize(content.trim()).ok().as_ref() == Some(backing) {
                    if let Some(device) = entry.iter().nth(3) {
                        return Ok(Some(format!("/dev/{}", device.to_string_lossy())));
                    }
                }
            }
        }

        debug!(backing = %self.backing_file(), "No loop device bound, searching a free one");
        let found = call(&argv(&["losetup", "--find"]), &CallOptions::default().as_root()).await?;
        Ok(Some(found.trim().to_string()))
    }

    async fn schroot_run(&self, args: &[&str], namespace: &str) -> Result<String> {
        let mut full = argv(&[
            &self.binpath_schroot,
            &format!("--chroot={}:{}", namespace, self.chroot.name()),
            "--user=root",
        ]);
        full.extend(argv(args));
        Ok(call(&full, &CallOptions::default()).await?)
    }

    async fn export_keyring(&self) -> Result<()> {
        let gnupg = GnuPg::tmp(&self.binpath_gpg)?;
        for key_file in &self.source.apt_key_files {
            gnupg.import_file(Path::new(key_file)).await?;
        }
        gnupg.export_keyring(Path::new(&self.keyring_file())).await
    }
}

#[async_trait]
impl Lifecycle for ChrootLifecycle {
    fn status_id(&self) -> String {
        self.chroot.status_id()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.chroot.source.status_id()]
    }

    #[instrument(skip(self), fields(chroot = %self.chroot.name()))]
    async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(self.libdir())
            .with_context(|| format!("Failed to create {}", self.libdir().display()))?;
        fs::write(self.schroot_conf_file(), self.schroot_conf())?;
        self.export_keyring().await?;

        let loop_device = self.loop_device().await?;
        let sequence = self.sequence(loop_device.as_deref())?;
        call_sequence(&sequence, false, &CallOptions::default().as_root()).await?;
        info!("Chroot prepared on system for schroot");
        Ok(())
    }

    #[instrument(skip(self), fields(chroot = %self.chroot.name()))]
    async fn unprepare(&self) -> Result<()> {
        let loop_device = self.loop_device().await.unwrap_or_default();
        let sequence = self.sequence(loop_device.as_deref())?;
        call_sequence(&sequence, true, &CallOptions::default().as_root()).await?;
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to remove chroot dir (ignoring)");
        }
        info!("Chroot removed from system");
        Ok(())
    }

    #[instrument(skip(self), fields(chroot = %self.chroot.name()))]
    async fn check(&self) -> Result<()> {
        self.schroot_run(&["--info"], "chroot").await?;

        if let (Some((filesystem, _)), Some(device)) = (self.lvm_options(), self.lvm_device()) {
            info!("Running file system check");
            call(
                &argv(&["fsck", "-a", &format!("-t{}", filesystem), &device]),
                &CallOptions::default().as_root(),
            )
            .await?;
        }

        for (args, fatal) in [
            (&["update"][..], true),
            (&["--ignore-missing", "dist-upgrade"][..], true),
            (&["--purge", "autoremove"][..], false),
            (&["clean"][..], true),
        ] {
            let mut full = vec![
                "--directory=/",
                "--",
                "apt-get",
                "-q",
                "-o",
                "APT::Install-Recommends=false",
                "--yes",
            ];
            full.extend_from_slice(args);
            match self.schroot_run(&full, "source").await {
                Ok(output) => debug!(output = %output, "apt-get {}", args.join(" ")),
                Err(e) if !fatal => {
                    warn!(error = %e, "'apt-get {}' not supported in this chroot", args.join(" "))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entity::chroot::Compression;
    use entity::source::SourceRef;

    fn lifecycle(backend: ChrootBackend, arch: &str) -> ChrootLifecycle {
        let source = Source {
            origin: "Debian".to_string(),
            codename: "wheezy".to_string(),
            archives: vec!["http://deb.example.org/debian".to_string()],
            apt_key_files: Vec::new(),
            codeversion_override: None,
            release: None,
        };
        ChrootLifecycle {
            chroot: Chroot {
                source: SourceRef {
                    origin: "Debian".to_string(),
                    codename: "wheezy".to_string(),
                },
                architecture: arch.to_string(),
                backend,
                personality_override: None,
                debootstrap_command: None,
            },
            source,
            dir: PathBuf::from("/var/lib/aptforge/chroots/wheezy").join(arch),
            binpath_debootstrap: "debootstrap".to_string(),
            binpath_schroot: "schroot".to_string(),
            binpath_gpg: "gpg".to_string(),
        }
    }

    fn commands(steps: &[SequenceStep]) -> Vec<String> {
        steps.iter().map(|s| s.run[0].clone()).collect()
    }

    #[test]
    fn test_file_backed_sequence() {
        let chroot = lifecycle(
            ChrootBackend::FileBacked {
                compression: Compression::Xz,
            },
            "i386",
        );
        let sequence = chroot.sequence(None).unwrap();
        assert_eq!(
            commands(&sequence),
            vec!["mkdir", "debootstrap", "tar", "rm", "cp"]
        );
        assert!(sequence[2].run.contains(&"--xz".to_string()));

        let conf = chroot.schroot_conf();
        assert!(conf.starts_with("[aptforge-wheezy-i386]\n"));
        assert!(conf.contains("personality=linux32\n"));
        assert!(conf.contains("type=file\nfile=/var/lib/aptforge/chroots/wheezy/i386/source.tar.xz\n"));
    }

    #[test]
    fn test_loop_lvm_sequence() {
        let chroot = lifecycle(
            ChrootBackend::LvmOnLoopfile {
                filesystem: "ext2".to_string(),
                snapshot_size: 4,
                loop_size: 100,
            },
            "amd64",
        );
        let sequence = chroot.sequence(Some("/dev/loop0")).unwrap();
        assert_eq!(
            commands(&sequence),
            vec![
                "mkdir", "dd", "losetup", "pvcreate", "vgcreate", "lvcreate", "mkfs", "mount",
                "debootstrap", "umount", "cp"
            ]
        );
        assert!(sequence[4]
            .run
            .contains(&"aptforge-loop-wheezy-amd64".to_string()));
        assert!(chroot
            .schroot_conf()
            .contains("device=/dev/aptforge-loop-wheezy-amd64/aptforge-wheezy-amd64\n"));
        assert!(chroot.schroot_conf().contains("personality=linux\n"));
    }

    #[test]
    fn test_lvm_snapshot_sequence() {
        let chroot = lifecycle(
            ChrootBackend::LvmSnapshot {
                volume_group: "vg0".to_string(),
                filesystem: "ext4".to_string(),
                snapshot_size: 8,
            },
            "amd64",
        );
        let sequence = chroot.sequence(None).unwrap();
        assert_eq!(
            commands(&sequence),
            vec!["mkdir", "lvcreate", "mkfs", "mount", "debootstrap", "umount", "cp"]
        );
        assert!(sequence[1].run.contains(&"--size=8G".to_string()));
        assert!(chroot
            .schroot_conf()
            .contains("lvm-snapshot-options=--size 8G\n"));
    }
}
