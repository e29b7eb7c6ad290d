// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The volume lifecycle: sparse backing files in the main volume, exposed to
//! instance containers as loop-backed block devices.
//!
//! All state lives in two files per volume under the main mount: the sparse
//! backing file and a newline-delimited attachments sidecar. Both are only
//! ever touched through `exec` in the main container, so every executor and
//! every instance container observes the same bytes through the shared
//! volume.

use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::*;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MAIN_MOUNT,
    engine::ExecOutput,
    error::ExecutorError,
    executor::Executor,
    ids,
    models::{VolumeAttachment, VolumeDescription},
};

lazy_static! {
    static ref LOOP_DEVICE: Regex = Regex::new(r"^/dev/loop(\d+)$").expect("hardcoded regex");
}

fn backing_path(volume_id: &str) -> String {
    format!("{}/{}", MAIN_MOUNT, volume_id)
}

fn attachments_path(volume_id: &str) -> String {
    format!("{}/{}.attachments", MAIN_MOUNT, volume_id)
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}

/// Single-quotes `value` for `/bin/sh -c`. Device names and instance IDs are
/// caller-supplied and end up inside the sidecar commands, so embedded
/// quotes must not terminate the quoted string.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl Executor {
    /// Creates a sparse volume of `size_bytes` and returns its ID.
    pub async fn create_volume(
        &self,
        size_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        if size_bytes == 0 {
            return Err(ExecutorError::InvalidRequest(
                "volume size must be positive".to_string(),
            ));
        }
        let volume_id = ids::volume_id();
        self.exec_main(
            &["truncate", "-s", &size_bytes.to_string(), &backing_path(&volume_id)],
            cancel,
        )
        .await?;
        self.exec_main(&["touch", &attachments_path(&volume_id)], cancel)
            .await?;
        info!("Volume {} created ({} bytes)", volume_id, size_bytes);
        Ok(volume_id)
    }

    /// Deletes a volume's backing file and sidecar. Live loop devices inside
    /// instance containers are not unwound here; detach handles those.
    pub async fn delete_volume(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        self.volume_size(volume_id, cancel).await?;
        self.exec_main(
            &["rm", "-f", &backing_path(volume_id), &attachments_path(volume_id)],
            cancel,
        )
        .await?;
        info!("Volume {} deleted", volume_id);
        Ok(())
    }

    /// Binds a volume into an instance container as a loop-backed block
    /// device at `device`.
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        cancel: &CancellationToken,
    ) -> Result<VolumeAttachment, ExecutorError> {
        let container_id = self
            .find_instance(instance_id, cancel)
            .await?
            .ok_or_else(|| ExecutorError::InstanceNotFound(instance_id.to_string()))?;
        self.volume_size(volume_id, cancel).await?;

        let attachments = self.read_attachments(volume_id, cancel).await?;
        if attachments
            .iter()
            .any(|a| a.instance_id == instance_id && a.device == device)
        {
            return Err(ExecutorError::InvalidRequest(format!(
                "volume {} is already attached to instance {} on {}",
                volume_id, instance_id, device
            )));
        }

        // The next free loop slot as seen from inside the instance.
        let probe = self.exec_in(&container_id, &["losetup", "-f"], cancel).await?;
        let loop_device = parse_loop_device(&probe.stdout)?;
        self.exec_in(
            &container_id,
            &["mknod", device, "b", "7", &loop_device.to_string()],
            cancel,
        )
        .await?;
        self.exec_in(
            &container_id,
            &["losetup", device, &backing_path(volume_id)],
            cancel,
        )
        .await?;

        let attachment = VolumeAttachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            loop_device,
            attached_at_nanos: now_nanos(),
        };
        // One shell append so concurrent attachments to other volumes never
        // interleave partial lines.
        self.exec_main(
            &[
                "/bin/sh",
                "-c",
                &format!(
                    "echo {} >> {}",
                    sh_quote(&attachment.to_line()),
                    sh_quote(&attachments_path(volume_id))
                ),
            ],
            cancel,
        )
        .await?;
        info!(
            "Volume {} attached to instance {} at {} (loop {})",
            volume_id, instance_id, device, loop_device
        );
        Ok(attachment)
    }

    /// Unbinds a volume from an instance container and drops the sidecar
    /// row. Fails with [`ExecutorError::NotAttached`] when no such
    /// attachment exists.
    pub async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        cancel: &CancellationToken,
    ) -> Result<VolumeAttachment, ExecutorError> {
        let container_id = self
            .find_instance(instance_id, cancel)
            .await?
            .ok_or_else(|| ExecutorError::InstanceNotFound(instance_id.to_string()))?;

        let mut attachments = self.read_attachments(volume_id, cancel).await?;
        let position = attachments
            .iter()
            .position(|a| a.instance_id == instance_id && a.device == device)
            .ok_or_else(|| ExecutorError::NotAttached {
                volume: volume_id.to_string(),
                instance: instance_id.to_string(),
                device: device.to_string(),
            })?;
        let removed = attachments.remove(position);

        self.exec_in(&container_id, &["losetup", "-d", device], cancel)
            .await?;
        self.exec_in(&container_id, &["rm", "-f", device], cancel)
            .await?;
        self.write_attachments(volume_id, &attachments, cancel).await?;
        info!(
            "Volume {} detached from instance {} at {}",
            volume_id, instance_id, device
        );
        Ok(removed)
    }

    /// Describes the given volumes: current size and attachment rows.
    pub async fn describe_volumes(
        &self,
        volume_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<VolumeDescription>, ExecutorError> {
        let mut descriptions = Vec::with_capacity(volume_ids.len());
        for volume_id in volume_ids {
            let size_bytes = self.volume_size(volume_id, cancel).await?;
            let attachments = self.read_attachments(volume_id, cancel).await?;
            descriptions.push(VolumeDescription {
                volume_id: volume_id.clone(),
                size_bytes,
                attachments,
            });
        }
        Ok(descriptions)
    }

    /// The apparent size of the backing file, in bytes. A missing file is
    /// [`ExecutorError::VolumeNotFound`].
    async fn volume_size(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ExecutorError> {
        let output = self
            .engine
            .exec(
                self.main_name.as_str(),
                &["du", "-b", &backing_path(volume_id)],
                cancel,
            )
            .await?;
        if output.exit_code != 0 {
            return Err(ExecutorError::VolumeNotFound(volume_id.to_string()));
        }
        parse_du_size(&output.stdout).ok_or_else(|| {
            ExecutorError::StateDecode(format!("unreadable du output {:?}", output.stdout))
        })
    }

    async fn read_attachments(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<VolumeAttachment>, ExecutorError> {
        let output = self
            .engine
            .exec(
                self.main_name.as_str(),
                &["cat", &attachments_path(volume_id)],
                cancel,
            )
            .await?;
        if output.exit_code != 0 {
            // No sidecar, no attachments.
            return Ok(Vec::new());
        }
        let mut attachments = Vec::new();
        for line in output.stdout.lines().filter(|line| !line.trim().is_empty()) {
            match VolumeAttachment::from_line(line) {
                Some(attachment) => attachments.push(attachment),
                None => warn!(
                    "Skipping malformed attachment row {:?} of volume {}",
                    line, volume_id
                ),
            }
        }
        Ok(attachments)
    }

    async fn write_attachments(
        &self,
        volume_id: &str,
        attachments: &[VolumeAttachment],
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut content = attachments
            .iter()
            .map(VolumeAttachment::to_line)
            .collect::<Vec<String>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        self.exec_main(
            &[
                "/bin/sh",
                "-c",
                &format!(
                    "printf '%s' {} > {}",
                    sh_quote(&content),
                    sh_quote(&attachments_path(volume_id))
                ),
            ],
            cancel,
        )
        .await
        .map(|_| ())
    }

    /// Runs a command in the main container, failing on non-zero exit.
    async fn exec_main(
        &self,
        command: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecutorError> {
        self.exec_in(&self.main_name, command, cancel).await
    }

    /// Runs a command in the given container, failing on non-zero exit.
    async fn exec_in(
        &self,
        container: &str,
        command: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecutorError> {
        let output = self.engine.exec(container, command, cancel).await?;
        if output.exit_code != 0 {
            return Err(ExecutorError::CommandFailed {
                container: container.to_string(),
                command: command.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Parses the first token of `losetup -f` output into a loop-device number.
fn parse_loop_device(stdout: &str) -> Result<i64, ExecutorError> {
    let token = stdout.split_whitespace().next().unwrap_or_default();
    LOOP_DEVICE
        .captures(token)
        .and_then(|captures| captures.get(1))
        .and_then(|number| number.as_str().parse().ok())
        .ok_or_else(|| {
            ExecutorError::StateDecode(format!("unexpected losetup output {:?}", stdout))
        })
}

/// Parses the integer `du -b` prints ahead of the tab separator.
fn parse_du_size(stdout: &str) -> Option<u64> {
    stdout.split('\t').next()?.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loop_device_numbers_parse() {
        assert_eq!(parse_loop_device("/dev/loop0\n").unwrap(), 0);
        assert_eq!(parse_loop_device("/dev/loop17\n").unwrap(), 17);
        assert_eq!(parse_loop_device("  /dev/loop3  ").unwrap(), 3);
    }

    #[test]
    fn junk_losetup_output_is_an_error() {
        for output in ["", "\n", "/dev/sda1", "loop0", "/dev/loop", "/dev/loopx"] {
            let err = parse_loop_device(output).unwrap_err();
            assert!(matches!(err, ExecutorError::StateDecode(_)), "{:?}", output);
        }
    }

    #[test]
    fn du_sizes_parse() {
        assert_eq!(parse_du_size("1048576\t/var/dc2/abc\n"), Some(1_048_576));
        assert_eq!(parse_du_size("0\t/var/dc2/abc"), Some(0));
        assert_eq!(parse_du_size(""), None);
        assert_eq!(parse_du_size("du: cannot access"), None);
    }

    #[test]
    fn paths_live_under_the_main_mount() {
        assert_eq!(backing_path("abc"), "/var/dc2/abc");
        assert_eq!(attachments_path("abc"), "/var/dc2/abc.attachments");
    }

    #[test]
    fn shell_quoting_keeps_hostile_values_inert() {
        assert_eq!(sh_quote("0123456789abcdef0:/dev/sdb:7:1"), "'0123456789abcdef0:/dev/sdb:7:1'");
        // A device name trying to break out of the quoted string stays a
        // single shell word.
        assert_eq!(
            sh_quote("'; touch /tmp/pwned #"),
            r#"''\''; touch /tmp/pwned #'"#
        );
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("a'b'c"), r#"'a'\''b'\''c'"#);
    }
}
