// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display as EnumDisplay, EnumIter};

//-------------------------------------------     ContainerId      ----------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl ContainerId {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

//-------------------------------------------     InstanceState      ----------------------------------------------

/// The EC2-visible lifecycle state of a pseudo-instance. Always a total
/// function of the engine's container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumDisplay, EnumIter)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    #[strum(serialize = "pending")]
    Pending,
    #[strum(serialize = "running")]
    Running,
    #[strum(serialize = "stopping")]
    Stopping,
    #[strum(serialize = "stopped")]
    Stopped,
    #[strum(serialize = "shutting-down")]
    ShuttingDown,
    #[strum(serialize = "terminated")]
    Terminated,
}

/// Maps the engine's architecture naming onto EC2's.
pub fn normalize_architecture(arch: &str) -> String {
    match arch {
        "amd64" => "x86_64".to_string(),
        other => other.to_string(),
    }
}

//-------------------------------------------     Descriptions      ----------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub image_id: String,
    pub state: InstanceState,
    pub health_status: String,
    pub private_dns_name: String,
    pub private_ip_address: String,
    /// Equal to the private address. There is no NAT layer locally, and
    /// tooling that insists on a public address keeps working this way.
    pub public_ip_address: String,
    pub instance_type: String,
    pub architecture: String,
    pub launch_time: DateTime<Utc>,
}

/// One entry of the list returned by the start/stop/terminate operations,
/// in the order of the request's instance IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStateChange {
    pub instance_id: String,
    pub previous_state: InstanceState,
    pub current_state: InstanceState,
}

//-------------------------------------------     Volumes      ----------------------------------------------

/// One row of a volume's attachments sidecar file:
/// `<instance-id>:<device>:<loop-num>:<unix-nano>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub loop_device: i64,
    pub attached_at_nanos: i64,
}

impl VolumeAttachment {
    /// Renders the sidecar line for this attachment.
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.instance_id, self.device, self.loop_device, self.attached_at_nanos
        )
    }

    /// Parses one sidecar line. Returns `None` for anything malformed so a
    /// damaged sidecar degrades to fewer attachments instead of an error.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(':');
        let instance_id = parts.next()?.to_string();
        let device = parts.next()?.to_string();
        let loop_device = parts.next()?.parse().ok()?;
        let attached_at_nanos = parts.next()?.parse().ok()?;
        if parts.next().is_some() || instance_id.is_empty() || device.is_empty() {
            return None;
        }
        Some(Self {
            instance_id,
            device,
            loop_device,
            attached_at_nanos,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub size_bytes: u64,
    pub attachments: Vec<VolumeAttachment>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instance_states_render_like_ec2() {
        assert_eq!(InstanceState::Pending.to_string(), "pending");
        assert_eq!(InstanceState::Running.to_string(), "running");
        assert_eq!(InstanceState::Stopping.to_string(), "stopping");
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
        assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(InstanceState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn amd64_normalizes_to_x86_64() {
        assert_eq!(normalize_architecture("amd64"), "x86_64");
        assert_eq!(normalize_architecture("arm64"), "arm64");
        assert_eq!(normalize_architecture("aarch64"), "aarch64");
        assert_eq!(normalize_architecture(""), "");
    }

    #[test]
    fn attachment_lines_round_trip() {
        let attachment = VolumeAttachment {
            instance_id: "0123456789abcdef0".to_string(),
            device: "/dev/sdb".to_string(),
            loop_device: 7,
            attached_at_nanos: 1_700_000_000_000_000_000,
        };
        let line = attachment.to_line();
        assert_eq!(line, "0123456789abcdef0:/dev/sdb:7:1700000000000000000");
        assert_eq!(VolumeAttachment::from_line(&line).unwrap(), attachment);
    }

    #[test]
    fn malformed_attachment_lines_are_rejected() {
        for line in [
            "",
            "a:b:c",
            "a:/dev/sdb:notanumber:1",
            "a:/dev/sdb:1:notanumber",
            "a:/dev/sdb:1:2:extra",
            ":/dev/sdb:1:2",
            "a::1:2",
        ] {
            assert!(
                VolumeAttachment::from_line(line).is_none(),
                "line {:?} should not parse",
                line
            );
        }
    }
}
