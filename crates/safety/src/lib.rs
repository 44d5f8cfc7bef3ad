use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    /// Options handed to `mount -o`.
    pub fn options(self) -> &'static str {
        match self {
            MountMode::ReadOnly => "ro,noexec,nosuid,nodev",
            MountMode::ReadWrite => "rw,noexec,nosuid,nodev",
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::ReadOnly => f.write_str("read-only"),
            MountMode::ReadWrite => f.write_str("read-write"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub device: String,
    pub mode: MountMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

/// Foreign partitions are only ever attached read-only, and only from `/dev`.
pub fn can_mount(ctx: &SafetyContext) -> SafetyDecision {
    if ctx.mode != MountMode::ReadOnly {
        return SafetyDecision::Deny(format!(
            "Denied: {} mount of {} requested, only read-only is permitted",
            ctx.mode, ctx.device
        ));
    }
    if !ctx.device.starts_with("/dev/") {
        return SafetyDecision::Deny(format!(
            "Denied: {} is not a block device path",
            ctx.device
        ));
    }
    SafetyDecision::Allow
}

/// Writing the BlueZ store and mounting need an effective uid of 0.
pub fn require_root(euid: u32) -> SafetyDecision {
    if euid != 0 {
        return SafetyDecision::Deny(
            "Denied: root privileges are required (run with sudo)".to_string(),
        );
    }
    SafetyDecision::Allow
}
