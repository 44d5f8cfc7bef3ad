//! Block device discovery and read-only mounting on Linux hosts.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub mod detect;
pub mod lsblk;
pub mod mount;
pub mod survey;

pub use detect::{Detector, DetectorChain, HeadReader, DEFAULT_HEURISTIC_MIN_SIZE};
pub use lsblk::PartitionRow;
pub use mount::{MountBackend, MountError, MountHandle, PartitionMounter, SystemMount};
pub use survey::{BlockDeviceSurveyor, PartitionSource, Surveyor};

/// Loop, RAM, compressed-RAM and optical devices never hold an installation.
pub fn is_virtual_device(name: &str) -> bool {
    ["loop", "ram", "zram", "sr"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Mount points per kernel device name (`sda3`, `nvme0n1p2`).
pub(crate) fn read_mounts() -> HashMap<String, Vec<String>> {
    parse_mounts(&fs::read_to_string("/proc/self/mounts").unwrap_or_default())
}

fn parse_mounts(data: &str) -> HashMap<String, Vec<String>> {
    let mut mounts: HashMap<String, Vec<String>> = HashMap::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts
            .entry(name)
            .or_default()
            .push(unescape_mount(mount_point));
    }
    mounts
}

// /proc/self/mounts escapes space, tab, newline and backslash as \ooo.
fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte as char),
            _ => {
                output.push('\\');
                output.push_str(&octal);
            }
        }
    }
    output
}
