use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;

mod error;
mod key;
mod mac;

pub use error::{SyncError, SyncResult};
pub use key::{KeyStatus, LinkKey, LINK_KEY_LEN};
pub use mac::{MacAddress, MacParseError};

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsKind {
    Ntfs,
    Fat32,
    /// A recognised filesystem that never hosts Windows (ext4, swap, ...).
    Other(String),
    Unknown,
}

impl FsKind {
    pub fn is_windows_capable(&self) -> bool {
        matches!(self, FsKind::Ntfs | FsKind::Fat32)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Ntfs => f.write_str("ntfs"),
            FsKind::Fat32 => f.write_str("fat32"),
            FsKind::Other(name) => f.write_str(name),
            FsKind::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    ToolReportedType,
    MagicBytes,
    HeuristicNameMatch,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionMethod::ToolReportedType => "tool-reported-type",
            DetectionMethod::MagicBytes => "magic-bytes",
            DetectionMethod::HeuristicNameMatch => "heuristic-name-match",
        };
        f.write_str(name)
    }
}

/// Candidate rank. Lower sorts first.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    ToolReportedNtfs = 0,
    MagicBytes = 1,
    /// FAT32 by tool or superblock; usually the EFI partition.
    Fat32 = 2,
    Heuristic = 3,
}

impl Confidence {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn for_detection(method: DetectionMethod, kind: &FsKind) -> Self {
        match (method, kind) {
            (DetectionMethod::HeuristicNameMatch, _) => Confidence::Heuristic,
            (_, FsKind::Fat32) => Confidence::Fat32,
            (DetectionMethod::ToolReportedType, _) => Confidence::ToolReportedNtfs,
            (DetectionMethod::MagicBytes, _) => Confidence::MagicBytes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PartitionCandidate {
    pub device: String,
    pub kind: FsKind,
    pub method: DetectionMethod,
    pub confidence: Confidence,
    /// Position in the enumeration order, used as the tie breaker.
    pub order: usize,
    pub size_bytes: u64,
    pub label: Option<String>,
    /// Where the partition is already mounted, e.g. by the desktop.
    #[serde(default)]
    pub mount_points: Vec<String>,
}

/// Where a device's key was found under the adapter key.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Subkey,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub address: MacAddress,
    pub name: Option<String>,
    pub key: KeyStatus,
    pub device_class: Option<u32>,
    pub key_type: Option<u32>,
    pub source: KeySource,
}

impl DeviceRecord {
    pub fn is_writable(&self) -> bool {
        matches!(self.key, KeyStatus::Valid(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRecord {
    pub address: MacAddress,
    pub devices: Vec<DeviceRecord>,
}

impl AdapterRecord {
    pub fn writable_devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter().filter(|device| device.is_writable())
    }
}

/// What the write-back side receives for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBackRecord {
    pub adapter: MacAddress,
    pub device: MacAddress,
    pub link_key: LinkKey,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SyncedDevice {
    pub adapter: MacAddress,
    pub device: MacAddress,
    pub name: Option<String>,
    pub key_fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SkippedDevice {
    pub adapter: MacAddress,
    pub device: MacAddress,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub partition: Option<String>,
    pub control_set: Option<String>,
    pub adapters_found: usize,
    pub devices_found: usize,
    pub written: Vec<SyncedDevice>,
    pub skipped: Vec<SkippedDevice>,
    pub backup_path: Option<String>,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn from_adapters(adapters: &[AdapterRecord]) -> Self {
        let mut report = SyncReport {
            adapters_found: adapters.len(),
            devices_found: adapters.iter().map(|adapter| adapter.devices.len()).sum(),
            ..SyncReport::default()
        };
        for adapter in adapters {
            for device in &adapter.devices {
                let reason = match &device.key {
                    KeyStatus::Valid(_) => continue,
                    KeyStatus::Missing => "device present but no extractable LinkKey".to_string(),
                    KeyStatus::Malformed { len } => SyncError::KeyMalformed {
                        device: device.address.to_string(),
                        reason: format!("{} bytes, expected {}", len, LINK_KEY_LEN),
                    }
                    .to_string(),
                };
                report.skipped.push(SkippedDevice {
                    adapter: adapter.address,
                    device: device.address,
                    name: device.name.clone(),
                    reason,
                });
            }
        }
        report
    }

    pub fn written_count(&self) -> usize {
        self.written.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SyncOutcome {
    Success(SyncReport),
    NoWindowsFound,
    NothingToSync(SyncReport),
    Failed(String),
}

impl SyncOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncOutcome::Success(_) | SyncOutcome::NothingToSync(_) => 0,
            SyncOutcome::Failed(_) => 1,
            SyncOutcome::NoWindowsFound => 2,
        }
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Success(report) | SyncOutcome::NothingToSync(report) => Some(report),
            _ => None,
        }
    }

    /// Plain-language summary, one line per entry.
    pub fn summary_lines(&self) -> Vec<String> {
        match self {
            SyncOutcome::NoWindowsFound => vec!["No Windows installation found.".to_string()],
            SyncOutcome::NothingToSync(_) => vec![
                "Windows found, but no Bluetooth devices have been paired there yet.".to_string(),
            ],
            SyncOutcome::Failed(reason) => vec![format!("Synchronization failed: {}", reason)],
            SyncOutcome::Success(report) => {
                let total = report.written_count() + report.skipped_count();
                let verb = if report.dry_run { "Would synchronize" } else { "Synchronized" };
                let mut lines = vec![format!(
                    "{} {} of {} device(s).",
                    verb,
                    report.written_count(),
                    total
                )];
                for skipped in &report.skipped {
                    let name = skipped
                        .name
                        .clone()
                        .unwrap_or_else(|| skipped.device.to_string());
                    lines.push(format!(
                        "  skipped {} ({}) on adapter {}: {}",
                        name, skipped.device, skipped.adapter, skipped.reason
                    ));
                }
                lines
            }
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Timestamp usable in file names, e.g. `20240131_235959`.
pub fn now_utc_compact() -> String {
    let format = time::macros::format_description!("[year][month][day]_[hour][minute][second]");
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "19700101_000000".to_string())
}
