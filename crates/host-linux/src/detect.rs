//! Filesystem classification for a single partition.
//!
//! Detectors run in a fixed order and the first definite answer wins, so the
//! method that produced a kind is always known.

use crate::lsblk::PartitionRow;
use btsync_core::{DetectionMethod, FsKind};
use std::fs::File;
use std::io::{self, Read};

pub const HEAD_LEN: usize = 4096;

const NTFS_OEM_ID: &[u8] = b"NTFS    ";
const NTFS_OEM_OFFSET: usize = 3;
const FAT32_FS_TYPE: &[u8] = b"FAT32   ";
const FAT32_FS_TYPE_OFFSET: usize = 0x52;
const FAT16_FS_TYPE_OFFSET: usize = 0x36;
const EXT_MAGIC_OFFSET: usize = 0x438;
const EXT_MAGIC: u16 = 0xEF53;
const SWAP_MAGIC_OFFSET: usize = 4086;

const MS_BASIC_DATA_GUID: &str = "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7";
const MBR_NTFS_TYPES: [&str; 2] = ["0x7", "0x07"];
const LINUX_LABELS: [&str; 14] = [
    "root", "home", "boot", "efi", "swap", "var", "usr", "data", "fedora", "ubuntu", "debian",
    "arch", "pop_os", "nixos",
];

pub const DEFAULT_HEURISTIC_MIN_SIZE: u64 = 20 * 1024 * 1024 * 1024;

pub trait Detector: Send + Sync {
    fn method(&self) -> DetectionMethod;
    /// `None` means "cannot tell", letting the next detector try.
    fn detect(&self, row: &PartitionRow) -> Option<FsKind>;
}

pub struct ToolReportedType;

impl Detector for ToolReportedType {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::ToolReportedType
    }

    fn detect(&self, row: &PartitionRow) -> Option<FsKind> {
        let fstype = row.fstype.as_deref()?.to_ascii_lowercase();
        match fstype.as_str() {
            "ntfs" | "ntfs3" => Some(FsKind::Ntfs),
            "fat32" => Some(FsKind::Fat32),
            // lsblk reports FAT12/16/32 alike as vfat; the superblock decides
            "" | "vfat" | "msdos" | "fat" | "fat12" | "fat16" => None,
            other => Some(FsKind::Other(other.to_string())),
        }
    }
}

/// Source of the first bytes of a block device.
pub trait HeadReader: Send + Sync {
    fn read_head(&self, device: &str) -> io::Result<Vec<u8>>;
}

impl<F> HeadReader for F
where
    F: Fn(&str) -> io::Result<Vec<u8>> + Send + Sync,
{
    fn read_head(&self, device: &str) -> io::Result<Vec<u8>> {
        self(device)
    }
}

pub struct DeviceHead;

impl HeadReader for DeviceHead {
    fn read_head(&self, device: &str) -> io::Result<Vec<u8>> {
        let mut head = Vec::with_capacity(HEAD_LEN);
        File::open(device)?
            .take(HEAD_LEN as u64)
            .read_to_end(&mut head)?;
        Ok(head)
    }
}

pub struct MagicBytes {
    reader: Box<dyn HeadReader>,
}

impl MagicBytes {
    pub fn new() -> Self {
        Self::with_reader(DeviceHead)
    }

    pub fn with_reader(reader: impl HeadReader + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }
}

impl Default for MagicBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for MagicBytes {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::MagicBytes
    }

    fn detect(&self, row: &PartitionRow) -> Option<FsKind> {
        match self.reader.read_head(&row.device) {
            Ok(head) => classify_head(&head),
            Err(err) => {
                tracing::debug!("survey: cannot read {}: {}", row.device, err);
                None
            }
        }
    }
}

/// Classify the first [`HEAD_LEN`] bytes of a device.
pub fn classify_head(head: &[u8]) -> Option<FsKind> {
    let at = |offset: usize, len: usize| head.get(offset..offset + len);
    if at(NTFS_OEM_OFFSET, NTFS_OEM_ID.len()) == Some(NTFS_OEM_ID) {
        return Some(FsKind::Ntfs);
    }
    if at(FAT32_FS_TYPE_OFFSET, FAT32_FS_TYPE.len()) == Some(FAT32_FS_TYPE) {
        return Some(FsKind::Fat32);
    }
    match at(FAT16_FS_TYPE_OFFSET, 8) {
        Some(b"FAT12   ") => return Some(FsKind::Other("fat12".to_string())),
        Some(b"FAT16   ") => return Some(FsKind::Other("fat16".to_string())),
        _ => {}
    }
    if let Some(raw) = at(EXT_MAGIC_OFFSET, 2) {
        if u16::from_le_bytes([raw[0], raw[1]]) == EXT_MAGIC {
            return Some(FsKind::Other("ext4".to_string()));
        }
    }
    if let Some(raw) = at(SWAP_MAGIC_OFFSET, 10) {
        if raw == b"SWAPSPACE2" || raw == b"SWAP-SPACE" {
            return Some(FsKind::Other("swap".to_string()));
        }
    }
    None
}

pub struct HeuristicNameMatch {
    pub min_size_bytes: u64,
}

impl Detector for HeuristicNameMatch {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::HeuristicNameMatch
    }

    fn detect(&self, row: &PartitionRow) -> Option<FsKind> {
        if let Some(parttype) = row.parttype.as_deref() {
            let parttype = parttype.to_ascii_lowercase();
            if parttype == MS_BASIC_DATA_GUID || MBR_NTFS_TYPES.contains(&parttype.as_str()) {
                return Some(FsKind::Ntfs);
            }
        }
        if row.size_bytes >= self.min_size_bytes && !has_linux_label(row) {
            return Some(FsKind::Ntfs);
        }
        None
    }
}

fn has_linux_label(row: &PartitionRow) -> bool {
    row.label.as_deref().is_some_and(|label| {
        let label = label.to_ascii_lowercase();
        LINUX_LABELS.iter().any(|known| label == *known)
    })
}

pub struct DetectorChain {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorChain {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Tool type, then magic bytes read from the device, then heuristics.
    pub fn standard(heuristic_min_size_bytes: u64) -> Self {
        Self::with_head_reader(DeviceHead, heuristic_min_size_bytes)
    }

    pub fn with_head_reader(reader: impl HeadReader + 'static, heuristic_min_size_bytes: u64) -> Self {
        Self::new(vec![
            Box::new(ToolReportedType),
            Box::new(MagicBytes::with_reader(reader)),
            Box::new(HeuristicNameMatch {
                min_size_bytes: heuristic_min_size_bytes,
            }),
        ])
    }

    pub fn classify(&self, row: &PartitionRow) -> Option<(FsKind, DetectionMethod)> {
        self.detectors
            .iter()
            .find_map(|detector| detector.detect(row).map(|kind| (kind, detector.method())))
    }
}
