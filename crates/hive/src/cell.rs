//! On-disk layout of a regf hive.
//!
//! ```text
//! +0x0000  base block, 4096 bytes
//!   +0x00  "regf"
//!   +0x04  primary sequence number (u32)
//!   +0x08  secondary sequence number (u32)
//!   +0x24  root cell offset (u32, relative to hive data)
//!   +0x28  hive data length (u32)
//!   +0x1FC xor checksum of the first 508 bytes
//! +0x1000  hive data: "hbin" blocks holding cells
//!   cell = |size: i32|body...|, allocated cells have a negative size
//! ```
//!
//! Every offset stored inside the hive is relative to the start of the hive
//! data, i.e. file offset minus 0x1000.

use crate::HiveError;

pub(crate) const REGF_SIGNATURE: &[u8; 4] = b"regf";
pub(crate) const HBIN_SIGNATURE: &[u8; 4] = b"hbin";
pub(crate) const BASE_BLOCK_SIZE: usize = 4096;

pub(crate) const REGF_SEQUENCE_1: usize = 0x04;
pub(crate) const REGF_SEQUENCE_2: usize = 0x08;
pub(crate) const REGF_MAJOR_VERSION: usize = 0x14;
pub(crate) const REGF_MINOR_VERSION: usize = 0x18;
pub(crate) const REGF_ROOT_CELL: usize = 0x24;
pub(crate) const REGF_HIVE_LENGTH: usize = 0x28;
pub(crate) const REGF_CHECKSUM: usize = 0x1FC;

pub(crate) const NK_SIGNATURE: &[u8; 2] = b"nk";
pub(crate) const VK_SIGNATURE: &[u8; 2] = b"vk";
pub(crate) const LF_SIGNATURE: &[u8; 2] = b"lf";
pub(crate) const LH_SIGNATURE: &[u8; 2] = b"lh";
pub(crate) const LI_SIGNATURE: &[u8; 2] = b"li";
pub(crate) const RI_SIGNATURE: &[u8; 2] = b"ri";
pub(crate) const DB_SIGNATURE: &[u8; 2] = b"db";

// nk body offsets, measured from the signature
pub(crate) const NK_FLAGS: usize = 0x02;
pub(crate) const NK_SUBKEY_COUNT: usize = 0x14;
pub(crate) const NK_SUBKEY_LIST: usize = 0x1C;
pub(crate) const NK_VALUE_COUNT: usize = 0x24;
pub(crate) const NK_VALUE_LIST: usize = 0x28;
// written by the test builder only
#[allow(dead_code)]
pub(crate) const NK_SECURITY: usize = 0x2C;
#[allow(dead_code)]
pub(crate) const NK_CLASS_NAME: usize = 0x30;
pub(crate) const NK_NAME_LENGTH: usize = 0x48;
pub(crate) const NK_NAME: usize = 0x4C;

// vk body offsets, measured from the signature
pub(crate) const VK_NAME_LENGTH: usize = 0x02;
pub(crate) const VK_DATA_LENGTH: usize = 0x04;
pub(crate) const VK_DATA_OFFSET: usize = 0x08;
pub(crate) const VK_TYPE: usize = 0x0C;
pub(crate) const VK_FLAGS: usize = 0x10;
pub(crate) const VK_NAME: usize = 0x14;

pub(crate) const KEY_HIVE_ENTRY: u16 = 0x0004;
pub(crate) const KEY_COMP_NAME: u16 = 0x0020;
pub(crate) const VALUE_COMP_NAME: u16 = 0x0001;

/// High bit of the vk data length: data lives in the offset field itself.
pub(crate) const DATA_RESIDENT: u32 = 0x8000_0000;
/// Largest value stored in a single data cell; longer data uses a `db` record.
pub(crate) const BIG_DATA_THRESHOLD: usize = 16344;
pub(crate) const NO_CELL: u32 = 0xFFFF_FFFF;

/// Upper bound for subkey or value counts, far above anything Windows writes.
pub(crate) const MAX_LIST_ENTRIES: usize = 0x10_0000;
/// `ri` records only ever point at leaf lists, allow one level of slack.
pub(crate) const MAX_INDEX_DEPTH: usize = 2;

pub(crate) fn corrupt(offset: u32, reason: impl Into<String>) -> HiveError {
    HiveError::Corrupt {
        offset,
        reason: reason.into(),
    }
}

pub(crate) fn read_u16(bytes: &[u8], at: usize, cell: u32) -> Result<u16, HiveError> {
    bytes
        .get(at..at + 2)
        .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
        .ok_or_else(|| corrupt(cell, format!("u16 at +{:#x} past end of cell", at)))
}

pub(crate) fn read_u32(bytes: &[u8], at: usize, cell: u32) -> Result<u32, HiveError> {
    bytes
        .get(at..at + 4)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .ok_or_else(|| corrupt(cell, format!("u32 at +{:#x} past end of cell", at)))
}

pub(crate) fn slice(bytes: &[u8], at: usize, len: usize, cell: u32) -> Result<&[u8], HiveError> {
    at.checked_add(len)
        .and_then(|end| bytes.get(at..end))
        .ok_or_else(|| corrupt(cell, format!("{} bytes at +{:#x} past end of cell", len, at)))
}

/// Key and value names are either Latin-1 ("compressed") or UTF-16LE.
pub(crate) fn decode_name(raw: &[u8], compressed: bool) -> String {
    if compressed {
        raw.iter().map(|&byte| byte as char).collect()
    } else {
        decode_utf16le(raw)
    }
}

/// Decode UTF-16LE, stopping at the first NUL.
pub(crate) fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// XOR of the first 127 dwords of the base block, as Windows computes it.
pub(crate) fn base_block_checksum(header: &[u8]) -> u32 {
    let mut sum = 0u32;
    for dword in header[..REGF_CHECKSUM].chunks_exact(4) {
        sum ^= u32::from_le_bytes([dword[0], dword[1], dword[2], dword[3]]);
    }
    match sum {
        0 => 1,
        0xFFFF_FFFF => 0xFFFF_FFFE,
        other => other,
    }
}
