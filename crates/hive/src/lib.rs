//! Read-only access to Windows registry hive files.
//!
//! Only what key extraction needs: name resolution, subkey enumeration and
//! raw value retrieval. Security descriptors, class names and timestamps are
//! never decoded. Anything structurally wrong is reported as
//! [`HiveError::Corrupt`] instead of being skipped.

mod cell;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use cell::*;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_MULTI_SZ: u32 = 7;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("cannot read hive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hive corrupt at cell {offset:#x}: {reason}")]
    Corrupt { offset: u32, reason: String },

    #[error("registry path not found: {path}")]
    PathNotFound { path: String },
}

impl HiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HiveError::PathNotFound { .. })
    }
}

pub type HiveResult<T> = Result<T, HiveError>;

/// A parsed key node. Cheap to clone, only valid for the hive it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    offset: u32,
    name: String,
    subkey_count: u32,
    subkey_list: u32,
    value_count: u32,
    value_list: u32,
}

impl KeyNode {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    /// Empty for the `(Default)` value.
    pub name: String,
    pub value_type: u32,
    pub data: Vec<u8>,
}

struct VkHeader {
    offset: u32,
    name: String,
    value_type: u32,
    raw_length: u32,
    data_offset: u32,
}

/// An open hive. The whole file is held in memory and never written.
pub struct Hive {
    data: Vec<u8>,
    root_cell: u32,
    dirty: bool,
}

impl Hive {
    pub fn open(path: impl AsRef<Path>) -> HiveResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| HiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("hive: read {} bytes from {}", bytes.len(), path.display());
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> HiveResult<Self> {
        if bytes.len() < BASE_BLOCK_SIZE + 32 {
            return Err(corrupt(0, format!("file too short ({} bytes)", bytes.len())));
        }
        let header = &bytes[..BASE_BLOCK_SIZE];
        if &header[0..4] != REGF_SIGNATURE {
            return Err(corrupt(0, "missing regf signature"));
        }
        if &bytes[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + 4] != HBIN_SIGNATURE {
            return Err(corrupt(0, "missing hbin signature after base block"));
        }

        let sequence_1 = read_u32(header, REGF_SEQUENCE_1, 0)?;
        let sequence_2 = read_u32(header, REGF_SEQUENCE_2, 0)?;
        let major = read_u32(header, REGF_MAJOR_VERSION, 0)?;
        let minor = read_u32(header, REGF_MINOR_VERSION, 0)?;
        let root_cell = read_u32(header, REGF_ROOT_CELL, 0)?;
        let hive_length = read_u32(header, REGF_HIVE_LENGTH, 0)? as usize;
        let checksum = read_u32(header, REGF_CHECKSUM, 0)?;

        let available = bytes.len() - BASE_BLOCK_SIZE;
        if hive_length > available {
            return Err(corrupt(
                0,
                format!(
                    "header claims {:#x} bytes of hive data, file holds {:#x}",
                    hive_length, available
                ),
            ));
        }
        if major != 1 {
            return Err(corrupt(0, format!("unsupported hive version {}.{}", major, minor)));
        }
        if checksum != base_block_checksum(header) {
            warn!("hive: base block checksum mismatch, continuing");
        }
        let dirty = sequence_1 != sequence_2;
        if dirty {
            warn!(
                "hive: sequence numbers differ ({} != {}), transaction logs were not replayed",
                sequence_1, sequence_2
            );
        }

        let mut data = bytes;
        data.truncate(BASE_BLOCK_SIZE + hive_length);
        let hive = Hive {
            data,
            root_cell,
            dirty,
        };
        let root = hive.key_node(root_cell)?;
        debug!("hive: root key '{}' at {:#x}, version 1.{}", root.name, root_cell, minor);
        Ok(hive)
    }

    /// True when the primary and secondary sequence numbers disagree.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn root(&self) -> HiveResult<KeyNode> {
        self.key_node(self.root_cell)
    }

    /// Resolve a path of key names from the root, case-insensitively.
    pub fn resolve(&self, path: &[&str]) -> HiveResult<KeyNode> {
        let root = self.root()?;
        self.resolve_from(&root, path)
    }

    /// Resolve a path relative to `start`. A missing component yields
    /// [`HiveError::PathNotFound`] naming the whole requested path.
    pub fn resolve_from(&self, start: &KeyNode, path: &[&str]) -> HiveResult<KeyNode> {
        let mut current = start.clone();
        for component in path.iter().filter(|component| !component.is_empty()) {
            current = match self.subkey(&current, component)? {
                Some(next) => next,
                None => {
                    return Err(HiveError::PathNotFound {
                        path: path.join("\\"),
                    })
                }
            };
        }
        Ok(current)
    }

    pub fn subkey(&self, key: &KeyNode, name: &str) -> HiveResult<Option<KeyNode>> {
        Ok(self
            .subkey_nodes(key)?
            .into_iter()
            .find(|child| names_match(&child.name, name)))
    }

    pub fn subkeys(&self, key: &KeyNode) -> HiveResult<Vec<String>> {
        Ok(self
            .subkey_nodes(key)?
            .into_iter()
            .map(|child| child.name)
            .collect())
    }

    pub fn subkey_nodes(&self, key: &KeyNode) -> HiveResult<Vec<KeyNode>> {
        self.subkey_offsets(key)?
            .into_iter()
            .map(|offset| self.key_node(offset))
            .collect()
    }

    /// Cell offsets of the children of `key`, without decoding them.
    ///
    /// Pair with [`Hive::key_node_at`] to read siblings one at a time, so a
    /// damaged child can be skipped without losing the rest.
    pub fn subkey_offsets(&self, key: &KeyNode) -> HiveResult<Vec<u32>> {
        if key.subkey_count == 0 {
            return Ok(Vec::new());
        }
        if key.subkey_list == NO_CELL {
            return Err(corrupt(
                key.offset,
                format!("key '{}' has {} subkeys but no list", key.name, key.subkey_count),
            ));
        }
        let mut offsets = Vec::new();
        self.collect_subkey_offsets(key.subkey_list, 0, &mut offsets)?;
        if offsets.len() != key.subkey_count as usize {
            return Err(corrupt(
                key.subkey_list,
                format!(
                    "key '{}' lists {} subkeys, header says {}",
                    key.name,
                    offsets.len(),
                    key.subkey_count
                ),
            ));
        }
        Ok(offsets)
    }

    pub fn key_node_at(&self, offset: u32) -> HiveResult<KeyNode> {
        self.key_node(offset)
    }

    /// Cell offsets of the values of `key`, without decoding them.
    pub fn value_offsets(&self, key: &KeyNode) -> HiveResult<Vec<u32>> {
        if key.value_count == 0 {
            return Ok(Vec::new());
        }
        if key.value_list == NO_CELL {
            return Err(corrupt(
                key.offset,
                format!("key '{}' has {} values but no list", key.name, key.value_count),
            ));
        }
        let list = self.cell(key.value_list)?;
        let entries = slice(list, 0, key.value_count as usize * 4, key.value_list)?;
        Ok(entries
            .chunks_exact(4)
            .map(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]))
            .collect())
    }

    pub fn value_entry_at(&self, offset: u32) -> HiveResult<ValueEntry> {
        let header = self.vk_header(offset)?;
        let data = self.value_data(&header)?;
        Ok(ValueEntry {
            name: header.name,
            value_type: header.value_type,
            data,
        })
    }

    pub fn value_entry(&self, key: &KeyNode, name: &str) -> HiveResult<Option<ValueEntry>> {
        for header in self.value_headers(key)? {
            if names_match(&header.name, name) {
                let data = self.value_data(&header)?;
                return Ok(Some(ValueEntry {
                    name: header.name,
                    value_type: header.value_type,
                    data,
                }));
            }
        }
        Ok(None)
    }

    /// Raw bytes of a named value, `None` when the key has no such value.
    pub fn value(&self, key: &KeyNode, name: &str) -> HiveResult<Option<Vec<u8>>> {
        Ok(self.value_entry(key, name)?.map(|entry| entry.data))
    }

    pub fn value_dword(&self, key: &KeyNode, name: &str) -> HiveResult<Option<u32>> {
        let Some(entry) = self.value_entry(key, name)? else {
            return Ok(None);
        };
        match entry.data.get(0..4) {
            Some(raw) => Ok(Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))),
            None => Err(corrupt(
                key.offset,
                format!("value '{}' is {} bytes, not a dword", name, entry.data.len()),
            )),
        }
    }

    /// String value. `REG_SZ`-style types decode as UTF-16LE, anything else
    /// is taken as UTF-8 (Windows stores Bluetooth names as UTF-8 binaries).
    pub fn value_string(&self, key: &KeyNode, name: &str) -> HiveResult<Option<String>> {
        Ok(self
            .value_entry(key, name)?
            .map(|entry| decode_string(entry.value_type, &entry.data)))
    }

    fn cell(&self, offset: u32) -> HiveResult<&[u8]> {
        let start = BASE_BLOCK_SIZE
            .checked_add(offset as usize)
            .ok_or_else(|| corrupt(offset, "offset overflow"))?;
        let size_bytes = self
            .data
            .get(start..start + 4)
            .ok_or_else(|| corrupt(offset, "cell offset outside hive data"))?;
        let raw_size = i32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]);
        if raw_size >= 0 {
            return Err(corrupt(offset, "reference to an unallocated cell"));
        }
        let size = raw_size.unsigned_abs() as usize;
        if size < 8 {
            return Err(corrupt(offset, format!("cell size {} too small", size)));
        }
        self.data
            .get(start + 4..start + size)
            .ok_or_else(|| corrupt(offset, format!("cell of {} bytes runs past hive end", size)))
    }

    fn key_node(&self, offset: u32) -> HiveResult<KeyNode> {
        let body = self.cell(offset)?;
        if slice(body, 0, 2, offset)? != NK_SIGNATURE {
            return Err(corrupt(offset, "expected nk record"));
        }
        let flags = read_u16(body, NK_FLAGS, offset)?;
        let name_length = read_u16(body, NK_NAME_LENGTH, offset)? as usize;
        let name_bytes = slice(body, NK_NAME, name_length, offset)?;
        if offset == self.root_cell && flags & KEY_HIVE_ENTRY == 0 {
            debug!("hive: root key at {:#x} lacks the hive-entry flag", offset);
        }
        let subkey_count = read_u32(body, NK_SUBKEY_COUNT, offset)?;
        let value_count = read_u32(body, NK_VALUE_COUNT, offset)?;
        if subkey_count as usize > MAX_LIST_ENTRIES || value_count as usize > MAX_LIST_ENTRIES {
            return Err(corrupt(
                offset,
                format!("implausible counts ({} subkeys, {} values)", subkey_count, value_count),
            ));
        }
        Ok(KeyNode {
            offset,
            name: decode_name(name_bytes, flags & KEY_COMP_NAME != 0),
            subkey_count,
            subkey_list: read_u32(body, NK_SUBKEY_LIST, offset)?,
            value_count,
            value_list: read_u32(body, NK_VALUE_LIST, offset)?,
        })
    }

    fn collect_subkey_offsets(&self, list: u32, depth: usize, out: &mut Vec<u32>) -> HiveResult<()> {
        let body = self.cell(list)?;
        let signature = slice(body, 0, 2, list)?;
        let count = read_u16(body, 2, list)? as usize;
        let entry_size = if signature == LF_SIGNATURE || signature == LH_SIGNATURE {
            8
        } else if signature == LI_SIGNATURE || signature == RI_SIGNATURE {
            4
        } else {
            return Err(corrupt(
                list,
                format!("unknown subkey list signature {:?}", String::from_utf8_lossy(signature)),
            ));
        };
        let entries = slice(body, 4, count * entry_size, list)?;
        for entry in entries.chunks_exact(entry_size) {
            let target = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            if signature == RI_SIGNATURE {
                if depth >= MAX_INDEX_DEPTH {
                    return Err(corrupt(list, "index root nested too deeply"));
                }
                self.collect_subkey_offsets(target, depth + 1, out)?;
            } else {
                out.push(target);
            }
        }
        Ok(())
    }

    fn value_headers(&self, key: &KeyNode) -> HiveResult<Vec<VkHeader>> {
        self.value_offsets(key)?
            .into_iter()
            .map(|offset| self.vk_header(offset))
            .collect()
    }

    fn vk_header(&self, offset: u32) -> HiveResult<VkHeader> {
        let body = self.cell(offset)?;
        if slice(body, 0, 2, offset)? != VK_SIGNATURE {
            return Err(corrupt(offset, "expected vk record"));
        }
        let name_length = read_u16(body, VK_NAME_LENGTH, offset)? as usize;
        let flags = read_u16(body, VK_FLAGS, offset)?;
        let name_bytes = slice(body, VK_NAME, name_length, offset)?;
        Ok(VkHeader {
            offset,
            name: decode_name(name_bytes, flags & VALUE_COMP_NAME != 0),
            value_type: read_u32(body, VK_TYPE, offset)?,
            raw_length: read_u32(body, VK_DATA_LENGTH, offset)?,
            data_offset: read_u32(body, VK_DATA_OFFSET, offset)?,
        })
    }

    fn value_data(&self, header: &VkHeader) -> HiveResult<Vec<u8>> {
        let length = (header.raw_length & !DATA_RESIDENT) as usize;
        if header.raw_length & DATA_RESIDENT != 0 {
            if length > 4 {
                return Err(corrupt(
                    header.offset,
                    format!("resident value '{}' claims {} bytes", header.name, length),
                ));
            }
            return Ok(header.data_offset.to_le_bytes()[..length].to_vec());
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        let body = self.cell(header.data_offset)?;
        if length > BIG_DATA_THRESHOLD && body.get(0..2) == Some(DB_SIGNATURE.as_slice()) {
            return self.big_data(header.data_offset, body, length);
        }
        Ok(slice(body, 0, length, header.data_offset)?.to_vec())
    }

    fn big_data(&self, offset: u32, body: &[u8], length: usize) -> HiveResult<Vec<u8>> {
        let segment_count = read_u16(body, 2, offset)? as usize;
        let segment_list = read_u32(body, 4, offset)?;
        let list = self.cell(segment_list)?;
        let entries = slice(list, 0, segment_count * 4, segment_list)?;
        let mut data = Vec::with_capacity(length);
        for entry in entries.chunks_exact(4) {
            let segment = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let chunk = self.cell(segment)?;
            let take = (length - data.len()).min(BIG_DATA_THRESHOLD).min(chunk.len());
            data.extend_from_slice(&chunk[..take]);
            if data.len() == length {
                break;
            }
        }
        if data.len() != length {
            return Err(corrupt(
                offset,
                format!("big data holds {} of {} bytes", data.len(), length),
            ));
        }
        Ok(data)
    }
}

/// Decode registry string data of the given type.
pub fn decode_string(value_type: u32, data: &[u8]) -> String {
    match value_type {
        REG_SZ | REG_EXPAND_SZ | REG_MULTI_SZ => decode_utf16le(data),
        _ => {
            let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
            String::from_utf8_lossy(&data[..end]).trim().to_string()
        }
    }
}

fn names_match(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right) || left.to_lowercase() == right.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{damage_key, HiveBuilder, KeySpec, ListKind};

    fn sample() -> Vec<u8> {
        HiveBuilder::new(
            KeySpec::new("ROOT")
                .key(
                    KeySpec::new("Select")
                        .dword("Current", 2)
                        .dword("Default", 2),
                )
                .key(
                    KeySpec::new("ControlSet002").key(
                        KeySpec::new("Services")
                            .key(KeySpec::new("BTHPORT").key(KeySpec::new("Parameters"))),
                    ),
                )
                .key(
                    KeySpec::new("Misc")
                        .binary("Blob", (1..=16).collect())
                        .binary("Tiny", vec![9, 8])
                        .string("Label", "Hello")
                        .binary("Utf8Name", b"Headset\0".to_vec()),
                ),
        )
        .build()
    }

    fn root_nk_position(bytes: &[u8]) -> usize {
        let root = u32::from_le_bytes(bytes[0x24..0x28].try_into().unwrap()) as usize;
        BASE_BLOCK_SIZE + root + 4
    }

    #[test]
    fn resolves_paths_case_insensitively() {
        let hive = Hive::from_bytes(sample()).unwrap();
        let node = hive
            .resolve(&["controlset002", "SERVICES", "bthport", "Parameters"])
            .unwrap();
        assert_eq!(node.name(), "Parameters");
        assert!(!hive.is_dirty());
    }

    #[test]
    fn missing_intermediate_key_is_path_not_found() {
        let hive = Hive::from_bytes(sample()).unwrap();
        let err = hive
            .resolve(&["ControlSet002", "Nope", "BTHPORT"])
            .unwrap_err();
        match err {
            HiveError::PathNotFound { path } => assert_eq!(path, "ControlSet002\\Nope\\BTHPORT"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn enumerates_subkeys_in_list_order() {
        let hive = Hive::from_bytes(sample()).unwrap();
        let root = hive.root().unwrap();
        assert_eq!(root.name(), "ROOT");
        assert_eq!(
            hive.subkeys(&root).unwrap(),
            vec!["Select", "ControlSet002", "Misc"]
        );
    }

    #[test]
    fn damaged_sibling_is_readable_one_offset_at_a_time() {
        let mut image = sample();
        assert!(damage_key(&mut image, "Select"));
        let hive = Hive::from_bytes(image).unwrap();
        let root = hive.root().unwrap();

        assert!(matches!(hive.subkey_nodes(&root), Err(HiveError::Corrupt { .. })));
        let offsets = hive.subkey_offsets(&root).unwrap();
        assert_eq!(offsets.len(), 3);
        let readable: Vec<String> = offsets
            .into_iter()
            .filter_map(|offset| hive.key_node_at(offset).ok())
            .map(|node| node.name().to_string())
            .collect();
        assert_eq!(readable, vec!["ControlSet002", "Misc"]);
    }

    #[test]
    fn reads_values_of_each_storage_kind() {
        let hive = Hive::from_bytes(sample()).unwrap();
        let misc = hive.resolve(&["Misc"]).unwrap();
        let blob = hive.value(&misc, "blob").unwrap().unwrap();
        assert_eq!(blob, (1..=16).collect::<Vec<u8>>());
        assert_eq!(hive.value(&misc, "Tiny").unwrap().unwrap(), vec![9, 8]);
        assert_eq!(hive.value_string(&misc, "Label").unwrap().unwrap(), "Hello");
        assert_eq!(hive.value_string(&misc, "Utf8Name").unwrap().unwrap(), "Headset");
        assert_eq!(hive.value(&misc, "Absent").unwrap(), None);
        assert_eq!(hive.value_offsets(&misc).unwrap().len(), 4);

        let select = hive.resolve(&["Select"]).unwrap();
        assert_eq!(hive.value_dword(&select, "Current").unwrap(), Some(2));
    }

    #[test]
    fn reads_big_data_values() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let bytes = HiveBuilder::new(KeySpec::new("ROOT").binary("Big", payload.clone())).build();
        let hive = Hive::from_bytes(bytes).unwrap();
        let root = hive.root().unwrap();
        assert_eq!(hive.value(&root, "Big").unwrap().unwrap(), payload);
    }

    #[test]
    fn follows_every_subkey_list_kind() {
        for kind in [ListKind::Lf, ListKind::Lh, ListKind::Li, ListKind::Ri] {
            let mut root = KeySpec::new("ROOT");
            for idx in 0..5 {
                root = root.key(KeySpec::new(&format!("Child{}", idx)));
            }
            let bytes = HiveBuilder::new(root).list_kind(kind).build();
            let hive = Hive::from_bytes(bytes).unwrap();
            let names = hive.subkeys(&hive.root().unwrap()).unwrap();
            assert_eq!(names.len(), 5, "{:?}", kind);
            assert_eq!(names[4], "Child4");
        }
    }

    #[test]
    fn rejects_bad_signature_and_truncation() {
        let mut bytes = sample();
        bytes[0] = b'x';
        assert!(matches!(Hive::from_bytes(bytes), Err(HiveError::Corrupt { .. })));

        let bytes = sample();
        let truncated = bytes[..bytes.len() - 4096].to_vec();
        assert!(matches!(Hive::from_bytes(truncated), Err(HiveError::Corrupt { .. })));

        assert!(matches!(Hive::from_bytes(vec![0; 100]), Err(HiveError::Corrupt { .. })));
    }

    #[test]
    fn root_offset_outside_data_is_corrupt() {
        let mut bytes = sample();
        bytes[0x24..0x28].copy_from_slice(&0x00FF_FFF0u32.to_le_bytes());
        assert!(matches!(Hive::from_bytes(bytes), Err(HiveError::Corrupt { .. })));
    }

    #[test]
    fn dangling_subkey_list_is_corrupt_not_empty() {
        let mut bytes = sample();
        let nk = root_nk_position(&bytes);
        bytes[nk + NK_SUBKEY_LIST..nk + NK_SUBKEY_LIST + 4]
            .copy_from_slice(&0x0FFF_0000u32.to_le_bytes());
        let hive = Hive::from_bytes(bytes).unwrap();
        let root = hive.root().unwrap();
        assert!(matches!(hive.subkeys(&root), Err(HiveError::Corrupt { .. })));
        assert!(matches!(
            hive.resolve(&["Select"]),
            Err(HiveError::Corrupt { .. })
        ));
    }

    #[test]
    fn subkey_count_mismatch_is_corrupt() {
        let mut bytes = sample();
        let nk = root_nk_position(&bytes);
        bytes[nk + NK_SUBKEY_COUNT..nk + NK_SUBKEY_COUNT + 4].copy_from_slice(&7u32.to_le_bytes());
        let hive = Hive::from_bytes(bytes).unwrap();
        assert!(matches!(
            hive.subkeys(&hive.root().unwrap()),
            Err(HiveError::Corrupt { .. })
        ));
    }

    #[test]
    fn dirty_hive_still_opens() {
        let mut bytes = sample();
        bytes[REGF_SEQUENCE_2..REGF_SEQUENCE_2 + 4].copy_from_slice(&9u32.to_le_bytes());
        let hive = Hive::from_bytes(bytes).unwrap();
        assert!(hive.is_dirty());
    }

    #[test]
    fn opens_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SYSTEM");
        std::fs::write(&path, sample()).unwrap();
        let hive = Hive::open(&path).unwrap();
        assert_eq!(hive.root().unwrap().name(), "ROOT");

        let missing = Hive::open(dir.path().join("nope"));
        assert!(matches!(missing, Err(HiveError::Io { .. })));
    }
}
