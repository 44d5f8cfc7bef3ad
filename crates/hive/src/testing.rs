//! Synthetic hive images for tests.
//!
//! Writes just enough of the regf format for [`crate::Hive`] to read back:
//! one hbin, compressed (Latin-1) names, no security or class cells.

use crate::cell::*;
use crate::{REG_BINARY, REG_DWORD, REG_SZ};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Lf,
    Lh,
    Li,
    /// An `ri` index root splitting the children over two `li` lists.
    Ri,
}

#[derive(Debug, Clone)]
pub struct KeySpec {
    name: String,
    values: Vec<(String, u32, Vec<u8>)>,
    children: Vec<KeySpec>,
}

impl KeySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn key(mut self, child: KeySpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn value(mut self, name: impl Into<String>, value_type: u32, data: Vec<u8>) -> Self {
        self.values.push((name.into(), value_type, data));
        self
    }

    pub fn binary(self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.value(name, REG_BINARY, data)
    }

    pub fn dword(self, name: impl Into<String>, value: u32) -> Self {
        self.value(name, REG_DWORD, value.to_le_bytes().to_vec())
    }

    /// `REG_SZ`, UTF-16LE with a terminating NUL.
    pub fn string(self, name: impl Into<String>, value: &str) -> Self {
        let mut data: Vec<u8> = value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
        data.extend_from_slice(&[0, 0]);
        self.value(name, REG_SZ, data)
    }
}

pub struct HiveBuilder {
    root: KeySpec,
    list_kind: ListKind,
}

impl HiveBuilder {
    pub fn new(root: KeySpec) -> Self {
        Self {
            root,
            list_kind: ListKind::Lf,
        }
    }

    pub fn list_kind(mut self, kind: ListKind) -> Self {
        self.list_kind = kind;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut writer = CellWriter::new();
        let root = writer.write_key(&self.root, self.list_kind, true);
        let mut data = writer.finish();

        let hbin_size = data.len() as u32;
        data[4..8].copy_from_slice(&0u32.to_le_bytes());
        data[8..12].copy_from_slice(&hbin_size.to_le_bytes());

        let mut header = vec![0u8; BASE_BLOCK_SIZE];
        header[0..4].copy_from_slice(REGF_SIGNATURE);
        put_u32(&mut header, REGF_SEQUENCE_1, 1);
        put_u32(&mut header, REGF_SEQUENCE_2, 1);
        put_u32(&mut header, REGF_MAJOR_VERSION, 1);
        put_u32(&mut header, REGF_MINOR_VERSION, 5);
        put_u32(&mut header, REGF_ROOT_CELL, root);
        put_u32(&mut header, REGF_HIVE_LENGTH, hbin_size);
        let checksum = base_block_checksum(&header);
        put_u32(&mut header, REGF_CHECKSUM, checksum);

        header.extend_from_slice(&data);
        header
    }
}

/// Overwrite the signature of the key record named `name` so that reading
/// it fails. Returns false when no such record exists.
pub fn damage_key(image: &mut [u8], name: &str) -> bool {
    damage_record(image, name, NK_SIGNATURE, NK_NAME_LENGTH, NK_NAME)
}

/// Same as [`damage_key`] for a value record.
pub fn damage_value(image: &mut [u8], name: &str) -> bool {
    damage_record(image, name, VK_SIGNATURE, VK_NAME_LENGTH, VK_NAME)
}

fn damage_record(
    image: &mut [u8],
    name: &str,
    signature: &[u8; 2],
    length_at: usize,
    name_at: usize,
) -> bool {
    let name = latin1(name);
    for start in BASE_BLOCK_SIZE..image.len().saturating_sub(name_at + name.len()) {
        let name_start = start + name_at;
        if &image[start..start + 2] == signature
            && image[start + length_at..start + length_at + 2] == (name.len() as u16).to_le_bytes()
            && image[name_start..name_start + name.len()] == name[..]
        {
            image[start..start + 2].copy_from_slice(b"xx");
            return true;
        }
    }
    false
}

struct CellWriter {
    data: Vec<u8>,
}

impl CellWriter {
    fn new() -> Self {
        let mut data = vec![0u8; 0x20];
        data[0..4].copy_from_slice(HBIN_SIGNATURE);
        Self { data }
    }

    fn alloc(&mut self, body: &[u8]) -> u32 {
        let offset = self.data.len() as u32;
        let size = (4 + body.len() + 7) & !7;
        self.data.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.data.extend_from_slice(body);
        self.data.resize(offset as usize + size, 0);
        offset
    }

    fn finish(mut self) -> Vec<u8> {
        let used = self.data.len();
        let padded = ((used + 4095) / 4096) * 4096;
        if padded > used {
            let free = (padded - used) as i32;
            self.data.extend_from_slice(&free.to_le_bytes());
            self.data.resize(padded, 0);
        }
        self.data
    }

    fn write_key(&mut self, key: &KeySpec, list_kind: ListKind, is_root: bool) -> u32 {
        let value_list = if key.values.is_empty() {
            NO_CELL
        } else {
            let offsets: Vec<u32> = key
                .values
                .iter()
                .map(|(name, value_type, data)| self.write_value(name, *value_type, data))
                .collect();
            let body: Vec<u8> = offsets.iter().flat_map(|offset| offset.to_le_bytes()).collect();
            self.alloc(&body)
        };

        let children: Vec<u32> = key
            .children
            .iter()
            .map(|child| self.write_key(child, list_kind, false))
            .collect();
        let subkey_list = if children.is_empty() {
            NO_CELL
        } else {
            self.write_subkey_list(&children, list_kind)
        };

        let mut body = vec![0u8; NK_NAME];
        body[0..2].copy_from_slice(NK_SIGNATURE);
        let flags = if is_root {
            KEY_HIVE_ENTRY | KEY_COMP_NAME
        } else {
            KEY_COMP_NAME
        };
        body[NK_FLAGS..NK_FLAGS + 2].copy_from_slice(&flags.to_le_bytes());
        put_u32(&mut body, NK_SUBKEY_COUNT, children.len() as u32);
        put_u32(&mut body, NK_SUBKEY_LIST, subkey_list);
        put_u32(&mut body, NK_VALUE_COUNT, key.values.len() as u32);
        put_u32(&mut body, NK_VALUE_LIST, value_list);
        put_u32(&mut body, NK_SECURITY, NO_CELL);
        put_u32(&mut body, NK_CLASS_NAME, NO_CELL);
        let name = latin1(&key.name);
        body[NK_NAME_LENGTH..NK_NAME_LENGTH + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&name);
        self.alloc(&body)
    }

    fn write_subkey_list(&mut self, children: &[u32], kind: ListKind) -> u32 {
        match kind {
            ListKind::Lf | ListKind::Lh => {
                let signature = if kind == ListKind::Lf { LF_SIGNATURE } else { LH_SIGNATURE };
                let mut body = list_header(signature, children.len());
                for child in children {
                    body.extend_from_slice(&child.to_le_bytes());
                    body.extend_from_slice(&0u32.to_le_bytes());
                }
                self.alloc(&body)
            }
            ListKind::Li => {
                let mut body = list_header(LI_SIGNATURE, children.len());
                for child in children {
                    body.extend_from_slice(&child.to_le_bytes());
                }
                self.alloc(&body)
            }
            ListKind::Ri => {
                let split = (children.len() + 1) / 2;
                let leaves: Vec<u32> = children
                    .chunks(split.max(1))
                    .map(|chunk| self.write_subkey_list(chunk, ListKind::Li))
                    .collect();
                let mut body = list_header(RI_SIGNATURE, leaves.len());
                for leaf in leaves {
                    body.extend_from_slice(&leaf.to_le_bytes());
                }
                self.alloc(&body)
            }
        }
    }

    fn write_value(&mut self, name: &str, value_type: u32, data: &[u8]) -> u32 {
        let (raw_length, data_offset) = if data.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..data.len()].copy_from_slice(data);
            (data.len() as u32 | DATA_RESIDENT, u32::from_le_bytes(inline))
        } else if data.len() > BIG_DATA_THRESHOLD {
            (data.len() as u32, self.write_big_data(data))
        } else {
            (data.len() as u32, self.alloc(data))
        };

        let mut body = vec![0u8; VK_NAME];
        body[0..2].copy_from_slice(VK_SIGNATURE);
        let name = latin1(name);
        body[VK_NAME_LENGTH..VK_NAME_LENGTH + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        put_u32(&mut body, VK_DATA_LENGTH, raw_length);
        put_u32(&mut body, VK_DATA_OFFSET, data_offset);
        put_u32(&mut body, VK_TYPE, value_type);
        body[VK_FLAGS..VK_FLAGS + 2].copy_from_slice(&VALUE_COMP_NAME.to_le_bytes());
        body.extend_from_slice(&name);
        self.alloc(&body)
    }

    fn write_big_data(&mut self, data: &[u8]) -> u32 {
        let segments: Vec<u32> = data
            .chunks(BIG_DATA_THRESHOLD)
            .map(|chunk| self.alloc(chunk))
            .collect();
        let list: Vec<u8> = segments.iter().flat_map(|offset| offset.to_le_bytes()).collect();
        let list_offset = self.alloc(&list);
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(DB_SIGNATURE);
        body.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        body.extend_from_slice(&list_offset.to_le_bytes());
        self.alloc(&body)
    }
}

fn list_header(signature: &[u8; 2], count: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + count * 8);
    body.extend_from_slice(signature);
    body.extend_from_slice(&(count as u16).to_le_bytes());
    body
}

fn latin1(name: &str) -> Vec<u8> {
    name.chars().map(|ch| ch as u32 as u8).collect()
}

fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
