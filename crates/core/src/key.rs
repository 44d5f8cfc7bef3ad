use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a BR/EDR link key in bytes.
pub const LINK_KEY_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkKey([u8; LINK_KEY_LEN]);

impl LinkKey {
    /// Returns `None` unless `bytes` is exactly [`LINK_KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; LINK_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; LINK_KEY_LEN] {
        &self.0
    }

    /// Upper-case hex, the form BlueZ keeps in `[LinkKey] Key=`.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(LINK_KEY_LEN * 2);
        for byte in &self.0 {
            out.push_str(&format!("{:02X}", byte));
        }
        out
    }

    /// First 8 hex digits of the SHA-256 of the key. Safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest[..4].iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkKey(sha256:{}..)", self.fingerprint())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Valid(LinkKey),
    Missing,
    Malformed { len: usize },
}

impl KeyStatus {
    pub fn decode(raw: Option<&[u8]>) -> Self {
        match raw {
            None => KeyStatus::Missing,
            Some(bytes) => match LinkKey::from_bytes(bytes) {
                Some(key) => KeyStatus::Valid(key),
                None => KeyStatus::Malformed { len: bytes.len() },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_exact_length_only() {
        let bytes: Vec<u8> = (1..=16).collect();
        match KeyStatus::decode(Some(&bytes)) {
            KeyStatus::Valid(key) => assert_eq!(key.as_bytes().as_slice(), bytes.as_slice()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            KeyStatus::decode(Some(&bytes[..15])),
            KeyStatus::Malformed { len: 15 }
        );
        assert_eq!(KeyStatus::decode(None), KeyStatus::Missing);
    }

    #[test]
    fn hex_is_upper_case() {
        let bytes: Vec<u8> = (1..=16).collect();
        let key = LinkKey::from_bytes(&bytes).unwrap();
        assert_eq!(key.to_hex(), "0102030405060708090A0B0C0D0E0F10");
    }

    #[test]
    fn debug_hides_key_bytes() {
        let key = LinkKey::from_bytes(&[0xAB; 16]).unwrap();
        let shown = format!("{:?}", key);
        assert!(!shown.contains("AB"));
        assert!(!shown.to_lowercase().contains("abab"));
        assert_eq!(key.fingerprint().len(), 8);
    }
}
