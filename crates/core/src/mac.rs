use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth device address.
///
/// Windows stores addresses as bare hex (`aabbccddeeff`), BlueZ names its
/// directories in colon form (`AA:BB:CC:DD:EE:FF`). Both parse.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a MAC address: {0:?}")]
pub struct MacParseError(pub String);

impl MacAddress {
    /// Lower-case bare hex, the form used for registry key names.
    pub fn registry_form(&self) -> String {
        self.0.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits: String = value
            .trim()
            .chars()
            .filter(|ch| *ch != ':' && *ch != '-')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(MacParseError(value.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[idx * 2..idx * 2 + 2], 16)
                .map_err(|_| MacParseError(value.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_and_bluez_forms() {
        let bare: MacAddress = "aabbccddeeff".parse().unwrap();
        let colon: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let dash: MacAddress = "aa-bb-cc-dd-ee-ff".parse().unwrap();
        assert_eq!(bare, colon);
        assert_eq!(colon, dash);
        assert_eq!(bare.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(colon.registry_form(), "aabbccddeeff");
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!("aabbccddee".parse::<MacAddress>().is_err());
        assert!("aabbccddeeffaa".parse::<MacAddress>().is_err());
        assert!("ControlSet001".parse::<MacAddress>().is_err());
        assert!("zzbbccddeeff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn serializes_as_colon_string() {
        let mac: MacAddress = "112233445566".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"11:22:33:44:55:66\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
