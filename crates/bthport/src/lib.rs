//! Bluetooth pairing keys from an offline `SYSTEM` hive.
//!
//! Layout walked here:
//!
//! ```text
//! ControlSetNNN\Services\BTHPORT\Parameters
//!     Keys\<adapter>              one key per local radio
//!         <device>   (value)      16-byte link key, classic layout
//!         <device>\  (subkey)     LinkKey, Name, KeyType, ...
//!     Devices\<device>\Name       friendly name, UTF-8 binary
//! ```

use btsync_core::{
    AdapterRecord, DeviceRecord, KeySource, KeyStatus, MacAddress, WriteBackRecord,
};
use btsync_hive::{Hive, HiveError, HiveResult, KeyNode, ValueEntry, REG_BINARY};
use tracing::{debug, info, warn};

const CURRENT_CONTROL_SET: &str = "CurrentControlSet";
const BTHPORT: [&str; 2] = ["Services", "BTHPORT"];
const PARAMETERS: [&str; 3] = ["Services", "BTHPORT", "Parameters"];

const LINK_KEY_VALUE: &str = "LinkKey";
const NAME_VALUE: &str = "Name";
const CLASS_VALUES: [&str; 2] = ["COD", "ClassOfDevice"];
const KEY_TYPE_VALUES: [&str; 2] = ["KeyType", "AuthReq"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Name of the control set the keys were read from, e.g. `ControlSet001`.
    pub control_set: String,
    pub adapters: Vec<AdapterRecord>,
}

impl Extraction {
    pub fn device_count(&self) -> usize {
        self.adapters.iter().map(|adapter| adapter.devices.len()).sum()
    }

    pub fn write_back_records(&self) -> Vec<WriteBackRecord> {
        write_back_records(&self.adapters)
    }
}

/// Walk the hive from the control set down to every adapter and device.
///
/// Fails only when no control set carries a BTHPORT subtree or the hive is
/// corrupt above the adapter level. Problems inside one adapter or device
/// are logged and confined to that branch.
pub fn extract(hive: &Hive) -> HiveResult<Extraction> {
    let (control_set, parameters) = locate_parameters(hive)?;
    info!("bthport: using {}", control_set);

    let keys = match hive.resolve_from(&parameters, &["Keys"]) {
        Ok(keys) => keys,
        Err(err) if err.is_not_found() => {
            info!("bthport: no Keys subtree, Windows has no stored pairings");
            return Ok(Extraction {
                control_set,
                adapters: Vec::new(),
            });
        }
        Err(err) => return Err(err),
    };
    let devices_root = optional_child(hive, &parameters, "Devices");

    let mut adapters = Vec::new();
    for offset in hive.subkey_offsets(&keys)? {
        let adapter_node = match hive.key_node_at(offset) {
            Ok(node) => node,
            Err(err) => {
                warn!("bthport: skipping unreadable adapter key: {}", err);
                continue;
            }
        };
        let Ok(address) = adapter_node.name().parse::<MacAddress>() else {
            debug!("bthport: ignoring non-adapter key '{}'", adapter_node.name());
            continue;
        };
        let adapter = extract_adapter(hive, address, &adapter_node, devices_root.as_ref());
        info!(
            "bthport: adapter {} with {} device(s)",
            adapter.address,
            adapter.devices.len()
        );
        adapters.push(adapter);
    }
    Ok(Extraction {
        control_set,
        adapters,
    })
}

/// Records for every device that carries a usable link key.
pub fn write_back_records(adapters: &[AdapterRecord]) -> Vec<WriteBackRecord> {
    let mut records = Vec::new();
    for adapter in adapters {
        for device in adapter.writable_devices() {
            if let KeyStatus::Valid(link_key) = device.key {
                records.push(WriteBackRecord {
                    adapter: adapter.address,
                    device: device.address,
                    link_key,
                    name: device.name.clone(),
                });
            }
        }
    }
    records
}

/// Find `BTHPORT\Parameters`, trying the `CurrentControlSet` alias, then the
/// set named by `Select\Current`, then every numbered control set in order.
pub fn locate_parameters(hive: &Hive) -> HiveResult<(String, KeyNode)> {
    let root = hive.root()?;

    let mut tried = Vec::new();
    if let Some(found) = try_control_set(hive, &root, CURRENT_CONTROL_SET)? {
        return Ok(found);
    }
    tried.push(CURRENT_CONTROL_SET.to_string());

    if let Some(current) = selected_control_set(hive)? {
        let name = format!("ControlSet{:03}", current);
        if let Some(found) = try_control_set(hive, &root, &name)? {
            return Ok(found);
        }
        tried.push(name);
    }

    let mut numbered: Vec<(u32, String)> = hive
        .subkeys(&root)?
        .into_iter()
        .filter_map(|name| control_set_number(&name).map(|number| (number, name)))
        .collect();
    numbered.sort();
    for (_, name) in numbered {
        if tried.iter().any(|seen| seen.eq_ignore_ascii_case(&name)) {
            continue;
        }
        if let Some(found) = try_control_set(hive, &root, &name)? {
            return Ok(found);
        }
    }

    Err(HiveError::PathNotFound {
        path: "ControlSet*\\Services\\BTHPORT\\Parameters".to_string(),
    })
}

fn try_control_set(hive: &Hive, root: &KeyNode, name: &str) -> HiveResult<Option<(String, KeyNode)>> {
    let Some(control_set) = hive.subkey(root, name)? else {
        return Ok(None);
    };
    match hive.resolve_from(&control_set, &BTHPORT) {
        Ok(_) => {}
        Err(err) if err.is_not_found() => {
            debug!("bthport: {} has no BTHPORT service", control_set.name());
            return Ok(None);
        }
        Err(err) => return Err(err),
    }
    match hive.resolve_from(&control_set, &PARAMETERS) {
        Ok(parameters) => Ok(Some((control_set.name().to_string(), parameters))),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

fn selected_control_set(hive: &Hive) -> HiveResult<Option<u32>> {
    let select = match hive.resolve(&["Select"]) {
        Ok(select) => select,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    match hive.value_dword(&select, "Current") {
        Ok(current) => Ok(current),
        Err(err) => {
            warn!("bthport: unreadable Select\\Current: {}", err);
            Ok(None)
        }
    }
}

fn control_set_number(name: &str) -> Option<u32> {
    let prefix = name.get(..10)?;
    if !prefix.eq_ignore_ascii_case("ControlSet") {
        return None;
    }
    let digits = &name[10..];
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn optional_child(hive: &Hive, parent: &KeyNode, name: &str) -> Option<KeyNode> {
    match hive.subkey(parent, name) {
        Ok(child) => child,
        Err(err) => {
            warn!("bthport: cannot read {}\\{}: {}", parent.name(), name, err);
            None
        }
    }
}

fn extract_adapter(
    hive: &Hive,
    address: MacAddress,
    node: &KeyNode,
    devices_root: Option<&KeyNode>,
) -> AdapterRecord {
    let mut devices: Vec<DeviceRecord> = Vec::new();

    match hive.subkey_offsets(node) {
        Ok(offsets) => {
            for offset in offsets {
                let child = match hive.key_node_at(offset) {
                    Ok(child) => child,
                    Err(err) => {
                        warn!("bthport: skipping unreadable device key under {}: {}", address, err);
                        continue;
                    }
                };
                let Ok(device) = child.name().parse::<MacAddress>() else {
                    debug!("bthport: ignoring key '{}' under adapter {}", child.name(), address);
                    continue;
                };
                devices.push(device_from_subkey(hive, device, &child, devices_root));
            }
        }
        Err(err) => warn!("bthport: device keys of adapter {} unreadable: {}", address, err),
    }

    match hive.value_offsets(node) {
        Ok(offsets) => {
            for offset in offsets {
                let entry = match hive.value_entry_at(offset) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("bthport: skipping unreadable value under {}: {}", address, err);
                        continue;
                    }
                };
                let Ok(device) = entry.name.parse::<MacAddress>() else {
                    continue;
                };
                if devices.iter().any(|known| known.address == device) {
                    continue;
                }
                if let Some(record) = device_from_value(hive, device, &entry, devices_root) {
                    devices.push(record);
                }
            }
        }
        Err(err) => warn!("bthport: device values of adapter {} unreadable: {}", address, err),
    }

    AdapterRecord { address, devices }
}

fn device_from_subkey(
    hive: &Hive,
    address: MacAddress,
    node: &KeyNode,
    devices_root: Option<&KeyNode>,
) -> DeviceRecord {
    let key = match hive.value(node, LINK_KEY_VALUE) {
        Ok(raw) => KeyStatus::decode(raw.as_deref()),
        Err(err) => {
            warn!("bthport: LinkKey of {} unreadable: {}", address, err);
            KeyStatus::Missing
        }
    };
    log_key(address, &key);

    let name = match hive.value_string(node, NAME_VALUE) {
        Ok(Some(name)) if !name.is_empty() => Some(name),
        _ => friendly_name(hive, devices_root, address),
    };

    DeviceRecord {
        address,
        name,
        key,
        device_class: first_dword(hive, node, &CLASS_VALUES)
            .or_else(|| device_info_dword(hive, devices_root, address, &CLASS_VALUES)),
        key_type: first_dword(hive, node, &KEY_TYPE_VALUES),
        source: KeySource::Subkey,
    }
}

fn device_from_value(
    hive: &Hive,
    address: MacAddress,
    entry: &ValueEntry,
    devices_root: Option<&KeyNode>,
) -> Option<DeviceRecord> {
    if entry.value_type != REG_BINARY {
        debug!(
            "bthport: value {} has type {}, not a link key",
            entry.name, entry.value_type
        );
        return None;
    }
    let key = KeyStatus::decode(Some(&entry.data));
    log_key(address, &key);
    Some(DeviceRecord {
        address,
        name: friendly_name(hive, devices_root, address),
        key,
        device_class: device_info_dword(hive, devices_root, address, &CLASS_VALUES),
        key_type: None,
        source: KeySource::Value,
    })
}

fn log_key(address: MacAddress, key: &KeyStatus) {
    match key {
        KeyStatus::Valid(link_key) => {
            debug!("bthport: device {} key sha256:{}", address, link_key.fingerprint())
        }
        KeyStatus::Missing => debug!("bthport: device {} has no LinkKey", address),
        KeyStatus::Malformed { len } => {
            warn!("bthport: device {} LinkKey has {} bytes", address, len)
        }
    }
}

fn device_info(hive: &Hive, devices_root: Option<&KeyNode>, address: MacAddress) -> Option<KeyNode> {
    let root = devices_root?;
    hive.subkey(root, &address.registry_form()).ok().flatten()
}

fn friendly_name(hive: &Hive, devices_root: Option<&KeyNode>, address: MacAddress) -> Option<String> {
    let info = device_info(hive, devices_root, address)?;
    hive.value_string(&info, NAME_VALUE)
        .ok()
        .flatten()
        .filter(|name| !name.is_empty())
}

fn device_info_dword(
    hive: &Hive,
    devices_root: Option<&KeyNode>,
    address: MacAddress,
    names: &[&str],
) -> Option<u32> {
    let info = device_info(hive, devices_root, address)?;
    first_dword(hive, &info, names)
}

fn first_dword(hive: &Hive, node: &KeyNode, names: &[&str]) -> Option<u32> {
    names
        .iter()
        .find_map(|name| hive.value_dword(node, name).ok().flatten())
}
