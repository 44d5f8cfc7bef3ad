use crate::info::InfoFile;
use anyhow::{anyhow, bail, Context, Result};
use btsync_core::{now_utc_compact, MacAddress, WriteBackRecord};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_BLUETOOTH_DIR: &str = "/var/lib/bluetooth";

const INFO_FILE: &str = "info";
const INFO_TEMP_FILE: &str = "info.btsync.tmp";
const BACKUP_PREFIX: &str = "bluetooth_backup_";
// BlueZ: combination key, no PIN
const COMBINATION_KEY_TYPE: &str = "4";

/// BlueZ persistent storage: `<root>/<adapter>/<device>/info`.
#[derive(Debug, Clone)]
pub struct BluezStore {
    root: PathBuf,
}

impl BluezStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local adapters known to BlueZ.
    pub fn adapters(&self) -> Result<Vec<MacAddress>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read {}", self.root.display()))?;
        let mut adapters = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(address) = entry.file_name().to_string_lossy().parse::<MacAddress>() {
                adapters.push(address);
            }
        }
        adapters.sort();
        Ok(adapters)
    }

    /// Copy the whole store to `<backup_dir>/bluetooth_backup_<timestamp>`.
    ///
    /// Returns `None` when there is no store to back up.
    pub fn snapshot(&self, backup_dir: &Path) -> Result<Option<PathBuf>> {
        if !self.root.is_dir() {
            warn!("bluez: no store at {}, nothing to back up", self.root.display());
            return Ok(None);
        }
        fs::create_dir_all(backup_dir)
            .with_context(|| format!("create {}", backup_dir.display()))?;

        let stamp = now_utc_compact();
        let mut target = backup_dir.join(format!("{}{}", BACKUP_PREFIX, stamp));
        let mut suffix = 1;
        while target.exists() {
            target = backup_dir.join(format!("{}{}_{}", BACKUP_PREFIX, stamp, suffix));
            suffix += 1;
        }
        copy_tree(&self.root, &target)?;
        info!("bluez: store backed up to {}", target.display());
        Ok(Some(target))
    }

    /// Merge one link key into the device's `info` file, atomically.
    pub fn write(&self, record: &WriteBackRecord) -> Result<PathBuf> {
        let adapter_dir = self.root.join(record.adapter.to_string());
        if !adapter_dir.is_dir() {
            bail!("adapter {} not present on this host", record.adapter);
        }
        let device_dir = adapter_dir.join(record.device.to_string());
        if !device_dir.is_dir() {
            fs::DirBuilder::new()
                .mode(0o700)
                .create(&device_dir)
                .with_context(|| format!("create {}", device_dir.display()))?;
            debug!("bluez: created {}", device_dir.display());
        }

        let info_path = device_dir.join(INFO_FILE);
        let mut info = match fs::read_to_string(&info_path) {
            Ok(text) => InfoFile::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => InfoFile::default(),
            Err(err) => {
                return Err(anyhow!(err).context(format!("read {}", info_path.display())))
            }
        };
        if let Some(name) = record.name.as_deref().filter(|name| !name.is_empty()) {
            info.set_if_absent("General", "Name", name);
        }
        info.set_if_absent("General", "Trusted", "true");
        info.set_if_absent("General", "Blocked", "false");
        info.set("LinkKey", "Key", record.link_key.to_hex());
        info.set_if_absent("LinkKey", "Type", COMBINATION_KEY_TYPE);
        info.set_if_absent("LinkKey", "PINLength", "0");

        let temp_path = device_dir.join(INFO_TEMP_FILE);
        write_private(&temp_path, info.render().as_bytes())?;
        if let Err(err) = fs::rename(&temp_path, &info_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(anyhow!(err).context(format!("replace {}", info_path.display())));
        }
        info!(
            "bluez: {} on {} updated (key sha256:{})",
            record.device,
            record.adapter,
            record.link_key.fingerprint()
        );
        Ok(info_path)
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("write {}", path.display()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir(to).with_context(|| format!("create {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&source, &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(&source)?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("link {}", target.display()))?;
        } else {
            fs::copy(&source, &target)
                .with_context(|| format!("copy {}", source.display()))?;
        }
    }
    let permissions = fs::metadata(from)?.permissions();
    fs::set_permissions(to, permissions)?;
    Ok(())
}
