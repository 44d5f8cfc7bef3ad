use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer};
use std::process::Command;

const LSBLK_COLUMNS: &str = "NAME,PATH,FSTYPE,SIZE,TYPE,MOUNTPOINT,LABEL,PARTTYPE,PKNAME";

#[derive(Debug, Deserialize)]
struct Lsblk {
    blockdevices: Vec<BlockDev>,
}

#[derive(Debug, Deserialize)]
struct BlockDev {
    name: String,
    path: Option<String>,
    fstype: Option<String>,
    #[serde(default, deserialize_with = "size_field")]
    size: Option<u64>,
    #[serde(rename = "type")]
    dtype: String,
    mountpoint: Option<String>,
    label: Option<String>,
    parttype: Option<String>,
    pkname: Option<String>,
    #[serde(default)]
    children: Vec<BlockDev>,
}

/// One partition as listed by the OS, before any classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionRow {
    pub name: String,
    /// Device node, e.g. `/dev/sda3`.
    pub device: String,
    pub fstype: Option<String>,
    pub size_bytes: u64,
    pub label: Option<String>,
    pub parttype: Option<String>,
    pub parent: Option<String>,
    pub mount_points: Vec<String>,
}

// `-b` prints sizes as numbers on recent util-linux and as strings on older.
fn size_field<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }
    Ok(match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Number(value)) => Some(value),
        Some(Size::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

pub(crate) fn cmd_out(cmd: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("run {}", cmd))?;
    if !out.status.success() {
        return Err(anyhow!(
            "{} failed: {}",
            cmd,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

pub fn run_lsblk() -> Result<String> {
    cmd_out("lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS])
}

/// Partition rows from `lsblk -J` output, depth first in listing order.
pub fn parse_partitions(json: &str) -> Result<Vec<PartitionRow>> {
    let parsed: Lsblk = serde_json::from_str(json).context("parse lsblk JSON")?;
    let mut rows = Vec::new();
    for dev in parsed.blockdevices {
        collect(dev, &mut rows);
    }
    Ok(rows)
}

fn collect(dev: BlockDev, rows: &mut Vec<PartitionRow>) {
    let BlockDev {
        name,
        path,
        fstype,
        size,
        dtype,
        mountpoint,
        label,
        parttype,
        pkname,
        children,
    } = dev;
    if dtype == "part" {
        rows.push(PartitionRow {
            device: path.unwrap_or_else(|| format!("/dev/{}", name)),
            name,
            fstype: non_empty(fstype),
            size_bytes: size.unwrap_or(0),
            label: non_empty(label),
            parttype: non_empty(parttype),
            parent: non_empty(pkname),
            mount_points: non_empty(mountpoint).into_iter().collect(),
        });
    }
    for child in children {
        collect(child, rows);
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
