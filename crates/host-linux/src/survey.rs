use crate::detect::{DetectorChain, DEFAULT_HEURISTIC_MIN_SIZE};
use crate::lsblk::{parse_partitions, run_lsblk, PartitionRow};
use crate::{is_virtual_device, read_mounts};
use anyhow::Result;
use btsync_core::{Confidence, PartitionCandidate, SyncError};
use tracing::{debug, info};

const SYSTEM_MOUNT_POINTS: [&str; 8] = [
    "/", "/boot", "/boot/efi", "/efi", "/home", "/usr", "/var", "[SWAP]",
];

/// Produces ranked partitions that might hold a Windows installation.
pub trait Surveyor: Send + Sync {
    fn survey(&self) -> Result<Vec<PartitionCandidate>>;
}

/// Where partition rows come from.
pub trait PartitionSource: Send + Sync {
    fn partitions(&self) -> Result<Vec<PartitionRow>>;
}

/// `lsblk` listing, completed with mount points from `/proc/self/mounts`.
pub struct LsblkSource;

impl PartitionSource for LsblkSource {
    fn partitions(&self) -> Result<Vec<PartitionRow>> {
        let mut rows = parse_partitions(&run_lsblk()?)?;
        let mounts = read_mounts();
        for row in &mut rows {
            if let Some(extra) = mounts.get(&row.name) {
                for mount in extra {
                    if !row.mount_points.contains(mount) {
                        row.mount_points.push(mount.clone());
                    }
                }
            }
        }
        Ok(rows)
    }
}

pub struct BlockDeviceSurveyor {
    source: Box<dyn PartitionSource>,
    chain: DetectorChain,
}

impl BlockDeviceSurveyor {
    pub fn new(heuristic_min_size_bytes: u64) -> Self {
        Self::with_parts(LsblkSource, DetectorChain::standard(heuristic_min_size_bytes))
    }

    pub fn with_parts(source: impl PartitionSource + 'static, chain: DetectorChain) -> Self {
        Self {
            source: Box::new(source),
            chain,
        }
    }

    /// Classify and rank rows. Never fails for a single partition.
    pub fn rank(&self, rows: &[PartitionRow]) -> Vec<PartitionCandidate> {
        let mut candidates = Vec::new();
        for (order, row) in rows.iter().enumerate() {
            if let Some(reason) = exclusion(row) {
                debug!("survey: skipping {}: {}", row.device, reason);
                continue;
            }
            let Some((kind, method)) = self.chain.classify(row) else {
                debug!("survey: {} has no recognisable filesystem", row.device);
                continue;
            };
            if !kind.is_windows_capable() {
                let rejected = SyncError::CandidateRejected {
                    device: row.device.clone(),
                    reason: format!("{} filesystem ({})", kind, method),
                };
                debug!("survey: {}", rejected);
                continue;
            }
            let confidence = Confidence::for_detection(method, &kind);
            info!(
                "survey: candidate {} {} via {} (rank {})",
                row.device,
                kind,
                method,
                confidence.rank()
            );
            candidates.push(PartitionCandidate {
                device: row.device.clone(),
                kind,
                method,
                confidence,
                order,
                size_bytes: row.size_bytes,
                label: row.label.clone(),
                mount_points: row.mount_points.clone(),
            });
        }
        candidates.sort_by_key(|candidate| (candidate.confidence, candidate.order));
        candidates
    }
}

impl Default for BlockDeviceSurveyor {
    fn default() -> Self {
        Self::new(DEFAULT_HEURISTIC_MIN_SIZE)
    }
}

impl Surveyor for BlockDeviceSurveyor {
    fn survey(&self) -> Result<Vec<PartitionCandidate>> {
        let rows = self.source.partitions()?;
        debug!("survey: {} partition(s) listed", rows.len());
        Ok(self.rank(&rows))
    }
}

fn exclusion(row: &PartitionRow) -> Option<String> {
    if is_virtual_device(&row.name) {
        return Some("virtual or optical device".to_string());
    }
    row.mount_points
        .iter()
        .find(|mount| SYSTEM_MOUNT_POINTS.contains(&mount.as_str()))
        .map(|mount| format!("mounted at {}", mount))
}
