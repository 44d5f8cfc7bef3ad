//! Read-only attachment of a candidate partition.
//!
//! A [`MountHandle`] owns one temporary mount point. It is unmounted and its
//! directory removed exactly once: by [`MountHandle::release`], or by `Drop`
//! when the handle goes out of scope on any other path (early return, `?`,
//! unwinding panic).
//!
//! A partition that is already mounted elsewhere (a desktop automount under
//! `/media`) is not mounted a second time. The handle then borrows the
//! existing mount point and leaves it alone on release.

use crate::lsblk::cmd_out;
use anyhow::Result;
use btsync_core::{PartitionCandidate, SyncError};
use btsync_safety::{can_mount, MountMode, SafetyContext, SafetyDecision};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MOUNT_DIR_PREFIX: &str = "btsync_mount_";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{reason}")]
    WriteModeRejected { device: String, reason: String },

    #[error("mount of {device} failed: {message}")]
    Failed { device: String, message: String },

    #[error("cannot create mount point {}: {source}", path.display())]
    MountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unmount of {} failed: {message}", mount_point.display())]
    UnmountFailed { mount_point: PathBuf, message: String },
}

impl MountError {
    /// Errors that must end the run instead of moving to the next candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MountError::WriteModeRejected { .. } | MountError::UnmountFailed { .. }
        )
    }
}

impl From<MountError> for SyncError {
    fn from(err: MountError) -> Self {
        match err {
            MountError::WriteModeRejected { device, .. } => SyncError::WriteModeRejected { device },
            MountError::Failed { device, message } => SyncError::MountFailed { device, message },
            MountError::MountPoint { source, .. } => SyncError::Io(source),
            MountError::UnmountFailed {
                mount_point,
                message,
            } => SyncError::UnmountFailed {
                mount_point: mount_point.display().to_string(),
                message,
            },
        }
    }
}

/// The system calls behind mounting, replaceable in tests.
pub trait MountBackend: Send + Sync {
    fn mount(&self, device: &str, target: &Path, options: &str) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `mount(8)` / `umount(8)`.
pub struct SystemMount;

impl MountBackend for SystemMount {
    fn mount(&self, device: &str, target: &Path, options: &str) -> Result<()> {
        cmd_out(
            "mount",
            &["-o", options, device, target.to_string_lossy().as_ref()],
        )
        .map(|_| ())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        cmd_out("umount", &[target.to_string_lossy().as_ref()]).map(|_| ())
    }
}

pub struct PartitionMounter {
    backend: Arc<dyn MountBackend>,
    temp_root: PathBuf,
}

impl PartitionMounter {
    pub fn new(backend: Arc<dyn MountBackend>) -> Self {
        Self::with_temp_root(backend, std::env::temp_dir())
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemMount))
    }

    pub fn with_temp_root(backend: Arc<dyn MountBackend>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            temp_root: temp_root.into(),
        }
    }

    pub fn mount(
        &self,
        candidate: &PartitionCandidate,
        mode: MountMode,
    ) -> Result<MountHandle, MountError> {
        let ctx = SafetyContext {
            device: candidate.device.clone(),
            mode,
        };
        if let SafetyDecision::Deny(reason) = can_mount(&ctx) {
            return Err(MountError::WriteModeRejected {
                device: candidate.device.clone(),
                reason,
            });
        }

        if let Some(existing) = existing_mount(candidate) {
            info!(
                "mount: {} is already mounted at {}, reusing it",
                candidate.device,
                existing.display()
            );
            return Ok(MountHandle {
                device: candidate.device.clone(),
                mount_point: existing,
                attachment: Attachment::Existing,
                released: false,
            });
        }

        let mount_point = self
            .temp_root
            .join(format!("{}{}", MOUNT_DIR_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir(&mount_point).map_err(|source| MountError::MountPoint {
            path: mount_point.clone(),
            source,
        })?;

        if let Err(err) = self
            .backend
            .mount(&candidate.device, &mount_point, mode.options())
        {
            if let Err(cleanup) = fs::remove_dir(&mount_point) {
                warn!("mount: cannot remove {}: {}", mount_point.display(), cleanup);
            }
            return Err(MountError::Failed {
                device: candidate.device.clone(),
                message: err.to_string(),
            });
        }

        info!(
            "mount: {} attached {} at {}",
            candidate.device,
            mode,
            mount_point.display()
        );
        Ok(MountHandle {
            device: candidate.device.clone(),
            mount_point,
            attachment: Attachment::Owned(Arc::clone(&self.backend)),
            released: false,
        })
    }
}

fn existing_mount(candidate: &PartitionCandidate) -> Option<PathBuf> {
    candidate
        .mount_points
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_dir())
}

enum Attachment {
    /// Mounted by us; unmount and remove the directory on release.
    Owned(Arc<dyn MountBackend>),
    /// Someone else's mount; never touched.
    Existing,
}

pub struct MountHandle {
    device: String,
    mount_point: PathBuf,
    attachment: Attachment,
    released: bool,
}

impl MountHandle {
    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// True when the handle reuses a mount it did not create.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.attachment, Attachment::Existing)
    }

    pub fn release(mut self) -> Result<(), MountError> {
        self.released = true;
        self.detach()
    }

    fn detach(&self) -> Result<(), MountError> {
        let Attachment::Owned(backend) = &self.attachment else {
            debug!("mount: leaving {} mounted", self.mount_point.display());
            return Ok(());
        };
        backend
            .unmount(&self.mount_point)
            .map_err(|err| MountError::UnmountFailed {
                mount_point: self.mount_point.clone(),
                message: err.to_string(),
            })?;
        // remove_dir refuses non-empty directories, so a tree that is still
        // mounted is never deleted.
        fs::remove_dir(&self.mount_point).map_err(|err| MountError::UnmountFailed {
            mount_point: self.mount_point.clone(),
            message: format!("mount point not removed: {}", err),
        })?;
        debug!("mount: released {}", self.mount_point.display());
        Ok(())
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.detach() {
            warn!("mount: {} during cleanup of {}", err, self.device);
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("device", &self.device)
            .field("mount_point", &self.mount_point)
            .field("borrowed", &self.is_borrowed())
            .field("released", &self.released)
            .finish()
    }
}
