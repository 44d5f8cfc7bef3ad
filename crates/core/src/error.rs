use thiserror::Error;

/// Failure categories of a sync run.
///
/// Only `SurveyTimeout`, `UnmountFailed`, `WriteModeRejected` and `Ambiguous`
/// end a run. The rest are local to one candidate, adapter or device.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{device} rejected: {reason}")]
    CandidateRejected { device: String, reason: String },

    #[error("mount of {device} failed: {message}")]
    MountFailed { device: String, message: String },

    #[error("unmount of {mount_point} failed: {message}")]
    UnmountFailed { mount_point: String, message: String },

    #[error("refusing to mount {device} read-write")]
    WriteModeRejected { device: String },

    #[error("registry hive is corrupt: {0}")]
    HiveCorrupt(String),

    #[error("registry path not found: {0}")]
    PathNotFound(String),

    #[error("LinkKey for {device} is malformed: {reason}")]
    KeyMalformed { device: String, reason: String },

    #[error("block device survey did not finish within {seconds}s")]
    SurveyTimeout { seconds: u64 },

    #[error("more than one partition holds a Windows installation: {0}")]
    Ambiguous(String),

    #[error("write-back failed: {0}")]
    WriteBack(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the orchestrator may move on to the next candidate.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            SyncError::CandidateRejected { .. }
                | SyncError::MountFailed { .. }
                | SyncError::HiveCorrupt(_)
                | SyncError::PathNotFound(_)
                | SyncError::Io(_)
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_level_errors_are_not_candidate_local() {
        assert!(!SyncError::SurveyTimeout { seconds: 5 }.is_candidate_local());
        assert!(!SyncError::UnmountFailed {
            mount_point: "/tmp/x".into(),
            message: "busy".into()
        }
        .is_candidate_local());
        assert!(SyncError::MountFailed {
            device: "/dev/sda2".into(),
            message: "wrong fs type".into()
        }
        .is_candidate_local());
    }

    #[test]
    fn messages_name_the_device() {
        let err = SyncError::WriteModeRejected { device: "/dev/sda3".into() };
        assert!(err.to_string().contains("/dev/sda3"));
    }
}
