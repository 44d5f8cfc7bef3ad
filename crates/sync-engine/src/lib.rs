//! End-to-end sync run: find Windows, read its pairing keys, hand them to
//! BlueZ.

use btsync_bluez::{BluezStore, ServiceControl, ServiceGuard};
use btsync_bthport::Extraction;
use btsync_core::{
    PartitionCandidate, SkippedDevice, SyncError, SyncOutcome, SyncReport, SyncResult,
    SyncedDevice, WriteBackRecord,
};
use btsync_hive::{Hive, HiveError};
use btsync_host_linux::{MountHandle, PartitionMounter, Surveyor};
use btsync_safety::MountMode;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

pub mod config;
pub mod locate;

pub use config::{SelectionPolicy, SyncConfig};
use locate::{find_system_hive, has_windows_marker};

pub struct SyncOrchestrator {
    config: SyncConfig,
    surveyor: Arc<dyn Surveyor>,
    mounter: PartitionMounter,
    store: BluezStore,
    service: Box<dyn ServiceControl>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        surveyor: Arc<dyn Surveyor>,
        mounter: PartitionMounter,
        store: BluezStore,
        service: Box<dyn ServiceControl>,
    ) -> Self {
        Self {
            config,
            surveyor,
            mounter,
            store,
            service,
        }
    }

    pub fn run(&self) -> SyncOutcome {
        info!(
            "sync: starting (selection {:?}, dry run {})",
            self.config.selection, self.config.dry_run
        );
        let outcome = match self.try_run() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("sync: {}", err);
                SyncOutcome::Failed(err.to_string())
            }
        };
        info!("sync: finished with exit code {}", outcome.exit_code());
        outcome
    }

    fn try_run(&self) -> SyncResult<SyncOutcome> {
        let candidates = self.survey()?;
        if candidates.is_empty() {
            info!("sync: no NTFS or FAT32 partition found");
            return Ok(SyncOutcome::NoWindowsFound);
        }
        if self.config.selection == SelectionPolicy::RequireUnique {
            self.ensure_unique(&candidates)?;
        }
        for candidate in &candidates {
            if let Some(outcome) = self.try_candidate(candidate)? {
                return Ok(outcome);
            }
        }
        info!("sync: no candidate held a readable Windows registry");
        Ok(SyncOutcome::NoWindowsFound)
    }

    /// Run the survey on a worker thread so a hung device cannot stall the run.
    fn survey(&self) -> SyncResult<Vec<PartitionCandidate>> {
        let (tx, rx) = mpsc::channel();
        let surveyor = Arc::clone(&self.surveyor);
        thread::Builder::new()
            .name("btsync-survey".to_string())
            .spawn(move || {
                let _ = tx.send(surveyor.survey());
            })?;
        match rx.recv_timeout(self.config.survey_timeout()) {
            Ok(Ok(candidates)) => {
                info!("sync: {} candidate partition(s)", candidates.len());
                Ok(candidates)
            }
            Ok(Err(err)) => Err(SyncError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("block device survey failed: {:#}", err),
            ))),
            Err(RecvTimeoutError::Timeout) => Err(SyncError::SurveyTimeout {
                seconds: self.config.survey_timeout_secs,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::Io(io::Error::new(
                io::ErrorKind::Other,
                "block device survey stopped unexpectedly",
            ))),
        }
    }

    /// Mount `candidate` read-only; `None` when it can be skipped.
    fn mount(&self, candidate: &PartitionCandidate) -> SyncResult<Option<MountHandle>> {
        match self.mounter.mount(candidate, MountMode::ReadOnly) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                warn!("sync: skipping {}: {}", candidate.device, err);
                Ok(None)
            }
        }
    }

    fn ensure_unique(&self, candidates: &[PartitionCandidate]) -> SyncResult<()> {
        let mut holders = Vec::new();
        for candidate in candidates {
            let Some(handle) = self.mount(candidate)? else {
                continue;
            };
            if has_windows_marker(handle.path()) {
                holders.push(candidate.device.clone());
            }
            handle.release()?;
        }
        if holders.len() > 1 {
            return Err(SyncError::Ambiguous(holders.join(", ")));
        }
        Ok(())
    }

    fn try_candidate(&self, candidate: &PartitionCandidate) -> SyncResult<Option<SyncOutcome>> {
        let Some(handle) = self.mount(candidate)? else {
            return Ok(None);
        };
        if !has_windows_marker(handle.path()) {
            info!("sync: {} has no Windows directory", candidate.device);
            handle.release()?;
            return Ok(None);
        }

        let extraction = match read_extraction(&handle) {
            Ok(extraction) => extraction,
            Err(err) if err.is_candidate_local() => {
                warn!("sync: {}: {}", candidate.device, err);
                handle.release()?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        info!(
            "sync: {} holds {} adapter(s) and {} device(s) in {}",
            candidate.device,
            extraction.adapters.len(),
            extraction.device_count(),
            extraction.control_set
        );

        let mut report = SyncReport::from_adapters(&extraction.adapters);
        report.partition = Some(candidate.device.clone());
        report.control_set = Some(extraction.control_set.clone());
        report.dry_run = self.config.dry_run;

        let records = extraction.write_back_records();
        if records.is_empty() {
            handle.release()?;
            return Ok(Some(SyncOutcome::NothingToSync(report)));
        }

        if self.config.dry_run {
            report.written = records.iter().map(synced).collect();
        } else {
            self.write_back(&records, &mut report)?;
        }
        handle.release()?;
        Ok(Some(SyncOutcome::Success(report)))
    }

    fn write_back(&self, records: &[WriteBackRecord], report: &mut SyncReport) -> SyncResult<()> {
        let records = self.on_host_adapters(records, report);
        if records.is_empty() {
            warn!("sync: none of the Windows adapters exist on this host, nothing written");
            return Ok(());
        }

        let backup = self
            .store
            .snapshot(&self.config.backup_dir)
            .map_err(|err| SyncError::WriteBack(format!("backup failed: {:#}", err)))?;
        report.backup_path = backup.map(|path| path.display().to_string());

        let guard = ServiceGuard::stop(self.service.as_ref()).map_err(|err| {
            SyncError::WriteBack(format!("cannot stop bluetooth service: {:#}", err))
        })?;
        for record in &records {
            match self.store.write(record) {
                Ok(_) => report.written.push(synced(record)),
                Err(err) => {
                    warn!("sync: {} not written: {:#}", record.device, err);
                    report.skipped.push(SkippedDevice {
                        adapter: record.adapter,
                        device: record.device,
                        name: record.name.clone(),
                        reason: format!("{:#}", err),
                    });
                }
            }
        }
        if let Err(err) = guard.finish() {
            warn!("sync: bluetooth service did not restart: {:#}", err);
        }
        Ok(())
    }

    /// Records whose adapter has a BlueZ directory; the rest are reported as
    /// skipped. When the store cannot be listed every record is kept and the
    /// per-record write reports the problem.
    fn on_host_adapters(
        &self,
        records: &[WriteBackRecord],
        report: &mut SyncReport,
    ) -> Vec<WriteBackRecord> {
        let host = match self.store.adapters() {
            Ok(host) => host,
            Err(err) => {
                warn!("sync: cannot list BlueZ adapters: {:#}", err);
                return records.to_vec();
            }
        };
        let (present, absent): (Vec<_>, Vec<_>) = records
            .iter()
            .cloned()
            .partition(|record| host.contains(&record.adapter));
        for record in absent {
            warn!(
                "sync: adapter {} not present on this host, {} skipped",
                record.adapter, record.device
            );
            report.skipped.push(SkippedDevice {
                adapter: record.adapter,
                device: record.device,
                name: record.name,
                reason: format!("adapter {} not present on this host", record.adapter),
            });
        }
        present
    }
}

fn read_extraction(handle: &MountHandle) -> SyncResult<Extraction> {
    let hive_path = find_system_hive(handle.path()).ok_or_else(|| {
        SyncError::PathNotFound(locate::SYSTEM_HIVE_PATH.join("/"))
    })?;
    info!("sync: reading {}", hive_path.display());
    let hive = Hive::open(&hive_path).map_err(hive_error)?;
    if hive.is_dirty() {
        warn!(
            "sync: {} was not closed cleanly (fast startup?), recent pairings may be missing",
            handle.device()
        );
    }
    btsync_bthport::extract(&hive).map_err(hive_error)
}

fn hive_error(err: HiveError) -> SyncError {
    match err {
        HiveError::PathNotFound { path } => SyncError::PathNotFound(path),
        HiveError::Io { source, .. } => SyncError::Io(source),
        corrupt @ HiveError::Corrupt { .. } => SyncError::HiveCorrupt(corrupt.to_string()),
    }
}

fn synced(record: &WriteBackRecord) -> SyncedDevice {
    SyncedDevice {
        adapter: record.adapter,
        device: record.device,
        name: record.name.clone(),
        key_fingerprint: record.link_key.fingerprint(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use btsync_core::{Confidence, DetectionMethod, FsKind};
    use btsync_hive::testing::{HiveBuilder, KeySpec};
    use btsync_host_linux::MountBackend;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    const ADAPTER: &str = "AABBCCDDEEFF";

    struct FixedSurvey(Vec<PartitionCandidate>);

    impl Surveyor for FixedSurvey {
        fn survey(&self) -> Result<Vec<PartitionCandidate>> {
            Ok(self.0.clone())
        }
    }

    struct SlowSurvey;

    impl Surveyor for SlowSurvey {
        fn survey(&self) -> Result<Vec<PartitionCandidate>> {
            thread::sleep(Duration::from_secs(5));
            Ok(Vec::new())
        }
    }

    #[derive(Clone)]
    enum Volume {
        Empty,
        Windows(Vec<u8>),
        Unmountable,
    }

    /// Populates the mount point on mount and empties it on unmount.
    #[derive(Default)]
    struct FakeVolumes {
        volumes: HashMap<String, Volume>,
        attached: Mutex<HashMap<PathBuf, String>>,
        events: Mutex<Vec<String>>,
    }

    impl FakeVolumes {
        fn with(mut self, device: &str, volume: Volume) -> Self {
            self.volumes.insert(device.to_string(), volume);
            self
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MountBackend for FakeVolumes {
        fn mount(&self, device: &str, target: &Path, options: &str) -> Result<()> {
            assert!(options.starts_with("ro,"));
            self.events.lock().unwrap().push(format!("mount {}", device));
            match self.volumes.get(device) {
                Some(Volume::Windows(hive)) => {
                    let config = target.join("WINDOWS").join("System32").join("config");
                    fs::create_dir_all(&config)?;
                    fs::write(config.join("SYSTEM"), hive)?;
                }
                Some(Volume::Empty) => {
                    fs::create_dir_all(target.join("Users"))?;
                }
                Some(Volume::Unmountable) | None => return Err(anyhow!("wrong fs type")),
            }
            self.attached
                .lock()
                .unwrap()
                .insert(target.to_path_buf(), device.to_string());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            let device = self.attached.lock().unwrap().remove(target).unwrap_or_default();
            self.events.lock().unwrap().push(format!("umount {}", device));
            for entry in fs::read_dir(target)? {
                fs::remove_dir_all(entry?.path())?;
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct ServiceLog(Arc<Mutex<Vec<&'static str>>>);

    impl ServiceControl for ServiceLog {
        fn stop(&self) -> Result<()> {
            self.0.lock().unwrap().push("stop");
            Ok(())
        }

        fn start(&self) -> Result<()> {
            self.0.lock().unwrap().push("start");
            Ok(())
        }
    }

    struct Harness {
        temp: tempfile::TempDir,
        volumes: Arc<FakeVolumes>,
        service: ServiceLog,
        config: SyncConfig,
    }

    impl Harness {
        fn new(volumes: FakeVolumes) -> Self {
            let temp = tempfile::tempdir().unwrap();
            for dir in ["mnt", "backup"] {
                fs::create_dir_all(temp.path().join(dir)).unwrap();
            }
            fs::create_dir_all(temp.path().join("bluetooth").join("AA:BB:CC:DD:EE:FF")).unwrap();
            let config = SyncConfig {
                bluetooth_dir: temp.path().join("bluetooth"),
                backup_dir: temp.path().join("backup"),
                survey_timeout_secs: 1,
                ..SyncConfig::default()
            };
            Self {
                temp,
                volumes: Arc::new(volumes),
                service: ServiceLog::default(),
                config,
            }
        }

        fn run(&self, surveyor: impl Surveyor + 'static) -> SyncOutcome {
            let mounter = PartitionMounter::with_temp_root(
                self.volumes.clone(),
                self.temp.path().join("mnt"),
            );
            SyncOrchestrator::new(
                self.config.clone(),
                Arc::new(surveyor),
                mounter,
                BluezStore::new(&self.config.bluetooth_dir),
                Box::new(self.service.clone()),
            )
            .run()
        }

        fn mount_dirs_left(&self) -> usize {
            fs::read_dir(self.temp.path().join("mnt")).unwrap().count()
        }

        fn info(&self, device: &str) -> Option<String> {
            fs::read_to_string(
                self.config
                    .bluetooth_dir
                    .join("AA:BB:CC:DD:EE:FF")
                    .join(device)
                    .join("info"),
            )
            .ok()
        }
    }

    fn candidate(device: &str, order: usize) -> PartitionCandidate {
        PartitionCandidate {
            device: device.to_string(),
            kind: FsKind::Ntfs,
            method: DetectionMethod::ToolReportedType,
            confidence: Confidence::ToolReportedNtfs,
            order,
            size_bytes: 0,
            label: None,
            mount_points: Vec::new(),
        }
    }

    fn survey(devices: &[&str]) -> FixedSurvey {
        FixedSurvey(
            devices
                .iter()
                .enumerate()
                .map(|(order, device)| candidate(device, order))
                .collect(),
        )
    }

    fn system_hive(adapter: KeySpec) -> Vec<u8> {
        let root = KeySpec::new("ROOT").key(
            KeySpec::new("ControlSet001").key(
                KeySpec::new("Services").key(
                    KeySpec::new("BTHPORT")
                        .key(KeySpec::new("Parameters").key(KeySpec::new("Keys").key(adapter))),
                ),
            ),
        );
        HiveBuilder::new(root).build()
    }

    fn paired_hive() -> Vec<u8> {
        system_hive(
            KeySpec::new(ADAPTER)
                .key(KeySpec::new("112233445566").binary("LinkKey", (1..=16).collect()))
                .key(KeySpec::new("665544332211").binary("LinkKey", vec![1, 2, 3])),
        )
    }

    #[test]
    fn no_candidates_means_no_windows() {
        let harness = Harness::new(FakeVolumes::default());
        let outcome = harness.run(survey(&[]));
        assert_eq!(outcome, SyncOutcome::NoWindowsFound);
        assert_eq!(outcome.exit_code(), 2);
        assert!(harness.volumes.events().is_empty());
    }

    #[test]
    fn hive_without_keys_is_nothing_to_sync() {
        let volumes = FakeVolumes::default()
            .with("/dev/sda3", Volume::Windows(system_hive(KeySpec::new(ADAPTER))));
        let harness = Harness::new(volumes);
        let outcome = harness.run(survey(&["/dev/sda3"]));
        match &outcome {
            SyncOutcome::NothingToSync(report) => {
                assert_eq!(report.adapters_found, 1);
                assert_eq!(report.devices_found, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(harness.volumes.events(), vec!["mount /dev/sda3", "umount /dev/sda3"]);
        assert!(harness.service.0.lock().unwrap().is_empty());
        assert_eq!(harness.mount_dirs_left(), 0);
    }

    #[test]
    fn writes_valid_key_and_skips_malformed() {
        let volumes = FakeVolumes::default().with("/dev/sda3", Volume::Windows(paired_hive()));
        let harness = Harness::new(volumes);
        let outcome = harness.run(survey(&["/dev/sda3"]));

        let report = match &outcome {
            SyncOutcome::Success(report) => report,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(report.written_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].device.to_string(), "66:55:44:33:22:11");
        assert!(report.backup_path.is_some());
        assert_eq!(outcome.summary_lines()[0], "Synchronized 1 of 2 device(s).");

        let info = harness.info("11:22:33:44:55:66").unwrap();
        assert!(info.contains("Key=0102030405060708090A0B0C0D0E0F10"));
        assert!(harness.info("66:55:44:33:22:11").is_none());
        assert_eq!(*harness.service.0.lock().unwrap(), vec!["stop", "start"]);
        assert_eq!(harness.mount_dirs_left(), 0);
    }

    #[test]
    fn unmounts_first_candidate_before_mounting_second() {
        let volumes = FakeVolumes::default()
            .with("/dev/sda1", Volume::Empty)
            .with("/dev/sdb2", Volume::Windows(paired_hive()));
        let harness = Harness::new(volumes);
        let outcome = harness.run(survey(&["/dev/sda1", "/dev/sdb2"]));

        assert_eq!(
            outcome.report().unwrap().partition.as_deref(),
            Some("/dev/sdb2")
        );
        assert_eq!(
            harness.volumes.events(),
            vec!["mount /dev/sda1", "umount /dev/sda1", "mount /dev/sdb2", "umount /dev/sdb2"]
        );
    }

    #[test]
    fn reuses_partition_that_is_already_mounted() {
        let harness = Harness::new(FakeVolumes::default());
        let automount = harness.temp.path().join("media").join("Windows10");
        let config_dir = automount.join("Windows").join("System32").join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("SYSTEM"), paired_hive()).unwrap();
        let mut mounted = candidate("/dev/sda3", 0);
        mounted.mount_points = vec![automount.display().to_string()];

        let outcome = harness.run(FixedSurvey(vec![mounted]));
        assert_eq!(outcome.report().unwrap().written_count(), 1);
        assert!(harness.info("11:22:33:44:55:66").is_some());
        assert!(harness.volumes.events().is_empty());
        assert!(config_dir.join("SYSTEM").is_file());
        assert_eq!(harness.mount_dirs_left(), 0);
    }

    #[test]
    fn corrupt_hive_releases_mount_and_moves_on() {
        let volumes = FakeVolumes::default()
            .with("/dev/sda1", Volume::Unmountable)
            .with("/dev/sda2", Volume::Windows(b"regf but not really a hive".to_vec()));
        let harness = Harness::new(volumes);
        let outcome = harness.run(survey(&["/dev/sda1", "/dev/sda2"]));

        assert_eq!(outcome, SyncOutcome::NoWindowsFound);
        assert_eq!(
            harness.volumes.events(),
            vec!["mount /dev/sda1", "mount /dev/sda2", "umount /dev/sda2"]
        );
        assert_eq!(harness.mount_dirs_left(), 0);
    }

    #[test]
    fn require_unique_rejects_two_installations() {
        let volumes = FakeVolumes::default()
            .with("/dev/sda3", Volume::Windows(paired_hive()))
            .with("/dev/sdb3", Volume::Windows(paired_hive()));
        let mut harness = Harness::new(volumes);
        harness.config.selection = SelectionPolicy::RequireUnique;
        let outcome = harness.run(survey(&["/dev/sda3", "/dev/sdb3"]));

        match &outcome {
            SyncOutcome::Failed(reason) => assert!(reason.contains("/dev/sdb3")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert!(harness.info("11:22:33:44:55:66").is_none());
        assert_eq!(harness.mount_dirs_left(), 0);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let volumes = FakeVolumes::default().with("/dev/sda3", Volume::Windows(paired_hive()));
        let mut harness = Harness::new(volumes);
        harness.config.dry_run = true;
        let outcome = harness.run(survey(&["/dev/sda3"]));

        let report = outcome.report().unwrap();
        assert!(report.dry_run);
        assert_eq!(report.written_count(), 1);
        assert!(outcome.summary_lines()[0].starts_with("Would synchronize"));
        assert!(harness.info("11:22:33:44:55:66").is_none());
        assert!(harness.service.0.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_linux_adapter_becomes_skipped_entry() {
        let hive = system_hive(
            KeySpec::new("001122334455")
                .key(KeySpec::new("112233445566").binary("LinkKey", (1..=16).collect())),
        );
        let volumes = FakeVolumes::default().with("/dev/sda3", Volume::Windows(hive));
        let harness = Harness::new(volumes);
        let outcome = harness.run(survey(&["/dev/sda3"]));

        let report = outcome.report().unwrap();
        assert_eq!(report.written_count(), 0);
        assert!(report.skipped[0].reason.contains("not present on this host"));
        assert!(report.backup_path.is_none());
        assert!(harness.service.0.lock().unwrap().is_empty());
    }

    #[test]
    fn slow_survey_fails_the_run() {
        let harness = Harness::new(FakeVolumes::default());
        match harness.run(SlowSurvey) {
            SyncOutcome::Failed(reason) => assert!(reason.contains("did not finish")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
