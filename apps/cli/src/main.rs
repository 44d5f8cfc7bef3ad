use anyhow::{Context, Result};
use btsync_bluez::{BluezStore, ServiceControl, Systemd, Unmanaged};
use btsync_core::{AdapterRecord, KeyStatus};
use btsync_hive::Hive;
use btsync_host_linux::{BlockDeviceSurveyor, PartitionMounter, Surveyor};
use btsync_report::create_report_bundle;
use btsync_safety::{require_root, SafetyDecision};
use btsync_sync_engine::{SelectionPolicy, SyncConfig, SyncOrchestrator};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "bt_sync.log";

#[derive(Parser)]
#[command(
    name = "bt-sync",
    version,
    about = "Copy Bluetooth pairing keys from a Windows installation into BlueZ"
)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log file; defaults to the first writable of /tmp, $HOME and the working directory.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Find Windows, read its link keys and write them into BlueZ (default).
    Sync(SyncArgs),
    /// Print ranked candidate partitions as JSON.
    Survey {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the adapters and devices stored in a SYSTEM hive file.
    Inspect {
        #[arg(long)]
        hive: PathBuf,
    },
}

#[derive(Args, Default)]
struct SyncArgs {
    /// Report what would be written without touching BlueZ.
    #[arg(long)]
    dry_run: bool,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a report bundle under this directory.
    #[arg(long)]
    report_base: Option<PathBuf>,

    /// Fail when more than one partition carries a Windows directory.
    #[arg(long)]
    require_unique: bool,

    /// Seconds allowed for the block device survey.
    #[arg(long)]
    survey_timeout: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    let log = init_logging(cli.verbose, cli.log_file.as_deref());
    let code = match run(cli.command.unwrap_or(Command::Sync(SyncArgs::default())), log.as_ref()) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{:#}", err);
            eprintln!("error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}

fn run(command: Command, log: Option<&LogFile>) -> Result<i32> {
    match command {
        Command::Sync(args) => run_sync(args, log),
        Command::Survey { config } => {
            let config = load_config(config.as_deref())?;
            let candidates = BlockDeviceSurveyor::new(config.heuristic_min_size_bytes).survey()?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
            Ok(0)
        }
        Command::Inspect { hive } => {
            let hive = Hive::open(&hive)?;
            let extraction = btsync_bthport::extract(&hive)?;
            let view = json!({
                "control_set": extraction.control_set,
                "adapters": extraction.adapters.iter().map(adapter_view).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(0)
        }
    }
}

fn run_sync(args: SyncArgs, log: Option<&LogFile>) -> Result<i32> {
    let mut config = load_config(args.config.as_deref())?;
    if args.dry_run {
        config.dry_run = true;
    }
    if args.require_unique {
        config.selection = SelectionPolicy::RequireUnique;
    }
    if let Some(seconds) = args.survey_timeout {
        config.survey_timeout_secs = seconds;
    }
    if args.report_base.is_some() {
        config.report_base = args.report_base;
    }
    config.validate()?;

    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if let SafetyDecision::Deny(reason) = require_root(euid) {
        eprintln!("{}", reason);
        return Ok(1);
    }

    let service: Box<dyn ServiceControl> = if config.manage_service {
        Box::new(Systemd::new(config.service_unit.clone()))
    } else {
        Box::new(Unmanaged)
    };
    let orchestrator = SyncOrchestrator::new(
        config.clone(),
        Arc::new(BlockDeviceSurveyor::new(config.heuristic_min_size_bytes)),
        PartitionMounter::system(),
        BluezStore::new(&config.bluetooth_dir),
        service,
    );
    let outcome = orchestrator.run();
    for line in outcome.summary_lines() {
        println!("{}", line);
    }
    if let Some(backup) = outcome.report().and_then(|report| report.backup_path.as_ref()) {
        println!("Backup of the previous BlueZ configuration: {}", backup);
    }

    if let Some(base) = &config.report_base {
        let logs = log.and_then(|log| log.read_since_start().ok());
        let paths = create_report_bundle(base, &outcome, logs.as_deref())?;
        println!("report: {}", paths.root.display());
    }
    Ok(outcome.exit_code())
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path),
        None => Ok(SyncConfig::default()),
    }
}

fn adapter_view(adapter: &AdapterRecord) -> Value {
    let devices: Vec<Value> = adapter
        .devices
        .iter()
        .map(|device| {
            let key = match &device.key {
                KeyStatus::Valid(key) => format!("valid (sha256:{})", key.fingerprint()),
                KeyStatus::Missing => "missing".to_string(),
                KeyStatus::Malformed { len } => format!("malformed ({} bytes)", len),
            };
            json!({
                "address": device.address,
                "name": device.name,
                "key": key,
                "source": device.source,
                "device_class": device.device_class,
                "key_type": device.key_type,
            })
        })
        .collect();
    json!({ "address": adapter.address, "devices": devices })
}

/// The log file of this run and where this run's lines begin.
struct LogFile {
    path: PathBuf,
    start: u64,
}

impl LogFile {
    fn read_since_start(&self) -> Result<String> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.start))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Ok(text)
    }
}

fn log_file_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = vec![std::env::temp_dir().join(LOG_FILE_NAME)];
    if let Some(home) = std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        candidates.push(PathBuf::from(home).join(LOG_FILE_NAME));
    }
    candidates.push(PathBuf::from(LOG_FILE_NAME));
    candidates
}

fn open_log_file(explicit: Option<&Path>) -> Option<(File, LogFile)> {
    log_file_candidates(explicit).into_iter().find_map(|path| {
        let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
        let start = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Some((file, LogFile { path, start }))
    })
}

fn init_logging(verbose: bool, explicit: Option<&Path>) -> Option<LogFile> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let opened = open_log_file(explicit);
    let (file_layer, log) = match opened {
        Some((file, log)) => (
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            ),
            Some(log),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    match &log {
        Some(log) => tracing::info!("logging to {}", log.path.display()),
        None => tracing::warn!("no writable log file location, logging to stderr only"),
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_sync_flags() {
        let cli = Cli::try_parse_from([
            "bt-sync",
            "--verbose",
            "sync",
            "--dry-run",
            "--require-unique",
            "--survey-timeout",
            "5",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Command::Sync(args)) => {
                assert!(args.dry_run);
                assert!(args.require_unique);
                assert_eq!(args.survey_timeout, Some(5));
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn sync_is_the_default_action() {
        let cli = Cli::try_parse_from(["bt-sync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn inspect_requires_hive() {
        assert!(Cli::try_parse_from(["bt-sync", "inspect"]).is_err());
    }

    #[test]
    fn explicit_log_file_wins() {
        let path = PathBuf::from("/var/log/custom.log");
        assert_eq!(log_file_candidates(Some(path.as_path())), vec![path.clone()]);
        let defaults = log_file_candidates(None);
        assert!(defaults[0].ends_with(LOG_FILE_NAME));
        assert_eq!(defaults.last(), Some(&PathBuf::from(LOG_FILE_NAME)));
    }

    #[test]
    fn reads_only_this_runs_log_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bt_sync.log");
        std::fs::write(&path, "old run\n").unwrap();
        let (mut file, log) = open_log_file(Some(path.as_path())).unwrap();
        writeln!(file, "new run").unwrap();
        assert_eq!(log.read_since_start().unwrap(), "new run\n");
    }
}
