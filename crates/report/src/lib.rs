use anyhow::{Context, Result};
use btsync_core::{now_utc_rfc3339, SyncOutcome, REPORT_SCHEMA_VERSION};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub outcome_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: &'a str,
    created_at_utc: String,
    report_schema_version: &'a str,
    outcome: &'a str,
    exit_code: i32,
    summary: Vec<String>,
}

/// Write `<base>/reports/<run_id>/{outcome.json,run.json,logs.txt}`.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    outcome: &SyncOutcome,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let outcome_json = root.join("outcome.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    std::fs::write(&outcome_json, serde_json::to_string_pretty(outcome)?)
        .with_context(|| format!("write {}", outcome_json.display()))?;

    let run_meta = RunMetadata {
        run_id: &run_id,
        created_at_utc: now_utc_rfc3339(),
        report_schema_version: REPORT_SCHEMA_VERSION,
        outcome: outcome_name(outcome),
        exit_code: outcome.exit_code(),
        summary: outcome.summary_lines(),
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)
        .with_context(|| format!("write {}", run_json.display()))?;

    std::fs::write(&logs_path, logs.unwrap_or(""))
        .with_context(|| format!("write {}", logs_path.display()))?;

    Ok(ReportPaths {
        run_id,
        root,
        outcome_json,
        run_json,
        logs_path,
    })
}

fn outcome_name(outcome: &SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Success(_) => "success",
        SyncOutcome::NoWindowsFound => "no_windows_found",
        SyncOutcome::NothingToSync(_) => "nothing_to_sync",
        SyncOutcome::Failed(_) => "failed",
    }
}
