//! Per-run JSON summary (`run-<unix-ms>.json`).

use super::RunOutcome;
use crate::identity::ModuleVariant;
use crate::selector::SlotAssignment;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at_unix_ms: u64,
    pub finished_at_unix_ms: u64,
    pub variant: ModuleVariant,
    pub slots: SlotAssignment,
    /// Configured defaults the module is meant to come up with.
    pub hostname: Option<String>,
    pub account: Option<String>,
    pub dry_run: bool,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub log_path: Option<PathBuf>,
    pub diagnostics_path: Option<PathBuf>,
    pub flash_command: Option<String>,
}

impl RunReport {
    pub fn file_name(&self) -> String {
        format!("run-{}.json", self.started_at_unix_ms)
    }

    /// Write into `dir`, via a temporary file so a reader never sees half
    /// a report.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(self.file_name());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
