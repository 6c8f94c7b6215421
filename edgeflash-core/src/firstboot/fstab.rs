//! Persisted mount-table entry for the data volume.
//!
//! The entry is keyed by filesystem UUID and preceded by a marker comment
//! naming the volume label. Only an active line whose source is this
//! volume's `UUID=` or `LABEL=` counts as present; the comment is for
//! whoever edits the table by hand.

use edgeflash_hal::{HalResult, HostInfoOps, SystemOps};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct FstabEntry<'a> {
    pub label: &'a str,
    pub uuid: &'a str,
    pub mount_point: &'a Path,
    pub fs_type: &'a str,
    pub options: &'a str,
}

impl FstabEntry<'_> {
    pub fn marker(&self) -> String {
        format!("# edgeflash: data volume LABEL={}", self.label)
    }

    pub fn line(&self) -> String {
        format!(
            "UUID={}  {}  {}  {}  0  2",
            self.uuid,
            self.mount_point.display(),
            self.fs_type,
            self.options
        )
    }

    /// Sources that name this volume.
    pub fn sources(&self) -> [String; 2] {
        [format!("UUID={}", self.uuid), format!("LABEL={}", self.label)]
    }

    pub fn present_in(&self, content: &str) -> bool {
        let sources = self.sources();
        active_entries(content).any(|(source, _)| sources.iter().any(|s| s == source))
    }
}

/// `(source, mount point)` of every line that is not blank or a comment.
fn active_entries(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        Some((fields.next()?, fields.next()?))
    })
}

/// Source of the first active line that mounts something other than
/// `accepted` at `mount_point`.
pub fn foreign_claim(content: &str, mount_point: &Path, accepted: &[String]) -> Option<String> {
    let mount_point = mount_point.to_string_lossy();
    active_entries(content)
        .find(|(source, target)| {
            target.trim_end_matches('/') == mount_point.trim_end_matches('/')
                && !accepted.iter().any(|a| a == source)
        })
        .map(|(source, _)| source.to_string())
}

/// The table at `path`; a missing file reads as empty.
pub fn read_table<H: HostInfoOps + ?Sized>(hal: &H, path: &Path) -> HalResult<String> {
    Ok(hal.read_text(path)?.unwrap_or_default())
}

/// Append `entry` to the table at `path` unless `content` (its current text)
/// already has it. Returns whether an append was made, or would be in a dry run.
pub fn ensure_entry<H: SystemOps + ?Sized>(
    hal: &H,
    path: &Path,
    content: &str,
    entry: &FstabEntry<'_>,
    dry_run: bool,
) -> HalResult<bool> {
    if entry.present_in(content) {
        log::info!("{} already has an entry for {}", path.display(), entry.mount_point.display());
        return Ok(false);
    }

    let mut text = String::new();
    if !content.is_empty() && !content.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&entry.marker());
    text.push('\n');
    text.push_str(&entry.line());
    text.push('\n');
    hal.append_text(path, &text, dry_run)?;
    if !dry_run {
        log::info!("Added {} to {}", entry.mount_point.display(), path.display());
    }
    Ok(true)
}
