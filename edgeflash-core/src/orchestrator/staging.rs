//! Local staging of the flash toolkit.
//!
//! Every run copies the toolkit directory (or extracts the toolkit archive)
//! into an empty stage on local scratch and runs the flash tool there, so
//! signed images and generated configs from a failed run never reach the
//! next one. A toolkit on removable USB media also keeps the flash traffic
//! off that bus this way. The stage is removed when the [`StagedToolkit`] is
//! dropped, and any stage a killed run left behind is removed first.

use super::preflight::{check_toolkit_dir, is_archive, toolkit_file};
use crate::config::{FlashConfig, StagingPolicy};
use crate::errors::ProvisionError;
use anyhow::{Context, Result};
use edgeflash_hal::procfs::mountinfo;
use edgeflash_hal::{CopyOps, HostInfoOps, ProbeOps, ProcessOps, SystemOps};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STAGE_DIR_NAME: &str = "edgeflash-stage";
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Extracted size estimate for compressed archives, as a multiple of the
/// archive size.
const COMPRESSED_EXPANSION: u64 = 3;

#[derive(Debug)]
pub struct StagedToolkit {
    /// Toolkit directory the flash command runs in.
    pub dir: PathBuf,
    /// Stage owned by this run, removed on drop.
    stage: Option<PathBuf>,
}

impl StagedToolkit {
    pub fn in_place(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stage: None,
        }
    }

    pub fn is_staged(&self) -> bool {
        self.stage.is_some()
    }
}

impl Drop for StagedToolkit {
    fn drop(&mut self) {
        if let Some(stage) = self.stage.take() {
            match fs::remove_dir_all(&stage) {
                Ok(()) => log::info!("Removed staged toolkit {}", stage.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {e}", stage.display()),
            }
        }
    }
}

/// Whether `path` lives on a USB-attached or removable disk. Any probe
/// failure answers `false`.
pub fn on_removable_usb<H: ProbeOps + HostInfoOps + ?Sized>(hal: &H, path: &Path) -> bool {
    let probe = || -> Option<bool> {
        let content = hal.proc_mountinfo().ok()?;
        let entries = mountinfo::parse_mountinfo(&content);
        let source = &mountinfo::mount_containing(&entries, path)?.source;
        if !source.starts_with('/') {
            return Some(false);
        }
        let device = hal.resolve_device(Path::new(source)).ok()?;
        let disk = hal.parent_disk(&device).ok()?.unwrap_or(device);
        let info = hal
            .block_devices()
            .ok()?
            .into_iter()
            .find(|d| d.dev_path == disk)?;
        Some(info.transport.is_usb() || info.removable)
    };
    probe().unwrap_or(false)
}

fn ensure_space<H: SystemOps + ?Sized>(hal: &H, scratch: &Path, needed: u64) -> Result<()> {
    let available = hal
        .free_bytes(scratch)
        .with_context(|| format!("Failed to query free space in {}", scratch.display()))?;
    // 10% headroom for the flash tool's own temporaries.
    let wanted = needed.saturating_add(needed / 10);
    if available < wanted {
        return Err(ProvisionError::InsufficientSpace {
            path: scratch.to_path_buf(),
            needed: wanted,
            available,
        }
        .into());
    }
    Ok(())
}

fn fresh_stage(scratch: &Path) -> Result<PathBuf> {
    let stage = scratch.join(STAGE_DIR_NAME);
    if stage.exists() {
        log::info!("Removing stale stage {}", stage.display());
        fs::remove_dir_all(&stage)
            .with_context(|| format!("Failed to remove stale stage {}", stage.display()))?;
    }
    fs::create_dir_all(&stage)
        .with_context(|| format!("Failed to create stage {}", stage.display()))?;
    Ok(stage)
}

/// Directory inside an extracted archive that holds the flash command:
/// the stage itself, or its single top-level directory.
fn extracted_root(stage: &Path, cfg: &FlashConfig) -> Result<PathBuf> {
    if toolkit_file(stage, &cfg.command).exists() {
        return Ok(stage.to_path_buf());
    }
    let dirs: Vec<PathBuf> = fs::read_dir(stage)
        .with_context(|| format!("Failed to read {}", stage.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [one] => Ok(one.clone()),
        _ => Err(ProvisionError::Precondition(format!(
            "archive {} does not contain {}",
            cfg.toolkit.display(),
            cfg.command
        ))
        .into()),
    }
}

/// Prepare the toolkit directory for this run. Only
/// [`StagingPolicy::Never`] runs a toolkit directory in place.
pub fn prepare<H>(hal: &H, cfg: &FlashConfig, dry_run: bool) -> Result<StagedToolkit>
where
    H: CopyOps + SystemOps + ProbeOps + HostInfoOps + ProcessOps + ?Sized,
{
    let source = &cfg.toolkit;
    let scratch = &cfg.scratch_dir;

    if is_archive(source) {
        let archive_len = fs::metadata(source)
            .with_context(|| format!("Failed to stat {}", source.display()))?
            .len();
        let compressed = !source.to_string_lossy().to_ascii_lowercase().ends_with(".tar");
        let needed = if compressed {
            archive_len.saturating_mul(COMPRESSED_EXPANSION)
        } else {
            archive_len
        };
        ensure_space(hal, scratch, needed)?;
        if dry_run {
            log::info!(
                "DRY RUN: extract {} into {}",
                source.display(),
                scratch.join(STAGE_DIR_NAME).display()
            );
            return Ok(StagedToolkit::in_place(&scratch.join(STAGE_DIR_NAME)));
        }

        let stage = fresh_stage(scratch)?;
        let mut staged = StagedToolkit {
            dir: stage.clone(),
            stage: Some(stage.clone()),
        };
        log::info!("Extracting {} into {}", source.display(), stage.display());
        let src = source.to_string_lossy().into_owned();
        let dst = stage.to_string_lossy().into_owned();
        hal.command_status("tar", &["-xf", src.as_str(), "-C", dst.as_str()], EXTRACT_TIMEOUT)
            .with_context(|| format!("Failed to extract {}", source.display()))?;
        staged.dir = extracted_root(&stage, cfg)?;
        check_toolkit_dir(&staged.dir, cfg)?;
        return Ok(staged);
    }

    if cfg.staging == StagingPolicy::Never {
        log::warn!(
            "Staging disabled; running the toolkit in place at {} with whatever earlier runs left there",
            source.display()
        );
        return Ok(StagedToolkit::in_place(source));
    }
    if on_removable_usb(hal, source) {
        log::info!("{} is on removable USB media", source.display());
    }

    let needed = hal
        .tree_size(source)
        .with_context(|| format!("Failed to size {}", source.display()))?;
    ensure_space(hal, scratch, needed)?;
    let name = source.file_name().unwrap_or(std::ffi::OsStr::new("toolkit"));
    if dry_run {
        let dir = scratch.join(STAGE_DIR_NAME).join(name);
        log::info!("DRY RUN: stage {} ({} bytes) into {}", source.display(), needed, dir.display());
        return Ok(StagedToolkit::in_place(&dir));
    }

    let stage = fresh_stage(scratch)?;
    let dir = stage.join(name);
    let staged = StagedToolkit {
        dir: dir.clone(),
        stage: Some(stage),
    };
    log::info!("Staging toolkit {} -> {}", source.display(), dir.display());
    let mut last_decile = 0;
    hal.copy_tree(source, &dir, &mut |p| {
        let decile = p.deciles();
        if decile > last_decile {
            last_decile = decile;
            log::info!("Staging {}%", decile * 10);
        }
        true
    })
    .with_context(|| format!("Failed to stage {}", source.display()))?;
    Ok(staged)
}
