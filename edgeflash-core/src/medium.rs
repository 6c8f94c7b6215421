//! Installer medium writing.
//!
//! Streams a prepared installer image (raw or `.xz`) onto a host device the
//! operator picked and confirmed through the target selector.

use crate::errors::ProvisionError;
use crate::selector::SelectionResult;
use anyhow::{Context, Result};
use edgeflash_hal::{FlashOptions, ProvisionHal};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumWrite {
    pub device: PathBuf,
    pub image: PathBuf,
    /// Mount points released before writing, deepest first.
    pub unmounted: Vec<PathBuf>,
}

fn is_compressed(image: &Path) -> bool {
    image.extension().is_some_and(|e| e == "xz")
}

/// Deepest mount points first, so nested mounts come off before their parents.
fn unmount_order(mut points: Vec<PathBuf>) -> Vec<PathBuf> {
    points.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    points
}

/// Write `image` to the confirmed device. Consumes the selection, so one
/// confirmation covers exactly one write.
pub fn write_medium<H: ProvisionHal + ?Sized>(
    hal: &H,
    selection: SelectionResult,
    image: &Path,
    dry_run: bool,
) -> Result<MediumWrite> {
    let SelectionResult {
        device,
        alias,
        token: _confirmed,
    } = selection;

    let meta = fs::metadata(image)
        .map_err(|e| ProvisionError::Precondition(format!("image {}: {e}", image.display())))?;
    if !meta.is_file() {
        return Err(ProvisionError::Precondition(format!("{} is not a file", image.display())).into());
    }

    // The device node may have been renumbered since the operator confirmed.
    if let Some(alias) = &alias {
        let now = hal
            .resolve_device(alias)
            .with_context(|| format!("Failed to resolve {}", alias.display()))?;
        if now != device {
            return Err(ProvisionError::Selection(format!(
                "{} now points at {}, not the confirmed {}",
                alias.display(),
                now.display(),
                device.display()
            ))
            .into());
        }
    }

    let size = hal
        .block_devices()
        .context("Failed to list block devices")?
        .into_iter()
        .find(|d| d.dev_path == device)
        .map(|d| d.size_bytes)
        .ok_or_else(|| ProvisionError::Selection(format!("{} is gone", device.display())))?;
    if !is_compressed(image) && meta.len() > size {
        return Err(ProvisionError::Precondition(format!(
            "image is {} bytes but {} holds only {size}",
            meta.len(),
            device.display()
        ))
        .into());
    }

    let points = unmount_order(
        hal.mountpoints_on(&device)
            .with_context(|| format!("Failed to read mounts of {}", device.display()))?,
    );
    for point in &points {
        log::info!("Unmounting {}", point.display());
        hal.unmount(point, dry_run)
            .with_context(|| format!("Failed to unmount {}", point.display()))?;
    }

    if !dry_run {
        hal.sync().context("sync before write failed")?;
    }
    log::info!(
        "Writing {}{} -> {}",
        image.display(),
        if is_compressed(image) { " (xz)" } else { "" },
        device.display()
    );
    hal.flash_raw_image(image, &device, &FlashOptions::new(dry_run, true))
        .with_context(|| format!("Failed to write {}", device.display()))?;
    if !dry_run {
        hal.sync().context("sync after write failed")?;
        log::info!("Medium written: {}", device.display());
    }

    Ok(MediumWrite {
        device,
        image: image.to_path_buf(),
        unmounted: points,
    })
}
