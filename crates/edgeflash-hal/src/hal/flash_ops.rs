//! Installer image writes onto removable media.

use crate::HalResult;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct FlashOptions {
    pub dry_run: bool,
    /// The target came out of a confirmed selection.
    pub confirmed: bool,
}

impl FlashOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self { dry_run, confirmed }
    }
}

pub trait FlashOps {
    /// Stream `image_path` onto `target_disk` from offset zero, then fsync.
    /// A `.xz` image is decompressed on the fly.
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target_disk: &Path,
        opts: &FlashOptions,
    ) -> HalResult<()>;
}
