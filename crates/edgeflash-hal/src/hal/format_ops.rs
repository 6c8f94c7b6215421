//! Creating the data volume's filesystem.

use crate::HalResult;
use std::path::Path;

pub trait FormatOps {
    /// `mkfs.ext4 -F -L <label>` on a partition the caller has proven empty.
    fn format_ext4(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub dry_run: bool,
    /// The caller checked the partition carries no filesystem.
    pub confirmed: bool,
}

impl FormatOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self { dry_run, confirmed }
    }
}
