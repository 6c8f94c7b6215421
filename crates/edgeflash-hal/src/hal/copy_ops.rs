//! Toolkit tree copies onto local scratch.

use crate::HalResult;
use std::path::Path;

/// Bytes moved so far out of the total measured before the copy started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyProgress {
    pub done: u64,
    pub total: u64,
}

impl CopyProgress {
    /// Completed tenths, 0..=10. An empty tree counts as complete.
    pub fn deciles(&self) -> u64 {
        if self.total == 0 {
            10
        } else {
            self.done.min(self.total) * 10 / self.total
        }
    }
}

pub trait CopyOps {
    /// Copy `src` into `dst`, keeping file modes and recreating symlinks as
    /// links. The flashing scripts rely on both.
    ///
    /// `on_progress` runs after each regular file; returning `false` stops
    /// the copy with [`crate::HalError::CopyCancelled`].
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()>;

    /// Total size in bytes of all regular files under `path`.
    fn tree_size(&self, path: &Path) -> HalResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deciles_round_down_and_cap() {
        assert_eq!(CopyProgress { done: 0, total: 100 }.deciles(), 0);
        assert_eq!(CopyProgress { done: 59, total: 100 }.deciles(), 5);
        assert_eq!(CopyProgress { done: 200, total: 100 }.deciles(), 10);
        assert_eq!(CopyProgress::default().deciles(), 10);
    }
}
