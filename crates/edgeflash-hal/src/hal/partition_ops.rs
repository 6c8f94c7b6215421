//! Partition table edits on the data disk.

use crate::HalResult;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct PartedOptions {
    pub dry_run: bool,
    pub confirmed: bool,
}

impl PartedOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self { dry_run, confirmed }
    }
}

/// One `parted -s` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartedOp {
    MkLabel {
        label: String,
    },
    MkPart {
        name: String,
        fs_type: String,
        start: String,
        end: String,
    },
    Print,
}

impl PartedOp {
    pub fn is_destructive(&self) -> bool {
        !matches!(self, PartedOp::Print)
    }

    /// Script arguments after `parted -s <disk>`.
    pub fn script(&self) -> Vec<&str> {
        match self {
            PartedOp::MkLabel { label } => vec!["mklabel", label],
            PartedOp::MkPart {
                name,
                fs_type,
                start,
                end,
            } => vec!["-a", "optimal", "mkpart", name, fs_type, start, end],
            PartedOp::Print => vec!["unit", "B", "print"],
        }
    }
}

pub trait PartitionOps {
    /// Run one `parted` operation against `disk` and return its stdout.
    fn parted(&self, disk: &Path, op: PartedOp, opts: &PartedOptions) -> HalResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkpart_script_is_optimally_aligned() {
        let op = PartedOp::MkPart {
            name: "data".into(),
            fs_type: "ext4".into(),
            start: "0%".into(),
            end: "100%".into(),
        };
        assert!(op.is_destructive());
        assert_eq!(
            op.script(),
            ["-a", "optimal", "mkpart", "data", "ext4", "0%", "100%"]
        );
        assert!(!PartedOp::Print.is_destructive());
    }
}
