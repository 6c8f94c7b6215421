use edgeflash_hal::HalError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for edgeflash operations
pub type Result<T> = anyhow::Result<T>;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_PRECONDITION: i32 = 2;
pub const EXIT_WATCHDOG: i32 = 3;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Hardware identity refusals. Every variant is a hard stop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no supported device present (is the module in recovery mode?)")]
    NoDevice,

    #[error("ambiguous: multiple supported devices present ({0}); attach exactly one")]
    Ambiguous(String),

    #[error("unsupported hardware: model is {0:?}")]
    Unsupported(String),

    #[error("hardware identity could not be read: {0}")]
    Unreadable(String),
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflicting network interface {0} is up; bring it down and retry")]
    ConflictingInterface(String),

    #[error("not enough space in {}: need {needed} bytes, {available} available", path.display())]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("target selection failed: {0}")]
    Selection(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Hal(#[from] HalError),
}

impl ProvisionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Hal(_) => EXIT_FAILURE,
            _ => EXIT_PRECONDITION,
        }
    }
}

/// First-boot failures. Each maps to its own process exit status so the
/// service supervisor (and whoever reads its journal) can tell them apart.
#[derive(Error, Debug)]
pub enum FirstBootError {
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    #[error("cannot resolve the disk backing /: {0}")]
    BootDiskUnresolved(String),

    #[error("expected at least two storage devices, found {found}")]
    TooFewDevices { found: usize },

    #[error("cannot pick the data disk: {0}")]
    DataDiskUnresolved(String),

    #[error("refusing to touch {0}: it already holds data outside partition 1")]
    ExistingData(String),

    #[error("partitioning failed: {0}")]
    PartitionFailed(String),

    #[error("formatting failed: {0}")]
    FormatFailed(String),

    #[error("cannot read filesystem UUID: {0}")]
    UuidUnreadable(String),

    #[error("cannot update mount table: {0}")]
    MountTable(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("cannot write completion marker: {0}")]
    Marker(String),

    #[error("{} is already claimed in the mount table by {claimed_by}; remove that line and re-run", mount_point.display())]
    MountPointClaimed { mount_point: PathBuf, claimed_by: String },
}

impl FirstBootError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FirstBootError::UnsupportedHardware(_) => 10,
            FirstBootError::BootDiskUnresolved(_) => 11,
            FirstBootError::TooFewDevices { .. } => 12,
            FirstBootError::DataDiskUnresolved(_) => 13,
            FirstBootError::ExistingData(_) => 14,
            FirstBootError::PartitionFailed(_) => 15,
            FirstBootError::FormatFailed(_) => 16,
            FirstBootError::UuidUnreadable(_) => 17,
            FirstBootError::MountTable(_) => 18,
            FirstBootError::MountFailed(_) => 19,
            FirstBootError::Marker(_) => 20,
            FirstBootError::MountPointClaimed { .. } => 21,
        }
    }
}

/// Exit status for an error that escaped to the binary.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<FirstBootError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ProvisionError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<IdentityError>().is_some() {
            return EXIT_PRECONDITION;
        }
    }
    EXIT_FAILURE
}
