use std::path::PathBuf;
use thiserror::Error;

pub type HalResult<T> = std::result::Result<T, HalError>;

#[derive(Error, Debug)]
pub enum HalError {
    /// A destructive call arrived without the caller's confirmation flag.
    #[error("refusing destructive operation without confirmation")]
    SafetyLock,

    #[error("device or mount point is busy")]
    DiskBusy,

    #[error("permission denied (edgeflash needs root for this)")]
    PermissionDenied,

    #[error("not a device: {0}")]
    NoSuchDevice(PathBuf),

    #[error("{0} is not installed")]
    CommandNotFound(String),

    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("walking {path}: {message}")]
    Walk { path: PathBuf, message: String },

    #[error("copy of {0} cancelled")]
    CopyCancelled(PathBuf),

    #[error("unreadable sysfs value: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("systemd: {0}")]
    Systemd(#[from] zbus::Error),
}
