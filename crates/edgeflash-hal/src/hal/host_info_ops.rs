//! Host information (read-only).
//!
//! This is "world-touching" (reads `/proc`, `/etc`, state files) and belongs in the HAL.

use crate::HalResult;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsReleaseInfo {
    pub id: Option<String>,
    pub version_id: Option<String>,
}

pub trait HostInfoOps {
    fn os_release(&self) -> HalResult<OsReleaseInfo>;
    fn proc_mountinfo(&self) -> HalResult<String>;

    /// Raw bytes of the device-tree model node, if the platform has one.
    fn device_tree_model(&self) -> HalResult<Option<Vec<u8>>>;

    /// Contents of a small text file, `None` if it does not exist.
    fn read_text(&self, path: &Path) -> HalResult<Option<String>>;
}

/// Parses `os-release` content.
pub fn parse_os_release(content: &str) -> OsReleaseInfo {
    let mut info = OsReleaseInfo::default();
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            info.id = Some(value.trim().trim_matches('"').to_lowercase());
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            info.version_id = Some(value.trim().trim_matches('"').to_string());
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_os_release_extracts_id_and_version() {
        let release = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";
        let info = parse_os_release(release);
        assert_eq!(info.id.as_deref(), Some("ubuntu"));
        assert_eq!(info.version_id.as_deref(), Some("22.04"));
    }
}
