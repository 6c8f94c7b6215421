//! Short-lived external tools: package manager, `ip`, `journalctl`, overlay
//! VPN clients. The vendor flash tool itself is long-lived and is spawned by
//! the orchestrator, not through here.

use crate::HalResult;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

pub trait ProcessOps {
    /// Run `program` to completion and capture its output, whatever the
    /// exit status. Killed once `timeout` passes.
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output>;

    /// As above, but a non-zero exit becomes [`crate::HalError::CommandFailed`].
    fn command_status_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<()>;

    fn command_output(&self, program: &str, args: &[&str], timeout: Duration) -> HalResult<Output> {
        self.command_output_with_cwd(program, args, None, timeout)
    }

    fn command_status(&self, program: &str, args: &[&str], timeout: Duration) -> HalResult<()> {
        self.command_status_with_cwd(program, args, None, timeout)
    }
}
