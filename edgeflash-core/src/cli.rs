//! CLI argument parsing for edgeflash.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "edgeflash")]
#[command(about = "Provision Jetson Orin Nano modules and initialize their data storage")]
#[command(long_about = "Provision Jetson Orin Nano modules and initialize their data storage\n\n\
    On the provisioning host: `edgeflash flash` verifies the attached module, asks which\n\
    storage slot receives the OS and runs the vendor flash tool under a link watchdog.\n\
    On the module itself: `edgeflash firstboot` formats and mounts the data disk once.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: /etc/edgeflash/edgeflash.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run in dry-run mode (read-only steps only, no changes made)
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List storage devices and their roles
    List,

    /// Check that exactly one supported module is attached in recovery mode
    Identify,

    /// Run the dependency preflight only
    Preflight,

    /// Flash the base OS onto the attached module
    Flash {
        /// Storage slot that receives the OS (the other becomes DATA)
        #[arg(long)]
        os_slot: Option<String>,

        /// Take the OS slot from --os-slot or the config default without asking
        #[arg(long)]
        yes_slot: bool,
    },

    /// Write a prepared installer image onto a host device
    WriteMedium {
        /// Raw or .xz-compressed image
        #[arg(long)]
        image: PathBuf,
    },

    /// Initialize the data disk on first boot (runs on the module)
    Firstboot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_accepts_slot_flags() {
        let cli = Cli::try_parse_from([
            "edgeflash", "--dry-run", "flash", "--os-slot", "nvme1n1", "--yes-slot",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(
            cli.command,
            Command::Flash {
                os_slot: Some("nvme1n1".to_string()),
                yes_slot: true
            }
        );
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["edgeflash", "firstboot", "--config", "/tmp/e.toml", "-v"])
            .unwrap();
        assert_eq!(cli.command, Command::Firstboot);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/e.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn write_medium_requires_image() {
        assert!(Cli::try_parse_from(["edgeflash", "write-medium"]).is_err());
    }
}
