use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "nanny")]
#[command(about = "Reconciliation daemons for OpenStack on vSphere", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, global = true, env = "NANNY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that override the configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Seconds between cycles.
    #[arg(long, global = true)]
    pub interval: Option<u64>,

    /// Consecutive sightings before a fault is repaired.
    #[arg(long, global = true)]
    pub iterations: Option<u32>,

    /// Log what would be done without mutating anything.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Maximum repairs per fault kind and cycle.
    #[arg(long, global = true)]
    pub fix_limit: Option<u32>,

    #[arg(long, global = true)]
    pub metrics_port: Option<u16>,

    /// Run a single cycle and exit.
    #[arg(long, global = true)]
    pub once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Volume state and attachment consistency across compute, storage and vSphere.
    Volume,
    /// Soft-delete integrity of the OpenStack databases.
    Integrity,
    /// vSphere objects no OpenStack record accounts for.
    Vcenter,
    /// Datastore and aggregate occupancy balancing.
    StorageBalance,
    /// Big-VM memory balancing and settings.
    Bigvm,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Volume => "volume",
            Command::Integrity => "integrity",
            Command::Vcenter => "vcenter",
            Command::StorageBalance => "storage_balance",
            Command::Bigvm => "bigvm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["nanny", "storage-balance"]).unwrap();
        assert_eq!(cli.command, Command::StorageBalance);
        assert_eq!(cli.command.name(), "storage_balance");
        assert!(cli.config.is_none());
        assert!(!cli.run.once);
    }

    #[test]
    fn test_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "nanny",
            "volume",
            "--config",
            "/etc/nanny/volume.toml",
            "--dry-run",
            "--fix-limit",
            "5",
            "--iterations",
            "2",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.command, Command::Volume);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nanny/volume.toml")));
        assert!(cli.run.dry_run);
        assert_eq!(cli.run.fix_limit, Some(5));
        assert_eq!(cli.run.iterations, Some(2));
        assert!(cli.run.once);
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["nanny", "cinder"]).is_err());
        assert!(Cli::try_parse_from(["nanny"]).is_err());
    }
}
