//! Master command line.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use swarmpi_proto::MASTER_RPC_PORT;

use crate::app::AppConfig;
use crate::persist;

/// Flags for the `swarmpi-master` binary. Flag spellings match the original
/// deployment scripts (`--termSize=2000 --reset`).
#[derive(Debug, Clone, Parser)]
#[command(name = "swarmpi-master", version, about = "Coordinates BBP π workers")]
pub struct Cli {
    /// Initial number of terms per job.
    #[arg(
        long = "termSize",
        env = "SWARMPI_TERM_SIZE",
        default_value_t = AppConfig::DEFAULT_TERM_SIZE
    )]
    pub term_size: u64,

    /// Wipe the state file before starting.
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    /// Human-readable logging (`--logs=false` leaves warnings only).
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub logs: bool,

    /// Shrink the term size when jobs run long (`--reduceTermSize=false` to pin it).
    #[arg(
        long = "reduceTermSize",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub reduce_term_size: bool,

    /// TCP port workers dial.
    #[arg(long = "rpc-port", env = "SWARMPI_RPC_PORT", default_value_t = MASTER_RPC_PORT)]
    pub rpc_port: u16,

    /// Dashboard HTTP port.
    #[arg(long = "http-port", env = "SWARMPI_HTTP_PORT", default_value_t = 80)]
    pub http_port: u16,

    /// Ledger state file.
    #[arg(long = "state-file", env = "SWARMPI_STATE_FILE", default_value = persist::STATE_FILE)]
    pub state_file: PathBuf,
}

impl Cli {
    /// Lower the flags into the app configuration.
    pub fn into_config(self) -> AppConfig {
        AppConfig {
            term_size: self.term_size.max(1),
            reset: self.reset,
            shrink_term_size: self.reduce_term_size,
            rpc_port: self.rpc_port,
            http_port: Some(self.http_port),
            state_path: self.state_file,
            ..AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = Cli::parse_from(["swarmpi-master"]);
        assert_eq!(cli.term_size, 5_000);
        assert!(!cli.reset);
        assert!(cli.logs);
        assert!(cli.reduce_term_size);
        assert_eq!(cli.rpc_port, 9999);
        assert_eq!(cli.http_port, 80);
        assert_eq!(cli.state_file, PathBuf::from("calc.state"));
    }

    #[test]
    fn boolean_flags_accept_both_spellings() {
        let cli = Cli::parse_from(["swarmpi-master", "--logs=false", "--reduceTermSize", "false"]);
        assert!(!cli.logs);
        assert!(!cli.reduce_term_size);

        let cli = Cli::parse_from(["swarmpi-master", "--logs", "--reduceTermSize"]);
        assert!(cli.logs);
        assert!(cli.reduce_term_size);
    }

    #[test]
    fn term_size_zero_is_clamped() {
        let cli = Cli::parse_from(["swarmpi-master", "--termSize=0"]);
        assert_eq!(cli.into_config().term_size, 1);
    }
}
