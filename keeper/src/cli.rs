//! # CLI Interface
//!
//! Defines the command-line argument structure for `haven-keeper` using
//! `clap` derive. Supports two subcommands: `simulate` and `version`.

use clap::{Parser, Subcommand};

/// Haven Custody settlement keeper.
///
/// Drives full async settlement cycles — deposit, freeze, callback,
/// retry — against an in-memory margin ledger, for exercising the custody
/// layer end to end without a live ledger deployment.
#[derive(Parser, Debug)]
#[command(
    name = "haven-keeper",
    about = "Haven Custody settlement keeper",
    version,
    propagate_version = true
)]
pub struct KeeperCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the keeper binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a full settlement cycle against an in-memory ledger and print
    /// the resulting state as JSON.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Vault owner identity used for the cycle.
    #[arg(long, env = "HAVEN_OWNER", default_value = "alice")]
    pub owner: String,

    /// Isolation-asset amount deposited into the vault.
    #[arg(long, default_value_t = 1_000)]
    pub deposit_amount: u64,

    /// Amount moved into the borrow position and later unwrapped.
    #[arg(long, default_value_t = 400)]
    pub unwrap_amount: u64,

    /// Supply cap (max-wei) of the isolation market. 0 means uncapped.
    #[arg(long, default_value_t = 0)]
    pub max_wei: u64,

    /// Break the first callback-time ledger batch to exercise the
    /// frozen-then-retry recovery path.
    #[arg(long)]
    pub halt_credit: bool,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "HAVEN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        KeeperCli::command().debug_assert();
    }
}
