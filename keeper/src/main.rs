// Copyright (c) 2026 Haven Labs. MIT License.
// See LICENSE for details.

//! # Haven Settlement Keeper
//!
//! Entry point for the `haven-keeper` binary. Parses CLI arguments,
//! initializes logging, and drives a full async settlement cycle against
//! an in-memory margin ledger: deposit, borrow position, initiate unwrap,
//! settlement callback, and — when fault injection is requested — the
//! frozen-then-retry recovery path.
//!
//! The binary supports two subcommands:
//!
//! - `simulate` — run a settlement cycle and print a JSON report
//! - `version`  — print build version information

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use serde::Serialize;

use haven_custody::ledger::{AccountRef, InMemoryLedger, MarginLedger, SharedLedger};
use haven_custody::{
    CallbackOutcome, HandlerRegistry, LiquidatorWhitelist, ReceivedInfo, UnwrapperTrader,
    VaultFactory, WrapperTrader,
};

use cli::{Commands, KeeperCli, SimulateArgs};
use logging::LogFormat;

/// Governance identity owning the registry and the factory.
const GOVERNANCE: &str = "haven-governance";
/// Callback-invoking handler identity.
const HANDLER: &str = "keeper-1";
/// Trade-executor identity on the simulated ledger.
const EXECUTOR: &str = "trade-executor";
/// Payment-asset market on the simulated ledger.
const USDC_MARKET: u32 = 1;
/// Isolation-asset market the vaults custody.
const ISO_MARKET: u32 = 2;
/// Oracle price of the isolation asset, in USDC smallest units.
const ISO_PRICE: u64 = 4;

fn main() -> Result<()> {
    let cli = KeeperCli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// JSON report printed to stdout after a simulation cycle.
#[derive(Debug, Serialize)]
struct SimulationReport {
    vault: String,
    owner: String,
    settlement_key: String,
    callback_outcome: String,
    retried: bool,
    account_frozen_after: bool,
    pending_after: i128,
    default_account_iso: i128,
    borrow_account_iso: i128,
    borrow_account_usdc: i128,
}

/// Runs one full settlement cycle against a freshly wired custody stack.
fn simulate(args: SimulateArgs) -> Result<()> {
    logging::init_logging(
        "haven_keeper=info,haven_custody=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        owner = %args.owner,
        deposit = args.deposit_amount,
        unwrap = args.unwrap_amount,
        halt_credit = args.halt_credit,
        "starting settlement simulation"
    );

    // --- Ledger ---
    let mut memory = InMemoryLedger::new();
    memory.list_market(USDC_MARKET, 1);
    memory.list_market(ISO_MARKET, ISO_PRICE);
    if args.max_wei > 0 {
        memory.set_max_wei(ISO_MARKET, args.max_wei);
    }
    let concrete = Arc::new(RwLock::new(memory));
    let ledger: SharedLedger = concrete.clone();

    // --- Registry & whitelist ---
    let registry = HandlerRegistry::new(GOVERNANCE);
    registry
        .set_handler(GOVERNANCE, HANDLER, true)
        .context("registering handler")?;
    let whitelist = LiquidatorWhitelist::new();

    // --- Factory & traders ---
    let factory = VaultFactory::new(GOVERNANCE, ISO_MARKET, ledger, registry.clone(), whitelist);
    let wrapper = WrapperTrader::new(
        "wrapper-usdc",
        USDC_MARKET,
        EXECUTOR,
        "unwrapper-usdc",
        factory.clone(),
    );
    let unwrapper = UnwrapperTrader::new(
        "unwrapper-usdc",
        USDC_MARKET,
        EXECUTOR,
        wrapper.clone(),
        factory.clone(),
    );
    registry
        .set_wrapper_by_token(GOVERNANCE, ISO_MARKET, "wrapper-usdc")
        .context("registering wrapper")?;
    registry
        .set_unwrapper_by_token(GOVERNANCE, ISO_MARKET, "unwrapper-usdc")
        .context("registering unwrapper")?;
    factory
        .owner_install_traders(GOVERNANCE, wrapper, unwrapper.clone())
        .context("installing traders")?;

    // --- Vault & positions ---
    let vault = factory
        .create_vault(args.owner.clone())
        .context("creating vault")?;
    vault
        .deposit_into_vault(&args.owner, 0, args.deposit_amount)
        .context("depositing into vault")?;
    vault
        .open_borrow_position(&args.owner, 0, 123, args.unwrap_amount)
        .context("opening borrow position")?;

    // --- Initiate unwrap ---
    let key = vault
        .initiate_unwrapping(&args.owner, 123, args.unwrap_amount, 1)
        .context("initiating unwrap")?;
    tracing::info!(%key, "account frozen, awaiting external settlement");

    // --- Settlement callback ---
    if args.halt_credit {
        concrete.write().halt_operations(1);
        tracing::warn!("fault injection armed: next ledger batch will fail");
    }
    let received = args
        .unwrap_amount
        .checked_mul(ISO_PRICE)
        .context("unwrap amount too large")?;
    let outcome = unwrapper
        .after_withdrawal_execution(HANDLER, &key, ReceivedInfo { amount: received })
        .context("settlement callback")?;

    // --- Retry path ---
    let mut retried = false;
    if let CallbackOutcome::Retryable { ref reason } = outcome {
        tracing::warn!(%reason, "settlement parked as retryable, retrying");
        unwrapper
            .execute_withdrawal_cancellation_for_retry(HANDLER, &key)
            .context("settlement retry")?;
        retried = true;
    }

    // --- Report ---
    let balance = |account: u64, market: u32| {
        concrete
            .read()
            .account_balance(&AccountRef::new(vault.address(), account), market)
    };
    let report = SimulationReport {
        vault: vault.address().to_string(),
        owner: args.owner,
        settlement_key: key.clone(),
        callback_outcome: match outcome {
            CallbackOutcome::Settled => "settled".to_string(),
            CallbackOutcome::Retryable { reason } => format!("retryable: {reason}"),
        },
        retried,
        account_frozen_after: factory.is_vault_account_frozen(vault.address(), 123),
        pending_after: factory.pending_amount(vault.address(), 123),
        default_account_iso: balance(0, ISO_MARKET),
        borrow_account_iso: balance(123, ISO_MARKET),
        borrow_account_usdc: balance(123, USDC_MARKET),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("simulation complete");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("haven-keeper {}", env!("CARGO_PKG_VERSION"));
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}
