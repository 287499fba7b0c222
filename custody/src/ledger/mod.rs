//! # Margin Ledger Seam
//!
//! The custody layer does not price assets, accrue interest, or decide
//! solvency — a shared margin engine does. This module is the boundary:
//! everything the vaults and traders need from that engine is expressed as
//! the [`MarginLedger`] trait, and everything they hand back to it is an
//! [`Action`] list.
//!
//! ```text
//! actions.rs — the ledger's action encoding (what we submit)
//! memory.rs  — InMemoryLedger, a deterministic stand-in for tests and
//!              the keeper binary
//! ```
//!
//! Production wires a real engine behind the trait. Nothing in this crate
//! assumes the bundled in-memory implementation.

pub mod actions;
pub mod memory;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use actions::{Action, TradeData, TraderKind};
pub use memory::InMemoryLedger;

// ---------------------------------------------------------------------------
// Primitive Identifiers
// ---------------------------------------------------------------------------

/// An on-ledger address. Hex-encoded public key or contract identifier —
/// the custody layer treats it as opaque.
pub type Address = String;

/// Sub-account number within a vault. Account 0 is the default account;
/// borrow positions live on caller-chosen non-zero numbers.
pub type AccountNumber = u64;

/// Identifier of a market (one asset listed on the margin ledger).
pub type MarketId = u32;

/// A (owner address, account number) pair — the unit the ledger keeps
/// balances against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    /// Address that owns the account (a vault, in this crate's flows).
    pub owner: Address,
    /// Sub-account number.
    pub number: AccountNumber,
}

impl AccountRef {
    /// Convenience constructor.
    pub fn new(owner: impl Into<Address>, number: AccountNumber) -> Self {
        Self {
            owner: owner.into(),
            number,
        }
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.owner, self.number)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a margin ledger implementation.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The referenced market is not listed on the ledger.
    #[error("unknown market: {0}")]
    UnknownMarket(MarketId),

    /// A debit would drive an account below what its balance supports.
    #[error("insufficient balance in market {market} for {account}: have {available}, need {required}")]
    InsufficientBalance {
        /// The account being debited.
        account: AccountRef,
        /// The market in question.
        market: MarketId,
        /// Balance currently available.
        available: i128,
        /// Amount the operation required.
        required: u64,
    },

    /// Crediting the market would push its total supply past the max-wei cap.
    #[error("market {market} supply cap exceeded: cap {cap}, attempted total {attempted}")]
    MarketCapExceeded {
        /// The capped market.
        market: MarketId,
        /// Configured max-wei.
        cap: u64,
        /// Total supply the operation would have produced.
        attempted: u128,
    },

    /// A sell produced less than the caller's minimum acceptable output.
    #[error("sell output below minimum: got {output}, required at least {min_output}")]
    OutputBelowMinimum {
        /// Amount the sell produced.
        output: u64,
        /// Caller-specified floor.
        min_output: u64,
    },

    /// Arithmetic overflow while applying an action.
    #[error("amount overflow while applying ledger action")]
    AmountOverflow,

    /// The ledger refused the batch outright (e.g. an engine-side halt).
    #[error("ledger operations halted")]
    Halted,
}

// ---------------------------------------------------------------------------
// The Seam
// ---------------------------------------------------------------------------

/// Read and write interface of the external margin engine.
///
/// Query methods are cheap and side-effect free. [`operate`](Self::operate)
/// is the single mutation entry point: it applies an action list atomically —
/// either every action lands or none do.
pub trait MarginLedger: std::fmt::Debug + Send + Sync {
    /// Signed balance of `account` in `market`. Negative means debt.
    fn account_balance(&self, account: &AccountRef, market: MarketId) -> i128;

    /// Every market in which `account` holds a non-zero balance.
    fn account_markets(&self, account: &AccountRef) -> Vec<MarketId>;

    /// Oracle price of one smallest unit of `market`'s asset, in quote units.
    fn market_price(&self, market: MarketId) -> Result<u64, LedgerError>;

    /// `true` if the ledger has flagged this market as closing (no new
    /// debt may be opened against it).
    fn is_market_closing(&self, market: MarketId) -> bool;

    /// Supply cap of the market in smallest units. Zero means uncapped.
    fn max_wei(&self, market: MarketId) -> u64;

    /// Current total positive supply held across all accounts in `market`.
    fn market_total_supply(&self, market: MarketId) -> u128;

    /// `true` if the account's collateral no longer covers its debt with
    /// the required margin.
    fn is_liquidatable(&self, account: &AccountRef) -> bool;

    /// `true` if applying `actions` would leave `account` liquidatable.
    /// Must not mutate ledger state.
    fn would_be_liquidatable(
        &self,
        account: &AccountRef,
        actions: &[Action],
    ) -> Result<bool, LedgerError>;

    /// Apply `actions` atomically. On error, no action has been applied.
    fn operate(&mut self, actions: &[Action]) -> Result<(), LedgerError>;
}

/// Shared handle to the margin ledger. The host serializes execution, so
/// a plain `RwLock` is coordination enough.
pub type SharedLedger = Arc<RwLock<dyn MarginLedger>>;

/// Wrap a concrete ledger into a [`SharedLedger`] handle.
pub fn shared<L: MarginLedger + 'static>(ledger: L) -> SharedLedger {
    Arc::new(RwLock::new(ledger))
}
