//! # Async Wrapper/Unwrapper Traders
//!
//! Bridge between the vaults and the external asynchronous settlement
//! protocol. A trade does not complete in the call that starts it: the
//! trader books a [`SettlementRecord`], freezes the acting account through
//! the factory, and waits for the external protocol's keeper to call back
//! with the outcome — success, partial fill, or failure.
//!
//! ```text
//! records.rs   — settlement-record store and lifecycle
//! wrapper.rs   — deposit side: input asset -> isolation asset
//! unwrapper.rs — withdrawal side: isolation asset -> output asset
//! ```
//!
//! ## The One Rule of Callbacks
//!
//! Callbacks must never fail. The external protocol treats a failing
//! callback as a broken integration, so every downstream error inside one
//! is caught and converted into "account stays frozen, record retryable" —
//! expressed in the type system as [`CallbackOutcome`] rather than `Err`.
//! A callback only returns `Err` when the *caller* misbehaved (not a
//! registered handler, unknown key); those are integration bugs, not
//! settlement outcomes.

pub mod records;
pub mod unwrapper;
pub mod wrapper;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::factory::FactoryError;
use crate::ledger::{AccountNumber, Address, LedgerError, MarketId};

pub use records::{RecordKey, RecordKind, RecordStatus, RecordStore, SettlementRecord};
pub use unwrapper::UnwrapperTrader;
pub use wrapper::WrapperTrader;

// ---------------------------------------------------------------------------
// Callback Results
// ---------------------------------------------------------------------------

/// What the external settlement protocol reports back on execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedInfo {
    /// Amount actually received, in the record's output-token smallest
    /// units. May differ from the expected amount (partial or over-fill).
    pub amount: u64,
}

/// Outcome of a settlement callback.
///
/// Callbacks swallow downstream failures instead of propagating them, so
/// "it did not work" is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOutcome {
    /// The record was resolved and the account freeze cleared.
    Settled,
    /// A downstream fund movement failed. The account stays frozen, the
    /// record is flagged retryable, and recovery waits for an explicit
    /// handler-gated retry call.
    Retryable {
        /// Why the movement failed (for operators; not machine-parsed).
        reason: String,
    },
}

impl CallbackOutcome {
    /// `true` for the settled branch.
    pub fn is_settled(&self) -> bool {
        matches!(self, CallbackOutcome::Settled)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Hard errors from trader entry points. Downstream settlement failures
/// inside callbacks are *not* here — those become
/// [`CallbackOutcome::Retryable`].
#[derive(Debug, Error)]
pub enum TraderError {
    /// The caller is not a registered settlement handler.
    #[error("unauthorized: {caller} is not a registered handler")]
    NotHandler {
        /// Address that invoked the callback.
        caller: Address,
    },

    /// The caller is not the ledger's trade executor.
    #[error("unauthorized: {caller} is not the trade executor")]
    NotTradeExecutor {
        /// Address that attempted the exchange.
        caller: Address,
    },

    /// The caller is not the paired unwrapper of this wrapper.
    #[error("unauthorized: {caller} is not the paired unwrapper")]
    NotPairedUnwrapper {
        /// Address that attempted the cross-component call.
        caller: Address,
    },

    /// The trade originator is not the target vault (or not a vault at all).
    #[error("invalid trade originator: {originator}")]
    InvalidOriginator {
        /// The offending originator address.
        originator: Address,
    },

    /// The input token does not match this trader's configuration.
    #[error("invalid input token: market {0}")]
    InvalidInputToken(MarketId),

    /// The output token does not match this trader's configuration.
    #[error("invalid output token: market {0}")]
    InvalidOutputToken(MarketId),

    /// Zero or otherwise unusable trade amount.
    #[error("invalid input amount")]
    InvalidInputAmount,

    /// The target account already has an outstanding settlement.
    #[error("account {account} of vault {vault} is already frozen")]
    AccountFrozen {
        /// Target vault.
        vault: Address,
        /// Target account number.
        account: AccountNumber,
    },

    /// No settlement record exists under this key.
    #[error("invalid key: {0}")]
    InvalidKey(RecordKey),

    /// The record exists but is not awaiting this call (already resolved,
    /// or not flagged retryable).
    #[error("key not pending: {0}")]
    KeyNotPending(RecordKey),

    /// A swap path exceeds the configured maximum length.
    #[error("swap path too long: {length} markets, maximum {max}")]
    SwapPathTooLong {
        /// Path length supplied.
        length: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// A call into the target vault was rejected.
    #[error("vault interaction failed: {reason}")]
    VaultInteraction {
        /// The vault's rejection, stringified.
        reason: String,
    },

    /// Freeze bookkeeping rejected the operation.
    #[error(transparent)]
    Factory(#[from] FactoryError),

    /// The margin ledger rejected the operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
