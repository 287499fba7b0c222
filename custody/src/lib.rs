// Copyright (c) 2026 Haven Labs. MIT License.
// See LICENSE for details.

//! # Haven Custody — Core Library
//!
//! Collateral custody and asynchronous settlement for isolated per-user
//! vaults on a margin-lending ledger. Users deposit one restricted asset
//! into a vault; the vault may trade it into or out of an external
//! settlement protocol that completes later, in a different call, via a
//! callback. Everything hard about this crate is keeping the ledger
//! consistent during that window.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual trust
//! boundaries of the system:
//!
//! - **factory** — One vault per user, the freeze table, and the market
//!   allow-lists. The freeze table is the concurrency primitive.
//! - **vault** — The per-user authorization and freeze gate. Nothing
//!   moves without passing through here first.
//! - **trader** — The async wrapper/unwrapper protocol. Callbacks never
//!   fail; unresolved failures park as retryable records.
//! - **registry** — Who may invoke callbacks, and which trader is live
//!   for each isolation market.
//! - **ledger** — The margin-engine seam: the trait the host ledger
//!   implements, plus an in-memory one for tests and simulation.
//! - **config** — Custody constants and hard caps.
//!
//! ## Design Philosophy
//!
//! 1. A frozen account is a locked account. No exceptions for the owner.
//! 2. Callbacks from the external protocol always succeed; failure is a
//!    value, not a panic.
//! 3. If it touches money, it has tests. Plural.

pub mod config;
pub mod factory;
pub mod ledger;
pub mod registry;
pub mod trader;
pub mod vault;

pub use factory::{FactoryError, FreezeState, FreezeType, VaultFactory};
pub use ledger::{
    AccountNumber, AccountRef, Action, Address, InMemoryLedger, LedgerError, MarginLedger,
    MarketId, SharedLedger, TradeData, TraderKind,
};
pub use registry::{HandlerRegistry, LiquidatorWhitelist, RegistryError};
pub use trader::{
    CallbackOutcome, ReceivedInfo, RecordKey, RecordKind, RecordStatus, SettlementRecord,
    TraderError, UnwrapperTrader, WrapperTrader,
};
pub use vault::{TokenVault, VaultError};
