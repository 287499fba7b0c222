//! # Protocol Constants
//!
//! Every magic number in the custody layer lives here. Vault, factory, and
//! trader code reference these by name — if you find a bare constant anywhere
//! else in the crate, that is a bug, not a style choice.

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// The default account number of every vault.
///
/// Plain deposits and withdrawals move through this account. Borrow
/// positions live on caller-chosen non-zero account numbers. Spillover from
/// an over-filled settlement is also credited here.
pub const DEFAULT_ACCOUNT_NUMBER: u64 = 0;

// ---------------------------------------------------------------------------
// Trading
// ---------------------------------------------------------------------------

/// Maximum number of markets a swap path may touch, endpoints included.
///
/// Action builders reject longer paths outright — a long path is almost
/// always a fat-fingered route, and the ledger's executor has its own gas
/// ceiling anyway.
pub const MAX_SWAP_PATH_LENGTH: usize = 3;

/// Execution fee (in underlying smallest units) charged when no explicit fee
/// is configured on the factory.
pub const DEFAULT_EXECUTION_FEE: u64 = 0;

/// Hard ceiling on the factory's execution fee. An owner can tune the fee,
/// but never past this.
pub const MAX_EXECUTION_FEE: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Stub Ledger Parameters
// ---------------------------------------------------------------------------

/// Collateralization floor used by the in-memory ledger's liquidatability
/// check: collateral value must cover debt value times this ratio.
///
/// 11_500 basis points = 115%. The real margin engine supplies its own risk
/// parameters; this value only governs the bundled test ledger.
pub const MARGIN_RATIO_BPS: u128 = 11_500;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u128 = 10_000;
