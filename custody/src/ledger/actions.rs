//! # Ledger Action Encoding
//!
//! The margin ledger mutates state through `operate(actions)` — a batch of
//! typed actions applied atomically. The custody layer builds these batches
//! (directly in the vault, or via a trader's `create_actions_for_*` helpers)
//! and never touches ledger balances any other way.
//!
//! Trades carry an opaque [`TradeData`] payload: the acting account number,
//! the execution fee the keeper is owed, and the external protocol's own
//! order bytes, which the ledger forwards untouched.

use serde::{Deserialize, Serialize};

use super::{AccountRef, Address, MarketId};

/// Which side of the async settlement protocol a trade call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraderKind {
    /// Deposit side: some input asset into the isolation asset.
    Wrapper,
    /// Withdrawal side: isolation asset out into another asset.
    Unwrapper,
}

impl std::fmt::Display for TraderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraderKind::Wrapper => write!(f, "Wrapper"),
            TraderKind::Unwrapper => write!(f, "Unwrapper"),
        }
    }
}

/// Opaque trade payload forwarded to a wrapper/unwrapper through the
/// ledger's trade executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeData {
    /// Vault sub-account the trade acts on.
    pub account_number: u64,
    /// Fee (in underlying smallest units) owed to the settlement keeper.
    pub execution_fee: u64,
    /// The external protocol's order bytes. Not interpreted by this crate.
    pub order_data: Vec<u8>,
}

impl TradeData {
    /// Payload with no order bytes — enough for quote and test flows.
    pub fn new(account_number: u64, execution_fee: u64) -> Self {
        Self {
            account_number,
            execution_fee,
            order_data: Vec::new(),
        }
    }
}

/// One step in a ledger operation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Credit `amount` of `market` to `to` from outside the ledger.
    Deposit {
        /// Receiving account.
        to: AccountRef,
        /// Market being credited.
        market: MarketId,
        /// Amount in smallest units.
        amount: u64,
    },
    /// Debit `amount` of `market` from `from`, leaving the ledger.
    Withdraw {
        /// Account being debited.
        from: AccountRef,
        /// Market being debited.
        market: MarketId,
        /// Amount in smallest units.
        amount: u64,
    },
    /// Move `amount` of `market` between two accounts inside the ledger.
    /// The source may go negative — that is how debt is opened.
    Transfer {
        /// Source account.
        from: AccountRef,
        /// Destination account.
        to: AccountRef,
        /// Market being moved.
        market: MarketId,
        /// Amount in smallest units.
        amount: u64,
    },
    /// Move the source's entire (positive or negative) balance of `market`
    /// to `to`. Used by close-position and repay-all flows.
    TransferAll {
        /// Source account; its balance in `market` becomes zero.
        from: AccountRef,
        /// Destination account.
        to: AccountRef,
        /// Market being settled.
        market: MarketId,
    },
    /// Sell `input_amount` of `input_market` for `output_market` at oracle
    /// price, rejecting if the proceeds fall below `min_output_amount`.
    Sell {
        /// Account the sale debits and credits.
        account: AccountRef,
        /// Market sold.
        input_market: MarketId,
        /// Market bought.
        output_market: MarketId,
        /// Amount sold, in smallest units.
        input_amount: u64,
        /// Minimum acceptable proceeds.
        min_output_amount: u64,
    },
    /// Hand control to a registered wrapper/unwrapper via the ledger's
    /// trade executor. The ledger itself moves no balances for this action;
    /// the trader's `exchange` bookkeeping does.
    CallTrader {
        /// Address of the trader to invoke.
        trader: Address,
        /// Which trader interface the executor should use.
        kind: TraderKind,
        /// Opaque trade payload.
        data: TradeData,
    },
}

impl Action {
    /// `true` for actions that can reduce an account's collateral or
    /// increase its debt — the ones gated by the liquidation-safety check.
    pub fn reduces_safety(&self) -> bool {
        matches!(
            self,
            Action::Withdraw { .. } | Action::Transfer { .. } | Action::TransferAll { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_data_roundtrips_through_json() {
        let data = TradeData {
            account_number: 123,
            execution_fee: 50,
            order_data: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&data).expect("serialize");
        let back: TradeData = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, data);
    }

    #[test]
    fn safety_classification() {
        let acct = AccountRef::new("vault", 0);
        let deposit = Action::Deposit {
            to: acct.clone(),
            market: 1,
            amount: 10,
        };
        let withdraw = Action::Withdraw {
            from: acct,
            market: 1,
            amount: 10,
        };
        assert!(!deposit.reduces_safety());
        assert!(withdraw.reduces_safety());
    }
}
