//! # Unwrapper Trader — Withdrawal Side
//!
//! Turns the isolation asset back into an output asset through the
//! external async settlement protocol. The owning vault starts a
//! withdrawal with [`UnwrapperTrader::create_withdrawal`]: the isolation
//! asset leaves the account immediately, the account freezes with a
//! negative signed pending amount, and the output asset arrives later via
//! the execution callback. Cancellation returns the debited isolation
//! asset.
//!
//! Liquidation-driven unwraps enter through `exchange` instead, invoked by
//! the ledger's trade executor mid-operate, where the surrounding sell
//! action moves the funds.

use tracing::{info, warn};

use crate::config::MAX_SWAP_PATH_LENGTH;
use crate::factory::{FreezeType, VaultFactory};
use crate::ledger::{
    AccountRef, Action, Address, MarketId, SharedLedger, TradeData, TraderKind,
};
use crate::registry::HandlerRegistry;

use super::records::{RecordKind, RecordStatus, RecordStore, SettlementRecord};
use super::wrapper::WrapperTrader;
use super::{CallbackOutcome, ReceivedInfo, RecordKey, TraderError};

/// Withdrawal-side trader for one (isolation asset, output asset) pair.
/// Holds a handle to its paired wrapper for unwrap-triggered deposit
/// chains; the wrapper knows this trader only by address.
#[derive(Debug, Clone)]
pub struct UnwrapperTrader {
    address: Address,
    output_market: MarketId,
    isolation_market: MarketId,
    trade_executor: Address,
    paired_wrapper: WrapperTrader,
    factory: VaultFactory,
    ledger: SharedLedger,
    registry: HandlerRegistry,
    records: RecordStore,
}

impl UnwrapperTrader {
    /// New unwrapper producing `output_market` from the factory's
    /// isolation asset, chained to `paired_wrapper`.
    pub fn new(
        address: impl Into<Address>,
        output_market: MarketId,
        trade_executor: impl Into<Address>,
        paired_wrapper: WrapperTrader,
        factory: VaultFactory,
    ) -> Self {
        let ledger = factory.ledger();
        let registry = factory.registry();
        Self {
            address: address.into(),
            output_market,
            isolation_market: factory.isolation_market(),
            trade_executor: trade_executor.into(),
            paired_wrapper,
            factory,
            ledger,
            registry,
            records: RecordStore::new(),
        }
    }

    /// This trader's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The isolation asset this trader consumes.
    pub fn token(&self) -> MarketId {
        self.isolation_market
    }

    /// The output asset this trader produces.
    pub fn output_token(&self) -> MarketId {
        self.output_market
    }

    /// The withdrawal record under `key`, if outstanding.
    pub fn get_withdrawal_record(&self, key: &str) -> Option<SettlementRecord> {
        self.records.get(key)
    }

    /// The outstanding withdrawal record against a vault account, if any.
    pub fn record_for_account(
        &self,
        vault: &str,
        account_number: u64,
    ) -> Option<SettlementRecord> {
        self.records.for_account(vault, account_number)
    }

    // -----------------------------------------------------------------------
    // Quotes & Actions
    // -----------------------------------------------------------------------

    /// Pure quote: how much output asset `desired_input_amount` of the
    /// isolation asset unwraps into at oracle prices.
    pub fn get_exchange_cost(
        &self,
        input_token: MarketId,
        output_token: MarketId,
        desired_input_amount: u64,
        _order_data: &[u8],
    ) -> Result<u64, TraderError> {
        if input_token != self.isolation_market {
            return Err(TraderError::InvalidInputToken(input_token));
        }
        if output_token != self.output_market {
            return Err(TraderError::InvalidOutputToken(output_token));
        }
        if desired_input_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }
        self.quote(desired_input_amount)
    }

    /// Build the action sequence the ledger's executor runs for an unwrap:
    /// a call into this trader, then the sell routing isolation to output.
    pub fn create_actions_for_unwrapping(
        &self,
        vault: &str,
        account_number: u64,
        market_path: &[MarketId],
        input_amount: u64,
        min_output_amount: u64,
        order_data: Vec<u8>,
    ) -> Result<Vec<Action>, TraderError> {
        if market_path.len() < 2 || market_path.len() > MAX_SWAP_PATH_LENGTH {
            return Err(TraderError::SwapPathTooLong {
                length: market_path.len(),
                max: MAX_SWAP_PATH_LENGTH,
            });
        }
        if market_path[0] != self.isolation_market {
            return Err(TraderError::InvalidInputToken(market_path[0]));
        }
        let last = *market_path.last().expect("checked non-empty");
        if last != self.output_market {
            return Err(TraderError::InvalidOutputToken(last));
        }
        if input_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }

        Ok(vec![
            Action::CallTrader {
                trader: self.address.clone(),
                kind: TraderKind::Unwrapper,
                data: TradeData {
                    account_number,
                    execution_fee: self.factory.execution_fee(),
                    order_data,
                },
            },
            Action::Sell {
                account: AccountRef::new(vault, account_number),
                input_market: self.isolation_market,
                output_market: self.output_market,
                input_amount,
                min_output_amount,
            },
        ])
    }

    // -----------------------------------------------------------------------
    // Withdrawal Creation
    // -----------------------------------------------------------------------

    /// Start a withdrawal on behalf of the owning vault. Callable only by
    /// the vault itself (the vault has already run its owner and freeze
    /// checks; this trader re-checks the freeze, since the freeze is the
    /// invariant that must hold no matter who calls).
    ///
    /// Debits the isolation asset immediately, freezes the account with
    /// `Withdrawal` pending, and books the record.
    pub fn create_withdrawal(
        &self,
        caller: &str,
        account_number: u64,
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<RecordKey, TraderError> {
        if !self.factory.is_vault(caller) {
            return Err(TraderError::InvalidOriginator {
                originator: caller.to_string(),
            });
        }
        if input_amount == 0 || min_output_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }
        if self.factory.is_vault_account_frozen(caller, account_number) {
            return Err(TraderError::AccountFrozen {
                vault: caller.to_string(),
                account: account_number,
            });
        }

        let expected_output = self.quote(input_amount)?.max(min_output_amount);

        // The isolation asset leaves the account now; the output asset
        // arrives whenever the external protocol settles.
        self.ledger.write().operate(&[Action::Withdraw {
            from: AccountRef::new(caller, account_number),
            market: self.isolation_market,
            amount: input_amount,
        }])?;

        self.factory.set_vault_account_pending_amount_for_frozen_status(
            &self.address,
            caller,
            account_number,
            FreezeType::Withdrawal,
            input_amount as i128,
            Some(self.output_market),
        )?;

        let mut record = SettlementRecord::new(
            RecordKind::Withdrawal,
            caller,
            account_number,
            self.isolation_market,
            input_amount,
            self.output_market,
            expected_output,
            self.factory.execution_fee(),
        );
        record.status = RecordStatus::Executing;
        let key = self.records.insert(record);
        info!(
            key,
            vault = caller,
            account = account_number,
            input_amount,
            expected_output,
            "withdrawal settlement created"
        );
        Ok(key)
    }

    /// Liquidation-path entry, invoked by the ledger's trade executor
    /// mid-operate. The surrounding sell action moves the isolation asset,
    /// so this only validates, freezes, and books the record.
    pub fn exchange(
        &self,
        caller: &str,
        originator: &str,
        input_token: MarketId,
        output_token: MarketId,
        input_amount: u64,
        trade_data: &TradeData,
    ) -> Result<RecordKey, TraderError> {
        if caller != self.trade_executor {
            return Err(TraderError::NotTradeExecutor {
                caller: caller.to_string(),
            });
        }
        if !self.factory.is_vault(originator) {
            return Err(TraderError::InvalidOriginator {
                originator: originator.to_string(),
            });
        }
        if input_token != self.isolation_market {
            return Err(TraderError::InvalidInputToken(input_token));
        }
        if output_token != self.output_market {
            return Err(TraderError::InvalidOutputToken(output_token));
        }
        if input_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }
        let account_number = trade_data.account_number;
        if self
            .factory
            .is_vault_account_frozen(originator, account_number)
        {
            return Err(TraderError::AccountFrozen {
                vault: originator.to_string(),
                account: account_number,
            });
        }

        let expected_output = self.quote(input_amount)?;
        self.factory.set_vault_account_pending_amount_for_frozen_status(
            &self.address,
            originator,
            account_number,
            FreezeType::Withdrawal,
            input_amount as i128,
            Some(self.output_market),
        )?;

        let mut record = SettlementRecord::new(
            RecordKind::Withdrawal,
            originator,
            account_number,
            input_token,
            input_amount,
            output_token,
            expected_output,
            trade_data.execution_fee,
        );
        record.status = RecordStatus::Executing;
        let key = self.records.insert(record);
        info!(
            key,
            vault = originator,
            account = account_number,
            input_amount,
            "liquidation withdrawal settlement created"
        );
        Ok(key)
    }

    // -----------------------------------------------------------------------
    // Callbacks (handler entry points)
    // -----------------------------------------------------------------------

    /// Execution callback: the external protocol delivered the output
    /// asset. Credits the reported amount; a failing credit is swallowed
    /// and the record turns retryable.
    pub fn after_withdrawal_execution(
        &self,
        caller: &str,
        key: &str,
        info: ReceivedInfo,
    ) -> Result<CallbackOutcome, TraderError> {
        self.check_handler(caller)?;
        let record = self
            .records
            .get(key)
            .ok_or_else(|| TraderError::InvalidKey(key.to_string()))?;
        if record.status != RecordStatus::Executing {
            return Err(TraderError::KeyNotPending(key.to_string()));
        }

        self.records
            .update(key, |r| r.received_amount = Some(info.amount));

        match self.credit_output(&record, info.amount) {
            Ok(()) => {
                self.clear_freeze(&record.vault, record.account_number)?;
                self.records.remove(key);
                info!(key, received = info.amount, "withdrawal settled");
                Ok(CallbackOutcome::Settled)
            }
            Err(e) => {
                let reason = e.to_string();
                self.records.update(key, |r| r.is_retryable = true);
                warn!(key, %reason, "withdrawal credit failed; record retryable");
                Ok(CallbackOutcome::Retryable { reason })
            }
        }
    }

    /// Cancellation callback: the unwrap did not execute, return the
    /// debited isolation asset. A failing return is swallowed.
    pub fn after_withdrawal_cancellation(
        &self,
        caller: &str,
        key: &str,
    ) -> Result<CallbackOutcome, TraderError> {
        self.check_handler(caller)?;
        let record = self
            .records
            .get(key)
            .ok_or_else(|| TraderError::InvalidKey(key.to_string()))?;
        if record.status != RecordStatus::Executing {
            return Err(TraderError::KeyNotPending(key.to_string()));
        }

        match self.return_input_funds(&record) {
            Ok(()) => {
                self.clear_freeze(&record.vault, record.account_number)?;
                self.records.remove(key);
                info!(key, "withdrawal cancelled; isolation asset returned");
                Ok(CallbackOutcome::Settled)
            }
            Err(e) => {
                let reason = e.to_string();
                self.records.update(key, |r| {
                    r.status = RecordStatus::CancelledRetryable;
                    r.is_retryable = true;
                });
                warn!(key, %reason, "withdrawal cancellation failed; record retryable");
                Ok(CallbackOutcome::Retryable { reason })
            }
        }
    }

    /// Explicit retry of a record whose callback-time fund movement failed.
    /// Handler only; failure propagates since this is a direct call.
    pub fn execute_withdrawal_cancellation_for_retry(
        &self,
        caller: &str,
        key: &str,
    ) -> Result<(), TraderError> {
        self.check_handler(caller)?;
        let record = self
            .records
            .get(key)
            .ok_or_else(|| TraderError::KeyNotPending(key.to_string()))?;
        if !record.is_retryable {
            return Err(TraderError::KeyNotPending(key.to_string()));
        }

        match (record.status, record.received_amount) {
            (RecordStatus::Executing, Some(received)) => self.credit_output(&record, received)?,
            _ => self.return_input_funds(&record)?,
        }

        self.clear_freeze(&record.vault, record.account_number)?;
        self.records.remove(key);
        info!(key, "retry resolved withdrawal record");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cross-Component (wrapper chain)
    // -----------------------------------------------------------------------

    /// Forward a chained-deposit adjustment to the paired wrapper, used
    /// when a liquidation unwrap feeds an immediate re-wrap. Handler only;
    /// the wrapper separately verifies this trader is its pair.
    pub fn reduce_chained_deposit(
        &self,
        caller: &str,
        deposit_key: &str,
        output_amount: u64,
        pending_reduction: u64,
    ) -> Result<(), TraderError> {
        self.check_handler(caller)?;
        self.paired_wrapper
            .set_deposit_info_and_reduce_pending_amount_from_unwrapper(
                &self.address,
                deposit_key,
                output_amount,
                pending_reduction,
            )
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_handler(&self, caller: &str) -> Result<(), TraderError> {
        if !self.registry.is_handler(caller) {
            return Err(TraderError::NotHandler {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    fn quote(&self, input_amount: u64) -> Result<u64, TraderError> {
        let ledger = self.ledger.read();
        let price_in = ledger.market_price(self.isolation_market)? as u128;
        let price_out = ledger.market_price(self.output_market)? as u128;
        let out = (input_amount as u128) * price_in / price_out.max(1);
        u64::try_from(out).map_err(|_| TraderError::InvalidInputAmount)
    }

    fn credit_output(&self, record: &SettlementRecord, received: u64) -> Result<(), TraderError> {
        self.ledger.write().operate(&[Action::Deposit {
            to: AccountRef::new(record.vault.clone(), record.account_number),
            market: record.output_token,
            amount: received,
        }])?;
        Ok(())
    }

    fn return_input_funds(&self, record: &SettlementRecord) -> Result<(), TraderError> {
        self.ledger.write().operate(&[Action::Deposit {
            to: AccountRef::new(record.vault.clone(), record.account_number),
            market: record.input_token,
            amount: record.input_amount,
        }])?;
        Ok(())
    }

    fn clear_freeze(&self, vault: &str, account_number: u64) -> Result<(), TraderError> {
        if let Some(state) = self.factory.freeze_state(vault, account_number) {
            self.factory.set_vault_account_pending_amount_for_frozen_status(
                &self.address,
                vault,
                account_number,
                FreezeType::Withdrawal,
                -(state.pending as i128),
                None,
            )?;
        }
        Ok(())
    }
}
