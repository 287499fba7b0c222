//! # Wrapper Trader — Deposit Side
//!
//! Turns an accepted input asset into the isolation asset through the
//! external async settlement protocol. `exchange` is invoked by the
//! ledger's trade executor mid-`operate`; it books a Deposit record and
//! freezes the target account. The external protocol later reports back
//! through `after_deposit_execution` / `after_deposit_cancellation`, which
//! never fail for downstream reasons — see the module docs of
//! [`crate::trader`].
//!
//! ## Spillover
//!
//! The external protocol may deliver more than the market can absorb. The
//! execution callback compares the received amount against the isolation
//! market's remaining capacity (max-wei minus live total supply, read at
//! callback time) and splits: the target account is credited up to
//! capacity, the remainder lands on the vault's default account as
//! directly held balance.

use tracing::{info, warn};

use crate::config::MAX_SWAP_PATH_LENGTH;
use crate::factory::{FreezeType, VaultFactory};
use crate::ledger::{
    AccountRef, Action, Address, MarketId, SharedLedger, TradeData, TraderKind,
};
use crate::registry::HandlerRegistry;

use super::records::{RecordKind, RecordStatus, RecordStore, SettlementRecord};
use super::{CallbackOutcome, ReceivedInfo, RecordKey, TraderError};

/// Deposit-side trader for one (input asset, isolation asset) pair.
/// Cloning clones the handle; all clones share one record store.
#[derive(Debug, Clone)]
pub struct WrapperTrader {
    address: Address,
    input_market: MarketId,
    isolation_market: MarketId,
    trade_executor: Address,
    paired_unwrapper: Address,
    factory: VaultFactory,
    ledger: SharedLedger,
    registry: HandlerRegistry,
    records: RecordStore,
}

impl WrapperTrader {
    /// New wrapper accepting `input_market` and producing the factory's
    /// isolation asset.
    pub fn new(
        address: impl Into<Address>,
        input_market: MarketId,
        trade_executor: impl Into<Address>,
        paired_unwrapper: impl Into<Address>,
        factory: VaultFactory,
    ) -> Self {
        let ledger = factory.ledger();
        let registry = factory.registry();
        Self {
            address: address.into(),
            input_market,
            isolation_market: factory.isolation_market(),
            trade_executor: trade_executor.into(),
            paired_unwrapper: paired_unwrapper.into(),
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

    /// The isolation asset this trader produces.
    pub fn token(&self) -> MarketId {
        self.isolation_market
    }

    /// The input asset this trader accepts.
    pub fn input_token(&self) -> MarketId {
        self.input_market
    }

    /// The deposit record under `key`, if outstanding.
    pub fn get_deposit_record(&self, key: &str) -> Option<SettlementRecord> {
        self.records.get(key)
    }

    /// The outstanding deposit record against a vault account, if any.
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

    /// Pure quote: how much isolation asset `desired_input_amount` of the
    /// input asset buys at oracle prices. No state is touched.
    pub fn get_exchange_cost(
        &self,
        input_token: MarketId,
        output_token: MarketId,
        desired_input_amount: u64,
        _order_data: &[u8],
    ) -> Result<u64, TraderError> {
        if input_token != self.input_market {
            return Err(TraderError::InvalidInputToken(input_token));
        }
        if output_token != self.isolation_market {
            return Err(TraderError::InvalidOutputToken(output_token));
        }
        if desired_input_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }
        self.quote(desired_input_amount)
    }

    /// Build the action sequence the ledger's executor runs for a wrap:
    /// a call into this trader, then the sell that routes input to output.
    ///
    /// `market_path` starts at the input asset and ends at the isolation
    /// asset; intermediate hops are routed by the external protocol.
    pub fn create_actions_for_wrapping(
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
        if market_path[0] != self.input_market {
            return Err(TraderError::InvalidInputToken(market_path[0]));
        }
        let last = *market_path.last().expect("checked non-empty");
        if last != self.isolation_market {
            return Err(TraderError::InvalidOutputToken(last));
        }
        if input_amount == 0 {
            return Err(TraderError::InvalidInputAmount);
        }

        Ok(vec![
            Action::CallTrader {
                trader: self.address.clone(),
                kind: TraderKind::Wrapper,
                data: TradeData {
                    account_number,
                    execution_fee: self.factory.execution_fee(),
                    order_data,
                },
            },
            Action::Sell {
                account: AccountRef::new(vault, account_number),
                input_market: self.input_market,
                output_market: self.isolation_market,
                input_amount,
                min_output_amount,
            },
        ])
    }

    // -----------------------------------------------------------------------
    // Exchange (executor entry point)
    // -----------------------------------------------------------------------

    /// Start a wrap. Callable only by the ledger's trade executor, and only
    /// when the trade originator is the target vault itself.
    ///
    /// Books a Deposit record, arms the vault's deposit-source flags, and
    /// freezes the account with a positive pending amount. The external
    /// protocol resolves the record later via the callbacks.
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
        if input_token != self.input_market {
            return Err(TraderError::InvalidInputToken(input_token));
        }
        if output_token != self.isolation_market {
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

        // The vault will receive the minted isolation asset from this
        // trader, not from its owner; arm the one-shot flags.
        let vault = self
            .factory
            .get_vault(originator)
            .ok_or_else(|| TraderError::InvalidOriginator {
                originator: originator.to_string(),
            })?;
        vault
            .set_is_deposit_source_wrapper(&self.address, true)
            .and_then(|_| vault.set_should_skip_transfer(&self.address, true))
            .map_err(|e| TraderError::VaultInteraction {
                reason: e.to_string(),
            })?;

        self.factory.set_vault_account_pending_amount_for_frozen_status(
            &self.address,
            originator,
            account_number,
            FreezeType::Deposit,
            expected_output as i128,
            None,
        )?;

        let mut record = SettlementRecord::new(
            RecordKind::Deposit,
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
            expected_output,
            "deposit settlement created"
        );
        Ok(key)
    }

    // -----------------------------------------------------------------------
    // Callbacks (handler entry points)
    // -----------------------------------------------------------------------

    /// Execution callback from the external protocol.
    ///
    /// Hard-errors only on caller misbehavior (not a handler, unknown key,
    /// record not awaiting execution). A failing downstream credit is
    /// swallowed: the account stays frozen, the record turns retryable,
    /// and the call reports [`CallbackOutcome::Retryable`].
    pub fn after_deposit_execution(
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

        // Remember the reported amount so a failed credit can be retried.
        self.records
            .update(key, |r| r.received_amount = Some(info.amount));

        match self.settle_deposit(&record, info.amount) {
            Ok(()) => {
                self.clear_freeze(&record.vault, record.account_number, FreezeType::Deposit)?;
                self.records.remove(key);
                info!(key, received = info.amount, "deposit settled");
                Ok(CallbackOutcome::Settled)
            }
            Err(e) => {
                let reason = e.to_string();
                self.records.update(key, |r| r.is_retryable = true);
                warn!(key, %reason, "deposit credit failed; record retryable");
                Ok(CallbackOutcome::Retryable { reason })
            }
        }
    }

    /// Cancellation callback from the external protocol: the wrap did not
    /// execute, return the original input funds. A failing return is
    /// swallowed the same way as a failing execution credit.
    pub fn after_deposit_cancellation(
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
                self.clear_freeze(&record.vault, record.account_number, FreezeType::Deposit)?;
                self.records.remove(key);
                info!(key, "deposit cancelled; funds returned");
                Ok(CallbackOutcome::Settled)
            }
            Err(e) => {
                let reason = e.to_string();
                self.records.update(key, |r| {
                    r.status = RecordStatus::CancelledRetryable;
                    r.is_retryable = true;
                });
                warn!(key, %reason, "deposit cancellation failed; record retryable");
                Ok(CallbackOutcome::Retryable { reason })
            }
        }
    }

    /// Explicit retry of a record whose callback-time fund movement failed.
    /// Handler only. Success clears the freeze and removes the record;
    /// failure propagates (this is a direct call, not a callback).
    pub fn execute_deposit_cancellation_for_retry(
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
            // Execution arrived but the credit failed: re-attempt the credit.
            (RecordStatus::Executing, Some(received)) => {
                self.settle_deposit(&record, received)?
            }
            // Cancellation arrived but the return failed: re-attempt it.
            _ => self.return_input_funds(&record)?,
        }

        self.clear_freeze(&record.vault, record.account_number, FreezeType::Deposit)?;
        self.records.remove(key);
        info!(key, "retry resolved deposit record");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cross-Component (unwrapper chain)
    // -----------------------------------------------------------------------

    /// Adjust a deposit record that is one link of an unwrap-triggered
    /// chain (liquidation flows). Callable only by the paired unwrapper.
    pub fn set_deposit_info_and_reduce_pending_amount_from_unwrapper(
        &self,
        caller: &str,
        key: &str,
        output_amount: u64,
        pending_reduction: u64,
    ) -> Result<(), TraderError> {
        if caller != self.paired_unwrapper {
            return Err(TraderError::NotPairedUnwrapper {
                caller: caller.to_string(),
            });
        }
        let record = self
            .records
            .get(key)
            .ok_or_else(|| TraderError::InvalidKey(key.to_string()))?;

        self.records
            .update(key, |r| r.expected_output_amount = output_amount);
        self.factory.set_vault_account_pending_amount_for_frozen_status(
            &self.address,
            &record.vault,
            record.account_number,
            FreezeType::Deposit,
            -(pending_reduction as i128),
            None,
        )?;
        Ok(())
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
        let price_in = ledger.market_price(self.input_market)? as u128;
        let price_out = ledger.market_price(self.isolation_market)? as u128;
        let out = (input_amount as u128) * price_in / price_out.max(1);
        u64::try_from(out).map_err(|_| TraderError::InvalidInputAmount)
    }

    /// Isolation-market capacity still available under max-wei, read live.
    fn remaining_capacity(&self, market: MarketId) -> u128 {
        let ledger = self.ledger.read();
        let cap = ledger.max_wei(market);
        if cap == 0 {
            u128::MAX
        } else {
            (cap as u128).saturating_sub(ledger.market_total_supply(market))
        }
    }

    /// Credit a received amount, splitting spillover to the vault's
    /// default account when the market cannot absorb all of it.
    fn settle_deposit(&self, record: &SettlementRecord, received: u64) -> Result<(), TraderError> {
        let capacity = self.remaining_capacity(record.output_token);
        let credit = u64::try_from(capacity.min(received as u128)).unwrap_or(received);
        let spillover = received - credit;

        let vault =
            self.factory
                .get_vault(&record.vault)
                .ok_or_else(|| TraderError::InvalidOriginator {
                    originator: record.vault.clone(),
                })?;

        if credit > 0 {
            self.ledger.write().operate(&[Action::Deposit {
                to: AccountRef::new(record.vault.clone(), record.account_number),
                market: record.output_token,
                amount: credit,
            }])?;
        }
        if spillover > 0 {
            vault
                .credit_spillover(&self.address, spillover)
                .map_err(|e| TraderError::VaultInteraction {
                    reason: e.to_string(),
                })?;
            info!(
                key = %record.key,
                credit,
                spillover,
                "deposit split: market at capacity, spillover to default account"
            );
        }

        // The deposit-source flags are one-shot; disarm them now that the
        // credit has landed.
        vault
            .set_is_deposit_source_wrapper(&self.address, false)
            .and_then(|_| vault.set_should_skip_transfer(&self.address, false))
            .map_err(|e| TraderError::VaultInteraction {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Return the original input funds to the originating account.
    fn return_input_funds(&self, record: &SettlementRecord) -> Result<(), TraderError> {
        self.ledger.write().operate(&[Action::Deposit {
            to: AccountRef::new(record.vault.clone(), record.account_number),
            market: record.input_token,
            amount: record.input_amount,
        }])?;
        Ok(())
    }

    fn clear_freeze(
        &self,
        vault: &str,
        account_number: u64,
        freeze_type: FreezeType,
    ) -> Result<(), TraderError> {
        if let Some(state) = self.factory.freeze_state(vault, account_number) {
            self.factory.set_vault_account_pending_amount_for_frozen_status(
                &self.address,
                vault,
                account_number,
                freeze_type,
                -(state.pending as i128),
                None,
            )?;
        }
        Ok(())
    }
}
