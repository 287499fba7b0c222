//! # In-Memory Margin Ledger
//!
//! A deterministic [`MarginLedger`] used by the integration tests and the
//! keeper binary. It keeps signed balances, oracle prices, supply caps, and
//! closing flags in plain maps, and applies `operate` batches copy-then-commit
//! so a failed batch leaves no trace.
//!
//! This is a stand-in, not a margin engine: interest, fees, and real risk
//! parameters are out of scope. Its liquidatability rule is the fixed
//! collateralization floor from [`crate::config::MARGIN_RATIO_BPS`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{BPS_DENOMINATOR, MARGIN_RATIO_BPS};

use super::{AccountRef, Action, LedgerError, MarginLedger, MarketId};

/// Per-market configuration held by the stub ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarketEntry {
    /// Oracle price of one smallest unit, in quote units.
    price: u64,
    /// Supply cap in smallest units. Zero means uncapped.
    max_wei: u64,
    /// Whether the market is winding down (no new debt).
    closing: bool,
}

/// Deterministic in-memory margin ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryLedger {
    /// Signed balances per account per market. Negative means debt.
    balances: HashMap<AccountRef, HashMap<MarketId, i128>>,
    /// Listed markets.
    markets: HashMap<MarketId, MarketEntry>,
    /// Fault injection: number of upcoming `operate` calls to reject.
    halted_operations: u32,
}

impl InMemoryLedger {
    /// Empty ledger with no markets listed.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Setup (test / keeper surface)
    // -----------------------------------------------------------------------

    /// List a market at the given oracle price. Uncapped, not closing.
    pub fn list_market(&mut self, market: MarketId, price: u64) {
        self.markets.insert(
            market,
            MarketEntry {
                price,
                max_wei: 0,
                closing: false,
            },
        );
    }

    /// Update a market's oracle price.
    pub fn set_price(&mut self, market: MarketId, price: u64) {
        if let Some(entry) = self.markets.get_mut(&market) {
            entry.price = price;
        }
    }

    /// Set a market's supply cap. Zero removes the cap.
    pub fn set_max_wei(&mut self, market: MarketId, max_wei: u64) {
        if let Some(entry) = self.markets.get_mut(&market) {
            entry.max_wei = max_wei;
        }
    }

    /// Flag or unflag the market as closing.
    pub fn set_closing(&mut self, market: MarketId, closing: bool) {
        if let Some(entry) = self.markets.get_mut(&market) {
            entry.closing = closing;
        }
    }

    /// Directly set a signed balance. Test setup only — bypasses cap checks.
    pub fn set_balance(&mut self, account: AccountRef, market: MarketId, amount: i128) {
        self.balances.entry(account).or_default().insert(market, amount);
    }

    /// Fault injection: reject the next `count` calls to `operate` with
    /// [`LedgerError::Halted`]. Used to exercise the swallow-and-retry
    /// paths of the settlement callbacks.
    pub fn halt_operations(&mut self, count: u32) {
        self.halted_operations = count;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn market(&self, market: MarketId) -> Result<&MarketEntry, LedgerError> {
        self.markets
            .get(&market)
            .ok_or(LedgerError::UnknownMarket(market))
    }

    fn add(&mut self, account: &AccountRef, market: MarketId, delta: i128) -> Result<(), LedgerError> {
        let slot = self
            .balances
            .entry(account.clone())
            .or_default()
            .entry(market)
            .or_insert(0);
        *slot = slot.checked_add(delta).ok_or(LedgerError::AmountOverflow)?;
        Ok(())
    }

    /// Debit that refuses to take the balance negative.
    fn debit_strict(
        &mut self,
        account: &AccountRef,
        market: MarketId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let available = self.account_balance(account, market);
        if available < amount as i128 {
            return Err(LedgerError::InsufficientBalance {
                account: account.clone(),
                market,
                available,
                required: amount,
            });
        }
        self.add(account, market, -(amount as i128))
    }

    fn apply(&mut self, action: &Action) -> Result<(), LedgerError> {
        match action {
            Action::Deposit { to, market, amount } => {
                self.market(*market)?;
                self.add(to, *market, *amount as i128)
            }
            Action::Withdraw { from, market, amount } => {
                self.market(*market)?;
                self.debit_strict(from, *market, *amount)
            }
            Action::Transfer {
                from,
                to,
                market,
                amount,
            } => {
                // The source may go negative here: this is how debt opens.
                self.market(*market)?;
                self.add(from, *market, -(*amount as i128))?;
                self.add(to, *market, *amount as i128)
            }
            Action::TransferAll { from, to, market } => {
                self.market(*market)?;
                let balance = self.account_balance(from, *market);
                self.add(from, *market, -balance)?;
                self.add(to, *market, balance)
            }
            Action::Sell {
                account,
                input_market,
                output_market,
                input_amount,
                min_output_amount,
            } => {
                let price_in = self.market(*input_market)?.price as u128;
                let price_out = self.market(*output_market)?.price as u128;
                let output = (*input_amount as u128)
                    .checked_mul(price_in)
                    .ok_or(LedgerError::AmountOverflow)?
                    / price_out.max(1);
                let output = u64::try_from(output).map_err(|_| LedgerError::AmountOverflow)?;
                if output < *min_output_amount {
                    return Err(LedgerError::OutputBelowMinimum {
                        output,
                        min_output: *min_output_amount,
                    });
                }
                self.debit_strict(account, *input_market, *input_amount)?;
                self.add(account, *output_market, output as i128)
            }
            // The executor path is external; the trader's own bookkeeping
            // moves the balances for these.
            Action::CallTrader { .. } => Ok(()),
        }
    }

    fn check_caps(&self) -> Result<(), LedgerError> {
        for (market, entry) in &self.markets {
            if entry.max_wei == 0 {
                continue;
            }
            let total = self.market_total_supply(*market);
            if total > entry.max_wei as u128 {
                return Err(LedgerError::MarketCapExceeded {
                    market: *market,
                    cap: entry.max_wei,
                    attempted: total,
                });
            }
        }
        Ok(())
    }
}

impl MarginLedger for InMemoryLedger {
    fn account_balance(&self, account: &AccountRef, market: MarketId) -> i128 {
        self.balances
            .get(account)
            .and_then(|m| m.get(&market))
            .copied()
            .unwrap_or(0)
    }

    fn account_markets(&self, account: &AccountRef) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self
            .balances
            .get(account)
            .map(|m| {
                m.iter()
                    .filter(|(_, balance)| **balance != 0)
                    .map(|(market, _)| *market)
                    .collect()
            })
            .unwrap_or_default();
        markets.sort_unstable();
        markets
    }

    fn market_price(&self, market: MarketId) -> Result<u64, LedgerError> {
        Ok(self.market(market)?.price)
    }

    fn is_market_closing(&self, market: MarketId) -> bool {
        self.markets.get(&market).map(|m| m.closing).unwrap_or(false)
    }

    fn max_wei(&self, market: MarketId) -> u64 {
        self.markets.get(&market).map(|m| m.max_wei).unwrap_or(0)
    }

    fn market_total_supply(&self, market: MarketId) -> u128 {
        self.balances
            .values()
            .filter_map(|m| m.get(&market))
            .filter(|balance| **balance > 0)
            .map(|balance| *balance as u128)
            .sum()
    }

    fn is_liquidatable(&self, account: &AccountRef) -> bool {
        let mut collateral_value: u128 = 0;
        let mut debt_value: u128 = 0;
        for market in self.account_markets(account) {
            let price = match self.market_price(market) {
                Ok(p) => p as u128,
                Err(_) => continue,
            };
            let balance = self.account_balance(account, market);
            if balance >= 0 {
                collateral_value += balance as u128 * price;
            } else {
                debt_value += balance.unsigned_abs() * price;
            }
        }
        debt_value > 0 && collateral_value * BPS_DENOMINATOR < debt_value * MARGIN_RATIO_BPS
    }

    fn would_be_liquidatable(
        &self,
        account: &AccountRef,
        actions: &[Action],
    ) -> Result<bool, LedgerError> {
        let mut scratch = self.clone();
        scratch.operate(actions)?;
        Ok(scratch.is_liquidatable(account))
    }

    fn operate(&mut self, actions: &[Action]) -> Result<(), LedgerError> {
        if self.halted_operations > 0 {
            self.halted_operations -= 1;
            return Err(LedgerError::Halted);
        }
        // Copy-then-commit: a failed batch must leave no partial state.
        let mut staged = self.clone();
        for action in actions {
            staged.apply(action)?;
        }
        staged.check_caps()?;
        *self = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC: MarketId = 1;
    const ISO: MarketId = 2;

    fn ledger() -> InMemoryLedger {
        let mut l = InMemoryLedger::new();
        l.list_market(USDC, 1);
        l.list_market(ISO, 4);
        l
    }

    fn acct(number: u64) -> AccountRef {
        AccountRef::new("vault-a", number)
    }

    #[test]
    fn deposit_then_withdraw_roundtrip() {
        let mut l = ledger();
        l.operate(&[Action::Deposit {
            to: acct(0),
            market: ISO,
            amount: 1000,
        }])
        .unwrap();
        assert_eq!(l.account_balance(&acct(0), ISO), 1000);

        l.operate(&[Action::Withdraw {
            from: acct(0),
            market: ISO,
            amount: 400,
        }])
        .unwrap();
        assert_eq!(l.account_balance(&acct(0), ISO), 600);
    }

    #[test]
    fn withdraw_beyond_balance_rejected() {
        let mut l = ledger();
        let result = l.operate(&[Action::Withdraw {
            from: acct(0),
            market: ISO,
            amount: 1,
        }]);
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
    }

    #[test]
    fn transfer_opens_debt_on_source() {
        let mut l = ledger();
        l.operate(&[Action::Transfer {
            from: acct(123),
            to: acct(0),
            market: USDC,
            amount: 500,
        }])
        .unwrap();
        assert_eq!(l.account_balance(&acct(123), USDC), -500);
        assert_eq!(l.account_balance(&acct(0), USDC), 500);
    }

    #[test]
    fn transfer_all_moves_negative_balances() {
        let mut l = ledger();
        l.set_balance(acct(123), USDC, -300);
        l.operate(&[Action::TransferAll {
            from: acct(123),
            to: acct(0),
            market: USDC,
        }])
        .unwrap();
        assert_eq!(l.account_balance(&acct(123), USDC), 0);
        assert_eq!(l.account_balance(&acct(0), USDC), -300);
    }

    #[test]
    fn sell_converts_at_oracle_price() {
        let mut l = ledger();
        l.set_balance(acct(0), ISO, 100);
        // ISO at 4, USDC at 1: 100 ISO -> 400 USDC.
        l.operate(&[Action::Sell {
            account: acct(0),
            input_market: ISO,
            output_market: USDC,
            input_amount: 100,
            min_output_amount: 400,
        }])
        .unwrap();
        assert_eq!(l.account_balance(&acct(0), ISO), 0);
        assert_eq!(l.account_balance(&acct(0), USDC), 400);
    }

    #[test]
    fn sell_below_minimum_rejected() {
        let mut l = ledger();
        l.set_balance(acct(0), ISO, 100);
        let result = l.operate(&[Action::Sell {
            account: acct(0),
            input_market: ISO,
            output_market: USDC,
            input_amount: 100,
            min_output_amount: 401,
        }]);
        assert!(matches!(result, Err(LedgerError::OutputBelowMinimum { .. })));
        // Nothing moved.
        assert_eq!(l.account_balance(&acct(0), ISO), 100);
    }

    #[test]
    fn supply_cap_enforced() {
        let mut l = ledger();
        l.set_max_wei(ISO, 500);
        let result = l.operate(&[Action::Deposit {
            to: acct(0),
            market: ISO,
            amount: 501,
        }]);
        assert!(matches!(result, Err(LedgerError::MarketCapExceeded { .. })));

        l.operate(&[Action::Deposit {
            to: acct(0),
            market: ISO,
            amount: 500,
        }])
        .unwrap();
        assert_eq!(l.market_total_supply(ISO), 500);
    }

    #[test]
    fn failed_batch_leaves_no_partial_state() {
        let mut l = ledger();
        let result = l.operate(&[
            Action::Deposit {
                to: acct(0),
                market: ISO,
                amount: 100,
            },
            Action::Withdraw {
                from: acct(0),
                market: USDC,
                amount: 1, // fails: no USDC balance
            },
        ]);
        assert!(result.is_err());
        assert_eq!(l.account_balance(&acct(0), ISO), 0);
    }

    #[test]
    fn halt_rejects_exactly_n_batches() {
        let mut l = ledger();
        l.halt_operations(1);
        let deposit = [Action::Deposit {
            to: acct(0),
            market: ISO,
            amount: 100,
        }];
        assert!(matches!(l.operate(&deposit), Err(LedgerError::Halted)));
        l.operate(&deposit).unwrap();
        assert_eq!(l.account_balance(&acct(0), ISO), 100);
    }

    #[test]
    fn liquidatability_tracks_margin_floor() {
        let mut l = ledger();
        // 120 ISO collateral at price 4 = 480; 400 USDC debt at price 1.
        // 480 * 10000 >= 400 * 11500 (4.8M vs 4.6M) -> safe.
        l.set_balance(acct(123), ISO, 120);
        l.set_balance(acct(123), USDC, -400);
        assert!(!l.is_liquidatable(&acct(123)));

        // Drop collateral to 110 ISO = 440: 4.4M < 4.6M -> liquidatable.
        l.set_balance(acct(123), ISO, 110);
        assert!(l.is_liquidatable(&acct(123)));
    }

    #[test]
    fn would_be_liquidatable_is_pure() {
        let mut l = ledger();
        l.set_balance(acct(123), ISO, 120);
        l.set_balance(acct(123), USDC, -400);

        let withdrawing = [Action::Withdraw {
            from: acct(123),
            market: ISO,
            amount: 20,
        }];
        assert!(l.would_be_liquidatable(&acct(123), &withdrawing).unwrap());
        // The probe must not have moved anything.
        assert_eq!(l.account_balance(&acct(123), ISO), 120);
    }
}
