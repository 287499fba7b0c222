//! # Token Vault
//!
//! One isolated vault per user, custodian of a single restricted asset.
//! Every operation runs the same gauntlet before any money moves:
//!
//! 1. **Authorization** — owner, trusted converter, or liquidator,
//!    depending on the operation; while an account is frozen the owner is
//!    locked out of swap operations so in-flight settlement can complete
//!    without interference.
//! 2. **Freeze gate** — any named account with an outstanding async
//!    settlement causes rejection, except on the paths that resolve it.
//! 3. **Allow-lists** — factory-owned collateral and debt market lists,
//!    enforced here on every transfer and swap.
//! 4. **Safety** — collateral-reducing and debt-increasing actions are
//!    simulated against the ledger first; anything that would leave the
//!    account liquidatable is rejected.
//!
//! The two initiate-unwrap entry points call into trader components before
//! bookkeeping completes, so both run under a scoped reentrancy guard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{DEFAULT_ACCOUNT_NUMBER, MAX_SWAP_PATH_LENGTH};
use crate::factory::{FactoryError, VaultFactory};
use crate::ledger::{
    AccountNumber, AccountRef, Action, Address, LedgerError, MarketId, SharedLedger,
};
use crate::registry::HandlerRegistry;
use crate::registry::LiquidatorWhitelist;
use crate::trader::TraderError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The caller is not the vault owner.
    #[error("unauthorized: {caller} is not the vault owner")]
    NotOwner {
        /// Address that attempted the operation.
        caller: Address,
    },

    /// The caller is not on the liquidator whitelist.
    #[error("unauthorized: {caller} is not a whitelisted liquidator")]
    NotLiquidator {
        /// Address that attempted the operation.
        caller: Address,
    },

    /// The caller is not the registered wrapper/unwrapper for this vault's
    /// isolation asset.
    #[error("unauthorized: {caller} is not a registered trader")]
    NotTrader {
        /// Address that attempted the operation.
        caller: Address,
    },

    /// The named account has an outstanding async settlement.
    #[error("account {account} is frozen by a pending settlement")]
    AccountFrozen {
        /// The frozen account number.
        account: AccountNumber,
    },

    /// The account is frozen and the operation is reserved for a trusted
    /// converter until settlement resolves.
    #[error("account {account} is frozen: only a trusted converter may act")]
    OwnerLockedOut {
        /// The frozen account number.
        account: AccountNumber,
    },

    /// Zero or otherwise unusable amount.
    #[error("invalid amount")]
    InvalidAmount,

    /// A swap path with more hops than the protocol allows.
    #[error("swap path too long: {length} markets, maximum {max}")]
    SwapPathTooLong {
        /// Number of markets in the offending path.
        length: usize,
        /// The configured cap.
        max: usize,
    },

    /// Borrow positions live in nonzero account numbers.
    #[error("invalid account number {account}: borrow positions use nonzero accounts")]
    InvalidAccountNumber {
        /// The offending account number.
        account: AccountNumber,
    },

    /// The isolation asset has a dedicated deposit/withdraw path and can
    /// never be moved as the "other token".
    #[error("the underlying isolation asset cannot be transferred as an other token")]
    UnderlyingNotAllowed,

    /// A transfer would drive a market not on the collateral allow-list
    /// negative.
    #[error("market {0} is not an allowed collateral market")]
    CollateralMarketNotAllowed(MarketId),

    /// A transfer would increase debt in a market not on the debt
    /// allow-list.
    #[error("market {0} is not an allowed debt market")]
    DebtMarketNotAllowed(MarketId),

    /// The operation would leave the acting account liquidatable.
    #[error("account {account} would become liquidatable")]
    AccountWouldBeLiquidatable {
        /// The account that failed the simulation.
        account: AccountNumber,
    },

    /// A liquidation unwrap must take the full account balance.
    #[error("liquidation must unwrap the full balance: requested {requested}, balance {balance}")]
    LiquidationNotFullBalance {
        /// Amount the liquidator asked for.
        requested: u64,
        /// Whole balance of the account.
        balance: u64,
    },

    /// A nested call re-entered an initiate-unwrap entry point.
    #[error("reentrant call into vault trade entry point")]
    Reentrancy,

    /// No wrapper/unwrapper pair has been installed on the factory.
    #[error("no traders installed for this factory")]
    TradersNotInstalled,

    /// Withdrawing more directly-held balance than the vault has.
    #[error("insufficient held balance: have {available}, requested {requested}")]
    InsufficientHeldBalance {
        /// Directly-held balance.
        available: u64,
        /// Amount requested.
        requested: u64,
    },

    /// A trader call failed.
    #[error(transparent)]
    Trader(#[from] TraderError),

    /// Freeze bookkeeping rejected the operation.
    #[error(transparent)]
    Factory(#[from] FactoryError),

    /// The margin ledger rejected the operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// State & Guard
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct VaultState {
    /// Isolation asset held directly by the vault, outside the ledger.
    /// Fed by deposit spillover when the market is at capacity.
    underlying_balance: u64,
    /// One-shot flag: the next deposit credit originates from the wrapper.
    is_deposit_source_wrapper: bool,
    /// One-shot flag: skip the token transfer on the next deposit credit.
    should_skip_transfer: bool,
    /// Reentrancy latch around the initiate-unwrap entry points.
    in_trade: bool,
    created_at: DateTime<Utc>,
}

/// Scoped reentrancy guard. Entering twice without dropping fails; the
/// latch releases on drop, including on the error paths.
struct TradeGuard {
    state: Arc<RwLock<VaultState>>,
}

impl TradeGuard {
    fn enter(state: &Arc<RwLock<VaultState>>) -> Result<Self, VaultError> {
        let mut s = state.write();
        if s.in_trade {
            return Err(VaultError::Reentrancy);
        }
        s.in_trade = true;
        Ok(TradeGuard {
            state: Arc::clone(state),
        })
    }
}

impl Drop for TradeGuard {
    fn drop(&mut self) {
        self.state.write().in_trade = false;
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Per-user isolation vault. Cloning clones the handle; the factory keeps
/// the canonical copy.
#[derive(Debug, Clone)]
pub struct TokenVault {
    address: Address,
    owner: Address,
    isolation_market: MarketId,
    factory: VaultFactory,
    ledger: SharedLedger,
    registry: HandlerRegistry,
    whitelist: LiquidatorWhitelist,
    state: Arc<RwLock<VaultState>>,
}

impl TokenVault {
    /// Assemble a vault from its wiring. Called by the factory only; user
    /// code obtains vaults through [`VaultFactory::create_vault`].
    pub(crate) fn from_parts(
        address: Address,
        owner: Address,
        isolation_market: MarketId,
        factory: VaultFactory,
        ledger: SharedLedger,
        registry: HandlerRegistry,
        whitelist: LiquidatorWhitelist,
    ) -> Self {
        Self {
            address,
            owner,
            isolation_market,
            factory,
            ledger,
            registry,
            whitelist,
            state: Arc::new(RwLock::new(VaultState {
                underlying_balance: 0,
                is_deposit_source_wrapper: false,
                should_skip_transfer: false,
                in_trade: false,
                created_at: Utc::now(),
            })),
        }
    }

    /// This vault's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The vault owner's address.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The isolation asset this vault custodies.
    pub fn isolation_market(&self) -> MarketId {
        self.isolation_market
    }

    /// Isolation asset held directly by the vault (spillover).
    pub fn underlying_balance(&self) -> u64 {
        self.state.read().underlying_balance
    }

    /// When the vault was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.read().created_at
    }

    /// Current value of the deposit-source-wrapper flag.
    pub fn is_deposit_source_wrapper(&self) -> bool {
        self.state.read().is_deposit_source_wrapper
    }

    /// Current value of the skip-transfer flag.
    pub fn should_skip_transfer(&self) -> bool {
        self.state.read().should_skip_transfer
    }

    // -----------------------------------------------------------------------
    // Deposit / Withdraw (underlying only)
    // -----------------------------------------------------------------------

    /// Deposit the isolation asset into a vault account. Owner only; the
    /// account must not be frozen.
    pub fn deposit_into_vault(
        &self,
        caller: &str,
        to_account: AccountNumber,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        self.check_not_frozen(to_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        self.ledger.write().operate(&[Action::Deposit {
            to: self.account(to_account),
            market: self.isolation_market,
            amount,
        }])?;
        info!(vault = %self.address, account = to_account, amount, "deposit");
        Ok(())
    }

    /// Withdraw the isolation asset from a vault account. Owner only; the
    /// account must not be frozen and must stay safe afterwards.
    pub fn withdraw_from_vault(
        &self,
        caller: &str,
        from_account: AccountNumber,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        self.check_not_frozen(from_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        let actions = [Action::Withdraw {
            from: self.account(from_account),
            market: self.isolation_market,
            amount,
        }];
        self.check_remains_safe(from_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        info!(vault = %self.address, account = from_account, amount, "withdraw");
        Ok(())
    }

    /// Withdraw from the vault's directly-held spillover balance. Owner
    /// only; purely internal bookkeeping, no ledger involvement.
    pub fn withdraw_held_balance(&self, caller: &str, amount: u64) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let mut state = self.state.write();
        if state.underlying_balance < amount {
            return Err(VaultError::InsufficientHeldBalance {
                available: state.underlying_balance,
                requested: amount,
            });
        }
        state.underlying_balance -= amount;
        info!(vault = %self.address, amount, "held balance withdrawn");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Borrow Positions
    // -----------------------------------------------------------------------

    /// Open a borrow position: move isolation asset from the default
    /// account into a nonzero position account.
    pub fn open_borrow_position(
        &self,
        caller: &str,
        from_account: AccountNumber,
        borrow_account: AccountNumber,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if borrow_account == DEFAULT_ACCOUNT_NUMBER {
            return Err(VaultError::InvalidAccountNumber {
                account: borrow_account,
            });
        }
        self.check_not_frozen(from_account)?;
        self.check_not_frozen(borrow_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        let actions = [Action::Transfer {
            from: self.account(from_account),
            to: self.account(borrow_account),
            market: self.isolation_market,
            amount,
        }];
        self.check_remains_safe(from_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        info!(
            vault = %self.address,
            from = from_account,
            borrow = borrow_account,
            amount,
            "borrow position opened"
        );
        Ok(())
    }

    /// Close a borrow position: sweep the listed markets back into the
    /// receiving account.
    pub fn close_borrow_position(
        &self,
        caller: &str,
        borrow_account: AccountNumber,
        to_account: AccountNumber,
        collateral_market_ids: &[MarketId],
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if borrow_account == DEFAULT_ACCOUNT_NUMBER {
            return Err(VaultError::InvalidAccountNumber {
                account: borrow_account,
            });
        }
        self.check_not_frozen(borrow_account)?;
        self.check_not_frozen(to_account)?;

        let actions: Vec<Action> = collateral_market_ids
            .iter()
            .map(|market| Action::TransferAll {
                from: self.account(borrow_account),
                to: self.account(to_account),
                market: *market,
            })
            .collect();
        self.ledger.write().operate(&actions)?;
        info!(
            vault = %self.address,
            borrow = borrow_account,
            to = to_account,
            "borrow position closed"
        );
        Ok(())
    }

    /// Move isolation asset into an open position.
    pub fn transfer_into_position_with_underlying(
        &self,
        caller: &str,
        from_account: AccountNumber,
        borrow_account: AccountNumber,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if borrow_account == DEFAULT_ACCOUNT_NUMBER {
            return Err(VaultError::InvalidAccountNumber {
                account: borrow_account,
            });
        }
        self.check_not_frozen(from_account)?;
        self.check_not_frozen(borrow_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        let actions = [Action::Transfer {
            from: self.account(from_account),
            to: self.account(borrow_account),
            market: self.isolation_market,
            amount,
        }];
        self.check_remains_safe(from_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        Ok(())
    }

    /// Move a non-underlying market into an open position. Enforces the
    /// factory's collateral and debt allow-lists on the sending side.
    pub fn transfer_into_position_with_other_token(
        &self,
        caller: &str,
        from_account: AccountNumber,
        borrow_account: AccountNumber,
        market: MarketId,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if market == self.isolation_market {
            return Err(VaultError::UnderlyingNotAllowed);
        }
        self.check_not_frozen(from_account)?;
        self.check_not_frozen(borrow_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        self.check_allow_lists(from_account, market, amount)?;
        self.ledger.write().operate(&[Action::Transfer {
            from: self.account(from_account),
            to: self.account(borrow_account),
            market,
            amount,
        }])?;
        Ok(())
    }

    /// Move isolation asset out of an open position. The position must
    /// stay safe afterwards.
    pub fn transfer_from_position_with_underlying(
        &self,
        caller: &str,
        borrow_account: AccountNumber,
        to_account: AccountNumber,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        self.check_not_frozen(borrow_account)?;
        self.check_not_frozen(to_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        let actions = [Action::Transfer {
            from: self.account(borrow_account),
            to: self.account(to_account),
            market: self.isolation_market,
            amount,
        }];
        self.check_remains_safe(borrow_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        Ok(())
    }

    /// Move a non-underlying market out of an open position. The position
    /// must stay safe and the allow-lists are enforced on the borrow side.
    pub fn transfer_from_position_with_other_token(
        &self,
        caller: &str,
        borrow_account: AccountNumber,
        to_account: AccountNumber,
        market: MarketId,
        amount: u64,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if market == self.isolation_market {
            return Err(VaultError::UnderlyingNotAllowed);
        }
        self.check_not_frozen(borrow_account)?;
        self.check_not_frozen(to_account)?;
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }

        self.check_allow_lists(borrow_account, market, amount)?;
        let actions = [Action::Transfer {
            from: self.account(borrow_account),
            to: self.account(to_account),
            market,
            amount,
        }];
        self.check_remains_safe(borrow_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        Ok(())
    }

    /// Repay the whole debt of one market in a borrow position from the
    /// default account. A position with no debt in that market is a no-op.
    pub fn repay_all_for_borrow_position(
        &self,
        caller: &str,
        borrow_account: AccountNumber,
        market: MarketId,
    ) -> Result<(), VaultError> {
        self.check_owner(caller)?;
        if market == self.isolation_market {
            return Err(VaultError::UnderlyingNotAllowed);
        }
        self.check_not_frozen(DEFAULT_ACCOUNT_NUMBER)?;
        self.check_not_frozen(borrow_account)?;

        let debt = {
            let ledger = self.ledger.read();
            let balance = ledger.account_balance(&self.account(borrow_account), market);
            if balance >= 0 {
                debug!(vault = %self.address, borrow = borrow_account, market, "no debt to repay");
                return Ok(());
            }
            u64::try_from(-balance).map_err(|_| VaultError::InvalidAmount)?
        };

        self.ledger.write().operate(&[Action::Transfer {
            from: self.account(DEFAULT_ACCOUNT_NUMBER),
            to: self.account(borrow_account),
            market,
            amount: debt,
        }])?;
        info!(vault = %self.address, borrow = borrow_account, market, debt, "debt repaid");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Swaps
    // -----------------------------------------------------------------------

    /// Swap an exact input for an output inside one account.
    ///
    /// Callable by the owner or a trusted converter; while the account is
    /// frozen the owner is locked out and only the converter may act, so
    /// in-flight settlement can complete without user interference.
    pub fn swap_exact_input_for_output(
        &self,
        caller: &str,
        account_number: AccountNumber,
        market_path: &[MarketId],
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<(), VaultError> {
        self.check_swap_caller(caller, account_number)?;
        if market_path.len() < 2 {
            return Err(VaultError::InvalidAmount);
        }
        if market_path.len() > MAX_SWAP_PATH_LENGTH {
            return Err(VaultError::SwapPathTooLong {
                length: market_path.len(),
                max: MAX_SWAP_PATH_LENGTH,
            });
        }
        if input_amount == 0 || min_output_amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let input_market = market_path[0];
        let output_market = *market_path.last().expect("checked non-empty");

        self.check_allow_lists(account_number, input_market, input_amount)?;
        let actions = [Action::Sell {
            account: self.account(account_number),
            input_market,
            output_market,
            input_amount,
            min_output_amount,
        }];
        self.check_remains_safe(account_number, &actions)?;
        self.ledger.write().operate(&actions)?;
        info!(
            vault = %self.address,
            account = account_number,
            input_market,
            output_market,
            input_amount,
            "swap executed"
        );
        Ok(())
    }

    /// Add collateral to a position, then swap it inside the position.
    pub fn add_collateral_and_swap_exact_input_for_output(
        &self,
        caller: &str,
        from_account: AccountNumber,
        borrow_account: AccountNumber,
        market_path: &[MarketId],
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<(), VaultError> {
        let input_market = *market_path.first().ok_or(VaultError::InvalidAmount)?;
        if input_market == self.isolation_market {
            self.transfer_into_position_with_underlying(
                caller,
                from_account,
                borrow_account,
                input_amount,
            )?;
        } else {
            self.transfer_into_position_with_other_token(
                caller,
                from_account,
                borrow_account,
                input_market,
                input_amount,
            )?;
        }
        self.swap_exact_input_for_output(
            caller,
            borrow_account,
            market_path,
            input_amount,
            min_output_amount,
        )
    }

    /// Swap inside a position, then remove the proceeds.
    pub fn swap_exact_input_for_output_and_remove_collateral(
        &self,
        caller: &str,
        to_account: AccountNumber,
        borrow_account: AccountNumber,
        market_path: &[MarketId],
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<(), VaultError> {
        self.check_not_frozen(to_account)?;
        self.swap_exact_input_for_output(
            caller,
            borrow_account,
            market_path,
            input_amount,
            min_output_amount,
        )?;
        let output_market = *market_path.last().ok_or(VaultError::InvalidAmount)?;

        let actions = [Action::TransferAll {
            from: self.account(borrow_account),
            to: self.account(to_account),
            market: output_market,
        }];
        self.check_remains_safe(borrow_account, &actions)?;
        self.ledger.write().operate(&actions)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Initiate Unwrap
    // -----------------------------------------------------------------------

    /// Start an async withdrawal of the isolation asset. Owner only;
    /// requires a positive amount and minimum output, the amount within
    /// the unfrozen balance, and no outstanding settlement on the account.
    pub fn initiate_unwrapping(
        &self,
        caller: &str,
        account_number: AccountNumber,
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<String, VaultError> {
        self.check_owner(caller)?;
        let _guard = TradeGuard::enter(&self.state)?;
        self.check_not_frozen(account_number)?;
        if input_amount == 0 || min_output_amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let balance = self.isolation_balance(account_number);
        if (input_amount as i128) > balance {
            return Err(VaultError::InvalidAmount);
        }

        let unwrapper = self
            .factory
            .unwrapper()
            .ok_or(VaultError::TradersNotInstalled)?;
        let key = unwrapper.create_withdrawal(
            &self.address,
            account_number,
            input_amount,
            min_output_amount,
        )?;
        Ok(key)
    }

    /// Start an async withdrawal on behalf of a liquidator. Whitelist
    /// only, and strictly the full balance: a partially-resolved freeze
    /// cannot be safely unwound.
    pub fn initiate_unwrapping_for_liquidation(
        &self,
        caller: &str,
        account_number: AccountNumber,
        input_amount: u64,
        min_output_amount: u64,
    ) -> Result<String, VaultError> {
        if !self.whitelist.is_liquidator(caller) {
            return Err(VaultError::NotLiquidator {
                caller: caller.to_string(),
            });
        }
        let _guard = TradeGuard::enter(&self.state)?;
        self.check_not_frozen(account_number)?;
        if input_amount == 0 || min_output_amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let balance = self.isolation_balance(account_number);
        let balance_u64 = u64::try_from(balance.max(0)).unwrap_or(0);
        if input_amount != balance_u64 {
            return Err(VaultError::LiquidationNotFullBalance {
                requested: input_amount,
                balance: balance_u64,
            });
        }

        let unwrapper = self
            .factory
            .unwrapper()
            .ok_or(VaultError::TradersNotInstalled)?;
        let key = unwrapper.create_withdrawal(
            &self.address,
            account_number,
            input_amount,
            min_output_amount,
        )?;
        info!(
            vault = %self.address,
            account = account_number,
            liquidator = caller,
            input_amount,
            "liquidation unwrap initiated"
        );
        Ok(key)
    }

    // -----------------------------------------------------------------------
    // Trader-Facing Hooks
    // -----------------------------------------------------------------------

    /// Toggle the deposit-source-wrapper flag. Registered traders only.
    pub fn set_is_deposit_source_wrapper(
        &self,
        caller: &str,
        value: bool,
    ) -> Result<(), VaultError> {
        self.check_trader(caller)?;
        self.state.write().is_deposit_source_wrapper = value;
        debug!(vault = %self.address, value, "deposit-source-wrapper flag set");
        Ok(())
    }

    /// Toggle the skip-transfer flag. Registered traders only.
    pub fn set_should_skip_transfer(&self, caller: &str, value: bool) -> Result<(), VaultError> {
        self.check_trader(caller)?;
        self.state.write().should_skip_transfer = value;
        debug!(vault = %self.address, value, "skip-transfer flag set");
        Ok(())
    }

    /// Credit deposit spillover to the vault's directly-held balance.
    /// Registered traders only.
    pub fn credit_spillover(&self, caller: &str, amount: u64) -> Result<(), VaultError> {
        self.check_trader(caller)?;
        let mut state = self.state.write();
        state.underlying_balance = state.underlying_balance.saturating_add(amount);
        info!(vault = %self.address, amount, "spillover credited to held balance");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    fn account(&self, number: AccountNumber) -> AccountRef {
        AccountRef::new(&self.address, number)
    }

    fn isolation_balance(&self, account_number: AccountNumber) -> i128 {
        self.ledger
            .read()
            .account_balance(&self.account(account_number), self.isolation_market)
    }

    fn check_owner(&self, caller: &str) -> Result<(), VaultError> {
        if caller != self.owner {
            return Err(VaultError::NotOwner {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    fn check_trader(&self, caller: &str) -> Result<(), VaultError> {
        if !self
            .registry
            .is_trader_for_token(self.isolation_market, caller)
        {
            return Err(VaultError::NotTrader {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    fn check_not_frozen(&self, account_number: AccountNumber) -> Result<(), VaultError> {
        if self
            .factory
            .is_vault_account_frozen(&self.address, account_number)
        {
            return Err(VaultError::AccountFrozen {
                account: account_number,
            });
        }
        Ok(())
    }

    /// Swap callers: owner or trusted converter normally; converter only
    /// while the account is frozen.
    fn check_swap_caller(
        &self,
        caller: &str,
        account_number: AccountNumber,
    ) -> Result<(), VaultError> {
        let is_converter = self.factory.is_trusted_converter(caller);
        if self
            .factory
            .is_vault_account_frozen(&self.address, account_number)
        {
            if !is_converter {
                return Err(VaultError::OwnerLockedOut {
                    account: account_number,
                });
            }
            return Ok(());
        }
        if caller != self.owner && !is_converter {
            return Err(VaultError::NotOwner {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    /// Collateral rule: a non-listed market may not be driven negative.
    /// Debt rule: debt may not increase in a non-listed market.
    fn check_allow_lists(
        &self,
        from_account: AccountNumber,
        market: MarketId,
        amount_out: u64,
    ) -> Result<(), VaultError> {
        let balance = self
            .ledger
            .read()
            .account_balance(&self.account(from_account), market);
        let new_balance = balance - amount_out as i128;
        if new_balance < 0 {
            if !self.factory.is_market_allowed_as_collateral(market) {
                return Err(VaultError::CollateralMarketNotAllowed(market));
            }
            if new_balance < balance.min(0) && !self.factory.is_market_allowed_as_debt(market) {
                return Err(VaultError::DebtMarketNotAllowed(market));
            }
        }
        Ok(())
    }

    fn check_remains_safe(
        &self,
        account_number: AccountNumber,
        actions: &[Action],
    ) -> Result<(), VaultError> {
        if !actions.iter().any(Action::reduces_safety)
            && !actions.iter().any(|a| matches!(a, Action::Sell { .. }))
        {
            return Ok(());
        }
        let account = self.account(account_number);
        if self
            .ledger
            .read()
            .would_be_liquidatable(&account, actions)?
        {
            return Err(VaultError::AccountWouldBeLiquidatable {
                account: account_number,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;
    use crate::ledger::{InMemoryLedger, MarginLedger, SharedLedger};
    use crate::trader::{UnwrapperTrader, WrapperTrader};

    const REGISTRY_OWNER: &str = "registry-owner";
    const FACTORY_OWNER: &str = "factory-owner";
    const EXECUTOR: &str = "trade-executor";
    const USDC: MarketId = 1;
    const ISO: MarketId = 2;
    const WETH: MarketId = 3;

    struct Harness {
        factory: VaultFactory,
        vault: TokenVault,
        ledger: Arc<RwLock<InMemoryLedger>>,
        whitelist: LiquidatorWhitelist,
    }

    fn harness() -> Harness {
        let mut ledger = InMemoryLedger::new();
        ledger.list_market(USDC, 1);
        ledger.list_market(ISO, 4);
        ledger.list_market(WETH, 10);
        let concrete = Arc::new(RwLock::new(ledger));
        let shared: SharedLedger = concrete.clone();

        let registry = HandlerRegistry::new(REGISTRY_OWNER);
        let whitelist = LiquidatorWhitelist::new();
        let factory = VaultFactory::new(
            FACTORY_OWNER,
            ISO,
            shared,
            registry.clone(),
            whitelist.clone(),
        );

        let wrapper =
            WrapperTrader::new("wrapper-1", USDC, EXECUTOR, "unwrapper-1", factory.clone());
        let unwrapper = UnwrapperTrader::new(
            "unwrapper-1",
            USDC,
            EXECUTOR,
            wrapper.clone(),
            factory.clone(),
        );
        registry
            .set_wrapper_by_token(REGISTRY_OWNER, ISO, "wrapper-1")
            .unwrap();
        registry
            .set_unwrapper_by_token(REGISTRY_OWNER, ISO, "unwrapper-1")
            .unwrap();
        factory
            .owner_install_traders(FACTORY_OWNER, wrapper, unwrapper)
            .unwrap();

        let vault = factory.create_vault("alice").unwrap();
        Harness {
            factory,
            vault,
            ledger: concrete,
            whitelist,
        }
    }

    fn balance(h: &Harness, account: u64, market: MarketId) -> i128 {
        h.ledger
            .read()
            .account_balance(&AccountRef::new(h.vault.address(), account), market)
    }

    #[test]
    fn deposit_is_owner_gated() {
        let h = harness();
        assert!(matches!(
            h.vault.deposit_into_vault("mallory", 0, 100),
            Err(VaultError::NotOwner { .. })
        ));
        h.vault.deposit_into_vault("alice", 0, 100).unwrap();
        assert_eq!(balance(&h, 0, ISO), 100);
    }

    #[test]
    fn withdraw_requires_unfrozen_account() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 100).unwrap();

        let addr = h.vault.address().to_string();
        h.factory
            .set_vault_account_pending_amount_for_frozen_status(
                &addr,
                &addr,
                0,
                crate::factory::FreezeType::Deposit,
                50,
                None,
            )
            .unwrap();
        assert!(matches!(
            h.vault.withdraw_from_vault("alice", 0, 100),
            Err(VaultError::AccountFrozen { .. })
        ));
    }

    #[test]
    fn borrow_position_requires_nonzero_account() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        assert!(matches!(
            h.vault.open_borrow_position("alice", 0, 0, 200),
            Err(VaultError::InvalidAccountNumber { .. })
        ));
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();
        assert_eq!(balance(&h, 123, ISO), 200);
        assert_eq!(balance(&h, 0, ISO), 0);
    }

    #[test]
    fn underlying_moves_in_and_out_of_a_position() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 150).unwrap();

        h.vault
            .transfer_into_position_with_underlying("alice", 0, 123, 50)
            .unwrap();
        assert_eq!(balance(&h, 123, ISO), 200);

        h.vault
            .transfer_from_position_with_underlying("alice", 123, 0, 80)
            .unwrap();
        assert_eq!(balance(&h, 123, ISO), 120);
        assert_eq!(balance(&h, 0, ISO), 80);

        assert!(matches!(
            h.vault
                .transfer_from_position_with_underlying("alice", 123, 0, 0),
            Err(VaultError::InvalidAmount)
        ));
    }

    #[test]
    fn underlying_is_never_the_other_token() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();

        assert!(matches!(
            h.vault
                .transfer_into_position_with_other_token("alice", 0, 123, ISO, 50),
            Err(VaultError::UnderlyingNotAllowed)
        ));
        assert!(matches!(
            h.vault
                .transfer_from_position_with_other_token("alice", 123, 0, ISO, 50),
            Err(VaultError::UnderlyingNotAllowed)
        ));
    }

    #[test]
    fn debt_allow_list_blocks_non_listed_borrow() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();
        h.factory
            .owner_set_allowable_debt_market_ids(FACTORY_OWNER, vec![USDC])
            .unwrap();
        h.factory
            .owner_set_allowable_collateral_market_ids(FACTORY_OWNER, vec![USDC, WETH])
            .unwrap();

        // Borrowing WETH against the position drives account 0's WETH
        // balance negative; WETH collateral is fine but WETH debt is not.
        let result = h
            .vault
            .transfer_into_position_with_other_token("alice", 0, 123, WETH, 5);
        assert!(matches!(result, Err(VaultError::DebtMarketNotAllowed(m)) if m == WETH));

        // USDC is on the debt list, so the same move in USDC passes.
        h.vault
            .transfer_into_position_with_other_token("alice", 0, 123, USDC, 50)
            .unwrap();
        assert_eq!(balance(&h, 0, USDC), -50);
        assert_eq!(balance(&h, 123, USDC), 50);
    }

    #[test]
    fn collateral_allow_list_blocks_non_listed_market_going_negative() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();
        h.factory
            .owner_set_allowable_collateral_market_ids(FACTORY_OWNER, vec![USDC])
            .unwrap();

        let result = h
            .vault
            .transfer_into_position_with_other_token("alice", 0, 123, WETH, 5);
        assert!(matches!(
            result,
            Err(VaultError::CollateralMarketNotAllowed(m)) if m == WETH
        ));
    }

    #[test]
    fn repay_all_clears_debt_and_tolerates_no_debt() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();
        h.vault
            .transfer_into_position_with_other_token("alice", 0, 123, USDC, 50)
            .unwrap();

        // Fund the default account and manufacture debt in the borrow
        // account so there is something to repay.
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 0), USDC, 100);
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 123), USDC, -40);

        h.vault
            .repay_all_for_borrow_position("alice", 123, USDC)
            .unwrap();
        assert_eq!(balance(&h, 123, USDC), 0);
        assert_eq!(balance(&h, 0, USDC), 60);

        // No debt left: repeat is a no-op.
        h.vault
            .repay_all_for_borrow_position("alice", 123, USDC)
            .unwrap();
        assert_eq!(balance(&h, 0, USDC), 60);
    }

    #[test]
    fn frozen_account_locks_owner_out_of_swaps_but_not_converter() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 123), USDC, 400);
        h.factory
            .owner_set_trusted_converter(FACTORY_OWNER, "converter-1", true)
            .unwrap();

        let addr = h.vault.address().to_string();
        h.factory
            .set_vault_account_pending_amount_for_frozen_status(
                &addr,
                &addr,
                123,
                crate::factory::FreezeType::Deposit,
                50,
                None,
            )
            .unwrap();

        let owner_attempt =
            h.vault
                .swap_exact_input_for_output("alice", 123, &[USDC, WETH], 100, 1);
        assert!(matches!(owner_attempt, Err(VaultError::OwnerLockedOut { .. })));

        h.vault
            .swap_exact_input_for_output("converter-1", 123, &[USDC, WETH], 100, 1)
            .unwrap();
        assert_eq!(balance(&h, 123, WETH), 10);
    }

    #[test]
    fn swap_and_remove_rejects_frozen_destination() {
        let h = harness();
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 123), USDC, 400);

        let addr = h.vault.address().to_string();
        h.factory
            .set_vault_account_pending_amount_for_frozen_status(
                &addr,
                &addr,
                55,
                crate::factory::FreezeType::Deposit,
                40,
                None,
            )
            .unwrap();

        // Only the registered trader may touch a frozen account, so the
        // proceeds of the composite swap must not land there either.
        assert!(matches!(
            h.vault.swap_exact_input_for_output_and_remove_collateral(
                "alice",
                55,
                123,
                &[USDC, WETH],
                100,
                1,
            ),
            Err(VaultError::AccountFrozen { account: 55 })
        ));
        assert_eq!(balance(&h, 55, WETH), 0);
        assert_eq!(balance(&h, 123, USDC), 400);
    }

    #[test]
    fn swap_path_longer_than_cap_rejected() {
        let h = harness();
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 123), USDC, 400);

        let long_path = [USDC, WETH, USDC, WETH];
        assert!(matches!(
            h.vault
                .swap_exact_input_for_output("alice", 123, &long_path, 100, 1),
            Err(VaultError::SwapPathTooLong { length: 4, .. })
        ));

        // The composites route through the same entry point.
        assert!(matches!(
            h.vault.swap_exact_input_for_output_and_remove_collateral(
                "alice",
                0,
                123,
                &long_path,
                100,
                1,
            ),
            Err(VaultError::SwapPathTooLong { .. })
        ));
    }

    #[test]
    fn initiate_unwrapping_happy_path() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();

        let key = h.vault.initiate_unwrapping("alice", 123, 200, 1).unwrap();
        assert!(!key.is_empty());
        assert!(h.factory.is_vault_account_frozen(h.vault.address(), 123));
        assert_eq!(h.factory.pending_amount(h.vault.address(), 123), -200);

        // The freeze is per account: depositing to account 0 still works.
        h.vault.deposit_into_vault("alice", 0, 25).unwrap();
        assert_eq!(balance(&h, 0, ISO), 25);
    }

    #[test]
    fn initiate_unwrapping_validates_inputs() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 100).unwrap();

        assert!(matches!(
            h.vault.initiate_unwrapping("alice", 0, 0, 1),
            Err(VaultError::InvalidAmount)
        ));
        assert!(matches!(
            h.vault.initiate_unwrapping("alice", 0, 100, 0),
            Err(VaultError::InvalidAmount)
        ));
        // More than the balance.
        assert!(matches!(
            h.vault.initiate_unwrapping("alice", 0, 101, 1),
            Err(VaultError::InvalidAmount)
        ));
    }

    #[test]
    fn liquidation_unwrap_requires_whitelist_and_full_balance() {
        let h = harness();
        h.vault.deposit_into_vault("alice", 0, 200).unwrap();
        h.vault.open_borrow_position("alice", 0, 123, 200).unwrap();

        assert!(matches!(
            h.vault
                .initiate_unwrapping_for_liquidation("mallory", 123, 200, 1),
            Err(VaultError::NotLiquidator { .. })
        ));

        h.whitelist.insert("liquidator-1");
        let partial = h
            .vault
            .initiate_unwrapping_for_liquidation("liquidator-1", 123, 150, 1);
        assert!(matches!(
            partial,
            Err(VaultError::LiquidationNotFullBalance {
                requested: 150,
                balance: 200
            })
        ));

        h.vault
            .initiate_unwrapping_for_liquidation("liquidator-1", 123, 200, 1)
            .unwrap();
        assert_eq!(h.factory.pending_amount(h.vault.address(), 123), -200);
    }

    #[test]
    fn trade_guard_rejects_nested_entry() {
        let h = harness();
        let first = TradeGuard::enter(&h.vault.state).unwrap();
        assert!(matches!(
            TradeGuard::enter(&h.vault.state),
            Err(VaultError::Reentrancy)
        ));
        drop(first);
        TradeGuard::enter(&h.vault.state).unwrap();
    }

    #[test]
    fn trader_hooks_are_gated() {
        let h = harness();
        assert!(matches!(
            h.vault.set_should_skip_transfer("mallory", true),
            Err(VaultError::NotTrader { .. })
        ));
        h.vault.set_should_skip_transfer("wrapper-1", true).unwrap();
        assert!(h.vault.should_skip_transfer());

        h.vault.credit_spillover("unwrapper-1", 40).unwrap();
        assert_eq!(h.vault.underlying_balance(), 40);
        h.vault.withdraw_held_balance("alice", 15).unwrap();
        assert_eq!(h.vault.underlying_balance(), 25);
        assert!(matches!(
            h.vault.withdraw_held_balance("alice", 100),
            Err(VaultError::InsufficientHeldBalance { .. })
        ));
    }

    #[test]
    fn withdraw_rejected_when_it_would_leave_account_liquidatable() {
        let h = harness();
        // Collateral 200 ISO at price 4 = 800; debt 180 USDC at price 1.
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 0), ISO, 200);
        h.ledger
            .write()
            .set_balance(AccountRef::new(h.vault.address(), 0), USDC, -180);

        // Withdrawing 160 ISO leaves collateral 160, debt 180: undercollateralized.
        let result = h.vault.withdraw_from_vault("alice", 0, 160);
        assert!(matches!(
            result,
            Err(VaultError::AccountWouldBeLiquidatable { account: 0 })
        ));

        // A small withdrawal keeps the account healthy.
        h.vault.withdraw_from_vault("alice", 0, 10).unwrap();
        assert_eq!(balance(&h, 0, ISO), 190);
    }
}
