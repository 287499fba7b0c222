//! # Vault Factory
//!
//! Creates exactly one [`TokenVault`](crate::vault::TokenVault) per owner and
//! keeps the bookkeeping every vault consults before moving money:
//!
//! - the **freeze table** — per-(vault, account-number) pending settlement
//!   state, the concurrency-control primitive of the whole layer;
//! - the **market allow-lists** — which markets may pair with the isolation
//!   asset as collateral or debt (empty list = everything allowed);
//! - the **trusted-converter set** and the execution fee charged on
//!   async trades.
//!
//! The freeze table may only be mutated by the vault that owns the account
//! or by the wrapper/unwrapper registered for the factory's isolation
//! market. The factory independently verifies the vault is one it created.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MAX_EXECUTION_FEE;
use crate::ledger::{AccountNumber, Address, MarketId, SharedLedger};
use crate::registry::{HandlerRegistry, LiquidatorWhitelist};
use crate::trader::{UnwrapperTrader, WrapperTrader};
use crate::vault::TokenVault;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from factory operations.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The caller is not the factory owner.
    #[error("unauthorized: {caller} is not the factory owner")]
    NotOwner {
        /// Address that attempted the operation.
        caller: Address,
    },

    /// The owner already has a vault — there is exactly one per user.
    #[error("vault already exists for owner {owner}")]
    VaultAlreadyExists {
        /// The owner in question.
        owner: Address,
    },

    /// The referenced address is not a vault created by this factory.
    #[error("not a vault of this factory: {address}")]
    NotAVault {
        /// The address that failed verification.
        address: Address,
    },

    /// The caller may not mutate this account's freeze state.
    #[error("unauthorized freeze mutation by {caller} on vault {vault}")]
    UnauthorizedFreezeCaller {
        /// Address that attempted the mutation.
        caller: Address,
        /// Vault whose account was targeted.
        vault: Address,
    },

    /// Freezing an account that already has an outstanding settlement.
    #[error("account {account} of vault {vault} is already frozen")]
    AccountAlreadyFrozen {
        /// Vault address.
        vault: Address,
        /// Frozen account number.
        account: AccountNumber,
    },

    /// The operation requires a frozen account, but none is.
    #[error("account {account} of vault {vault} is not frozen")]
    AccountNotFrozen {
        /// Vault address.
        vault: Address,
        /// Account number.
        account: AccountNumber,
    },

    /// Adjusting pending state with the wrong freeze type.
    #[error("freeze type mismatch on vault {vault} account {account}: frozen as {current}, caller said {given}")]
    FreezeTypeMismatch {
        /// Vault address.
        vault: Address,
        /// Account number.
        account: AccountNumber,
        /// Type currently recorded.
        current: FreezeType,
        /// Type the caller supplied.
        given: FreezeType,
    },

    /// A pending reduction would take the magnitude below zero.
    #[error("pending amount underflow on vault {vault} account {account}: have {pending}, delta {delta}")]
    PendingUnderflow {
        /// Vault address.
        vault: Address,
        /// Account number.
        account: AccountNumber,
        /// Current pending magnitude.
        pending: u64,
        /// Offending (negative) delta.
        delta: i128,
    },

    /// A freeze must start with a positive pending amount.
    #[error("cannot freeze vault {vault} account {account} with non-positive pending delta {delta}")]
    NonPositiveFreeze {
        /// Vault address.
        vault: Address,
        /// Account number.
        account: AccountNumber,
        /// Offending delta.
        delta: i128,
    },

    /// A market flagged as closing cannot be allow-listed for debt.
    #[error("market {0} is closing and cannot be allow-listed as debt")]
    MarketClosing(MarketId),

    /// The requested execution fee exceeds the hard cap.
    #[error("execution fee {fee} exceeds maximum {max}")]
    ExecutionFeeTooHigh {
        /// Requested fee.
        fee: u64,
        /// Hard ceiling.
        max: u64,
    },
}

// ---------------------------------------------------------------------------
// Freeze State
// ---------------------------------------------------------------------------

/// Direction of the outstanding async settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeType {
    /// Input asset en route into the isolation asset.
    Deposit,
    /// Isolation asset en route out into the output token.
    Withdrawal,
}

impl std::fmt::Display for FreezeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreezeType::Deposit => write!(f, "Deposit"),
            FreezeType::Withdrawal => write!(f, "Withdrawal"),
        }
    }
}

/// Freeze bookkeeping for one (vault, account-number) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeState {
    /// Direction of the pending settlement.
    pub freeze_type: FreezeType,
    /// Magnitude of the pending amount in smallest units. Always positive
    /// while frozen; an account is unfrozen exactly when no entry exists.
    pub pending: u64,
    /// Destination asset of a pending withdrawal.
    pub output_token: Option<MarketId>,
    /// When the freeze was set.
    pub frozen_at: DateTime<Utc>,
}

impl FreezeState {
    /// Signed pending amount: deposits positive, withdrawals negative.
    pub fn signed_pending(&self) -> i128 {
        match self.freeze_type {
            FreezeType::Deposit => self.pending as i128,
            FreezeType::Withdrawal => -(self.pending as i128),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// The wrapper/unwrapper pair installed on a factory.
#[derive(Debug, Clone)]
struct TraderPair {
    wrapper: WrapperTrader,
    unwrapper: UnwrapperTrader,
}

#[derive(Debug)]
struct FactoryState {
    /// Freeze table, keyed by (vault address, account number).
    freezes: HashMap<(Address, AccountNumber), FreezeState>,
    /// Markets allowed to carry debt. Empty = all allowed.
    allowable_debt_market_ids: BTreeSet<MarketId>,
    /// Markets allowed as collateral. Empty = all allowed.
    allowable_collateral_market_ids: BTreeSet<MarketId>,
    /// Addresses trusted to run wrap/unwrap trades on any vault.
    trusted_converters: HashSet<Address>,
    /// Fee (underlying smallest units) charged on async trades.
    execution_fee: u64,
}

/// Factory for isolated per-user vaults. Cloning clones the handle, not
/// the state — every clone sees the same freeze table and allow-lists.
#[derive(Debug, Clone)]
pub struct VaultFactory {
    owner: Address,
    isolation_market: MarketId,
    ledger: SharedLedger,
    registry: HandlerRegistry,
    whitelist: LiquidatorWhitelist,
    /// owner address -> vault address
    vaults_by_owner: Arc<DashMap<Address, Address>>,
    /// vault address -> live vault handle
    vaults: Arc<DashMap<Address, TokenVault>>,
    traders: Arc<RwLock<Option<TraderPair>>>,
    state: Arc<RwLock<FactoryState>>,
}

impl VaultFactory {
    /// New factory for one isolation market.
    pub fn new(
        owner: impl Into<Address>,
        isolation_market: MarketId,
        ledger: SharedLedger,
        registry: HandlerRegistry,
        whitelist: LiquidatorWhitelist,
    ) -> Self {
        Self {
            owner: owner.into(),
            isolation_market,
            ledger,
            registry,
            whitelist,
            vaults_by_owner: Arc::new(DashMap::new()),
            vaults: Arc::new(DashMap::new()),
            traders: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(FactoryState {
                freezes: HashMap::new(),
                allowable_debt_market_ids: BTreeSet::new(),
                allowable_collateral_market_ids: BTreeSet::new(),
                trusted_converters: HashSet::new(),
                execution_fee: crate::config::DEFAULT_EXECUTION_FEE,
            })),
        }
    }

    /// The factory owner's address.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The isolation market this factory's vaults custody.
    pub fn isolation_market(&self) -> MarketId {
        self.isolation_market
    }

    /// Handle to the margin ledger the factory was wired against.
    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    /// Handle to the handler registry.
    pub fn registry(&self) -> HandlerRegistry {
        self.registry.clone()
    }

    fn check_owner(&self, caller: &str) -> Result<(), FactoryError> {
        if caller != self.owner {
            return Err(FactoryError::NotOwner {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Trader Installation
    // -----------------------------------------------------------------------

    /// Install the wrapper/unwrapper pair the vaults delegate async trades
    /// to. Owner only; replaces any previously installed pair.
    pub fn owner_install_traders(
        &self,
        caller: &str,
        wrapper: WrapperTrader,
        unwrapper: UnwrapperTrader,
    ) -> Result<(), FactoryError> {
        self.check_owner(caller)?;
        info!(
            wrapper = wrapper.address(),
            unwrapper = unwrapper.address(),
            "traders installed"
        );
        *self.traders.write() = Some(TraderPair { wrapper, unwrapper });
        Ok(())
    }

    /// The installed wrapper trader, if any.
    pub fn wrapper(&self) -> Option<WrapperTrader> {
        self.traders.read().as_ref().map(|p| p.wrapper.clone())
    }

    /// The installed unwrapper trader, if any.
    pub fn unwrapper(&self) -> Option<UnwrapperTrader> {
        self.traders.read().as_ref().map(|p| p.unwrapper.clone())
    }

    // -----------------------------------------------------------------------
    // Vault Creation
    // -----------------------------------------------------------------------

    /// Create the vault for `owner`. Exactly one vault exists per owner;
    /// a second call for the same owner fails.
    pub fn create_vault(&self, owner: impl Into<Address>) -> Result<TokenVault, FactoryError> {
        let owner = owner.into();
        if self.vaults_by_owner.contains_key(&owner) {
            return Err(FactoryError::VaultAlreadyExists { owner });
        }

        let address: Address = format!("vault-{}", Uuid::new_v4());
        let vault = TokenVault::from_parts(
            address.clone(),
            owner.clone(),
            self.isolation_market,
            self.clone(),
            Arc::clone(&self.ledger),
            self.registry.clone(),
            self.whitelist.clone(),
        );

        self.vaults_by_owner.insert(owner.clone(), address.clone());
        self.vaults.insert(address.clone(), vault.clone());
        info!(%owner, vault = %address, "vault created");
        Ok(vault)
    }

    /// `true` if `address` is a vault created by this factory.
    pub fn is_vault(&self, address: &str) -> bool {
        self.vaults.contains_key(address)
    }

    /// The vault handle at `address`, if this factory created it.
    pub fn get_vault(&self, address: &str) -> Option<TokenVault> {
        self.vaults.get(address).map(|v| v.clone())
    }

    /// The vault address belonging to `owner`, if one exists.
    pub fn vault_by_owner(&self, owner: &str) -> Option<Address> {
        self.vaults_by_owner.get(owner).map(|v| v.clone())
    }

    // -----------------------------------------------------------------------
    // Freeze Table
    // -----------------------------------------------------------------------

    /// Mutate the pending settlement amount that drives an account's frozen
    /// status.
    ///
    /// `pending_delta` adds to (positive) or reduces (negative) the pending
    /// magnitude. An unfrozen account requires a positive delta, which sets
    /// the freeze; reaching zero clears it. The recorded freeze type must
    /// match `freeze_type` on every adjustment.
    ///
    /// Callable only by the owning vault itself or by the wrapper/unwrapper
    /// registered for this factory's isolation market.
    pub fn set_vault_account_pending_amount_for_frozen_status(
        &self,
        caller: &str,
        vault: &str,
        account_number: AccountNumber,
        freeze_type: FreezeType,
        pending_delta: i128,
        output_token: Option<MarketId>,
    ) -> Result<(), FactoryError> {
        if !self.is_vault(vault) {
            return Err(FactoryError::NotAVault {
                address: vault.to_string(),
            });
        }
        let caller_is_vault = caller == vault;
        let caller_is_trader = self
            .registry
            .is_trader_for_token(self.isolation_market, caller);
        if !caller_is_vault && !caller_is_trader {
            return Err(FactoryError::UnauthorizedFreezeCaller {
                caller: caller.to_string(),
                vault: vault.to_string(),
            });
        }

        let key = (vault.to_string(), account_number);
        let mut state = self.state.write();
        match state.freezes.get(&key).cloned() {
            None => {
                if pending_delta <= 0 {
                    return Err(FactoryError::NonPositiveFreeze {
                        vault: vault.to_string(),
                        account: account_number,
                        delta: pending_delta,
                    });
                }
                let pending =
                    u64::try_from(pending_delta).map_err(|_| FactoryError::NonPositiveFreeze {
                        vault: vault.to_string(),
                        account: account_number,
                        delta: pending_delta,
                    })?;
                state.freezes.insert(
                    key,
                    FreezeState {
                        freeze_type,
                        pending,
                        output_token,
                        frozen_at: Utc::now(),
                    },
                );
                info!(
                    vault,
                    account = account_number,
                    %freeze_type,
                    pending,
                    "account frozen"
                );
                Ok(())
            }
            Some(mut entry) => {
                if entry.freeze_type != freeze_type {
                    return Err(FactoryError::FreezeTypeMismatch {
                        vault: vault.to_string(),
                        account: account_number,
                        current: entry.freeze_type,
                        given: freeze_type,
                    });
                }
                let new_pending = entry.pending as i128 + pending_delta;
                if new_pending < 0 {
                    return Err(FactoryError::PendingUnderflow {
                        vault: vault.to_string(),
                        account: account_number,
                        pending: entry.pending,
                        delta: pending_delta,
                    });
                }
                if new_pending == 0 {
                    state.freezes.remove(&key);
                    info!(vault, account = account_number, "account freeze cleared");
                } else {
                    entry.pending = new_pending as u64;
                    debug!(
                        vault,
                        account = account_number,
                        pending = entry.pending,
                        "pending amount adjusted"
                    );
                    state.freezes.insert(key, entry);
                }
                Ok(())
            }
        }
    }

    /// `true` if the account has an outstanding settlement.
    pub fn is_vault_account_frozen(&self, vault: &str, account_number: AccountNumber) -> bool {
        self.state
            .read()
            .freezes
            .contains_key(&(vault.to_string(), account_number))
    }

    /// Signed pending amount of the account: deposits positive, withdrawals
    /// negative, zero when unfrozen.
    pub fn pending_amount(&self, vault: &str, account_number: AccountNumber) -> i128 {
        self.state
            .read()
            .freezes
            .get(&(vault.to_string(), account_number))
            .map(|f| f.signed_pending())
            .unwrap_or(0)
    }

    /// Full freeze state of the account, if frozen.
    pub fn freeze_state(&self, vault: &str, account_number: AccountNumber) -> Option<FreezeState> {
        self.state
            .read()
            .freezes
            .get(&(vault.to_string(), account_number))
            .cloned()
    }

    /// All currently frozen accounts of a vault, sorted by account number.
    pub fn frozen_accounts(&self, vault: &str) -> Vec<(AccountNumber, FreezeState)> {
        let state = self.state.read();
        let mut frozen: Vec<(AccountNumber, FreezeState)> = state
            .freezes
            .iter()
            .filter(|((v, _), _)| v == vault)
            .map(|((_, account), freeze)| (*account, freeze.clone()))
            .collect();
        frozen.sort_by_key(|(account, _)| *account);
        frozen
    }

    // -----------------------------------------------------------------------
    // Allow-Lists
    // -----------------------------------------------------------------------

    /// Replace the debt allow-list. Owner only. Rejects any market the
    /// ledger currently flags as closing — winding-down markets must not
    /// attract new debt.
    pub fn owner_set_allowable_debt_market_ids(
        &self,
        caller: &str,
        market_ids: Vec<MarketId>,
    ) -> Result<(), FactoryError> {
        self.check_owner(caller)?;
        {
            let ledger = self.ledger.read();
            for market in &market_ids {
                if ledger.is_market_closing(*market) {
                    return Err(FactoryError::MarketClosing(*market));
                }
            }
        }
        self.state.write().allowable_debt_market_ids = market_ids.into_iter().collect();
        Ok(())
    }

    /// Replace the collateral allow-list. Owner only.
    pub fn owner_set_allowable_collateral_market_ids(
        &self,
        caller: &str,
        market_ids: Vec<MarketId>,
    ) -> Result<(), FactoryError> {
        self.check_owner(caller)?;
        self.state.write().allowable_collateral_market_ids = market_ids.into_iter().collect();
        Ok(())
    }

    /// `true` if the market may carry debt under the current allow-list.
    pub fn is_market_allowed_as_debt(&self, market: MarketId) -> bool {
        let state = self.state.read();
        state.allowable_debt_market_ids.is_empty()
            || state.allowable_debt_market_ids.contains(&market)
    }

    /// `true` if the market may be used as collateral under the current
    /// allow-list.
    pub fn is_market_allowed_as_collateral(&self, market: MarketId) -> bool {
        let state = self.state.read();
        state.allowable_collateral_market_ids.is_empty()
            || state.allowable_collateral_market_ids.contains(&market)
    }

    // -----------------------------------------------------------------------
    // Converters & Fees
    // -----------------------------------------------------------------------

    /// Grant or revoke converter trust. Owner only.
    pub fn owner_set_trusted_converter(
        &self,
        caller: &str,
        converter: impl Into<Address>,
        trusted: bool,
    ) -> Result<(), FactoryError> {
        self.check_owner(caller)?;
        let converter = converter.into();
        let mut state = self.state.write();
        if trusted {
            state.trusted_converters.insert(converter.clone());
        } else {
            state.trusted_converters.remove(&converter);
        }
        info!(%converter, trusted, "converter trust updated");
        Ok(())
    }

    /// `true` if `address` may run wrap/unwrap trades on any vault.
    pub fn is_trusted_converter(&self, address: &str) -> bool {
        self.state.read().trusted_converters.contains(address)
    }

    /// Set the execution fee. Owner only; hard-capped.
    pub fn owner_set_execution_fee(&self, caller: &str, fee: u64) -> Result<(), FactoryError> {
        self.check_owner(caller)?;
        if fee > MAX_EXECUTION_FEE {
            return Err(FactoryError::ExecutionFeeTooHigh {
                fee,
                max: MAX_EXECUTION_FEE,
            });
        }
        self.state.write().execution_fee = fee;
        Ok(())
    }

    /// The current execution fee in underlying smallest units.
    pub fn execution_fee(&self) -> u64 {
        self.state.read().execution_fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{shared, InMemoryLedger};

    const FACTORY_OWNER: &str = "factory-owner";
    const ISO: MarketId = 2;
    const USDC: MarketId = 1;

    fn factory() -> VaultFactory {
        let mut ledger = InMemoryLedger::new();
        ledger.list_market(USDC, 1);
        ledger.list_market(ISO, 4);
        VaultFactory::new(
            FACTORY_OWNER,
            ISO,
            shared(ledger),
            HandlerRegistry::new("registry-owner"),
            LiquidatorWhitelist::new(),
        )
    }

    #[test]
    fn one_vault_per_owner() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        assert!(f.is_vault(vault.address()));
        assert_eq!(f.vault_by_owner("alice").as_deref(), Some(vault.address()));

        let second = f.create_vault("alice");
        assert!(matches!(second, Err(FactoryError::VaultAlreadyExists { .. })));
    }

    #[test]
    fn freeze_requires_known_vault() {
        let f = factory();
        let result = f.set_vault_account_pending_amount_for_frozen_status(
            "nobody",
            "not-a-vault",
            0,
            FreezeType::Deposit,
            100,
            None,
        );
        assert!(matches!(result, Err(FactoryError::NotAVault { .. })));
    }

    #[test]
    fn freeze_rejects_strangers() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let result = f.set_vault_account_pending_amount_for_frozen_status(
            "mallory",
            vault.address(),
            0,
            FreezeType::Deposit,
            100,
            None,
        );
        assert!(matches!(
            result,
            Err(FactoryError::UnauthorizedFreezeCaller { .. })
        ));
    }

    #[test]
    fn freeze_is_exclusive_per_account() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let addr = vault.address().to_string();

        f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            123,
            FreezeType::Withdrawal,
            200,
            Some(USDC),
        )
        .unwrap();
        assert!(f.is_vault_account_frozen(&addr, 123));
        assert_eq!(f.pending_amount(&addr, 123), -200);

        // A second freeze on the same account must establish, not extend:
        // establishing on a frozen account with a mismatched type fails...
        let mismatch = f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            123,
            FreezeType::Deposit,
            50,
            None,
        );
        assert!(matches!(
            mismatch,
            Err(FactoryError::FreezeTypeMismatch { .. })
        ));

        // ...while a different account number freezes independently.
        f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            124,
            FreezeType::Deposit,
            50,
            None,
        )
        .unwrap();
        assert!(f.is_vault_account_frozen(&addr, 124));
    }

    #[test]
    fn pending_returns_to_exactly_zero() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let addr = vault.address().to_string();

        f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            0,
            FreezeType::Deposit,
            500,
            None,
        )
        .unwrap();
        f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            0,
            FreezeType::Deposit,
            -500,
            None,
        )
        .unwrap();

        assert!(!f.is_vault_account_frozen(&addr, 0));
        assert_eq!(f.pending_amount(&addr, 0), 0);
    }

    #[test]
    fn pending_underflow_rejected() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let addr = vault.address().to_string();

        f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            0,
            FreezeType::Deposit,
            100,
            None,
        )
        .unwrap();
        let result = f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            0,
            FreezeType::Deposit,
            -101,
            None,
        );
        assert!(matches!(result, Err(FactoryError::PendingUnderflow { .. })));
        // Still frozen with the original magnitude.
        assert_eq!(f.pending_amount(&addr, 0), 100);
    }

    #[test]
    fn clearing_an_unfrozen_account_rejected() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let addr = vault.address().to_string();
        let result = f.set_vault_account_pending_amount_for_frozen_status(
            &addr,
            &addr,
            0,
            FreezeType::Deposit,
            -100,
            None,
        );
        assert!(matches!(result, Err(FactoryError::NonPositiveFreeze { .. })));
    }

    #[test]
    fn empty_allow_lists_allow_everything() {
        let f = factory();
        assert!(f.is_market_allowed_as_debt(99));
        assert!(f.is_market_allowed_as_collateral(99));
    }

    #[test]
    fn non_empty_allow_lists_restrict() {
        let f = factory();
        f.owner_set_allowable_debt_market_ids(FACTORY_OWNER, vec![USDC])
            .unwrap();
        assert!(f.is_market_allowed_as_debt(USDC));
        assert!(!f.is_market_allowed_as_debt(99));

        f.owner_set_allowable_collateral_market_ids(FACTORY_OWNER, vec![USDC])
            .unwrap();
        assert!(!f.is_market_allowed_as_collateral(99));
    }

    #[test]
    fn closing_market_cannot_join_debt_list() {
        let mut ledger = InMemoryLedger::new();
        ledger.list_market(USDC, 1);
        ledger.list_market(ISO, 4);
        ledger.set_closing(USDC, true);
        let f = VaultFactory::new(
            FACTORY_OWNER,
            ISO,
            shared(ledger),
            HandlerRegistry::new("registry-owner"),
            LiquidatorWhitelist::new(),
        );
        let result = f.owner_set_allowable_debt_market_ids(FACTORY_OWNER, vec![USDC]);
        assert!(matches!(result, Err(FactoryError::MarketClosing(m)) if m == USDC));
    }

    #[test]
    fn allow_list_mutation_is_owner_gated() {
        let f = factory();
        let result = f.owner_set_allowable_debt_market_ids("mallory", vec![USDC]);
        assert!(matches!(result, Err(FactoryError::NotOwner { .. })));
    }

    #[test]
    fn execution_fee_capped() {
        let f = factory();
        f.owner_set_execution_fee(FACTORY_OWNER, 100).unwrap();
        assert_eq!(f.execution_fee(), 100);

        let result = f.owner_set_execution_fee(FACTORY_OWNER, MAX_EXECUTION_FEE + 1);
        assert!(matches!(result, Err(FactoryError::ExecutionFeeTooHigh { .. })));
    }

    #[test]
    fn converter_trust_round_trip() {
        let f = factory();
        f.owner_set_trusted_converter(FACTORY_OWNER, "converter-1", true)
            .unwrap();
        assert!(f.is_trusted_converter("converter-1"));
        f.owner_set_trusted_converter(FACTORY_OWNER, "converter-1", false)
            .unwrap();
        assert!(!f.is_trusted_converter("converter-1"));
    }

    #[test]
    fn frozen_accounts_listing_is_sorted() {
        let f = factory();
        let vault = f.create_vault("alice").unwrap();
        let addr = vault.address().to_string();
        for account in [9u64, 3, 7] {
            f.set_vault_account_pending_amount_for_frozen_status(
                &addr,
                &addr,
                account,
                FreezeType::Deposit,
                10,
                None,
            )
            .unwrap();
        }
        let listed: Vec<u64> = f
            .frozen_accounts(&addr)
            .into_iter()
            .map(|(account, _)| account)
            .collect();
        assert_eq!(listed, vec![3, 7, 9]);
    }
}
