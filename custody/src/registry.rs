//! # Handler Registry
//!
//! Capability registry for the async settlement protocol: which addresses
//! may invoke post-settlement callbacks, and which wrapper/unwrapper trader
//! is active for each isolation market. Every callback entry point in the
//! trader module starts by consulting this registry.
//!
//! The registry is an explicitly owned service object. Vaults and traders
//! hold cloned handles ([`HandlerRegistry`] is an `Arc` around the state);
//! mutation goes through owner-gated methods only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ledger::{Address, MarketId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The caller is not the registry owner.
    #[error("unauthorized: {caller} is not the registry owner")]
    NotOwner {
        /// Address that attempted the mutation.
        caller: Address,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    /// Addresses trusted to invoke settlement callbacks.
    handlers: HashSet<Address>,
    /// Active wrapper trader per isolation market.
    wrappers: HashMap<MarketId, Address>,
    /// Active unwrapper trader per isolation market.
    unwrappers: HashMap<MarketId, Address>,
}

/// Shared, owner-gated handler registry.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    owner: Address,
    state: Arc<RwLock<RegistryState>>,
}

impl HandlerRegistry {
    /// New registry owned by `owner`. Starts with no handlers or traders.
    pub fn new(owner: impl Into<Address>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// The registry owner's address.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn check_owner(&self, caller: &str) -> Result<(), RegistryError> {
        if caller != self.owner {
            return Err(RegistryError::NotOwner {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// `true` if `address` may invoke settlement callbacks.
    pub fn is_handler(&self, address: &str) -> bool {
        self.state.read().handlers.contains(address)
    }

    /// Grant or revoke handler status. Owner only.
    pub fn set_handler(
        &self,
        caller: &str,
        address: impl Into<Address>,
        trusted: bool,
    ) -> Result<(), RegistryError> {
        self.check_owner(caller)?;
        let address = address.into();
        let mut state = self.state.write();
        if trusted {
            state.handlers.insert(address.clone());
        } else {
            state.handlers.remove(&address);
        }
        info!(handler = %address, trusted, "handler status updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Trader Lookup
    // -----------------------------------------------------------------------

    /// The active wrapper trader for an isolation market, if any.
    pub fn get_wrapper_by_token(&self, isolation_market: MarketId) -> Option<Address> {
        self.state.read().wrappers.get(&isolation_market).cloned()
    }

    /// The active unwrapper trader for an isolation market, if any.
    pub fn get_unwrapper_by_token(&self, isolation_market: MarketId) -> Option<Address> {
        self.state.read().unwrappers.get(&isolation_market).cloned()
    }

    /// Register the single active wrapper for an isolation market,
    /// replacing any previous one. Owner only.
    pub fn set_wrapper_by_token(
        &self,
        caller: &str,
        isolation_market: MarketId,
        trader: impl Into<Address>,
    ) -> Result<(), RegistryError> {
        self.check_owner(caller)?;
        let trader = trader.into();
        self.state
            .write()
            .wrappers
            .insert(isolation_market, trader.clone());
        info!(market = isolation_market, %trader, "wrapper registered");
        Ok(())
    }

    /// Register the single active unwrapper for an isolation market,
    /// replacing any previous one. Owner only.
    pub fn set_unwrapper_by_token(
        &self,
        caller: &str,
        isolation_market: MarketId,
        trader: impl Into<Address>,
    ) -> Result<(), RegistryError> {
        self.check_owner(caller)?;
        let trader = trader.into();
        self.state
            .write()
            .unwrappers
            .insert(isolation_market, trader.clone());
        info!(market = isolation_market, %trader, "unwrapper registered");
        Ok(())
    }

    /// `true` if `address` is the registered wrapper or unwrapper for the
    /// given isolation market.
    pub fn is_trader_for_token(&self, isolation_market: MarketId, address: &str) -> bool {
        let state = self.state.read();
        state
            .wrappers
            .get(&isolation_market)
            .map(|t| t == address)
            .unwrap_or(false)
            || state
                .unwrappers
                .get(&isolation_market)
                .map(|t| t == address)
                .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Liquidator Whitelist
// ---------------------------------------------------------------------------

/// Read-only collaborator listing addresses allowed to run liquidations.
///
/// Ownership and governance of this list live outside the custody layer;
/// here it is a plain shared set that deployment wiring populates.
#[derive(Debug, Clone, Default)]
pub struct LiquidatorWhitelist {
    state: Arc<RwLock<HashSet<Address>>>,
}

impl LiquidatorWhitelist {
    /// Empty whitelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a liquidator address.
    pub fn insert(&self, address: impl Into<Address>) {
        self.state.write().insert(address.into());
    }

    /// `true` if `address` may run liquidations.
    pub fn is_liquidator(&self, address: &str) -> bool {
        self.state.read().contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "registry-owner";

    #[test]
    fn handler_toggle_round_trip() {
        let registry = HandlerRegistry::new(OWNER);
        assert!(!registry.is_handler("keeper-1"));

        registry.set_handler(OWNER, "keeper-1", true).unwrap();
        assert!(registry.is_handler("keeper-1"));

        registry.set_handler(OWNER, "keeper-1", false).unwrap();
        assert!(!registry.is_handler("keeper-1"));
    }

    #[test]
    fn non_owner_cannot_mutate() {
        let registry = HandlerRegistry::new(OWNER);
        let result = registry.set_handler("mallory", "mallory", true);
        assert!(matches!(result, Err(RegistryError::NotOwner { .. })));
        assert!(!registry.is_handler("mallory"));
    }

    #[test]
    fn single_active_wrapper_per_token() {
        let registry = HandlerRegistry::new(OWNER);
        registry.set_wrapper_by_token(OWNER, 7, "wrapper-v1").unwrap();
        registry.set_wrapper_by_token(OWNER, 7, "wrapper-v2").unwrap();
        assert_eq!(registry.get_wrapper_by_token(7).as_deref(), Some("wrapper-v2"));
    }

    #[test]
    fn trader_for_token_covers_both_sides() {
        let registry = HandlerRegistry::new(OWNER);
        registry.set_wrapper_by_token(OWNER, 7, "wrapper").unwrap();
        registry.set_unwrapper_by_token(OWNER, 7, "unwrapper").unwrap();

        assert!(registry.is_trader_for_token(7, "wrapper"));
        assert!(registry.is_trader_for_token(7, "unwrapper"));
        assert!(!registry.is_trader_for_token(7, "someone-else"));
        assert!(!registry.is_trader_for_token(8, "wrapper"));
    }

    #[test]
    fn liquidator_whitelist_lookup() {
        let whitelist = LiquidatorWhitelist::new();
        assert!(!whitelist.is_liquidator("liq-1"));
        whitelist.insert("liq-1");
        assert!(whitelist.is_liquidator("liq-1"));
    }
}
