//! # Settlement Records
//!
//! One [`SettlementRecord`] exists per outstanding async trade. The record
//! is created when the trade is handed to the external protocol, carried
//! through `Created → Executing → {Settled, CancelledRetryable,
//! CancelledFinal}`, and removed from the store once resolved. Terminal
//! resolution always coincides with the account freeze clearing.
//!
//! Exclusivity (at most one record per vault account) is not re-checked
//! here — the freeze table enforces it before a record is ever created.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{AccountNumber, Address, MarketId};

/// Opaque settlement-record key, assigned at creation time.
pub type RecordKey = String;

/// Which side of the settlement protocol a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Input asset being wrapped into the isolation asset.
    Deposit,
    /// Isolation asset being unwrapped into an output asset.
    Withdrawal,
}

/// Lifecycle state of a settlement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Booked, not yet handed to the external protocol.
    Created,
    /// In the external protocol's hands; a callback will resolve it.
    Executing,
    /// Terminal: executed and credited.
    Settled,
    /// Cancelled, but the fund-return step failed; awaiting retry.
    CancelledRetryable,
    /// Terminal: cancelled with funds returned.
    CancelledFinal,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Created => write!(f, "Created"),
            RecordStatus::Executing => write!(f, "Executing"),
            RecordStatus::Settled => write!(f, "Settled"),
            RecordStatus::CancelledRetryable => write!(f, "CancelledRetryable"),
            RecordStatus::CancelledFinal => write!(f, "CancelledFinal"),
        }
    }
}

/// Bookkeeping for one outstanding (or retryable) async trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Opaque key identifying this record.
    pub key: RecordKey,
    /// Deposit or withdrawal side.
    pub kind: RecordKind,
    /// The vault whose account is frozen for this trade.
    pub vault: Address,
    /// The frozen account number.
    pub account_number: AccountNumber,
    /// Asset handed to the external protocol.
    pub input_token: MarketId,
    /// Amount handed over, in input smallest units.
    pub input_amount: u64,
    /// Asset expected back.
    pub output_token: MarketId,
    /// Amount expected back, in output smallest units.
    pub expected_output_amount: u64,
    /// Fee owed to the settlement keeper.
    pub execution_fee: u64,
    /// Lifecycle state.
    pub status: RecordStatus,
    /// `true` once a downstream fund movement has failed and an explicit
    /// retry is the designated recovery path.
    pub is_retryable: bool,
    /// Amount the execution callback reported, when one has arrived.
    /// Kept so a failed credit can be retried with the same figure.
    pub received_amount: Option<u64>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Most recent state change.
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    /// New record in `Created` status with a fresh key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: RecordKind,
        vault: impl Into<Address>,
        account_number: AccountNumber,
        input_token: MarketId,
        input_amount: u64,
        output_token: MarketId,
        expected_output_amount: u64,
        execution_fee: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: Uuid::new_v4().to_string(),
            kind,
            vault: vault.into(),
            account_number,
            input_token,
            input_amount,
            output_token,
            expected_output_amount,
            execution_fee,
            status: RecordStatus::Created,
            is_retryable: false,
            received_amount: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `true` once the record can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::Settled | RecordStatus::CancelledFinal
        )
    }
}

/// Shared store of outstanding settlement records, keyed by record key.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    inner: Arc<RwLock<HashMap<RecordKey, SettlementRecord>>>,
}

impl RecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning its key.
    pub fn insert(&self, record: SettlementRecord) -> RecordKey {
        let key = record.key.clone();
        self.inner.write().insert(key.clone(), record);
        key
    }

    /// Fetch a record by key.
    pub fn get(&self, key: &str) -> Option<SettlementRecord> {
        self.inner.read().get(key).cloned()
    }

    /// Apply `update` to the record under `key`, bumping `updated_at`.
    /// Returns `false` if no such record exists.
    pub fn update<F>(&self, key: &str, update: F) -> bool
    where
        F: FnOnce(&mut SettlementRecord),
    {
        let mut inner = self.inner.write();
        match inner.get_mut(key) {
            Some(record) => {
                update(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove and return the record under `key`.
    pub fn remove(&self, key: &str) -> Option<SettlementRecord> {
        self.inner.write().remove(key)
    }

    /// The outstanding record against a specific vault account, if any.
    pub fn for_account(&self, vault: &str, account_number: AccountNumber) -> Option<SettlementRecord> {
        self.inner
            .read()
            .values()
            .find(|r| r.vault == vault && r.account_number == account_number)
            .cloned()
    }

    /// Number of outstanding records.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// `true` if no records are outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SettlementRecord {
        SettlementRecord::new(RecordKind::Deposit, "vault-1", 123, 1, 400, 2, 100, 0)
    }

    #[test]
    fn new_record_starts_created() {
        let record = sample();
        assert_eq!(record.status, RecordStatus::Created);
        assert!(!record.is_retryable);
        assert!(!record.is_terminal());
        assert!(record.received_amount.is_none());
    }

    #[test]
    fn keys_are_unique() {
        assert_ne!(sample().key, sample().key);
    }

    #[test]
    fn store_round_trip_and_account_lookup() {
        let store = RecordStore::new();
        let key = store.insert(sample());

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).unwrap().account_number, 123);
        assert!(store.for_account("vault-1", 123).is_some());
        assert!(store.for_account("vault-1", 124).is_none());
        assert!(store.for_account("vault-2", 123).is_none());

        let removed = store.remove(&key).unwrap();
        assert_eq!(removed.key, key);
        assert!(store.is_empty());
    }

    #[test]
    fn update_bumps_timestamp() {
        let store = RecordStore::new();
        let key = store.insert(sample());
        let before = store.get(&key).unwrap().updated_at;

        let updated = store.update(&key, |r| {
            r.status = RecordStatus::Executing;
        });
        assert!(updated);

        let after = store.get(&key).unwrap();
        assert_eq!(after.status, RecordStatus::Executing);
        assert!(after.updated_at >= before);
    }

    #[test]
    fn update_missing_key_reports_false() {
        let store = RecordStore::new();
        assert!(!store.update("no-such-key", |r| r.is_retryable = true));
    }

    #[test]
    fn records_serialize_for_operator_tooling() {
        let record = sample();
        let json = serde_json::to_string(&record).unwrap();
        let back: SettlementRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, record.key);
        assert_eq!(back.status, RecordStatus::Created);
    }
}
