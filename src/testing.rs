//! In-memory store and sink implementations for tests.
//!
//! These back the crate's own test suite and are useful as fakes in
//! downstream application tests. They are not production stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{MfaError, Result};
use crate::ratelimit::{FailureLedger, FailureRecord};
use crate::storage::{MfaSettings, SettingsStore};

/// In-memory settings store.
///
/// Tracks load calls and can simulate an outage, so tests can assert that a
/// locked account is rejected without touching storage and that verification
/// fails closed when persistence is down.
#[derive(Clone, Default)]
pub struct InMemorySettingsStore {
    records: Arc<RwLock<HashMap<String, MfaSettings>>>,
    loads: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySettingsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load` calls made so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Toggle a simulated outage; while set, every call returns
    /// [`MfaError::Persistence`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a record directly, bypassing the service (for corruption
    /// and fixture setup in tests).
    pub fn put(&self, settings: MfaSettings) {
        self.records
            .write()
            .unwrap()
            .insert(settings.account_id.clone(), settings);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MfaError::Persistence("settings store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(&self, account_id: &str) -> Result<Option<MfaSettings>> {
        self.check_available()?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.read().unwrap().get(account_id).cloned())
    }

    async fn save(&self, settings: &MfaSettings) -> Result<()> {
        self.check_available()?;
        self.records
            .write()
            .unwrap()
            .insert(settings.account_id.clone(), settings.clone());
        Ok(())
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        self.check_available()?;
        self.records.write().unwrap().remove(account_id);
        Ok(())
    }
}

/// In-memory append-only failure ledger.
#[derive(Clone, Default)]
pub struct InMemoryFailureLedger {
    records: Arc<RwLock<Vec<FailureRecord>>>,
}

impl InMemoryFailureLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records currently held, in append order.
    #[must_use]
    pub fn all(&self) -> Vec<FailureRecord> {
        self.records.read().unwrap().clone()
    }
}

#[async_trait]
impl FailureLedger for InMemoryFailureLedger {
    async fn append(&self, record: FailureRecord) -> Result<()> {
        self.records.write().unwrap().push(record);
        Ok(())
    }

    async fn recent(&self, account_id: &str, since: SystemTime) -> Result<Vec<FailureRecord>> {
        let mut matching: Vec<FailureRecord> = self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.account_id == account_id && r.occurred_at > since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(matching)
    }

    async fn clear(&self, account_id: &str) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .retain(|r| r.account_id != account_id);
        Ok(())
    }
}

/// Audit sink that captures events for assertions.
#[derive(Clone, Default)]
pub struct CapturingAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl CapturingAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured events, in emit order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().unwrap().clone()
    }

    /// Event names, in emit order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .read()
            .unwrap()
            .iter()
            .map(|e| e.kind.name())
            .collect()
    }
}

#[async_trait]
impl AuditSink for CapturingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        self.events.write().unwrap().push(event);
        Ok(())
    }
}
