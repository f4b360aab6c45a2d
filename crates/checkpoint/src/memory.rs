//! In-process ledger used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::store::{AuditLedger, LoadStateStore};
use crate::{LoadRunAudit, ReconciliationRecord, TableLoadState};

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<String, TableLoadState>,
    runs: Vec<LoadRunAudit>,
    reconciliations: Vec<ReconciliationRecord>,
}

/// [`LoadStateStore`] and [`AuditLedger`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, table: &str) -> Option<TableLoadState> {
        self.lock().states.get(table).cloned()
    }

    /// Seed a state row directly, bypassing the tracker.
    pub fn put_state(&self, state: TableLoadState) {
        self.lock().states.insert(state.table_name.clone(), state);
    }

    pub fn runs(&self) -> Vec<LoadRunAudit> {
        self.lock().runs.clone()
    }

    pub fn run(&self, load_id: &str) -> Option<LoadRunAudit> {
        self.lock()
            .runs
            .iter()
            .rev()
            .find(|r| r.load_id == load_id)
            .cloned()
    }

    pub fn reconciliations(&self) -> Vec<ReconciliationRecord> {
        self.lock().reconciliations.clone()
    }
}

#[async_trait]
impl LoadStateStore for MemoryLedger {
    async fn count_states(&self, table: &str) -> Result<u64> {
        Ok(u64::from(self.lock().states.contains_key(table)))
    }

    async fn read_state(&self, table: &str) -> Result<Option<TableLoadState>> {
        Ok(self.state(table))
    }

    async fn insert_state(&self, state: &TableLoadState) -> Result<()> {
        let mut inner = self.lock();
        if inner.states.contains_key(&state.table_name) {
            return Err(anyhow!("Load state for {} already exists", state.table_name));
        }
        inner.states.insert(state.table_name.clone(), state.clone());
        Ok(())
    }

    async fn update_state(&self, state: &TableLoadState) -> Result<()> {
        let mut inner = self.lock();
        match inner.states.get_mut(&state.table_name) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(anyhow!("No load state for {}", state.table_name)),
        }
    }

    async fn delete_state(&self, table: &str) -> Result<()> {
        self.lock().states.remove(table);
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for MemoryLedger {
    async fn open_run(&self, audit: &LoadRunAudit) -> Result<()> {
        self.lock().runs.push(audit.clone());
        Ok(())
    }

    async fn update_run(&self, audit: &LoadRunAudit) -> Result<()> {
        let mut inner = self.lock();
        match inner.runs.iter_mut().rev().find(|r| r.same_run(audit)) {
            Some(existing) => {
                *existing = audit.clone();
                Ok(())
            }
            None => Err(anyhow!("No audit row for load id {}", audit.load_id)),
        }
    }

    async fn append_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        self.lock().reconciliations.push(record.clone());
        Ok(())
    }
}
