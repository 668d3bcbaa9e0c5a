//! In-memory DNS for tests.
//!
//! Provider and resolver at once: records written through [`DnsProvider`]
//! become visible to [`TxtResolver`] after a configurable number of lookups.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{DnsProvider, TxtResolver};
use crate::acme::error::DnsError;

#[derive(Debug, Clone)]
struct Record {
    values: Vec<String>,
    hidden_lookups: usize,
}

/// DNS zone held in process memory
#[derive(Debug, Default)]
pub struct MemoryDns {
    records: DashMap<String, Record>,
    propagation_lookups: usize,
    upserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide new records from the first `lookups` resolver queries
    pub fn with_propagation_delay(mut self, lookups: usize) -> Self {
        self.propagation_lookups = lookups;
        self
    }

    /// Current values at `name`
    pub fn values(&self, name: &str) -> Vec<String> {
        self.records
            .get(&normalize(name))
            .map(|r| r.values.clone())
            .unwrap_or_default()
    }

    /// Number of names holding at least one record
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[async_trait]
impl DnsProvider for MemoryDns {
    async fn upsert_txt(&self, name: &str, value: &str, _ttl: u32) -> Result<(), DnsError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let name = normalize(name);
        let mut entry = self.records.entry(name.clone()).or_insert_with(|| Record {
            values: Vec::new(),
            hidden_lookups: self.propagation_lookups,
        });
        if entry.values != [value] {
            entry.values = vec![value.to_string()];
            entry.hidden_lookups = self.propagation_lookups;
        }
        trace!(name = %name, "Upserted TXT record");
        Ok(())
    }

    async fn delete_txt(&self, name: &str, _value: &str, _ttl: u32) -> Result<(), DnsError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.records.remove(&normalize(name));
        Ok(())
    }
}

#[async_trait]
impl TxtResolver for MemoryDns {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let Some(mut record) = self.records.get_mut(&normalize(name)) else {
            return Ok(Vec::new());
        };
        if record.hidden_lookups > 0 {
            record.hidden_lookups -= 1;
            return Ok(Vec::new());
        }
        Ok(record.values.clone())
    }
}
