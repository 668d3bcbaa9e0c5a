//! DNS seams for DNS-01 challenges.
//!
//! [`DnsProvider`] writes TXT records through the provider API.
//! [`TxtResolver`] reads them back through ordinary DNS so propagation can
//! be confirmed before the CA is asked to look.

mod memory;
mod route53;

use async_trait::async_trait;

pub use memory::MemoryDns;
pub use route53::Route53DnsProvider;

use super::error::DnsError;

/// Writes challenge TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create or replace the TXT record `name` with the single value `value`
    async fn upsert_txt(&self, name: &str, value: &str, ttl: u32) -> Result<(), DnsError>;

    /// Delete the TXT record; deleting a missing record succeeds
    async fn delete_txt(&self, name: &str, value: &str, ttl: u32) -> Result<(), DnsError>;
}

/// Reads TXT records as resolvers see them
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT values at `name`; an empty list when there are none
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
}
