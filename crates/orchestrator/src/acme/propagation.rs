//! Challenge record propagation checks

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use radcert_config::PropagationConfig;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use super::dns::TxtResolver;
use super::error::DnsError;

/// Ceiling for the delay between lookups
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// TXT lookups through `hickory-resolver`.
///
/// With configured nameservers every lookup goes to them. Otherwise the
/// record's zone is found by walking up its labels for NS records, and the
/// lookup goes straight to that zone's authoritative servers, since those
/// are what the CA's validators see first. Recursive resolution through the
/// system configuration is the fallback when the zone cannot be found.
pub struct HickoryTxtResolver {
    recursive: TokioAsyncResolver,
    pinned: bool,
    authoritative: Mutex<HashMap<String, TokioAsyncResolver>>,
}

impl HickoryTxtResolver {
    /// Resolver using the given nameservers, or the record's authoritative
    /// servers when the list is empty
    pub fn new(nameservers: &[IpAddr]) -> Result<Self, DnsError> {
        let opts = uncached_opts(ResolverOpts::default());

        let (recursive, pinned) = if nameservers.is_empty() {
            let (config, system_opts) = hickory_resolver::system_conf::read_system_conf()
                .map_err(|e| DnsError::Transport(format!("system resolver config: {}", e)))?;
            (TokioAsyncResolver::tokio(config, uncached_opts(system_opts)), false)
        } else {
            (direct_resolver(nameservers, opts), true)
        };

        Ok(Self {
            recursive,
            pinned,
            authoritative: Mutex::new(HashMap::new()),
        })
    }

    /// Resolver aimed at the authoritative servers for `fqdn`, if found
    async fn authoritative_for(&self, fqdn: &str) -> Option<TokioAsyncResolver> {
        for zone in zone_candidates(fqdn) {
            if let Some(resolver) = self.authoritative.lock().get(&zone) {
                return Some(resolver.clone());
            }

            let hosts: Vec<String> = match self.recursive.ns_lookup(zone.as_str()).await {
                Ok(lookup) => lookup.iter().map(|ns| ns.to_string()).collect(),
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => continue,
                    _ => {
                        debug!(zone = %zone, error = %e, "NS lookup failed");
                        return None;
                    }
                },
            };

            let mut addresses = Vec::new();
            for host in &hosts {
                match self.recursive.lookup_ip(host.as_str()).await {
                    Ok(ips) => addresses.extend(ips.iter()),
                    Err(e) => trace!(host = %host, error = %e, "Nameserver address lookup failed"),
                }
            }
            if addresses.is_empty() {
                debug!(zone = %zone, "No reachable authoritative nameserver");
                return None;
            }

            debug!(
                zone = %zone,
                nameservers = ?hosts,
                "Checking challenge records at authoritative servers"
            );
            let resolver = direct_resolver(&addresses, uncached_opts(ResolverOpts::default()));
            self.authoritative.lock().insert(zone, resolver.clone());
            return Some(resolver);
        }
        None
    }
}

/// Do not let a cached NXDOMAIN hide a freshly published record
fn uncached_opts(mut opts: ResolverOpts) -> ResolverOpts {
    opts.negative_max_ttl = Some(Duration::from_secs(1));
    opts.positive_max_ttl = Some(Duration::from_secs(1));
    opts
}

fn direct_resolver(nameservers: &[IpAddr], opts: ResolverOpts) -> TokioAsyncResolver {
    let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
    TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
}

/// `fqdn` and its ancestors down to two labels, longest first
fn zone_candidates(fqdn: &str) -> Vec<String> {
    let labels: Vec<&str> = fqdn
        .trim_end_matches('.')
        .split('.')
        .filter(|label| !label.is_empty())
        .collect();
    (0..labels.len().saturating_sub(1))
        .map(|skip| format!("{}.", labels[skip..].join(".")))
        .collect()
}

fn txt_values(
    result: Result<hickory_resolver::lookup::TxtLookup, hickory_resolver::error::ResolveError>,
) -> Result<Vec<String>, DnsError> {
    match result {
        Ok(lookup) => Ok(lookup.iter().map(|txt| txt.to_string()).collect()),
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
            _ => Err(DnsError::Transport(e.to_string())),
        },
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        if !self.pinned {
            if let Some(resolver) = self.authoritative_for(&fqdn).await {
                return txt_values(resolver.txt_lookup(fqdn).await);
            }
        }
        txt_values(self.recursive.txt_lookup(fqdn).await)
    }
}

impl std::fmt::Debug for HickoryTxtResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryTxtResolver")
            .field("pinned", &self.pinned)
            .field("zones", &self.authoritative.lock().len())
            .finish()
    }
}

/// Polls a resolver until a TXT value shows up
#[derive(Clone)]
pub struct PropagationProbe {
    resolver: Arc<dyn TxtResolver>,
    initial_delay: Duration,
    interval: Duration,
}

impl PropagationProbe {
    pub fn new(resolver: Arc<dyn TxtResolver>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            resolver,
            initial_delay,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(resolver: Arc<dyn TxtResolver>, config: &PropagationConfig) -> Self {
        Self::new(
            resolver,
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.check_interval_secs),
        )
    }

    /// Wait until `value` is visible at `name`.
    ///
    /// Returns `false` once `timeout` has elapsed. Lookup errors count as
    /// "not visible yet".
    pub async fn await_record(&self, name: &str, value: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        if !self.initial_delay.is_zero() {
            sleep(self.initial_delay.min(timeout)).await;
        }

        let mut delay = self.interval;
        let mut lookups = 0u32;
        loop {
            lookups += 1;
            match self.resolver.lookup_txt(name).await {
                Ok(values) if values.iter().any(|v| v == value) => {
                    debug!(name = %name, lookups, "Challenge record is visible");
                    return true;
                }
                Ok(values) => {
                    trace!(name = %name, seen = values.len(), "Challenge record not visible yet");
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "TXT lookup failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(name = %name, lookups, "Gave up waiting for challenge record");
                return false;
            }
            sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_CHECK_INTERVAL);
        }
    }
}

impl std::fmt::Debug for PropagationProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationProbe")
            .field("initial_delay", &self.initial_delay)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::{DnsProvider, MemoryDns};

    const NAME: &str = "_acme-challenge.radius.example.com";

    #[test]
    fn test_zone_candidates_walk_up_to_registered_domain() {
        assert_eq!(
            zone_candidates("_acme-challenge.radius.example.com."),
            vec![
                "_acme-challenge.radius.example.com.",
                "radius.example.com.",
                "example.com.",
            ]
        );
        assert_eq!(zone_candidates("example.com"), vec!["example.com."]);
        assert!(zone_candidates("com.").is_empty());
        assert!(zone_candidates("").is_empty());
    }

    #[tokio::test]
    async fn test_configured_nameservers_are_used_directly() {
        let resolver = HickoryTxtResolver::new(&["192.0.2.53".parse().unwrap()]).unwrap();
        assert!(resolver.pinned);
        assert!(resolver.authoritative.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_visible_after_delay() {
        let dns = Arc::new(MemoryDns::new().with_propagation_delay(3));
        dns.upsert_txt(NAME, "token-digest", 60).await.unwrap();

        let probe = PropagationProbe::new(dns.clone(), Duration::ZERO, Duration::from_secs(1));
        assert!(probe.await_record(NAME, "token-digest", Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_false() {
        let dns = Arc::new(MemoryDns::new());
        dns.upsert_txt(NAME, "other", 60).await.unwrap();

        let probe = PropagationProbe::new(dns, Duration::from_secs(5), Duration::from_secs(1));
        assert!(!probe.await_record(NAME, "token-digest", Duration::from_secs(20)).await);
    }
}
