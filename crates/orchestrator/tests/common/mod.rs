//! Shared fixtures for the integration tests: a throwaway CA that signs
//! real CSRs, certificate helpers, and a reload signal that only counts.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use radcert::acme::{
    AcmeError, CertificateAuthority, ChallengePublisher, DnsChallenge, Issuer, IssuerSettings,
    MemoryDns, PropagationProbe,
};
use radcert::reload::{ReloadError, ReloadSignal};
use radcert::store::ArtifactSink;
use radcert_common::{ArtifactKind, CertificateArtifactSet, DomainName, RetryPolicy};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use time::OffsetDateTime;

pub const DOMAIN: &str = "radius.example.com";

pub fn domain() -> DomainName {
    DomainName::new(DOMAIN)
}

/// Self-signed root that plays the CA
pub struct TestCa {
    issuer: rcgen::Issuer<'static, KeyPair>,
    pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "radcert test root");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key).unwrap();
        let pem = cert.pem();

        Self {
            issuer: rcgen::Issuer::new(params, key),
            pem,
        }
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Leaf for `name` expiring `valid_days` from now, as a stored set
    pub fn leaf_set(&self, name: &str, valid_days: i64) -> CertificateArtifactSet {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(valid_days);
        params.not_before = params.not_after - time::Duration::days(90);
        let cert = params.signed_by(&key, &self.issuer).unwrap();

        CertificateArtifactSet::from_parts(
            DomainName::new(name),
            Bytes::from(format!("{}{}", cert.pem(), self.pem)),
            Bytes::from(key.serialize_pem()),
            Bytes::from(self.pem.clone()),
        )
        .unwrap()
    }

    fn sign_csr(&self, csr_der: &[u8], valid_days: i64) -> Result<String, AcmeError> {
        let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| AcmeError::Csr(e.to_string()))?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::hours(1);
        csr.params.not_after = now + time::Duration::days(valid_days);
        let cert = csr
            .signed_by(&self.issuer)
            .map_err(|e| AcmeError::Csr(e.to_string()))?;
        Ok(format!("{}{}", cert.pem(), self.pem))
    }
}

pub async fn seed(store: &dyn ArtifactSink, set: &CertificateArtifactSet) {
    for kind in ArtifactKind::ALL {
        store.put(kind, set.body(kind).clone()).await.unwrap();
    }
}

/// In-flight order of the fake CA
#[derive(Debug)]
pub struct FakeOrder {
    pub number: usize,
    pub submitted: bool,
}

/// ACME stand-in backed by [`TestCa`].
///
/// Clones share the CA and the counters, so a test can keep one clone to
/// inspect after handing the other to an [`Issuer`].
#[derive(Clone)]
pub struct FakeAuthority {
    ca: Arc<TestCa>,
    validity_days: i64,
    challenge_delay: Duration,
    reject_validation: bool,
    valid_authorization: bool,
    orders: Arc<AtomicUsize>,
    submitted: Arc<AtomicUsize>,
    finalized: Arc<AtomicUsize>,
}

impl FakeAuthority {
    pub fn new(ca: Arc<TestCa>) -> Self {
        Self {
            ca,
            validity_days: 90,
            challenge_delay: Duration::ZERO,
            reject_validation: false,
            valid_authorization: false,
            orders: Arc::new(AtomicUsize::new(0)),
            submitted: Arc::new(AtomicUsize::new(0)),
            finalized: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    /// Hold every new order open for `delay` before returning the challenge
    pub fn with_challenge_delay(mut self, delay: Duration) -> Self {
        self.challenge_delay = delay;
        self
    }

    /// Fail validation as if the TXT record was wrong
    pub fn rejecting_validation(mut self) -> Self {
        self.reject_validation = true;
        self
    }

    /// Pretend the account already holds a valid authorization
    pub fn with_valid_authorization(mut self) -> Self {
        self.valid_authorization = true;
        self
    }

    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    type Order = FakeOrder;

    async fn ensure_account(&self, _contact: &str) -> Result<(), AcmeError> {
        Ok(())
    }

    async fn request_challenge(
        &self,
        domain: &DomainName,
    ) -> Result<(FakeOrder, Option<DnsChallenge>), AcmeError> {
        let number = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.challenge_delay.is_zero() {
            tokio::time::sleep(self.challenge_delay).await;
        }

        let order = FakeOrder {
            number,
            submitted: false,
        };
        if self.valid_authorization {
            return Ok((order, None));
        }
        let challenge = DnsChallenge {
            identifier: domain.to_string(),
            token: format!("tok-{}", number),
            url: format!("https://acme.test/chall/{}", number),
            record_value: format!("digest-{}", number),
        };
        Ok((order, Some(challenge)))
    }

    async fn submit_challenge(
        &self,
        order: &mut FakeOrder,
        _challenge: &DnsChallenge,
    ) -> Result<(), AcmeError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        order.submitted = true;
        Ok(())
    }

    async fn await_validation(
        &self,
        order: &mut FakeOrder,
        _timeout: Duration,
    ) -> Result<(), AcmeError> {
        if self.reject_validation {
            return Err(AcmeError::Api {
                problem_type: "urn:ietf:params:acme:error:unauthorized".to_string(),
                detail: format!("Incorrect TXT record for order {}", order.number),
                status: Some(403),
            });
        }
        if !order.submitted && !self.valid_authorization {
            return Err(AcmeError::OrderInvalid("challenge never submitted".to_string()));
        }
        Ok(())
    }

    async fn finalize(
        &self,
        _order: &mut FakeOrder,
        csr_der: &[u8],
        _timeout: Duration,
    ) -> Result<String, AcmeError> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        self.ca.sign_csr(csr_der, self.validity_days)
    }
}

impl std::fmt::Debug for FakeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeAuthority")
            .field("orders", &self.orders())
            .finish()
    }
}

pub fn settings(renew_before_days: i64) -> IssuerSettings {
    IssuerSettings {
        renew_before: chrono::Duration::days(renew_before_days),
        validation_timeout: Duration::from_secs(5),
        propagation_timeout: Duration::from_secs(2),
        retry: RetryPolicy::fixed(2, Duration::ZERO),
    }
}

/// Publisher whose provider and resolver are both `dns`
pub fn publisher(dns: &Arc<MemoryDns>) -> Arc<ChallengePublisher> {
    let probe = PropagationProbe::new(dns.clone(), Duration::ZERO, Duration::from_millis(10));
    Arc::new(ChallengePublisher::new(
        dns.clone(),
        probe,
        60,
        RetryPolicy::fixed(2, Duration::ZERO),
    ))
}

pub fn issuer(
    authority: FakeAuthority,
    dns: &Arc<MemoryDns>,
    store: Arc<dyn ArtifactSink>,
    settings: IssuerSettings,
) -> Issuer<FakeAuthority> {
    Issuer::new(authority, publisher(dns), store, settings)
}

/// Reload signal that records calls
#[derive(Debug, Default)]
pub struct RecordingReload {
    calls: AtomicUsize,
    fail: bool,
}

impl RecordingReload {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadSignal for RecordingReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReloadError::Failed {
                command: "systemctl reload freeradius".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "Job for freeradius.service failed".to_string(),
            });
        }
        Ok(())
    }
}
