//! ACME certificate issuance over DNS-01
//!
//! # Architecture
//!
//! - [`CertificateAuthority`] - ACME operations, implemented over `instant-acme`
//!   by [`InstantAcmeAuthority`]
//! - [`ChallengePublisher`] - writes `_acme-challenge` TXT records through a
//!   [`DnsProvider`] and waits for them to propagate
//! - [`Issuer`] - the per-attempt state machine driving CA, publisher and store
//! - [`RenewalScheduler`] - one externally triggered firing, guarded by an
//!   in-progress marker
//!
//! # Challenge Flow
//!
//! 1. The scheduler takes the domain's in-progress marker
//! 2. The issuer reads the stored certificate and skips if renewal is not due
//! 3. [`CertificateAuthority::request_challenge`] opens an order
//! 4. [`ChallengePublisher`] upserts the TXT record and polls resolvers
//! 5. The CA is told the challenge is ready and polled until valid
//! 6. A fresh key and CSR finalize the order; the chain is split into the
//!    three artifacts and published to the store
//! 7. The TXT record is removed whether the attempt succeeded or not

mod account;
mod challenge;
mod client;
pub mod dns;
mod error;
mod issuer;
mod propagation;
mod scheduler;

pub use account::{contact_uri, AccountStore, StoredAccount};
pub use challenge::{ChallengePublisher, ChallengeRecord, ChallengeState, RecordHandle};
pub use client::{certificate_request, CertificateAuthority, DnsChallenge, InstantAcmeAuthority};
pub use dns::{DnsProvider, MemoryDns, Route53DnsProvider, TxtResolver};
pub use error::{AcmeError, DnsError, IssuanceError, PublishError, RemoveError, RenewalError};
pub use issuer::{
    IssuanceAttempt, IssuanceState, IssueOutcome, Issuer, IssuerSettings, Transition,
};
pub use propagation::{HickoryTxtResolver, PropagationProbe};
pub use scheduler::{RenewalOutcome, RenewalScheduler, DEFAULT_LEASE_TTL};
