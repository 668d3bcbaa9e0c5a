//! Certificate issuance state machine
//!
//! One [`IssuanceAttempt`] per run, moving through
//!
//! ```text
//! Start -> ChallengeRequested -> ChallengePublished -> Validating -> Issued -> Stored -> Done
//!                  \______________________________________^
//!                  (authorization already valid)
//! ```
//!
//! `Failed` is reachable from every non-terminal state. Entering `Done` or
//! `Failed` always removes the challenge record. The attempt keeps a
//! timestamped transition list and is logged as JSON when it ends.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use radcert_common::{
    split_full_chain, ArtifactError, AttemptId, CertificateArtifactSet, Classify, DomainName,
    RetryPolicy,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::challenge::{ChallengePublisher, ChallengeRecord, ChallengeState, RecordHandle};
use super::client::{certificate_request, CertificateAuthority};
use super::error::IssuanceError;
use crate::store::{load_set, publish_set, ArtifactSink, LoadError};

/// States of one issuance attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceState {
    Start,
    ChallengeRequested,
    ChallengePublished,
    Validating,
    Issued,
    Stored,
    Done,
    Failed,
}

impl IssuanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IssuanceState::Done | IssuanceState::Failed)
    }

    /// Whether `self -> to` is an edge of the machine
    pub fn can_transition_to(self, to: IssuanceState) -> bool {
        use IssuanceState::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Start, ChallengeRequested)
            | (ChallengeRequested, ChallengePublished)
            | (ChallengeRequested, Validating)
            | (ChallengePublished, Validating)
            | (Validating, Issued)
            | (Issued, Stored)
            | (Stored, Done) => true,
            _ => false,
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: IssuanceState,
    pub to: IssuanceState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Audit record of one issuance attempt
#[derive(Debug, Clone, Serialize)]
pub struct IssuanceAttempt {
    pub id: AttemptId,
    pub domain: DomainName,
    pub state: IssuanceState,
    pub challenge: Option<ChallengeRecord>,
    pub transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl IssuanceAttempt {
    pub fn new(domain: DomainName) -> Self {
        Self {
            id: AttemptId::new(),
            domain,
            state: IssuanceState::Start,
            challenge: None,
            transitions: Vec::new(),
            failure: None,
        }
    }

    fn advance(&mut self, to: IssuanceState, note: Option<String>) -> Result<(), IssuanceError> {
        if !self.state.can_transition_to(to) {
            return Err(IssuanceError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(attempt = %self.id, from = ?self.state, to = ?to, "Issuance transition");
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
            note,
        });
        self.state = to;
        Ok(())
    }

    fn set_challenge_state(&mut self, state: ChallengeState) {
        if let Some(challenge) = self.challenge.as_mut() {
            challenge.state = state;
        }
    }

    /// CA opened the order; `challenge` is `None` for a reused authorization
    pub fn challenge_requested(
        &mut self,
        challenge: Option<ChallengeRecord>,
    ) -> Result<(), IssuanceError> {
        let note = challenge
            .is_none()
            .then(|| "authorization already valid".to_string());
        self.advance(IssuanceState::ChallengeRequested, note)?;
        self.challenge = challenge;
        Ok(())
    }

    pub fn challenge_published(&mut self) -> Result<(), IssuanceError> {
        self.advance(IssuanceState::ChallengePublished, None)?;
        self.set_challenge_state(ChallengeState::Published);
        Ok(())
    }

    pub fn validating(&mut self) -> Result<(), IssuanceError> {
        self.advance(IssuanceState::Validating, None)
    }

    /// CA accepted the challenge
    pub fn challenge_validated(&mut self) {
        self.set_challenge_state(ChallengeState::Validated);
    }

    pub fn issued(&mut self, not_after: DateTime<Utc>) -> Result<(), IssuanceError> {
        self.advance(IssuanceState::Issued, Some(format!("not_after {}", not_after)))
    }

    pub fn stored(&mut self) -> Result<(), IssuanceError> {
        self.advance(IssuanceState::Stored, None)
    }

    pub fn done(&mut self) -> Result<(), IssuanceError> {
        self.advance(IssuanceState::Done, None)
    }

    /// Enter `Failed` with the reason of `err`
    pub fn fail(&mut self, err: &IssuanceError) {
        let reason = err.reason();
        if self.state.is_terminal() {
            warn!(attempt = %self.id, state = ?self.state, "Attempt already finished");
            return;
        }
        // Failed is reachable from every non-terminal state
        let _ = self.advance(IssuanceState::Failed, Some(reason.to_string()));
        self.set_challenge_state(ChallengeState::Failed);
        self.failure = Some(format!("{}: {}", reason, err));
    }

    /// Challenge record was deleted during cleanup
    pub fn challenge_removed(&mut self) {
        self.set_challenge_state(ChallengeState::Removed);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Result of [`Issuer::issue`]
#[derive(Debug)]
pub enum IssueOutcome {
    /// Stored set is outside the renewal window; nothing was requested
    Current(CertificateArtifactSet),
    /// A new set was issued and stored
    Issued {
        set: CertificateArtifactSet,
        attempt: IssuanceAttempt,
    },
}

impl IssueOutcome {
    pub fn set(&self) -> &CertificateArtifactSet {
        match self {
            IssueOutcome::Current(set) => set,
            IssueOutcome::Issued { set, .. } => set,
        }
    }
}

/// Timing knobs for an issuance attempt
#[derive(Debug, Clone)]
pub struct IssuerSettings {
    /// Renew when at most this much validity is left
    pub renew_before: chrono::Duration,
    /// Bound on CA validation and certificate retrieval
    pub validation_timeout: Duration,
    /// Bound on waiting for the challenge record to propagate
    pub propagation_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Drives the CA, the challenge publisher and the store for one domain
pub struct Issuer<C: CertificateAuthority> {
    ca: C,
    publisher: Arc<ChallengePublisher>,
    store: Arc<dyn ArtifactSink>,
    settings: IssuerSettings,
}

impl<C: CertificateAuthority> Issuer<C> {
    pub fn new(
        ca: C,
        publisher: Arc<ChallengePublisher>,
        store: Arc<dyn ArtifactSink>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            ca,
            publisher,
            store,
            settings,
        }
    }

    pub fn publisher(&self) -> &ChallengePublisher {
        &self.publisher
    }

    /// Set currently held by the store, if complete and readable
    pub async fn current(
        &self,
        domain: &DomainName,
    ) -> Result<Option<CertificateArtifactSet>, IssuanceError> {
        match load_set(self.store.as_ref(), domain, &self.settings.retry).await {
            Ok(set) => Ok(set),
            Err(LoadError::Artifact(e)) => {
                warn!(domain = %domain, error = %e, "Stored certificate is unreadable, reissuing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Issue a certificate for `domain` unless the stored one is still
    /// outside the renewal window. `force` skips the window check.
    pub async fn issue(
        &self,
        domain: &DomainName,
        contact: &str,
        force: bool,
    ) -> Result<IssueOutcome, IssuanceError> {
        if !force {
            if let Some(current) = self.current(domain).await? {
                let now = Utc::now();
                if !current.needs_renewal(now, self.settings.renew_before) {
                    info!(
                        domain = %domain,
                        not_after = %current.not_after,
                        remaining_days = current.remaining_validity(now).num_days(),
                        "Certificate not due for renewal"
                    );
                    return Ok(IssueOutcome::Current(current));
                }
                info!(domain = %domain, not_after = %current.not_after, "Certificate due for renewal");
            } else {
                info!(domain = %domain, "No certificate in store, issuing");
            }
        }

        let mut attempt = IssuanceAttempt::new(domain.clone());
        let mut record = None;
        let result = self.run(&mut attempt, &mut record, contact).await;

        let result = match result {
            Ok(set) => attempt.done().map(|_| set),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            attempt.fail(e);
        }

        // Cleanup on entry to Done or Failed
        if let Some(handle) = record {
            match self.publisher.remove(&handle).await {
                Ok(()) => attempt.challenge_removed(),
                Err(e) => warn!(
                    attempt = %attempt.id,
                    error = %e,
                    "Challenge cleanup failed"
                ),
            }
        }

        match result {
            Ok(set) => {
                info!(attempt = %attempt.id, trail = %attempt.to_json(), "Issuance attempt finished");
                Ok(IssueOutcome::Issued { set, attempt })
            }
            Err(e) => {
                error!(
                    attempt = %attempt.id,
                    reason = e.reason(),
                    trail = %attempt.to_json(),
                    "Issuance attempt failed"
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        attempt: &mut IssuanceAttempt,
        record: &mut Option<RecordHandle>,
        contact: &str,
    ) -> Result<CertificateArtifactSet, IssuanceError> {
        let domain = attempt.domain.clone();

        self.ca.ensure_account(contact).await?;
        let (mut order, challenge) = self.ca.request_challenge(&domain).await?;
        attempt.challenge_requested(challenge.as_ref().map(|c| {
            ChallengeRecord::new(domain.clone(), c.token.clone(), c.record_value.clone())
        }))?;

        if let Some(challenge) = &challenge {
            let handle = self
                .publisher
                .publish(&domain, &challenge.token, &challenge.record_value)
                .await?;
            *record = Some(handle.clone());
            attempt.challenge_published()?;

            let timeout = self.settings.propagation_timeout;
            if !self.publisher.await_propagation(&handle, timeout).await {
                return Err(IssuanceError::PropagationTimeout {
                    record: handle.record_name,
                    timeout_secs: timeout.as_secs(),
                });
            }
            self.ca.submit_challenge(&mut order, challenge).await?;
        }

        attempt.validating()?;
        self.ca
            .await_validation(&mut order, self.settings.validation_timeout)
            .await?;
        attempt.challenge_validated();

        let (key, csr) = certificate_request(&domain)?;
        let chain = self
            .ca
            .finalize(&mut order, &csr, self.settings.validation_timeout)
            .await?;

        let (leaf_chain, anchor) = split_full_chain(&chain)?;
        let set = CertificateArtifactSet::from_parts(
            domain.clone(),
            Bytes::from(leaf_chain),
            Bytes::from(key.serialize_pem()),
            Bytes::from(anchor),
        )?;
        set.validate()?;
        if set.not_after <= Utc::now() {
            return Err(ArtifactError::Expired(set.not_after).into());
        }
        attempt.issued(set.not_after)?;

        publish_set(self.store.as_ref(), &set, &self.settings.retry).await?;
        attempt.stored()?;

        Ok(set)
    }
}

impl<C: CertificateAuthority + std::fmt::Debug> std::fmt::Debug for Issuer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer")
            .field("ca", &self.ca)
            .field("publisher", &self.publisher)
            .field("settings", &self.settings)
            .finish()
    }
}
