//! Certificate authority client
//!
//! [`CertificateAuthority`] is the seam the issuer drives: open an order and
//! learn the DNS-01 challenge, tell the CA the record is ready, wait for
//! validation, finalize with a CSR. [`InstantAcmeAuthority`] implements it
//! over `instant-acme`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use radcert_common::{retry, Classify, DomainName, RetryPolicy};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::sync::OnceCell;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use super::account::{contact_uri, AccountStore, StoredAccount};
use super::error::AcmeError;

/// First delay between order polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for the delay between order polls
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Await `$call` under `$policy`, retrying transient failures.
///
/// [`retry`] needs a closure it can call again, which an expression
/// borrowing the order mutably cannot be; this re-evaluates the expression
/// in place instead.
macro_rules! retry_in_place {
    ($policy:expr, $operation:expr, $call:expr) => {{
        let mut attempt = 1;
        loop {
            match $call.await.map_err(AcmeError::from) {
                Ok(value) => break Ok(value),
                Err(e) => match $policy.retry_delay(attempt, &e) {
                    Some(delay) => {
                        warn!(
                            operation = $operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient CA failure, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => break Err(e),
                },
            }
        }
    }};
}

/// A DNS-01 challenge the CA wants answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    /// Identifier being validated
    pub identifier: String,
    /// Challenge token issued by the CA
    pub token: String,
    /// Challenge URL to notify once the record is visible
    pub url: String,
    /// TXT value: base64url SHA-256 of the key authorization
    pub record_value: String,
}

/// ACME operations the issuer needs from a certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// In-flight order state
    type Order: Send;

    /// Load or register the account for `contact`
    async fn ensure_account(&self, contact: &str) -> Result<(), AcmeError>;

    /// Open an order for `domain`.
    ///
    /// The challenge is `None` when the CA already holds a valid
    /// authorization for the domain.
    async fn request_challenge(
        &self,
        domain: &DomainName,
    ) -> Result<(Self::Order, Option<DnsChallenge>), AcmeError>;

    /// Tell the CA the challenge record is in place
    async fn submit_challenge(
        &self,
        order: &mut Self::Order,
        challenge: &DnsChallenge,
    ) -> Result<(), AcmeError>;

    /// Wait until the CA has validated the order
    async fn await_validation(
        &self,
        order: &mut Self::Order,
        timeout: Duration,
    ) -> Result<(), AcmeError>;

    /// Submit the CSR and return the issued full chain as PEM
    async fn finalize(
        &self,
        order: &mut Self::Order,
        csr_der: &[u8],
        timeout: Duration,
    ) -> Result<String, AcmeError>;
}

/// Generate an ECDSA P-256 key and a CSR for `domain`
pub fn certificate_request(domain: &DomainName) -> Result<(KeyPair, Vec<u8>), AcmeError> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| AcmeError::Csr(e.to_string()))?;
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::Csr(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(&key)
        .map_err(|e| AcmeError::Csr(e.to_string()))?;
    Ok((key, csr.der().as_ref().to_vec()))
}

/// ACME client over `instant-acme`
pub struct InstantAcmeAuthority {
    directory_url: String,
    accounts: AccountStore,
    account: OnceCell<Account>,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl InstantAcmeAuthority {
    pub fn new(directory_url: impl Into<String>, accounts: AccountStore, policy: RetryPolicy) -> Self {
        Self {
            directory_url: directory_url.into(),
            accounts,
            account: OnceCell::new(),
            policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    fn account(&self) -> Result<&Account, AcmeError> {
        self.account.get().ok_or(AcmeError::NoAccount)
    }

    async fn load_or_create(&self, contact: &str) -> Result<Account, AcmeError> {
        let contact = contact_uri(contact);

        if let Some(stored) = self.accounts.load()? {
            if stored.directory == self.directory_url {
                let credentials: AccountCredentials = serde_json::from_value(stored.credentials)
                    .map_err(|e| AcmeError::AccountStorage(e.to_string()))?;
                let account = Account::from_credentials(credentials).await?;
                debug!(contact = %stored.contact, "Using stored ACME account");
                return Ok(account);
            }
            warn!(
                stored_directory = %stored.directory,
                directory = %self.directory_url,
                "Stored ACME account belongs to another directory, registering a new one"
            );
        }

        let contacts = [contact.as_str()];
        let new_account = NewAccount {
            contact: &contacts,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let new_account = &new_account;
        let directory_url = self.directory_url.as_str();
        let (account, credentials) = retry(&self.policy, "acme.new_account", move || async move {
            Account::create(new_account, directory_url, None)
                .await
                .map_err(AcmeError::from)
        })
        .await?;

        self.accounts.save(&StoredAccount {
            contact: contact.clone(),
            directory: self.directory_url.clone(),
            created: Utc::now(),
            credentials: serde_json::to_value(&credentials)
                .map_err(|e| AcmeError::AccountStorage(e.to_string()))?,
        })?;

        info!(contact = %contact, directory = %self.directory_url, "Registered ACME account");
        Ok(account)
    }
}

#[async_trait]
impl CertificateAuthority for InstantAcmeAuthority {
    type Order = Order;

    async fn ensure_account(&self, contact: &str) -> Result<(), AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create(contact))
            .await?;
        Ok(())
    }

    async fn request_challenge(
        &self,
        domain: &DomainName,
    ) -> Result<(Order, Option<DnsChallenge>), AcmeError> {
        let account = self.account()?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let identifiers = &identifiers[..];

        let mut order = retry(&self.policy, "acme.new_order", move || async move {
            account
                .new_order(&NewOrder { identifiers })
                .await
                .map_err(AcmeError::from)
        })
        .await?;
        debug!(domain = %domain, "Created ACME order");

        let authorizations: Vec<_> =
            retry_in_place!(self.policy, "acme.authorizations", order.authorizations())?;
        let mut found = None;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                ref other => {
                    return Err(AcmeError::OrderInvalid(format!(
                        "authorization for {} is {:?}",
                        domain, other
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDnsChallenge(domain.to_string()))?;

            #[allow(unreachable_patterns)]
            let identifier = match &authz.identifier {
                Identifier::Dns(name) => name.clone(),
                _ => domain.to_string(),
            };

            found = Some(DnsChallenge {
                identifier,
                token: challenge.token.clone(),
                url: challenge.url.clone(),
                record_value: order.key_authorization(challenge).dns_value(),
            });
        }

        Ok((order, found))
    }

    async fn submit_challenge(
        &self,
        order: &mut Order,
        challenge: &DnsChallenge,
    ) -> Result<(), AcmeError> {
        retry_in_place!(
            self.policy,
            "acme.challenge_ready",
            order.set_challenge_ready(&challenge.url)
        )?;
        debug!(identifier = %challenge.identifier, "Challenge marked ready");
        Ok(())
    }

    async fn await_validation(&self, order: &mut Order, timeout: Duration) -> Result<(), AcmeError> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.poll_interval;

        loop {
            // A transient poll failure only costs this round
            let status = match order.refresh().await.map_err(AcmeError::from) {
                Ok(state) => Some(state.status),
                Err(e) if e.class().is_retryable() => {
                    warn!(error = %e, "Order poll failed, polling again");
                    None
                }
                Err(e) => return Err(e),
            };
            trace!(status = ?status, "Polled ACME order");
            match status {
                None => {}
                Some(OrderStatus::Ready | OrderStatus::Valid) => return Ok(()),
                Some(OrderStatus::Invalid) => {
                    let detail = order
                        .state()
                        .error
                        .as_ref()
                        .and_then(|p| p.detail.clone())
                        .unwrap_or_else(|| "CA reported the order invalid".to_string());
                    return Err(AcmeError::OrderInvalid(detail));
                }
                Some(OrderStatus::Pending | OrderStatus::Processing) => {}
            }

            if Instant::now() + delay > deadline {
                return Err(AcmeError::Timeout {
                    stage: "validation",
                    timeout_secs: timeout.as_secs(),
                });
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    async fn finalize(
        &self,
        order: &mut Order,
        csr_der: &[u8],
        timeout: Duration,
    ) -> Result<String, AcmeError> {
        retry_in_place!(self.policy, "acme.finalize", order.finalize(csr_der))?;
        debug!("Submitted CSR");

        let deadline = Instant::now() + timeout;
        let mut delay = self.poll_interval;
        loop {
            match order.certificate().await.map_err(AcmeError::from) {
                Ok(Some(chain)) => return Ok(chain),
                Ok(None) => {}
                Err(e) if e.class().is_retryable() => {
                    warn!(error = %e, "Certificate download failed, trying again");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() + delay > deadline {
                return Err(AcmeError::Timeout {
                    stage: "certificate retrieval",
                    timeout_secs: timeout.as_secs(),
                });
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for InstantAcmeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeAuthority")
            .field("directory_url", &self.directory_url)
            .field("account_path", &self.accounts.path())
            .field("account_loaded", &self.account.initialized())
            .finish()
    }
}
