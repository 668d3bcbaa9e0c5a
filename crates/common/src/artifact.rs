//! Certificate artifact model.
//!
//! A usable TLS identity for the RADIUS server is three files: the leaf
//! certificate with its chain, the private key, and the trust anchor the
//! server hands to supplicants. They are always produced, stored, fetched
//! and installed together.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rcgen::{KeyPair, PublicKeyData};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::errors::{Classify, ErrorClass};
use crate::ids::DomainName;

/// One of the three artifacts that make up a certificate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Leaf certificate followed by intermediates (`server.pem`)
    LeafChain,
    /// PEM private key for the leaf (`server.key`)
    PrivateKey,
    /// Trust anchor handed to clients (`ca.pem`)
    TrustAnchor,
}

impl ArtifactKind {
    /// All kinds, in install order
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::LeafChain,
        ArtifactKind::PrivateKey,
        ArtifactKind::TrustAnchor,
    ];

    /// Fixed object/file name for this kind
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::LeafChain => "server.pem",
            ArtifactKind::PrivateKey => "server.key",
            ArtifactKind::TrustAnchor => "ca.pem",
        }
    }

    /// Whether the artifact is secret material
    pub fn is_secret(self) -> bool {
        matches!(self, ArtifactKind::PrivateKey)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Change-detection metadata for one stored artifact.
///
/// Never used for trust decisions: a matching fingerprint only means
/// "nothing to do", never "this content is valid".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Opaque content identity (entity tag or content digest)
    pub fingerprint: String,
    /// Last modification time reported by the store
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl ArtifactMetadata {
    pub fn new(fingerprint: impl Into<String>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            last_modified,
        }
    }
}

/// SHA-256 hex digest of a body, used where a store has no entity tag
pub fn content_fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Structural problems with an artifact set
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{0} is empty")]
    Empty(ArtifactKind),

    #[error("{kind} is not valid PEM: {message}")]
    Pem { kind: ArtifactKind, message: String },

    #[error("{kind} contains no {expected} block")]
    MissingBlock {
        kind: ArtifactKind,
        expected: &'static str,
    },

    #[error("invalid leaf certificate: {0}")]
    Certificate(String),

    #[error("invalid private key: {0}")]
    PrivateKey(String),

    #[error("private key does not match the leaf certificate")]
    KeyMismatch,

    #[error("certificate names {found:?} do not cover {expected}")]
    DomainMismatch { expected: String, found: Vec<String> },

    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),
}

impl Classify for ArtifactError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }

    fn reason(&self) -> &'static str {
        match self {
            ArtifactError::Empty(_) => "artifact_empty",
            ArtifactError::Pem { .. } | ArtifactError::MissingBlock { .. } => "artifact_malformed",
            ArtifactError::Certificate(_) => "certificate_invalid",
            ArtifactError::PrivateKey(_) => "private_key_invalid",
            ArtifactError::KeyMismatch => "key_mismatch",
            ArtifactError::DomainMismatch { .. } => "domain_mismatch",
            ArtifactError::Expired(_) => "certificate_expired",
        }
    }
}

/// The complete set of artifacts for one domain
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateArtifactSet {
    pub leaf_chain: Bytes,
    pub private_key: Bytes,
    pub trust_anchor: Bytes,
    pub domain: DomainName,
    pub not_after: DateTime<Utc>,
}

impl CertificateArtifactSet {
    /// Assemble a set from raw bodies.
    ///
    /// Checks non-emptiness and reads `notAfter` from the leaf. Use
    /// [`validate`](Self::validate) for the full structural check.
    pub fn from_parts(
        domain: DomainName,
        leaf_chain: Bytes,
        private_key: Bytes,
        trust_anchor: Bytes,
    ) -> Result<Self, ArtifactError> {
        for (kind, body) in [
            (ArtifactKind::LeafChain, &leaf_chain),
            (ArtifactKind::PrivateKey, &private_key),
            (ArtifactKind::TrustAnchor, &trust_anchor),
        ] {
            if body.iter().all(|b| b.is_ascii_whitespace()) {
                return Err(ArtifactError::Empty(kind));
            }
        }

        let not_after = leaf_not_after(&leaf_chain)?;

        Ok(Self {
            leaf_chain,
            private_key,
            trust_anchor,
            domain,
            not_after,
        })
    }

    /// Body for one artifact kind
    pub fn body(&self, kind: ArtifactKind) -> &Bytes {
        match kind {
            ArtifactKind::LeafChain => &self.leaf_chain,
            ArtifactKind::PrivateKey => &self.private_key,
            ArtifactKind::TrustAnchor => &self.trust_anchor,
        }
    }

    /// Time left until the leaf expires (negative once expired)
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    /// Whether the set is inside the renewal window
    pub fn needs_renewal(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        self.remaining_validity(now) <= renew_before
    }

    /// Full structural validation.
    ///
    /// All bodies present, every body parses as PEM, the private key
    /// belongs to the leaf, and the leaf names cover `domain`.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        for kind in ArtifactKind::ALL {
            if self.body(kind).iter().all(|b| b.is_ascii_whitespace()) {
                return Err(ArtifactError::Empty(kind));
            }
        }

        let chain = parse_pem(ArtifactKind::LeafChain, &self.leaf_chain)?;
        let leaf_der = first_certificate(ArtifactKind::LeafChain, &chain)?;
        let (_, leaf) = x509_parser::parse_x509_certificate(leaf_der)
            .map_err(|e| ArtifactError::Certificate(e.to_string()))?;

        let anchors = parse_pem(ArtifactKind::TrustAnchor, &self.trust_anchor)?;
        first_certificate(ArtifactKind::TrustAnchor, &anchors)?;

        let key_pem = std::str::from_utf8(&self.private_key)
            .map_err(|e| ArtifactError::PrivateKey(e.to_string()))?;
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| ArtifactError::PrivateKey(e.to_string()))?;
        if key_pair.subject_public_key_info() != leaf.tbs_certificate.subject_pki.raw {
            return Err(ArtifactError::KeyMismatch);
        }

        let names = certificate_names(&leaf);
        if !names.iter().any(|name| self.domain.is_covered_by(name)) {
            return Err(ArtifactError::DomainMismatch {
                expected: self.domain.to_string(),
                found: names,
            });
        }

        Ok(())
    }
}

impl fmt::Debug for CertificateArtifactSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateArtifactSet")
            .field("domain", &self.domain)
            .field("not_after", &self.not_after)
            .field("leaf_chain_len", &self.leaf_chain.len())
            .field("private_key", &"<redacted>")
            .field("trust_anchor_len", &self.trust_anchor.len())
            .finish()
    }
}

/// Read `notAfter` from the first certificate in a PEM bundle
pub fn leaf_not_after(pem_bytes: &[u8]) -> Result<DateTime<Utc>, ArtifactError> {
    let blocks = parse_pem(ArtifactKind::LeafChain, pem_bytes)?;
    let der = first_certificate(ArtifactKind::LeafChain, &blocks)?;
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ArtifactError::Certificate(e.to_string()))?;

    let ts = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| ArtifactError::Certificate(format!("notAfter out of range: {}", ts)))
}

/// Split a CA-issued full chain into (`server.pem`, `ca.pem`) bodies.
///
/// `server.pem` keeps the full chain. `ca.pem` is the chain without the
/// leaf, or the full chain again when the CA returned a single certificate.
pub fn split_full_chain(full_chain_pem: &str) -> Result<(String, String), ArtifactError> {
    let blocks = parse_pem(ArtifactKind::LeafChain, full_chain_pem.as_bytes())?;
    let certs: Vec<&pem::Pem> = blocks.iter().filter(|p| p.tag() == "CERTIFICATE").collect();

    if certs.is_empty() {
        return Err(ArtifactError::MissingBlock {
            kind: ArtifactKind::LeafChain,
            expected: "CERTIFICATE",
        });
    }

    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    let full: String = certs.iter().map(|p| pem::encode_config(p, config)).collect();
    let anchor: String = if certs.len() > 1 {
        certs[1..]
            .iter()
            .map(|p| pem::encode_config(p, config))
            .collect()
    } else {
        full.clone()
    };

    Ok((full, anchor))
}

fn parse_pem(kind: ArtifactKind, body: &[u8]) -> Result<Vec<pem::Pem>, ArtifactError> {
    let blocks = pem::parse_many(body).map_err(|e| ArtifactError::Pem {
        kind,
        message: e.to_string(),
    })?;
    if blocks.is_empty() {
        return Err(ArtifactError::Pem {
            kind,
            message: "no PEM blocks found".to_string(),
        });
    }
    Ok(blocks)
}

fn first_certificate(kind: ArtifactKind, blocks: &[pem::Pem]) -> Result<&[u8], ArtifactError> {
    blocks
        .iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.contents())
        .ok_or(ArtifactError::MissingBlock {
            kind,
            expected: "CERTIFICATE",
        })
}

fn certificate_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names = Vec::new();

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }

    if names.is_empty() {
        for cn in cert.subject().iter_common_name() {
            if let Ok(value) = cn.as_str() {
                names.push(value.to_string());
            }
        }
    }

    names
}
