//! Shared types for radcert.
//!
//! - [`artifact`]: the three-file certificate set and its structural checks
//! - [`errors`]: the error taxonomy every component maps onto
//! - [`retry`]: bounded exponential backoff for transient failures
//! - [`ids`]: identifier newtypes

pub mod artifact;
pub mod errors;
pub mod ids;
pub mod retry;

pub use artifact::{
    content_fingerprint, leaf_not_after, split_full_chain, ArtifactError, ArtifactKind,
    ArtifactMetadata, CertificateArtifactSet,
};
pub use errors::{Classify, ErrorClass};
pub use ids::{AttemptId, DomainName};
pub use retry::{retry, RetryPolicy};
