//! radcert library
//!
//! Keeps a RADIUS server equipped with a publicly trusted TLS certificate
//! without putting cloud credentials on the RADIUS host.
//!
//! - **Issuer side** (`renew`): DNS-01 issuance over ACME, published to an
//!   encrypted S3 prefix
//! - **Consumer side** (`sync`): credential-less change detection, atomic
//!   install and a server reload
//!
//! # Example
//!
//! ```ignore
//! use radcert::distribution::DistributionAgent;
//! use radcert::deploy::{DeploymentApplier, InstallLayout};
//!
//! let applier = DeploymentApplier::new(InstallLayout::in_dir(certs_dir), reload);
//! let agent = DistributionAgent::new(source, Arc::new(applier), state, domain, policy);
//! match agent.sync(false).await? {
//!     SyncOutcome::Unchanged => {}
//!     SyncOutcome::Applied { not_after, .. } => println!("installed until {not_after}"),
//! }
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod deploy;
pub mod distribution;
pub mod outcome;
pub mod reload;
pub mod state;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Issuance
pub use acme::{Issuer, RenewalOutcome, RenewalScheduler};

// Distribution
pub use deploy::{ApplyError, DeploymentApplier};
pub use distribution::{Applier, DistributionAgent, SyncError, SyncOutcome};

// Reporting
pub use outcome::{Outcome, TriggerReport};
