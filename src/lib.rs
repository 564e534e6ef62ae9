//! Trellis - automated X.509 certificate rotation for Kubernetes control planes
//!
//! Trellis keeps a three-part PKI converged inside an operator: a self-signed
//! signing CA held in a Secret, a trust bundle ConfigMap aggregating the
//! current and recently-retired signing certificates, and one or more leaf
//! certificate/key Secrets (serving or client) signed by the current CA.
//!
//! # Architecture
//!
//! A [`controller::CertRotationController`] runs three rotators in strict
//! order on every activation:
//! - the signer rotator creates or rotates the signing CA,
//! - the bundle rotator merges the current (and any just-retired) CA
//!   certificate into the trust bundle, pruning expired and duplicate
//!   entries,
//! - each leaf rotator re-issues its certificate whenever it is missing,
//!   stale, or no longer signed by the current CA.
//!
//! Rotation preserves trust continuity: the retired CA certificate stays in
//! the bundle until it expires, so peers that have not yet observed the new
//! CA keep validating leaves signed by either generation.
//!
//! Multiple controllers may share one signer and bundle. They coordinate
//! without locks or leader election, purely through the API server's
//! optimistic concurrency: every write is a read-merge-update with a
//! resource-version check, and the bundle merge is commutative under retry.
//!
//! # Modules
//!
//! - [`controller`] - the reconciler (`sync`) and dispatcher (`run`)
//! - [`signer`] - signing CA rotator
//! - [`cabundle`] - trust bundle rotator and merge algorithm
//! - [`target`] - leaf certificate rotators (serving and client)
//! - [`pki`] - certificate generation, parsing, and verification
//! - [`store`] - Kubernetes store/informer contracts and implementations
//! - [`metadata`] - annotation schema and owner-reference aggregation
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cabundle;
pub mod controller;
pub mod error;
pub mod metadata;
pub mod pki;
pub mod signer;
pub mod store;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Secret data key holding the PEM-encoded certificate
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret data key holding the PEM-encoded private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// ConfigMap data key holding the PEM concatenation of trusted CA certificates
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Default interval between periodic full resyncs of a controller
pub const DEFAULT_RESYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
