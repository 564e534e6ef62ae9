//! Leaf certificate rotators
//!
//! Owns a `kubernetes.io/tls` Secret holding a certificate/key pair signed
//! by the current signing CA. Serving and client certificates share all of
//! the rotation machinery and differ only in how the subject and SAN set are
//! derived, so the kind-specific behavior lives behind the
//! [`TargetCertCreator`] capability trait rather than in separate rotators.
//!
//! A leaf is re-issued the moment it is no longer signed by the *current*
//! signing CA. The retired CA stays in the trust bundle until it expires, so
//! consumers that have not yet observed the new bundle keep accepting the
//! old leaf while the re-issued one propagates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Error;
use crate::metadata::{
    annotation, ensure_owner_ref, format_duration, has_owner_ref, regenerate_offset_elapsed,
    set_annotation, set_validity_annotations, AdditionalAnnotations, CertificateType,
    AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION, HOSTNAMES_ANNOTATION, ISSUER_ANNOTATION,
    OWNING_COMPONENT_ANNOTATION,
};
use crate::pki::{key_matches_certificate, verify_signed_by, CaCertificate, CertKeyPair, SigningCa};
use crate::store::{Clock, EventRecorder, SecretLister, SecretStore, StoreError};
use crate::{Result, TLS_CERT_KEY, TLS_KEY_KEY};

/// Secret type for certificate/key payloads
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Inline retries for optimistic-concurrency write conflicts before handing
/// the failure back to the dispatcher
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Kind-specific behavior of a leaf certificate.
///
/// Implementations derive the subject/SAN material, contribute their own
/// staleness checks and annotations, and may expose a recheck stream that
/// asks the dispatcher for an immediate resync when their inputs change
/// (e.g. the serving hostname set).
pub trait TargetCertCreator: Send + Sync {
    /// The certificate type this creator issues
    fn certificate_type(&self) -> CertificateType;

    /// Issue a fresh certificate/key pair signed by the given CA
    fn new_certificate(
        &self,
        signer: &SigningCa,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair>;

    /// Kind-specific staleness check for an otherwise healthy certificate;
    /// a non-empty reason forces re-issuance
    fn need_new(&self, cert: &CaCertificate) -> Option<String>;

    /// Contribute kind-specific annotations to the persisted Secret
    fn set_annotations(&self, cert: &CertKeyPair, meta: &mut ObjectMeta);

    /// Stream of "inputs changed" pulses, latest-wins; None means this kind
    /// has no recheck source
    fn recheck_channel(&self) -> Option<watch::Receiver<()>> {
        None
    }
}

/// Serving (TLS server) certificate derivation.
///
/// The hostname set is a function so embedders can plug in discovery; when
/// it changes between activations the SAN comparison forces re-issuance, and
/// an optional recheck channel lets the discovery source demand an immediate
/// resync instead of waiting for the periodic tick.
pub struct ServingCertRotation {
    hostnames: Arc<dyn Fn() -> Vec<String> + Send + Sync>,
    recheck: Option<watch::Receiver<()>>,
}

impl ServingCertRotation {
    /// Create a serving rotation over the given hostname source
    pub fn new(hostnames: impl Fn() -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            hostnames: Arc::new(hostnames),
            recheck: None,
        }
    }

    /// Attach a recheck stream pulsed whenever the hostname set changes
    pub fn with_recheck(mut self, recheck: watch::Receiver<()>) -> Self {
        self.recheck = Some(recheck);
        self
    }

    fn current_hostnames(&self) -> Vec<String> {
        (self.hostnames.as_ref())()
    }
}

impl TargetCertCreator for ServingCertRotation {
    fn certificate_type(&self) -> CertificateType {
        CertificateType::Serving
    }

    fn new_certificate(
        &self,
        signer: &SigningCa,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair> {
        signer.issue_serving_cert(&self.current_hostnames(), validity, now)
    }

    fn need_new(&self, cert: &CaCertificate) -> Option<String> {
        let configured: std::collections::BTreeSet<String> =
            self.current_hostnames().into_iter().collect();
        let actual = cert.san_entries();
        if configured != actual {
            return Some(format!(
                "hostnames changed from {actual:?} to {configured:?}"
            ));
        }
        None
    }

    fn set_annotations(&self, _cert: &CertKeyPair, meta: &mut ObjectMeta) {
        set_annotation(
            meta,
            HOSTNAMES_ANNOTATION,
            &self.current_hostnames().join(","),
        );
    }

    fn recheck_channel(&self) -> Option<watch::Receiver<()>> {
        self.recheck.clone()
    }
}

/// Client (mTLS) certificate derivation: CN is the user, each group becomes
/// an Organization entry
pub struct ClientCertRotation {
    /// User name embedded as the subject CommonName
    pub user: String,
    /// Group memberships embedded as Organization entries
    pub groups: Vec<String>,
}

impl TargetCertCreator for ClientCertRotation {
    fn certificate_type(&self) -> CertificateType {
        CertificateType::Client
    }

    fn new_certificate(
        &self,
        signer: &SigningCa,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<CertKeyPair> {
        signer.issue_client_cert(&self.user, &self.groups, validity, now)
    }

    fn need_new(&self, cert: &CaCertificate) -> Option<String> {
        if cert.common_name() != self.user {
            return Some(format!(
                "subject changed from {:?} to {:?}",
                cert.common_name(),
                self.user
            ));
        }
        None
    }

    fn set_annotations(&self, _cert: &CertKeyPair, _meta: &mut ObjectMeta) {}
}

/// Rotator for one leaf certificate Secret
pub struct RotatedTargetSecret {
    /// Namespace of the leaf Secret
    pub namespace: String,
    /// Name of the leaf Secret
    pub name: String,
    /// Lifetime of each issued certificate
    pub validity: Duration,
    /// Age after which a still-valid certificate is proactively re-issued;
    /// must be shorter than `validity`
    pub refresh: Duration,
    /// Suppress the refresh-window rotation and only re-issue once the
    /// certificate has actually expired (or is otherwise invalid)
    pub refresh_only_when_expired: bool,
    /// Optional early-rotation offset, persisted as an annotation
    pub auto_regenerate_after: Option<Duration>,
    /// Kind-specific certificate derivation
    pub cert_creator: Arc<dyn TargetCertCreator>,
    /// Live store for reads-before-write and writes
    pub store: Arc<dyn SecretStore>,
    /// Informer cache the rotation decision is made from
    pub lister: Arc<dyn SecretLister>,
    /// Sink for rotation events
    pub event_recorder: Arc<dyn EventRecorder>,
    /// Operator-supplied annotations
    pub additional_annotations: AdditionalAnnotations,
    /// Owner reference to aggregate onto the Secret
    pub owner: Option<OwnerReference>,
    /// Never re-create the Secret once it has been observed and then deleted
    /// out from under us; fail the activation instead
    pub use_update_only: bool,
    /// Time source for all validity decisions
    pub clock: Clock,
}

impl RotatedTargetSecret {
    /// Validate the rotator configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::config("target namespace and name must be set"));
        }
        if self.refresh.is_zero() || self.refresh >= self.validity {
            return Err(Error::config(format!(
                "target refresh ({}) must be non-zero and shorter than validity ({})",
                format_duration(self.refresh),
                format_duration(self.validity),
            )));
        }
        Ok(())
    }

    /// Ensure the leaf exists, chains to the current signer, and is not
    /// stale, re-issuing it when any check fails.
    pub async fn ensure_target_cert(
        &self,
        signer: &SigningCa,
        bundle: &[CaCertificate],
    ) -> Result<CertKeyPair> {
        let now = self.clock.now();
        let cached = self.lister.get(&self.namespace, &self.name);
        let existed_in_cache = cached.is_some();

        if let Some(secret) = &cached {
            match self.needs_new(secret, signer, bundle, now) {
                None => {
                    let pair = load_cert_key_pair(secret)?;
                    self.ensure_metadata(secret).await?;
                    return Ok(pair);
                }
                Some(reason) => {
                    info!(
                        secret = %format_args!("{}/{}", self.namespace, self.name),
                        %reason,
                        "target certificate needs re-issuance"
                    );
                    self.event_recorder.event(
                        "TargetUpdateRequired",
                        &format!(
                            "rotating target certificate {}/{}: {reason}",
                            self.namespace, self.name
                        ),
                    );
                }
            }
        } else {
            debug!(
                secret = %format_args!("{}/{}", self.namespace, self.name),
                "target certificate secret not in cache"
            );
        }

        let pair = self
            .cert_creator
            .new_certificate(signer, self.validity, now)?;
        self.persist(&pair, signer, existed_in_cache).await?;
        Ok(pair)
    }

    /// First matching condition wins; None means the persisted leaf is
    /// healthy.
    fn needs_new(
        &self,
        secret: &Secret,
        signer: &SigningCa,
        bundle: &[CaCertificate],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let empty = BTreeMap::new();
        let data = secret.data.as_ref().unwrap_or(&empty);
        let Some(cert_bytes) = data.get(TLS_CERT_KEY) else {
            return Some(format!("missing {TLS_CERT_KEY}"));
        };
        let Some(key_bytes) = data.get(TLS_KEY_KEY) else {
            return Some(format!("missing {TLS_KEY_KEY}"));
        };

        let cert = match CaCertificate::from_pem(&cert_bytes.0) {
            Ok(cert) => cert,
            Err(err) => return Some(format!("certificate does not parse: {err}")),
        };
        let key_pem = String::from_utf8_lossy(&key_bytes.0);
        if !key_matches_certificate(&cert, &key_pem) {
            return Some("private key does not match certificate".to_string());
        }

        let Some(issuer) = annotation(&secret.metadata, ISSUER_ANNOTATION) else {
            return Some("missing issuer annotation".to_string());
        };
        if !bundle.iter().any(|ca| ca.common_name() == issuer) {
            return Some(format!("issuer {issuer:?} is not in the ca-bundle"));
        }

        if cert.is_expired(now) {
            return Some(format!("already expired at {}", cert.not_after()));
        }
        if !self.refresh_only_when_expired {
            let refresh_due =
                cert.not_before() + chrono::Duration::from_std(self.refresh).unwrap_or(chrono::Duration::zero());
            if now >= refresh_due {
                return Some(format!("past its refresh window (since {refresh_due})"));
            }
        }
        if regenerate_offset_elapsed(&secret.metadata, cert.not_before(), now) {
            return Some("auto-regenerate offset has elapsed".to_string());
        }

        // Generations of the signer share one CommonName, so chaining to the
        // current CA is established cryptographically, not by name.
        if !verify_signed_by(&cert, signer.cert()) {
            return Some("not signed by the current signing CA".to_string());
        }

        self.cert_creator.need_new(&cert)
    }

    /// Healthy-leaf path: write only when owner aggregation or the
    /// write-once component tag requires it.
    async fn ensure_metadata(&self, cached: &Secret) -> Result<()> {
        let owner_missing = self
            .owner
            .as_ref()
            .is_some_and(|owner| !has_owner_ref(&cached.metadata, owner));
        let component_missing = self.additional_annotations.owning_component.is_some()
            && annotation(&cached.metadata, OWNING_COMPONENT_ANNOTATION).is_none();
        if !owner_missing && !component_missing {
            return Ok(());
        }

        let mut secret = self.store.get(&self.name).await?;
        let mut changed = self.additional_annotations.ensure(&mut secret.metadata);
        if let Some(owner) = &self.owner {
            changed |= ensure_owner_ref(&mut secret.metadata, owner);
        }
        if changed {
            self.store.update(&secret).await?;
        }
        Ok(())
    }

    async fn persist(
        &self,
        pair: &CertKeyPair,
        signer: &SigningCa,
        existed_in_cache: bool,
    ) -> Result<()> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.store.get(&self.name).await {
                Ok(mut existing) => {
                    self.apply(&mut existing, pair, signer);
                    match self.store.update(&existing).await {
                        Ok(_) => {
                            self.event_recorder.event(
                                "TargetCertificateUpdated",
                                &format!(
                                    "updated target certificate {}/{}",
                                    self.namespace, self.name
                                ),
                            );
                            return Ok(());
                        }
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    if self.use_update_only && existed_in_cache {
                        return Err(StoreError::NotFound(format!(
                            "target secret {}/{} deleted mid-rotation",
                            self.namespace, self.name
                        ))
                        .into());
                    }
                    let mut secret = Secret {
                        metadata: ObjectMeta {
                            namespace: Some(self.namespace.clone()),
                            name: Some(self.name.clone()),
                            ..Default::default()
                        },
                        type_: Some(TLS_SECRET_TYPE.to_string()),
                        ..Default::default()
                    };
                    self.apply(&mut secret, pair, signer);
                    match self.store.create(&secret).await {
                        Ok(_) => {
                            self.event_recorder.event(
                                "TargetCertificateCreated",
                                &format!(
                                    "created target certificate {}/{}",
                                    self.namespace, self.name
                                ),
                            );
                            return Ok(());
                        }
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(format!(
            "gave up writing target certificate {}/{} after {MAX_WRITE_ATTEMPTS} conflicts",
            self.namespace, self.name
        ))
        .into())
    }

    fn apply(&self, secret: &mut Secret, pair: &CertKeyPair, signer: &SigningCa) {
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        data.insert(
            TLS_CERT_KEY.to_string(),
            ByteString(pair.cert_pem().as_bytes().to_vec()),
        );
        data.insert(
            TLS_KEY_KEY.to_string(),
            ByteString(pair.key_pem().as_bytes().to_vec()),
        );
        secret.type_.get_or_insert_with(|| TLS_SECRET_TYPE.to_string());

        self.cert_creator
            .certificate_type()
            .apply(&mut secret.metadata);
        set_validity_annotations(
            &mut secret.metadata,
            pair.cert().not_before(),
            pair.cert().not_after(),
        );
        set_annotation(&mut secret.metadata, ISSUER_ANNOTATION, signer.common_name());
        if let Some(offset) = self.auto_regenerate_after {
            set_annotation(
                &mut secret.metadata,
                AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION,
                &format_duration(offset),
            );
        }
        self.cert_creator.set_annotations(pair, &mut secret.metadata);
        self.additional_annotations.ensure(&mut secret.metadata);
        if let Some(owner) = &self.owner {
            ensure_owner_ref(&mut secret.metadata, owner);
        }
    }
}

/// Load a certificate/key pair from a persisted Secret
pub(crate) fn load_cert_key_pair(secret: &Secret) -> Result<CertKeyPair> {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);
    let cert = data
        .get(TLS_CERT_KEY)
        .ok_or_else(|| Error::parse(format!("target secret missing {TLS_CERT_KEY}")))?;
    let key = data
        .get(TLS_KEY_KEY)
        .ok_or_else(|| Error::parse(format!("target secret missing {TLS_KEY_KEY}")))?;
    CertKeyPair::from_pem(
        &String::from_utf8_lossy(&cert.0),
        &String::from_utf8_lossy(&key.0),
    )
}
