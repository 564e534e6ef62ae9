//! Signing CA rotator
//!
//! Owns a `kubernetes.io/tls` Secret holding the current signing CA
//! certificate and private key. On each activation it decides whether the
//! persisted signer is healthy, stale, or missing, and regenerates it when
//! needed. When a rotation replaces an existing signer, the certificate
//! found in the live Secret at write time is returned to the caller so the
//! bundle rotator can keep trusting leaves signed by the outgoing CA until
//! it expires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use tracing::{debug, info};

use crate::error::Error;
use crate::metadata::{
    annotation, ensure_owner_ref, format_duration, has_owner_ref, regenerate_offset_elapsed,
    set_annotation, set_validity_annotations, AdditionalAnnotations, CertificateType,
    AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION, OWNING_COMPONENT_ANNOTATION,
};
use crate::pki::{key_matches_certificate, CaCertificate, SigningCa};
use crate::store::{Clock, EventRecorder, SecretLister, SecretStore, StoreError};
use crate::{Result, TLS_CERT_KEY, TLS_KEY_KEY};

/// Secret type for certificate/key payloads
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Inline retries for optimistic-concurrency write conflicts before handing
/// the failure back to the dispatcher
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Rotator for the self-signed signing CA Secret
pub struct RotatedSigningCaSecret {
    /// Namespace of the signer Secret
    pub namespace: String,
    /// Name of the signer Secret; also the CommonName of every generated CA
    pub name: String,
    /// Lifetime of each CA generation
    pub validity: Duration,
    /// Age after which a still-valid CA is proactively replaced; must be
    /// shorter than `validity`
    pub refresh: Duration,
    /// Optional early-rotation offset, persisted as an annotation so it can
    /// also be set out of band
    pub auto_regenerate_after: Option<Duration>,
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

impl RotatedSigningCaSecret {
    /// Validate the rotator configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::config("signer namespace and name must be set"));
        }
        if self.refresh.is_zero() || self.refresh >= self.validity {
            return Err(Error::config(format!(
                "signer refresh ({}) must be non-zero and shorter than validity ({})",
                format_duration(self.refresh),
                format_duration(self.validity),
            )));
        }
        Ok(())
    }

    /// Ensure a healthy signing CA exists, creating or rotating as needed.
    ///
    /// Returns the current CA and, when this activation replaced a
    /// previously persisted certificate, that outgoing certificate for
    /// bundling.
    pub async fn ensure_signing_ca(&self) -> Result<(SigningCa, Option<CaCertificate>)> {
        let now = self.clock.now();
        let cached = self.lister.get(&self.namespace, &self.name);
        let existed_in_cache = cached.is_some();

        if let Some(secret) = cached {
            match self.needs_new(&secret, now) {
                None => {
                    let ca = load_signing_ca(&secret)?;
                    self.ensure_metadata(&secret).await?;
                    return Ok((ca, None));
                }
                Some(reason) => {
                    info!(
                        secret = %format_args!("{}/{}", self.namespace, self.name),
                        %reason,
                        "signing CA needs regeneration"
                    );
                    self.event_recorder.event(
                        "SignerUpdateRequired",
                        &format!(
                            "rotating signing CA {}/{}: {reason}",
                            self.namespace, self.name
                        ),
                    );
                }
            }
        } else {
            debug!(
                secret = %format_args!("{}/{}", self.namespace, self.name),
                "signing CA secret not in cache"
            );
        }

        let ca = SigningCa::new(&self.name, self.validity, now)?;
        let previous = self.persist(&ca, existed_in_cache).await?;
        Ok((ca, previous))
    }

    /// First matching condition wins; None means the persisted signer is
    /// healthy.
    fn needs_new(&self, secret: &Secret, now: chrono::DateTime<chrono::Utc>) -> Option<String> {
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
        if !cert.is_ca() {
            return Some("certificate is not a CA".to_string());
        }

        let key_pem = String::from_utf8_lossy(&key_bytes.0);
        if !key_matches_certificate(&cert, &key_pem) {
            return Some("private key does not match certificate".to_string());
        }

        if cert.is_expired(now) {
            return Some(format!("already expired at {}", cert.not_after()));
        }
        let refresh_due =
            cert.not_before() + chrono::Duration::from_std(self.refresh).unwrap_or(chrono::Duration::zero());
        if now >= refresh_due {
            return Some(format!("past its refresh window (since {refresh_due})"));
        }
        if regenerate_offset_elapsed(&secret.metadata, cert.not_before(), now) {
            return Some("auto-regenerate offset has elapsed".to_string());
        }
        None
    }

    /// Healthy-signer path: write only when owner aggregation or the
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

    /// Write the new CA, capturing whatever certificate the live Secret held
    /// as the `previous` generation.
    async fn persist(
        &self,
        ca: &SigningCa,
        existed_in_cache: bool,
    ) -> Result<Option<CaCertificate>> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.store.get(&self.name).await {
                Ok(mut existing) => {
                    let previous = existing
                        .data
                        .as_ref()
                        .and_then(|d| d.get(TLS_CERT_KEY))
                        .and_then(|b| CaCertificate::from_pem(&b.0).ok());
                    self.apply(&mut existing, ca);
                    match self.store.update(&existing).await {
                        Ok(_) => {
                            self.event_recorder.event(
                                "SigningCertificateUpdated",
                                &format!(
                                    "updated signing CA {}/{}",
                                    self.namespace, self.name
                                ),
                            );
                            return Ok(previous);
                        }
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    if self.use_update_only && existed_in_cache {
                        return Err(StoreError::NotFound(format!(
                            "signing CA secret {}/{} deleted mid-rotation",
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
                    self.apply(&mut secret, ca);
                    match self.store.create(&secret).await {
                        Ok(_) => {
                            self.event_recorder.event(
                                "SigningCertificateCreated",
                                &format!(
                                    "created signing CA {}/{}",
                                    self.namespace, self.name
                                ),
                            );
                            return Ok(None);
                        }
                        // Lost a create race against a peer; re-read and
                        // fall into the update path.
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(format!(
            "gave up writing signing CA {}/{} after {MAX_WRITE_ATTEMPTS} conflicts",
            self.namespace, self.name
        ))
        .into())
    }

    fn apply(&self, secret: &mut Secret, ca: &SigningCa) {
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        data.insert(
            TLS_CERT_KEY.to_string(),
            ByteString(ca.cert_pem().as_bytes().to_vec()),
        );
        data.insert(
            TLS_KEY_KEY.to_string(),
            ByteString(ca.key_pem().as_bytes().to_vec()),
        );
        secret.type_.get_or_insert_with(|| TLS_SECRET_TYPE.to_string());

        CertificateType::Signer.apply(&mut secret.metadata);
        set_validity_annotations(
            &mut secret.metadata,
            ca.cert().not_before(),
            ca.cert().not_after(),
        );
        if let Some(offset) = self.auto_regenerate_after {
            set_annotation(
                &mut secret.metadata,
                AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION,
                &format_duration(offset),
            );
        }
        self.additional_annotations.ensure(&mut secret.metadata);
        if let Some(owner) = &self.owner {
            ensure_owner_ref(&mut secret.metadata, owner);
        }
    }
}

/// Load a signing CA from a persisted Secret
pub(crate) fn load_signing_ca(secret: &Secret) -> Result<SigningCa> {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);
    let cert = data
        .get(TLS_CERT_KEY)
        .ok_or_else(|| Error::parse(format!("signer secret missing {TLS_CERT_KEY}")))?;
    let key = data
        .get(TLS_KEY_KEY)
        .ok_or_else(|| Error::parse(format!("signer secret missing {TLS_KEY_KEY}")))?;
    SigningCa::from_pem(
        &String::from_utf8_lossy(&cert.0),
        &String::from_utf8_lossy(&key.0),
    )
}
