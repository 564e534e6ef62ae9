//! Trust bundle rotator
//!
//! Owns a ConfigMap whose `ca-bundle.crt` key holds the PEM concatenation of
//! every CA certificate consumers should trust. Each activation unions the
//! CAs this controller needs (the current signer and, mid-rotation, its
//! predecessor) with whatever the bundle already holds, drops expired and
//! duplicate entries, and writes back only when the payload or metadata
//! actually changed.
//!
//! Several controllers routinely share one bundle. The merge runs inside a
//! read-merge-update loop with a resource-version check, so concurrent
//! writers converge regardless of ordering: each retry re-reads the other
//! writer's certificates and carries them forward.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::metadata::{
    annotation, ensure_owner_ref, has_owner_ref, AdditionalAnnotations, CertificateType,
    OWNING_COMPONENT_ANNOTATION,
};
use crate::pki::{encode_certs_pem, parse_certs_pem, CaCertificate, SigningCa};
use crate::store::{Clock, ConfigMapLister, ConfigMapStore, EventRecorder, StoreError};
use crate::{Result, CA_BUNDLE_KEY};

/// Inline retries for optimistic-concurrency write conflicts before handing
/// the failure back to the dispatcher
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Rotator for the trust bundle ConfigMap
pub struct CaBundleConfigMap {
    /// Namespace of the bundle ConfigMap
    pub namespace: String,
    /// Name of the bundle ConfigMap
    pub name: String,
    /// Live store for reads-before-write and writes
    pub store: Arc<dyn ConfigMapStore>,
    /// Informer cache the no-write decision is made from
    pub lister: Arc<dyn ConfigMapLister>,
    /// Sink for bundle events
    pub event_recorder: Arc<dyn EventRecorder>,
    /// Operator-supplied annotations
    pub additional_annotations: AdditionalAnnotations,
    /// Owner reference to aggregate onto the ConfigMap
    pub owner: Option<OwnerReference>,
    /// Time source for expiry pruning
    pub clock: Clock,
}

impl CaBundleConfigMap {
    /// Validate the rotator configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::config("ca-bundle namespace and name must be set"));
        }
        Ok(())
    }

    /// Merge the signer's certificate (and its just-retired predecessor)
    /// into the bundle and return the resulting trusted certificates.
    pub async fn ensure_ca_bundle(
        &self,
        signer: &SigningCa,
        previous: Option<&CaCertificate>,
    ) -> Result<Vec<CaCertificate>> {
        let now = self.clock.now();
        let mut required = vec![signer.cert().clone()];
        if let Some(previous) = previous {
            required.push(previous.clone());
        }

        if let Some(cached) = self.lister.get(&self.namespace, &self.name) {
            let cached_pem = bundle_payload(&cached);
            let existing = parse_existing(&cached_pem);
            let merged = merge_bundle(&required, &existing, now);
            if cached_pem == encode_certs_pem(&merged) && self.metadata_current(&cached.metadata) {
                debug!(
                    configmap = %format_args!("{}/{}", self.namespace, self.name),
                    certs = merged.len(),
                    "trust bundle already up to date"
                );
                return Ok(merged);
            }
        }

        self.write(&required, now).await
    }

    /// Read-merge-update against the live object, retrying on conflicts so
    /// concurrent writers' certificates are carried forward.
    async fn write(
        &self,
        required: &[CaCertificate],
        now: DateTime<Utc>,
    ) -> Result<Vec<CaCertificate>> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.store.get(&self.name).await {
                Ok(mut configmap) => {
                    let live_pem = bundle_payload(&configmap);
                    let existing = parse_existing(&live_pem);
                    let merged = merge_bundle(required, &existing, now);
                    let merged_pem = encode_certs_pem(&merged);

                    let payload_changed = live_pem != merged_pem;
                    configmap
                        .data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(CA_BUNDLE_KEY.to_string(), merged_pem);
                    let metadata_changed = self.apply_metadata(&mut configmap.metadata);

                    if !payload_changed && !metadata_changed {
                        return Ok(merged);
                    }

                    match self.store.update(&configmap).await {
                        Ok(_) => {
                            info!(
                                configmap = %format_args!("{}/{}", self.namespace, self.name),
                                certs = merged.len(),
                                "updated trust bundle"
                            );
                            self.event_recorder.event(
                                "CABundleUpdated",
                                &format!(
                                    "updated trust bundle {}/{} to {} certificates",
                                    self.namespace,
                                    self.name,
                                    merged.len()
                                ),
                            );
                            return Ok(merged);
                        }
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    let merged = merge_bundle(required, &[], now);
                    let mut configmap = ConfigMap {
                        metadata: ObjectMeta {
                            namespace: Some(self.namespace.clone()),
                            name: Some(self.name.clone()),
                            ..Default::default()
                        },
                        data: Some(BTreeMap::from([(
                            CA_BUNDLE_KEY.to_string(),
                            encode_certs_pem(&merged),
                        )])),
                        ..Default::default()
                    };
                    self.apply_metadata(&mut configmap.metadata);

                    match self.store.create(&configmap).await {
                        Ok(_) => {
                            self.event_recorder.event(
                                "CABundleCreated",
                                &format!(
                                    "created trust bundle {}/{} with {} certificates",
                                    self.namespace,
                                    self.name,
                                    merged.len()
                                ),
                            );
                            return Ok(merged);
                        }
                        // Lost a create race against a peer; re-read and
                        // merge with their contents instead.
                        Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(format!(
            "gave up writing trust bundle {}/{} after {MAX_WRITE_ATTEMPTS} conflicts",
            self.namespace, self.name
        ))
        .into())
    }

    fn apply_metadata(&self, meta: &mut ObjectMeta) -> bool {
        let mut changed = CertificateType::CaBundle.apply(meta);
        changed |= self.additional_annotations.ensure(meta);
        if let Some(owner) = &self.owner {
            changed |= ensure_owner_ref(meta, owner);
        }
        changed
    }

    fn metadata_current(&self, meta: &ObjectMeta) -> bool {
        if CertificateType::from_object_meta(meta) != Some(CertificateType::CaBundle) {
            return false;
        }
        if self.additional_annotations.owning_component.is_some()
            && annotation(meta, OWNING_COMPONENT_ANNOTATION).is_none()
        {
            return false;
        }
        match &self.owner {
            Some(owner) => has_owner_ref(meta, owner),
            None => true,
        }
    }
}

fn bundle_payload(configmap: &ConfigMap) -> String {
    configmap
        .data
        .as_ref()
        .and_then(|d| d.get(CA_BUNDLE_KEY))
        .cloned()
        .unwrap_or_default()
}

/// Parse the existing payload, treating absence or garbage as an empty
/// bundle so a corrupted object is rebuilt rather than wedging rotation.
fn parse_existing(pem: &str) -> Vec<CaCertificate> {
    if pem.trim().is_empty() {
        return Vec::new();
    }
    match parse_certs_pem(pem.as_bytes()) {
        Ok(certs) => certs,
        Err(err) => {
            warn!(error = %err, "existing trust bundle does not parse, rebuilding");
            Vec::new()
        }
    }
}

/// The bundle merge: required certificates first, then whatever already
/// exists, dropping expired entries and (issuer, serial) duplicates while
/// preserving first appearance order. Deterministic for given inputs, and
/// commutative enough that concurrent writers converge under read-merge-CAS.
pub(crate) fn merge_bundle(
    required: &[CaCertificate],
    existing: &[CaCertificate],
    now: DateTime<Utc>,
) -> Vec<CaCertificate> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for cert in required.iter().chain(existing.iter()) {
        if cert.is_expired(now) {
            continue;
        }
        if !seen.insert(cert.fingerprint()) {
            continue;
        }
        merged.push(cert.clone());
    }
    merged
}
