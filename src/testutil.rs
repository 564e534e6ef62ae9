//! Shared in-memory fakes for unit tests
//!
//! The store fake mirrors the API server's optimistic concurrency: every
//! object carries a resource version, updates conflict on mismatch, and an
//! action log records the get/create/update sequence so tests can assert
//! exactly which calls a sync performed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use tokio::sync::broadcast;

use crate::store::{
    Clock, ConfigMapLister, ConfigMapStore, EventRecorder, Informer, SecretLister, SecretStore,
    StatusReporter, StoreError,
};
use crate::{TLS_CERT_KEY, TLS_KEY_KEY};

/// Owner reference carrying only a name
pub(crate) fn owner_ref(name: &str) -> OwnerReference {
    OwnerReference {
        name: name.to_string(),
        ..Default::default()
    }
}

/// A `kubernetes.io/tls` secret with the given PEM payloads
pub(crate) fn tls_secret(namespace: &str, name: &str, cert_pem: &str, key_pem: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(cert_pem.as_bytes().to_vec()),
            ),
            (
                TLS_KEY_KEY.to_string(),
                ByteString(key_pem.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

/// Clock pinned to one instant
pub(crate) fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Clock::new(move || at)
}

/// Clock that tests can advance without sleeping
#[derive(Clone)]
pub(crate) struct AdjustableClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl AdjustableClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub(crate) fn clock(&self) -> Clock {
        let now = self.now.clone();
        Clock::new(move || *now.lock().unwrap())
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub(crate) fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

/// In-memory secret + configmap store with CAS semantics and an action log
#[derive(Default)]
pub(crate) struct MemoryStore {
    log: Mutex<Vec<String>>,
    secrets: Mutex<BTreeMap<String, Secret>>,
    configmaps: Mutex<BTreeMap<String, ConfigMap>>,
    next_rv: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn actions(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn clear_actions(&self) {
        self.log.lock().unwrap().clear();
    }

    pub(crate) fn secrets(&self) -> Vec<Secret> {
        self.secrets.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn configmap(&self, name: &str) -> Option<ConfigMap> {
        self.configmaps.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn configmaps(&self) -> Vec<ConfigMap> {
        self.configmaps.lock().unwrap().values().cloned().collect()
    }

    /// Insert without logging, as if another writer had created the object
    pub(crate) fn seed_secret(&self, mut secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        secret.metadata.resource_version = Some(self.fresh_rv());
        self.secrets.lock().unwrap().insert(name, secret);
    }

    /// Insert without logging, as if another writer had created the object
    pub(crate) fn seed_configmap(&self, mut configmap: ConfigMap) {
        let name = configmap.metadata.name.clone().unwrap_or_default();
        configmap.metadata.resource_version = Some(self.fresh_rv());
        self.configmaps.lock().unwrap().insert(name, configmap);
    }

    pub(crate) fn remove_secret(&self, name: &str) {
        self.secrets.lock().unwrap().remove(name);
    }

    fn fresh_rv(&self) -> String {
        (self.next_rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record(&self, verb: &str, kind: &str, name: &str) {
        self.log.lock().unwrap().push(format!("{verb} {kind}/{name}"));
    }
}

fn cas_check(
    kind: &str,
    name: &str,
    stored_rv: &Option<String>,
    incoming_rv: &Option<String>,
) -> Result<(), StoreError> {
    match incoming_rv {
        Some(rv) if Some(rv) != stored_rv.as_ref() => Err(StoreError::Conflict(format!(
            "{kind}/{name}: resource version mismatch"
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Secret, StoreError> {
        self.record("get", "secrets", name);
        self.secret(name)
            .ok_or_else(|| StoreError::NotFound(format!("secrets/{name}")))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.record("create", "secrets", &name);
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.contains_key(&name) {
            return Err(StoreError::Conflict(format!("secrets/{name} already exists")));
        }
        let mut stored = secret.clone();
        stored.metadata.resource_version = Some(self.fresh_rv());
        secrets.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.record("update", "secrets", &name);
        let mut secrets = self.secrets.lock().unwrap();
        let Some(stored) = secrets.get(&name) else {
            return Err(StoreError::NotFound(format!("secrets/{name}")));
        };
        cas_check(
            "secrets",
            &name,
            &stored.metadata.resource_version,
            &secret.metadata.resource_version,
        )?;
        let mut updated = secret.clone();
        updated.metadata.resource_version = Some(self.fresh_rv());
        secrets.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<Secret>, StoreError> {
        self.record("list", "secrets", "*");
        Ok(self.secrets())
    }
}

#[async_trait]
impl ConfigMapStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.record("get", "configmaps", name);
        self.configmap(name)
            .ok_or_else(|| StoreError::NotFound(format!("configmaps/{name}")))
    }

    async fn create(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = configmap.metadata.name.clone().unwrap_or_default();
        self.record("create", "configmaps", &name);
        let mut configmaps = self.configmaps.lock().unwrap();
        if configmaps.contains_key(&name) {
            return Err(StoreError::Conflict(format!(
                "configmaps/{name} already exists"
            )));
        }
        let mut stored = configmap.clone();
        stored.metadata.resource_version = Some(self.fresh_rv());
        configmaps.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = configmap.metadata.name.clone().unwrap_or_default();
        self.record("update", "configmaps", &name);
        let mut configmaps = self.configmaps.lock().unwrap();
        let Some(stored) = configmaps.get(&name) else {
            return Err(StoreError::NotFound(format!("configmaps/{name}")));
        };
        cas_check(
            "configmaps",
            &name,
            &stored.metadata.resource_version,
            &configmap.metadata.resource_version,
        )?;
        let mut updated = configmap.clone();
        updated.metadata.resource_version = Some(self.fresh_rv());
        configmaps.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<ConfigMap>, StoreError> {
        self.record("list", "configmaps", "*");
        Ok(self.configmaps.lock().unwrap().values().cloned().collect())
    }
}

/// Map-backed informer cache stand-in
pub(crate) struct MapLister<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
}

impl<K> Default for MapLister<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K> MapLister<K>
where
    K: k8s_openapi::Metadata<Ty = ObjectMeta> + Clone,
{
    pub(crate) fn insert(&self, object: K) {
        let meta = object.metadata();
        let key = (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        );
        self.objects.lock().unwrap().insert(key, object);
    }

    fn lookup(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

impl SecretLister for MapLister<Secret> {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lookup(namespace, name)
    }
}

impl ConfigMapLister for MapLister<ConfigMap> {
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lookup(namespace, name)
    }
}

/// Event recorder that captures (reason, message) pairs
#[derive(Default)]
pub(crate) struct MemoryRecorder {
    events: Mutex<Vec<(String, String)>>,
}

impl MemoryRecorder {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, _)| reason.clone())
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn event(&self, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), message.to_string()));
    }
}

/// Status reporter that captures the per-sync outcome
#[derive(Default)]
pub(crate) struct CapturingStatusReporter {
    reports: Mutex<Vec<Option<String>>>,
}

impl CapturingStatusReporter {
    pub(crate) fn reports(&self) -> Vec<Option<String>> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusReporter for CapturingStatusReporter {
    async fn report(
        &self,
        _controller_name: &str,
        sync_result: &crate::Result<()>,
    ) -> crate::Result<bool> {
        self.reports
            .lock()
            .unwrap()
            .push(sync_result.as_ref().err().map(ToString::to_string));
        Ok(false)
    }
}

/// Informer whose pulses the test fires by hand; always reports synced
pub(crate) struct ManualInformer {
    events: broadcast::Sender<()>,
}

impl Default for ManualInformer {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self { events }
    }
}

impl ManualInformer {
    pub(crate) fn pulse(&self) {
        let _ = self.events.send(());
    }
}

#[async_trait]
impl Informer for ManualInformer {
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.events.subscribe()
    }

    async fn wait_synced(&self) -> bool {
        true
    }
}
