//! Object store, informer, and reporting contracts
//!
//! The rotators never talk to the Kubernetes API directly. They go through
//! the narrow traits in this module so that tests can substitute in-memory
//! fakes and embedders can wrap their own clients. The trait shapes mirror
//! the API server's semantics: `update` is an optimistic-concurrency write
//! that fails with [`StoreError::Conflict`] when the resource version no
//! longer matches, and listers serve read-only snapshots from an informer
//! cache rather than live reads.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// Source of the current wall-clock time.
///
/// Validity and refresh policies take the clock as a dependency so tests can
/// pin or advance time instead of sleeping.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Clock {
    /// Wrap an arbitrary time source
    pub fn new(source: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(source),
        }
    }

    /// The system wall clock
    pub fn system() -> Self {
        Self::new(Utc::now)
    }

    /// The current instant according to this clock
    pub fn now(&self) -> DateTime<Utc> {
        (self.inner.as_ref())()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

/// Object store error, classified by how the caller should react
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure: the resource version no longer
    /// matches, or a create raced another writer
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller is not allowed to perform this operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Timeout, 5xx, or any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Conflicts resolve once the latest version is re-read; not-found can be
    /// a stale-cache artifact that the next resync clears; transport errors
    /// are transient by definition. Only authorization failures are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Forbidden(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 403 => StoreError::Forbidden(ae.message),
            other => StoreError::Transport(other.to_string()),
        }
    }
}

/// Store of secret records in a single namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name
    async fn get(&self, name: &str) -> Result<Secret, StoreError>;

    /// Create a secret; conflicts if it already exists
    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError>;

    /// Update a secret; conflicts unless the resource version matches
    async fn update(&self, secret: &Secret) -> Result<Secret, StoreError>;

    /// List all secrets in the namespace
    async fn list(&self) -> Result<Vec<Secret>, StoreError>;
}

/// Store of configmap records in a single namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Fetch a configmap by name
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError>;

    /// Create a configmap; conflicts if it already exists
    async fn create(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Update a configmap; conflicts unless the resource version matches
    async fn update(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// List all configmaps in the namespace
    async fn list(&self) -> Result<Vec<ConfigMap>, StoreError>;
}

/// Read-only view of the secret informer cache
pub trait SecretLister: Send + Sync {
    /// Return the cached secret, if the cache has observed it
    fn get(&self, namespace: &str, name: &str) -> Option<Secret>;
}

/// Read-only view of the configmap informer cache
pub trait ConfigMapLister: Send + Sync {
    /// Return the cached configmap, if the cache has observed it
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap>;
}

/// Change notifications from a watch on one resource kind.
///
/// Events carry no payload: any add/update/delete simply schedules another
/// reconciliation, and the rotators re-read state themselves.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Subscribe to coalesced change pulses
    fn subscribe(&self) -> broadcast::Receiver<()>;

    /// Wait until the initial list has completed.
    ///
    /// Returns false if the watch died before the cache filled.
    async fn wait_synced(&self) -> bool;
}

/// Fire-and-forget operational event sink
pub trait EventRecorder: Send + Sync {
    /// Record an event with a CamelCase reason and a human-readable message
    fn event(&self, reason: &str, message: &str);
}

/// Event recorder that writes structured log lines
pub struct TracingRecorder {
    component: String,
}

impl TracingRecorder {
    /// Create a recorder attributing events to the given component
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl EventRecorder for TracingRecorder {
    fn event(&self, reason: &str, message: &str) {
        info!(component = %self.component, reason = %reason, "{message}");
    }
}

/// Sink for the per-activation sync outcome.
///
/// Called exactly once at the end of every `sync`, success or failure, so a
/// higher-level operator status can surface the last error.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Report the sync outcome; returns whether a status object was updated
    async fn report(
        &self,
        controller_name: &str,
        sync_result: &crate::Result<()>,
    ) -> crate::Result<bool>;
}

/// Status reporter that only logs the outcome
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(
        &self,
        controller_name: &str,
        sync_result: &crate::Result<()>,
    ) -> crate::Result<bool> {
        match sync_result {
            Ok(()) => info!(controller = %controller_name, "sync succeeded"),
            Err(err) => warn!(controller = %controller_name, error = %err, "sync failed"),
        }
        Ok(false)
    }
}

/// Secret store backed by the Kubernetes API
pub struct KubeSecretStore {
    api: Api<Secret>,
}

impl KubeSecretStore {
    /// Create a store scoped to the given namespace
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Secret, StoreError> {
        self.api.get(name).await.map_err(StoreError::from)
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.api
            .create(&PostParams::default(), secret)
            .await
            .map_err(StoreError::from)
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.api
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(StoreError::from)
    }

    async fn list(&self) -> Result<Vec<Secret>, StoreError> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(StoreError::from)
    }
}

/// ConfigMap store backed by the Kubernetes API
pub struct KubeConfigMapStore {
    api: Api<ConfigMap>,
}

impl KubeConfigMapStore {
    /// Create a store scoped to the given namespace
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.api.get(name).await.map_err(StoreError::from)
    }

    async fn create(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.api
            .create(&PostParams::default(), configmap)
            .await
            .map_err(StoreError::from)
    }

    async fn update(&self, configmap: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = configmap.metadata.name.as_deref().unwrap_or_default();
        self.api
            .replace(name, &PostParams::default(), configmap)
            .await
            .map_err(StoreError::from)
    }

    async fn list(&self) -> Result<Vec<ConfigMap>, StoreError> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(StoreError::from)
    }
}

/// Informer cache backed by a kube reflector.
///
/// Owns a reflector store fed by a watch; implements the lister trait for
/// its resource type plus [`Informer`] change pulses. [`SharedInformer::new`]
/// returns the informer together with the future that drives the watch; the
/// embedder spawns that future and drops it to stop watching.
pub struct SharedInformer<K>
where
    K: kube::runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone,
{
    reader: Store<K>,
    events: broadcast::Sender<()>,
}

impl<K> SharedInformer<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    /// Create an informer over the given API scope and the future driving
    /// its watch
    pub fn new(api: Api<K>) -> (Arc<Self>, impl Future<Output = ()> + Send) {
        let (reader, writer) = reflector::store();
        let (events, _) = broadcast::channel(64);
        let informer = Arc::new(Self {
            reader,
            events: events.clone(),
        });

        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
        let drive = async move {
            let mut stream = pin!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    // Receiver lag or absence is fine; pulses are best-effort
                    // wake-ups, not a durable queue.
                    Ok(_) => {
                        let _ = events.send(());
                    }
                    Err(err) => warn!(error = %err, "watch stream error"),
                }
            }
        };

        (informer, drive)
    }
}

#[async_trait]
impl<K> Informer for SharedInformer<K>
where
    K: kube::runtime::reflector::Lookup + Clone + Send + Sync + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync,
{
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.events.subscribe()
    }

    async fn wait_synced(&self) -> bool {
        self.reader.wait_until_ready().await.is_ok()
    }
}

impl SecretLister for SharedInformer<Secret> {
    fn get(&self, namespace: &str, name: &str) -> Option<Secret> {
        let key = ObjectRef::new(name).within(namespace);
        self.reader.get(&key).map(|secret| (*secret).clone())
    }
}

impl ConfigMapLister for SharedInformer<ConfigMap> {
    fn get(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        let key = ObjectRef::new(name).within(namespace);
        self.reader.get(&key).map(|configmap| (*configmap).clone())
    }
}
