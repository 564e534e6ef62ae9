//! Certificate rotation controller
//!
//! The controller combines the three rotators into one idempotent `sync`
//! and drives it from a single-worker dispatch loop. Within one activation
//! the order is strict: the signer is ensured before the bundle, the bundle
//! before any leaf, so a leaf is never issued by a CA the bundle does not
//! already trust. Per-leaf failures do not abort sibling leaves; they are
//! aggregated into one error for the activation.
//!
//! The dispatch loop coalesces its three wake-up sources (periodic resync,
//! informer change events, leaf recheck pulses) into a single logical queue
//! key: however many triggers fire while a sync is running, at most one
//! further activation is pending. Failed activations requeue themselves with
//! capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cabundle::CaBundleConfigMap;
use crate::error::Error;
use crate::signer::RotatedSigningCaSecret;
use crate::store::{EventRecorder, Informer, StatusReporter};
use crate::target::RotatedTargetSecret;
use crate::{Result, DEFAULT_RESYNC_INTERVAL};

/// First requeue delay after a failed activation
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Requeue delay ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Reconciler for one signer / bundle / leaves triple.
///
/// Multiple controllers may share the signer and bundle specs (with their
/// own leaves); they coordinate through the store's optimistic concurrency
/// alone.
pub struct CertRotationController {
    name: String,
    signer: RotatedSigningCaSecret,
    ca_bundle: CaBundleConfigMap,
    targets: Vec<RotatedTargetSecret>,
    event_recorder: Arc<dyn EventRecorder>,
    status_reporter: Arc<dyn StatusReporter>,
    informers: Vec<Arc<dyn Informer>>,
    resync_interval: Duration,
}

impl CertRotationController {
    /// Create a controller, validating every rotator spec.
    ///
    /// Invalid specs are configuration errors: they are reported once here
    /// rather than on every activation.
    pub fn new(
        name: impl Into<String>,
        signer: RotatedSigningCaSecret,
        ca_bundle: CaBundleConfigMap,
        targets: Vec<RotatedTargetSecret>,
        event_recorder: Arc<dyn EventRecorder>,
        status_reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        signer.validate()?;
        ca_bundle.validate()?;
        for target in &targets {
            target.validate()?;
        }
        Ok(Self {
            name: name.into(),
            signer,
            ca_bundle,
            targets,
            event_recorder,
            status_reporter,
            informers: Vec::new(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        })
    }

    /// Register the informers whose change events should trigger syncs.
    ///
    /// `run` waits for each to report synced before the first activation.
    pub fn with_informers(mut self, informers: Vec<Arc<dyn Informer>>) -> Self {
        self.informers = informers;
        self
    }

    /// Override the periodic resync interval
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// The controller's name, used in status reports and events
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One idempotent activation: signer, then bundle, then every leaf.
    ///
    /// The outcome is handed to the status reporter before it is returned.
    #[instrument(skip(self), fields(controller = %self.name))]
    pub async fn sync(&self) -> Result<()> {
        let result = self.sync_artifacts().await;
        if let Err(err) = self.status_reporter.report(&self.name, &result).await {
            warn!(error = %err, "status report failed");
        }
        result
    }

    async fn sync_artifacts(&self) -> Result<()> {
        let (signing_ca, previous) = self.signer.ensure_signing_ca().await?;
        let bundle = self
            .ca_bundle
            .ensure_ca_bundle(&signing_ca, previous.as_ref())
            .await?;

        let mut errors = Vec::new();
        for target in &self.targets {
            if let Err(err) = target.ensure_target_cert(&signing_ca, &bundle).await {
                warn!(
                    secret = %format_args!("{}/{}", target.namespace, target.name),
                    error = %err,
                    "target certificate sync failed"
                );
                errors.push(err);
            }
        }
        Error::aggregate(errors)
    }

    /// Run the dispatch loop until the token is cancelled.
    ///
    /// A single worker drains the coalescing queue, so no two activations of
    /// this controller ever overlap. Returns only after the in-flight
    /// activation finished and every spawned subscriber task has exited.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(controller = %self.name, "starting certificate rotation controller");

        for informer in &self.informers {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                synced = informer.wait_synced() => {
                    if !synced {
                        warn!(controller = %self.name, "informer cache failed to sync, not starting");
                        return;
                    }
                }
            }
        }

        let notify = Arc::new(Notify::new());
        let mut forwarders: JoinSet<()> = JoinSet::new();

        for informer in &self.informers {
            let mut events = informer.subscribe();
            let notify = notify.clone();
            let shutdown = shutdown.clone();
            forwarders.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(()) => notify.notify_one(),
                            // Missed pulses still mean "something changed".
                            Err(broadcast::error::RecvError::Lagged(_)) => notify.notify_one(),
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        for target in &self.targets {
            let Some(mut recheck) = target.cert_creator.recheck_channel() else {
                continue;
            };
            let notify = notify.clone();
            let shutdown = shutdown.clone();
            let target_name = format!("{}/{}", target.namespace, target.name);
            forwarders.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = recheck.changed() => match changed {
                            Ok(()) => {
                                debug!(secret = %target_name, "recheck pulse");
                                notify.notify_one();
                            }
                            // Sender dropped: this leaf no longer has a
                            // recheck source.
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        let mut interval = tokio::time::interval(self.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = notify.notified() => {}
            }

            match self.sync().await {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(err) => {
                    warn!(controller = %self.name, error = %err, "sync failed");
                    self.event_recorder
                        .event("CertRotationError", &format!("{}: {err}", self.name));
                    if !err.is_retryable() {
                        // A spec problem: wait for an external change
                        // instead of spinning on it.
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                    notify.notify_one();
                }
            }
        }

        forwarders.shutdown().await;
        info!(controller = %self.name, "certificate rotation controller shut down");
    }
}
