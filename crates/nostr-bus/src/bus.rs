//! The per-account bus: owns the subscription loop and wires the pipeline,
//! checkpoint, router and profile components together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::events::{dm_filter, unix_timestamp, DirectMessage};
use crate::metrics::{self, BusMetrics, MetricCallback, MetricsSnapshot};
use crate::pipeline::{Admission, EventPipeline, PipelineLimits};
use crate::profile::{
    ImportedProfile, ProfileContent, ProfileImporter, ProfilePublishResult, ProfilePublisher,
};
use crate::router::{RelayRouter, SendReceipt};
use crate::state::{
    compute_since_timestamp, BusState, CheckpointWriter, ProfileState, StateStore,
    WriteErrorCallback, BUS_STATE_VERSION,
};
use crate::transport::{RelayNotice, RelayTransport, SdkTransport};
use crate::Error;

/// Receives every admitted DM. Errors are reported through the error
/// callback and never stop the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: DirectMessage, reply: ReplyHandle) -> Result<(), Error>;
}

/// Called with the error and a short context string.
pub type ErrorCallback = Arc<dyn Fn(&Error, &str) + Send + Sync>;
/// Called with the relay URL when it finishes sending stored events.
pub type EoseCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct BusCallbacks {
    pub on_error: Option<ErrorCallback>,
    pub on_eose: Option<EoseCallback>,
    pub on_metric: Option<MetricCallback>,
}

/// Sends a DM back to the author of the message being handled.
#[derive(Clone)]
pub struct ReplyHandle {
    keys: Keys,
    router: Arc<RelayRouter>,
    to: PublicKey,
}

impl ReplyHandle {
    pub fn recipient(&self) -> PublicKey {
        self.to
    }

    pub async fn send(&self, text: &str) -> Result<SendReceipt, Error> {
        self.router.send_dm(&self.keys, &self.to, text).await
    }
}

struct BusInner {
    account_id: String,
    keys: Keys,
    config: BusConfig,
    transport: Arc<dyn RelayTransport>,
    router: Arc<RelayRouter>,
    pipeline: Mutex<EventPipeline>,
    checkpoint: Arc<CheckpointWriter>,
    handler: Arc<dyn MessageHandler>,
    callbacks: BusCallbacks,
    metrics: BusMetrics,
    deliveries: Mutex<JoinSet<()>>,
}

impl BusInner {
    fn report(&self, err: &Error, context: &str) {
        warn!(account = %self.account_id, context, error = %err, "Nostr bus error");
        if let Some(on_error) = &self.callbacks.on_error {
            on_error(err, context);
        }
    }

    fn handle_notice(self: &Arc<Self>, notice: RelayNotice) {
        match notice {
            RelayNotice::Event { relay, event } => {
                self.metrics.incr_relay(metrics::RELAY_EVENT, &relay);
                self.handle_event(&relay, &event);
            }
            RelayNotice::Eose { relay } => {
                debug!(relay = %relay, "End of stored events");
                self.metrics.incr_relay(metrics::RELAY_EOSE, &relay);
                if let Some(on_eose) = &self.callbacks.on_eose {
                    on_eose(&relay);
                }
            }
            RelayNotice::Closed { relay, reason } => {
                warn!(relay = %relay, reason = %reason, "Relay closed subscription");
                self.metrics.incr_relay(metrics::RELAY_CLOSED, &relay);
            }
        }
    }

    fn handle_event(self: &Arc<Self>, relay: &str, event: &Event) {
        let admission = match self.pipeline.lock() {
            Ok(mut pipeline) => pipeline.admit(event),
            Err(_) => {
                self.report(&Error::MutexPoisoned, "event pipeline");
                return;
            }
        };

        match admission {
            Admission::Deliver(message) => self.deliver(event.id, message),
            Admission::Dropped { reason, error } => {
                debug!(event_id = %event.id, relay = %relay, ?reason, "Dropped event");
                if let Some(err) = error {
                    self.report(&err, &format!("event {}", event.id));
                }
            }
        }
    }

    /// Runs the handler off the subscription loop, then records the
    /// checkpoint whether or not the handler succeeded.
    fn deliver(self: &Arc<Self>, id: EventId, message: DirectMessage) {
        let inner = self.clone();
        let task = async move {
            let created_at = message.created_at;
            let event_id = message.event_id.clone();
            let reply = ReplyHandle {
                keys: inner.keys.clone(),
                router: inner.router.clone(),
                to: message.sender,
            };

            let handler = inner.handler.clone();
            let outcome = tokio::spawn(async move { handler.on_message(message, reply).await }).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => inner.report(&err, &format!("handler for {}", event_id)),
                Err(join) => inner.report(
                    &Error::Handler(join.to_string()),
                    &format!("handler for {}", event_id),
                ),
            }

            inner.checkpoint.record(created_at, &event_id);
            match inner.pipeline.lock() {
                Ok(mut pipeline) => pipeline.complete(&id),
                Err(_) => inner.report(&Error::MutexPoisoned, "event pipeline"),
            }
        };

        match self.deliveries.lock() {
            Ok(mut deliveries) => {
                while deliveries.try_join_next().is_some() {}
                deliveries.spawn(task);
            }
            Err(_) => self.report(&Error::MutexPoisoned, "delivery tasks"),
        }
    }

    /// Wait up to `grace` for running handlers to finish and checkpoint.
    /// Stragglers are detached; the closed checkpoint writes them through.
    async fn drain_deliveries(&self, grace: Duration) {
        let mut deliveries = match self.deliveries.lock() {
            Ok(mut deliveries) => std::mem::take(&mut *deliveries),
            Err(_) => return,
        };
        if deliveries.is_empty() {
            return;
        }

        let pending = deliveries.len();
        let drained = tokio::time::timeout(grace, async {
            while deliveries.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                account = %self.account_id,
                pending = deliveries.len(),
                "Handlers still running after shutdown grace"
            );
            deliveries.detach_all();
        } else {
            debug!(account = %self.account_id, pending, "Drained in-flight handlers");
        }
    }

    /// Resume point for a fresh subscription. Never moves backwards.
    fn resume_since(&self) -> Result<u64, Error> {
        let snapshot = self.checkpoint.snapshot();
        let candidate = compute_since_timestamp(Some(&snapshot), unix_timestamp())
            .saturating_sub(self.config.startup_lookback.as_secs());
        let mut pipeline = self.pipeline.lock().map_err(|_| Error::MutexPoisoned)?;
        let since = pipeline.since().max(candidate);
        pipeline.set_since(since);
        pipeline.prune_seen();
        Ok(since)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let since = match self.pipeline.lock() {
                Ok(pipeline) => pipeline.since(),
                Err(_) => {
                    self.report(&Error::MutexPoisoned, "event pipeline");
                    return;
                }
            };

            match self.transport.subscribe(dm_filter(self.keys.public_key(), since)).await {
                Ok(mut notices) => {
                    attempt = 0;
                    info!(account = %self.account_id, since, "Subscribed to direct messages");
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return;
                                }
                            }
                            notice = notices.recv() => match notice {
                                Some(notice) => self.handle_notice(notice),
                                None => break,
                            },
                        }
                    }
                    warn!(account = %self.account_id, "Subscription stream ended");
                }
                Err(err) => self.report(&err, "subscribe"),
            }

            if !self.config.reconnect.should_retry(attempt) {
                error!(account = %self.account_id, attempt, "Giving up on relay subscription");
                self.report(&Error::NoRelayAvailable, "resubscribe");
                return;
            }
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            attempt += 1;
            self.metrics.incr(metrics::RELAY_RECONNECT);
            info!(account = %self.account_id, attempt, delay_ms = delay.as_millis() as u64, "Resubscribing");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(err) = self.resume_since() {
                self.report(&err, "resubscribe");
                return;
            }
        }
    }
}

pub struct NostrBus;

impl NostrBus {
    /// Connect to the configured relays and start listening.
    pub async fn start(
        config: BusConfig,
        handler: Arc<dyn MessageHandler>,
        callbacks: BusCallbacks,
    ) -> Result<BusHandle, Error> {
        let keys = config.validate()?;
        let transport = SdkTransport::connect(keys, &config.relays).await?;
        Self::start_with_transport(config, Arc::new(transport), handler, callbacks).await
    }

    pub async fn start_with_transport(
        config: BusConfig,
        transport: Arc<dyn RelayTransport>,
        handler: Arc<dyn MessageHandler>,
        callbacks: BusCallbacks,
    ) -> Result<BusHandle, Error> {
        let keys = config.validate()?;
        let bus_metrics = BusMetrics::new(callbacks.on_metric.clone());
        let store = StateStore::new(config.state_dir.clone(), &config.account_id);

        let now = unix_timestamp();
        let previous = store.read_bus_state();
        let since = compute_since_timestamp(previous.as_ref(), now)
            .saturating_sub(config.startup_lookback.as_secs());

        let initial = BusState {
            version: BUS_STATE_VERSION,
            last_processed_at: previous.as_ref().and_then(|s| s.last_processed_at),
            gateway_started_at: Some(now),
            recent_event_ids: previous.map(|s| s.recent_event_ids).unwrap_or_default(),
        };
        if let Err(err) = store.write_bus_state(&initial) {
            bus_metrics.incr(metrics::STATE_WRITE_FAILURE);
            warn!(error = %err, "Failed to write initial bus state");
            if let Some(on_error) = &callbacks.on_error {
                on_error(&err, "initial checkpoint");
            }
        }

        let on_write_error: WriteErrorCallback = {
            let on_error = callbacks.on_error.clone();
            let bus_metrics = bus_metrics.clone();
            Arc::new(move |err: &Error| {
                bus_metrics.incr(metrics::STATE_WRITE_FAILURE);
                if let Some(on_error) = &on_error {
                    on_error(err, "checkpoint");
                }
            })
        };

        let mut pipeline = EventPipeline::new(
            keys.clone(),
            since,
            config.seen.clone(),
            PipelineLimits {
                max_future_skew: config.max_future_skew,
                max_ciphertext_bytes: config.max_ciphertext_bytes,
            },
            bus_metrics.clone(),
        );
        pipeline.seed_seen(&initial.recent_event_ids);

        let checkpoint = CheckpointWriter::spawn(
            store.clone(),
            initial,
            config.checkpoint_debounce,
            Some(on_write_error),
        );
        let router = Arc::new(RelayRouter::new(
            transport.clone(),
            config.circuit_breaker,
            config.send_timeout,
            bus_metrics.clone(),
        ));
        let publisher = ProfilePublisher::new(
            config.account_id.clone(),
            keys.clone(),
            transport.clone(),
            store,
            config.profile_publish_timeout,
            bus_metrics.clone(),
        );
        let importer = ProfileImporter::new(transport.clone(), config.profile_import_timeout);

        info!(
            account = %config.account_id,
            pubkey = %keys.public_key(),
            relays = transport.relays().len(),
            since,
            "Starting nostr bus"
        );

        let inner = Arc::new(BusInner {
            account_id: config.account_id.clone(),
            keys,
            config,
            transport,
            router,
            pipeline: Mutex::new(pipeline),
            checkpoint,
            handler,
            callbacks,
            metrics: bus_metrics,
            deliveries: Mutex::new(JoinSet::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(inner.clone().run(shutdown_rx));

        Ok(BusHandle {
            inner,
            publisher,
            importer,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct BusHandle {
    inner: Arc<BusInner>,
    publisher: ProfilePublisher,
    importer: ProfileImporter,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BusHandle {
    pub fn public_key(&self) -> PublicKey {
        self.inner.keys.public_key()
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resume point of the current subscription.
    pub fn since(&self) -> u64 {
        self.inner
            .pipeline
            .lock()
            .map(|pipeline| pipeline.since())
            .unwrap_or_default()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn router(&self) -> &RelayRouter {
        &self.inner.router
    }

    pub async fn send_dm(&self, to: &PublicKey, text: &str) -> Result<SendReceipt, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.router.send_dm(&self.inner.keys, to, text).await
    }

    pub async fn publish_profile(
        &self,
        profile: &ProfileContent,
    ) -> Result<ProfilePublishResult, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.publisher.publish(profile).await
    }

    pub fn get_profile_state(&self) -> Option<ProfileState> {
        self.publisher.state()
    }

    pub async fn import_profile(&self, author: &PublicKey) -> Result<ImportedProfile, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.importer.import(author).await
    }

    /// Stop the subscription, let running handlers finish, flush the
    /// checkpoint, and disconnect. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                debug!(error = %err, "Subscription task ended abnormally");
            }
        }

        self.inner
            .drain_deliveries(self.inner.config.shutdown_grace)
            .await;
        let flushed = self.inner.checkpoint.close();
        if let Err(err) = &flushed {
            self.inner.metrics.incr(metrics::STATE_WRITE_FAILURE);
            self.inner.report(err, "close checkpoint");
        }
        self.inner.transport.close().await;
        info!(account = %self.inner.account_id, "Nostr bus closed");
        flushed
    }
}
