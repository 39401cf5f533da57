//! Event dispatch: immediate delivery, durable fallback, and retry sweeps.
//!
//! The dispatcher is the only owner of the pending buffer and the failure
//! store. Every detected batch is attempted once right away; whatever fails is
//! appended to the store and the buffer is cleared. A retry sweep, run on its
//! own timer, re-attempts stored entries in order and rewrites the store with
//! the ones that still fail.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::client::{Deliver, Outcome};
use crate::config::Config;
use crate::event::{Credentials, DeliveryPayload, SensorEvent};
use crate::store::{FailureStore, StoredEntry};

/// Retry sweeps never back off further than 2^MAX_BACKOFF_EXPONENT intervals.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// When to sweep the failure store and when to give up on an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between sweeps while deliveries succeed
    pub interval: Duration,

    /// Upper bound for the backed-off delay
    pub max_backoff: Duration,

    /// Permanent rejections after which an entry is dead-lettered
    pub max_rejected_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.retry_interval,
            max_backoff: config.max_retry_backoff,
            max_rejected_attempts: config.max_rejected_attempts,
        }
    }

    /// Delay before the next sweep after `failed_sweeps` unproductive ones.
    ///
    /// delay = min(interval * 2^failed_sweeps + jitter, max_backoff),
    /// with jitter up to 25% of the exponential part.
    pub fn next_delay(&self, failed_sweeps: u32) -> Duration {
        let base_ms = self.interval.as_millis().min(u64::MAX as u128) as u64;
        let exponential = base_ms.saturating_mul(1u64 << failed_sweeps.min(MAX_BACKOFF_EXPONENT));
        let jitter = if failed_sweeps == 0 {
            0
        } else {
            rand::random::<u64>() % (exponential / 4 + 1)
        };
        let cap_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        Duration::from_millis(exponential.saturating_add(jitter).min(cap_ms.max(base_ms)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to the events of one dispatched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Accepted by the backend on the first attempt
    pub delivered: usize,

    /// Written to the failure store for a later sweep
    pub persisted: usize,

    /// Rejected for good and moved to the dead-letter log
    pub dead_lettered: usize,

    /// Neither delivered nor persisted because the store could not be written
    pub lost: usize,
}

/// What happened during one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries a delivery was attempted for
    pub attempted: usize,

    /// Entries delivered and removed from the store
    pub delivered: usize,

    /// Entries left in the store
    pub remaining: usize,

    /// Entries moved to the dead-letter log
    pub dead_lettered: usize,
}

/// Running totals over the dispatcher's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events_received: u64,
    pub delivered_immediately: u64,
    pub persisted: u64,
    pub lost: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub sweeps: u64,
}

/// Orchestrates delivery of detected events.
pub struct Dispatcher<C: Deliver> {
    client: C,
    credentials: Credentials,
    store: FailureStore,
    pending: EventBuffer,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    failed_sweeps: u32,
    /// Dead-lettered entries still in the failure log after a failed rewrite
    awaiting_removal: HashSet<Uuid>,
    stats: DispatchStats,
}

impl<C: Deliver> Dispatcher<C> {
    pub fn new(
        client: C,
        credentials: Credentials,
        store: FailureStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            credentials,
            store,
            pending: EventBuffer::new(),
            policy,
            shutdown: CancellationToken::new(),
            failed_sweeps: 0,
            awaiting_removal: HashSet::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Abandon in-flight attempts once `token` is cancelled.
    ///
    /// An abandoned attempt counts as failed, so its event is persisted.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Dispatch a single event immediately.
    pub async fn on_event(&mut self, event: SensorEvent) -> DispatchReport {
        self.pending.push(event);
        self.flush_pending().await
    }

    /// Dispatch a full sweep's events, in order.
    pub async fn on_batch(&mut self, events: Vec<SensorEvent>) -> DispatchReport {
        self.pending.extend(events);
        self.flush_pending().await
    }

    /// Attempt every pending event once; persist the failures.
    ///
    /// The pending buffer is empty afterwards whatever the outcome.
    async fn flush_pending(&mut self) -> DispatchReport {
        let batch = self.pending.drain();
        let mut report = DispatchReport::default();
        self.stats.events_received += batch.len() as u64;

        for event in batch {
            let payload = DeliveryPayload::new(&event, &self.credentials);
            let outcome = match self.attempt(&payload).await {
                Some(outcome) => outcome,
                None => Outcome::Unreachable("shutdown in progress".to_string()),
            };

            if outcome.is_success() {
                debug!(sensor_id = %event.sensor_id(), status = %event.status(), "Event delivered");
                report.delivered += 1;
                self.stats.delivered_immediately += 1;
                continue;
            }

            warn!(
                sensor_id = %event.sensor_id(),
                status = %event.status(),
                timestamp = %event.formatted_timestamp(),
                cause = %outcome,
                "Delivery failed, keeping event for retry"
            );

            let mut entry = StoredEntry::new(payload);
            if outcome.is_permanent() {
                entry.rejections = 1;
            }
            self.persist(entry, &mut report);
        }

        report
    }

    /// Persist every pending event without attempting delivery.
    pub fn persist_pending(&mut self) -> DispatchReport {
        let batch = self.pending.drain();
        let mut report = DispatchReport::default();
        self.stats.events_received += batch.len() as u64;

        for event in batch {
            let payload = DeliveryPayload::new(&event, &self.credentials);
            let mut entry = StoredEntry::new(payload);
            entry.attempts = 0;
            self.persist(entry, &mut report);
        }

        report
    }

    /// Queue events and persist them straight away (shutdown path).
    pub fn persist_batch(&mut self, events: Vec<SensorEvent>) -> DispatchReport {
        self.pending.extend(events);
        self.persist_pending()
    }

    fn persist(&mut self, entry: StoredEntry, report: &mut DispatchReport) {
        if entry.rejections >= self.policy.max_rejected_attempts {
            match self.store.dead_letter(&entry) {
                Ok(()) => {
                    error!(
                        entry_id = %entry.entry_id,
                        sensor_id = %entry.payload.sensor_id,
                        "Event rejected by the backend, moved to dead-letter log"
                    );
                    report.dead_lettered += 1;
                    self.stats.dead_lettered += 1;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Dead-letter write failed, keeping entry in failure log");
                }
            }
        }

        let sensor_id = entry.payload.sensor_id;
        let timestamp = entry.payload.event().formatted_timestamp();
        match self.store.append_entry(entry) {
            Ok(entry_id) => {
                debug!(entry_id = %entry_id, sensor_id = %sensor_id, "Event persisted");
                report.persisted += 1;
                self.stats.persisted += 1;
            }
            Err(e) => {
                error!(
                    sensor_id = %sensor_id,
                    timestamp = %timestamp,
                    error = %e,
                    "Failed to persist undelivered event, event lost"
                );
                report.lost += 1;
                self.stats.lost += 1;
            }
        }
    }

    /// Re-attempt every stored entry, oldest first.
    ///
    /// Delivered entries are dropped, entries that keep being rejected are
    /// dead-lettered, and the rest are written back in their original order.
    /// The sweep stops at the first unreachable attempt, leaving the remaining
    /// entries untouched for the next one.
    ///
    /// If the log cannot be rewritten, delivered entries stay in it and are
    /// sent again by a later sweep. Dead-lettered ones are skipped until a
    /// rewrite succeeds.
    pub async fn retry_sweep(&mut self) -> SweepReport {
        let entries = self.store.drain_all();
        let mut report = SweepReport::default();
        self.stats.sweeps += 1;

        if entries.is_empty() {
            self.failed_sweeps = 0;
            return report;
        }

        let total = entries.len();
        let mut survivors = Vec::with_capacity(total);
        let mut entries = entries.into_iter();

        for mut entry in entries.by_ref() {
            if self.awaiting_removal.contains(&entry.entry_id) {
                continue;
            }
            let outcome = match self.attempt(&entry.payload).await {
                Some(outcome) => outcome,
                None => {
                    survivors.push(entry);
                    break;
                }
            };
            report.attempted += 1;

            if outcome.is_success() {
                debug!(entry_id = %entry.entry_id, "Stored event delivered");
                report.delivered += 1;
                continue;
            }

            entry.attempts = entry.attempts.saturating_add(1);
            let unreachable = matches!(outcome, Outcome::Unreachable(_));
            if outcome.is_permanent() {
                entry.rejections = entry.rejections.saturating_add(1);
            }

            if entry.rejections >= self.policy.max_rejected_attempts {
                match self.store.dead_letter(&entry) {
                    Ok(()) => {
                        error!(
                            entry_id = %entry.entry_id,
                            sensor_id = %entry.payload.sensor_id,
                            rejections = entry.rejections,
                            cause = %outcome,
                            "Giving up on event, moved to dead-letter log"
                        );
                        report.dead_lettered += 1;
                        self.awaiting_removal.insert(entry.entry_id);
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Dead-letter write failed, keeping entry");
                    }
                }
            } else {
                warn!(
                    entry_id = %entry.entry_id,
                    sensor_id = %entry.payload.sensor_id,
                    attempts = entry.attempts,
                    cause = %outcome,
                    "Retry failed"
                );
            }

            survivors.push(entry);
            if unreachable {
                break;
            }
        }
        survivors.extend(entries);

        report.remaining = survivors.len();
        match self.store.replace_all(survivors) {
            Ok(()) => self.awaiting_removal.clear(),
            Err(e) => {
                error!(error = %e, "Failed to rewrite failure log after retry sweep");
                report.remaining = self.store.len().saturating_sub(self.awaiting_removal.len());
            }
        }

        self.stats.redelivered += report.delivered as u64;
        self.stats.dead_lettered += report.dead_lettered as u64;
        if report.delivered > 0 || report.remaining == 0 {
            self.failed_sweeps = 0;
        } else {
            self.failed_sweeps = self.failed_sweeps.saturating_add(1);
        }

        info!(
            stored = total,
            attempted = report.attempted,
            delivered = report.delivered,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Retry sweep finished"
        );
        report
    }

    /// One delivery attempt, or `None` if shutdown interrupted it.
    async fn attempt(&self, payload: &DeliveryPayload) -> Option<Outcome> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        tokio::select! {
            outcome = self.client.deliver(payload) => Some(outcome),
            _ = self.shutdown.cancelled() => None,
        }
    }

    /// Delay until the next retry sweep.
    pub fn next_sweep_delay(&self) -> Duration {
        self.policy.next_delay(self.failed_sweeps)
    }

    pub fn store(&self) -> &FailureStore {
        &self.store
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

/// Drive a dispatcher from a channel of event batches.
///
/// Runs a recovery sweep first, then dispatches batches as they arrive and
/// sweeps the failure store on the policy's schedule. After `token` is
/// cancelled, every batch still arriving is persisted without delivery until
/// the sending side is dropped.
pub async fn dispatcher_task<C: Deliver>(
    mut dispatcher: Dispatcher<C>,
    mut rx: mpsc::Receiver<Vec<SensorEvent>>,
    token: CancellationToken,
) -> Dispatcher<C> {
    dispatcher = dispatcher.with_cancellation_token(token.clone());

    if !dispatcher.store().is_empty() {
        dispatcher.retry_sweep().await;
    }
    let mut next_sweep = Instant::now() + dispatcher.next_sweep_delay();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Dispatcher stopping");
                break;
            }

            maybe_batch = rx.recv() => match maybe_batch {
                Some(batch) => {
                    let report = dispatcher.on_batch(batch).await;
                    if report.lost > 0 {
                        error!(lost = report.lost, "Events lost in this batch");
                    }
                }
                None => {
                    info!("Event channel closed, dispatcher stopping");
                    break;
                }
            },

            _ = sleep_until(next_sweep) => {
                dispatcher.retry_sweep().await;
                next_sweep = Instant::now() + dispatcher.next_sweep_delay();
            }
        }
    }

    let mut persisted = dispatcher.persist_pending().persisted;
    while let Some(batch) = rx.recv().await {
        persisted += dispatcher.persist_batch(batch).persisted;
    }
    if persisted > 0 {
        info!(persisted = persisted, "Persisted undelivered events for the next run");
    }

    dispatcher
}
