//! The sync orchestrator.
//!
//! `SyncService` is the only writer of queue state. It tracks connectivity,
//! drains the queue in batches when online, retries failures with exponential
//! backoff, and invalidates cached reads once a mutation has landed remotely.
//!
//! The queue sits behind one async mutex, so each "read, decide, mutate,
//! persist" step is atomic even on a multi-threaded runtime. The lock is never
//! held across a remote call. A single `is_syncing` flag keeps drains from
//! overlapping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::events::{EventBus, ListenerHandle, SyncEvent};
use super::invalidation;
use super::network::NetworkState;
use crate::cache::{keys, CacheManager};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{OperationKind, Table};
use crate::queue::{AddOutcome, OperationStatus, QueueSummary, SyncOperation, SyncQueue};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::{load_json, save_json, Storage, LAST_SYNC_KEY};

/// Options for `SyncService::queue_operation`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Identifies the user intent for deduplication (usually the row id).
    pub reference_id: Option<String>,
    /// Start a sync right away when online.
    pub immediate: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            reference_id: None,
            immediate: true,
        }
    }
}

impl QueueOptions {
    pub fn with_reference(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: Some(reference_id.into()),
            ..Self::default()
        }
    }

    /// Queue only; leave sending to the next sync.
    pub fn deferred(mut self) -> Self {
        self.immediate = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncReport {
    pub success: bool,
    pub processed: usize,
    pub failed: usize,
}

impl SyncReport {
    /// The sync did not run (offline, or another drain is in flight).
    fn declined() -> Self {
        Self {
            success: false,
            processed: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub queue: QueueSummary,
}

enum Outcome {
    Completed,
    Failed,
}

/// Clears the syncing flag when a drain ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct RetryTimer {
    generation: u64,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncService {
    me: Weak<SyncService>,
    config: SyncConfig,
    queue: Mutex<SyncQueue>,
    cache: Arc<CacheManager>,
    remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    is_online: AtomicBool,
    is_syncing: AtomicBool,
    /// Ids revived while a drain was running; that drain attempts them again.
    readmit: std::sync::Mutex<Vec<String>>,
    retry_timer: std::sync::Mutex<Option<RetryTimer>>,
    retry_generation: AtomicU64,
    auto_sync: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_sync: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl SyncService {
    /// Build the service. Starts offline; the first connectivity report that
    /// says otherwise triggers a drain. Call `initialize` before use.
    pub fn new(
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<CacheManager>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let queue = SyncQueue::new(storage.clone(), clock.clone(), config.retry_budget());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            queue: Mutex::new(queue),
            cache,
            remote,
            storage,
            clock,
            events: EventBus::new(),
            is_online: AtomicBool::new(false),
            is_syncing: AtomicBool::new(false),
            readmit: std::sync::Mutex::new(Vec::new()),
            retry_timer: std::sync::Mutex::new(None),
            retry_generation: AtomicU64::new(0),
            auto_sync: std::sync::Mutex::new(None),
            last_sync: std::sync::Mutex::new(None),
        })
    }

    /// Load persisted queue and cache, and requeue operations a previous process
    /// left mid-flight.
    pub async fn initialize(&self) {
        {
            let mut queue = self.queue.lock().await;
            match queue.load().await {
                Ok(count) => info!(operations = count, "Sync queue loaded"),
                Err(e) => warn!(error = %e, "Failed to load sync queue, starting empty"),
            }
            let recovered = queue.recover_interrupted().await;
            if recovered > 0 {
                warn!(recovered, "Requeued operations interrupted by a previous shutdown");
            }
        }

        let cached = self.cache.load().await;
        debug!(entries = cached, "Cache loaded");

        match load_json::<DateTime<Utc>>(self.storage.as_ref(), LAST_SYNC_KEY).await {
            Ok(last) => *lock(&self.last_sync) = last,
            Err(e) => warn!(error = %e, "Failed to load last sync time"),
        }

        if let Some(interval) = self.config.auto_sync_interval() {
            self.start_auto_sync(interval);
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_sync)
    }

    // ===== Connectivity =====

    /// Apply a connectivity report.
    ///
    /// Only the offline-to-online edge starts a sync, and only when there is
    /// pending work. Repeated "still online" reports do nothing. Going offline
    /// cancels any scheduled retry; reconnecting drains instead.
    pub async fn set_network_status(&self, state: NetworkState) -> Option<JoinHandle<SyncReport>> {
        let was_online = self.is_online.swap(state.is_connected, Ordering::AcqRel);
        match (was_online, state.is_connected) {
            (false, true) => {
                info!(connection = ?state.connection_type, "Connection restored");
                if self.queue.lock().await.has_pending() {
                    return self.spawn_sync();
                }
                None
            }
            (true, false) => {
                info!("Connection lost, deferring writes");
                self.cancel_retry();
                None
            }
            _ => None,
        }
    }

    /// Follow a connectivity feed until it closes or the service is dropped.
    pub fn watch_connectivity(&self, mut rx: watch::Receiver<NetworkState>) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            let mut state = rx.borrow_and_update().clone();
            loop {
                let Some(service) = me.upgrade() else { break };
                service.set_network_status(state).await;
                drop(service);

                if rx.changed().await.is_err() {
                    break;
                }
                state = rx.borrow_and_update().clone();
            }
        })
    }

    // ===== Queueing =====

    /// Queue a local mutation. Validated, deduplicated by reference id, and
    /// persisted before this returns. With `immediate` set and a connection up,
    /// a sync starts in the background.
    pub async fn queue_operation(
        &self,
        table: Table,
        operation: OperationKind,
        data: Value,
        options: QueueOptions,
    ) -> Result<AddOutcome> {
        let outcome = self
            .queue
            .lock()
            .await
            .add(table, operation, data, options.reference_id)
            .await?;

        if !outcome.is_duplicate() && options.immediate && self.is_online() {
            self.spawn_sync();
        }
        Ok(outcome)
    }

    /// Cancel an operation that has not started sending. Returns `false` once it
    /// is `syncing` (its remote effect may already be in flight) or gone.
    pub async fn cancel_operation(&self, id: &str) -> bool {
        let cancelled = self.queue.lock().await.remove_if_pending(id).await;
        if cancelled {
            info!(op_id = id, "Operation cancelled");
        }
        cancelled
    }

    /// Reset every failed operation to pending with a fresh retry budget and,
    /// when online, sync. Returns how many were reset.
    pub async fn retry_failed(&self) -> usize {
        let (ids, reset) = {
            let mut queue = self.queue.lock().await;
            let ids: Vec<String> = queue.get_failed().into_iter().map(|op| op.id).collect();
            (ids, queue.reset_failed().await)
        };
        if reset > 0 {
            info!(reset, "Retrying failed operations");
            if self.is_online() {
                // Queued before trying to sync, so a drain that declines us
                // still picks them up.
                lock(&self.readmit).extend(ids);
                self.sync().await;
            }
        }
        reset
    }

    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        self.queue.lock().await.get_pending()
    }

    pub async fn failed_operations(&self) -> Vec<SyncOperation> {
        self.queue.lock().await.get_failed()
    }

    pub async fn operation(&self, id: &str) -> Option<SyncOperation> {
        self.queue.lock().await.get(id).cloned()
    }

    pub async fn has_pending(&self) -> bool {
        self.queue.lock().await.has_pending()
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            last_sync_at: self.last_sync_at(),
            queue: self.queue.lock().await.summary(),
        }
    }

    // ===== Events =====

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    // ===== Draining =====

    fn spawn_sync(&self) -> Option<JoinHandle<SyncReport>> {
        let service = self.me.upgrade()?;
        Some(tokio::spawn(async move { service.sync().await }))
    }

    /// Drain the queue against the remote store.
    ///
    /// Declines (reporting `success: false`) when offline or when another drain
    /// is already running. Remote failures never escape: they are recorded on
    /// the operation and reported through events and the `failed` count.
    pub async fn sync(&self) -> SyncReport {
        if !self.is_online() {
            debug!("Offline, sync deferred");
            return SyncReport::declined();
        }
        let Some(guard) = SyncGuard::acquire(&self.is_syncing) else {
            debug!("Sync already in progress");
            return SyncReport::declined();
        };
        // A fresh drain attempts everything anyway.
        lock(&self.readmit).clear();

        let pending = self.queue.lock().await.summary().pending;
        info!(pending, "Sync started");
        self.events.emit(SyncEvent::SyncStart { pending });

        let batch_size = self.config.batch_size.max(1);
        let mut processed = 0;
        let mut failed = 0;
        // Each operation gets one attempt per drain; later attempts belong to
        // the backoff timer.
        let mut attempted: HashSet<String> = HashSet::new();

        'drain: loop {
            for id in lock(&self.readmit).drain(..) {
                attempted.remove(&id);
            }
            let batch = self
                .queue
                .lock()
                .await
                .next_batch_excluding(batch_size, &attempted);
            if batch.is_empty() {
                break;
            }

            for op in &batch {
                if !self.is_online() {
                    info!("Connection lost mid-sync, stopping");
                    break 'drain;
                }
                attempted.insert(op.id.clone());
                match self.process_operation(op).await {
                    Ok(Outcome::Completed) => processed += 1,
                    Ok(Outcome::Failed) => failed += 1,
                    // Cancelled after this batch was read.
                    Err(Error::OperationNotFound(_)) => {
                        debug!(op_id = %op.id, "Operation gone before sending, skipped");
                    }
                    Err(e) => {
                        warn!(op_id = %op.id, error = %e, "Skipped operation");
                        self.events.emit(SyncEvent::SyncError {
                            message: e.to_string(),
                        });
                    }
                }
            }

            if batch.len() == batch_size {
                tokio::time::sleep(self.config.batch_delay()).await;
            }
        }

        self.queue.lock().await.clear_completed().await;
        self.record_sync_time().await;

        info!(processed, failed, "Sync finished");
        self.events.emit(SyncEvent::SyncComplete { processed, failed });

        drop(guard);
        // Revived between our last batch and releasing the flag.
        if !lock(&self.readmit).is_empty() && self.is_online() {
            self.spawn_sync();
        }
        SyncReport {
            success: true,
            processed,
            failed,
        }
    }

    async fn process_operation(&self, op: &SyncOperation) -> Result<Outcome> {
        self.queue
            .lock()
            .await
            .update_status(&op.id, OperationStatus::Syncing, None)
            .await?;

        match self.execute(op).await {
            Ok(row) => {
                self.queue
                    .lock()
                    .await
                    .update_status(&op.id, OperationStatus::Completed, None)
                    .await?;
                self.refresh_cache(op, row).await;
                debug!(op_id = %op.id, label = %op.label(), "Operation synced");
                self.events.emit(SyncEvent::OperationComplete {
                    id: op.id.clone(),
                    table: op.table,
                    operation: op.operation,
                });
                Ok(Outcome::Completed)
            }
            Err(e) => self.handle_failure(op, e).await,
        }
    }

    /// Run the remote call for `op`. Returns the stored row when the backend
    /// echoes one.
    async fn execute(&self, op: &SyncOperation) -> std::result::Result<Option<Value>, RemoteError> {
        let require_id = || {
            op.record_id().ok_or_else(|| {
                RemoteError::InvalidRequest(format!("{} payload has no id", op.label()))
            })
        };

        match op.operation {
            OperationKind::Insert => self.remote.insert(op.table, &op.data).await.map(Some),
            OperationKind::Update => {
                let id = require_id()?;
                self.remote.update(op.table, &id, &op.data).await.map(Some)
            }
            OperationKind::Delete => {
                let id = require_id()?;
                self.remote.delete(op.table, &id).await.map(|_| None)
            }
            OperationKind::Upsert => self.remote.upsert(op.table, &op.data).await.map(Some),
        }
    }

    /// Invalidate what `op` affected, then cache the row the backend returned.
    async fn refresh_cache(&self, op: &SyncOperation, row: Option<Value>) {
        let removed = self
            .cache
            .invalidate_all(invalidation::patterns_for(op))
            .await;
        debug!(op_id = %op.id, removed, "Invalidated cache after sync");

        let Some(row) = row else { return };
        let Some(id) = crate::models::record_id(&row) else {
            return;
        };
        if let Err(e) = self.cache.set(&keys::entity(op.table, &id), &row, None).await {
            debug!(op_id = %op.id, error = %e, "Failed to cache synced row");
        }
    }

    async fn handle_failure(&self, op: &SyncOperation, err: RemoteError) -> Result<Outcome> {
        let message = err.to_string();
        let fail_fast = self.config.fail_fast_on_permanent && err.is_permanent();

        let (will_retry, retry_count) = {
            let mut queue = self.queue.lock().await;
            let will_retry = if fail_fast {
                queue
                    .update_status(&op.id, OperationStatus::Failed, Some(message.clone()))
                    .await?;
                false
            } else {
                queue.increment_retry(&op.id, Some(message.clone())).await?
            };
            let retry_count = queue
                .get(&op.id)
                .map(|o| o.retry_count)
                .unwrap_or(op.retry_count);
            (will_retry, retry_count)
        };

        warn!(
            op_id = %op.id,
            label = %op.label(),
            retry_count,
            will_retry,
            error = %message,
            "Operation failed"
        );

        if will_retry {
            self.schedule_retry(self.config.retry_delay(op.retry_count));
        }

        self.events.emit(SyncEvent::OperationFailed {
            id: op.id.clone(),
            table: op.table,
            operation: op.operation,
            error: message,
            retry_count,
            will_retry,
        });
        Ok(Outcome::Failed)
    }

    async fn record_sync_time(&self) {
        let now = self.clock.now();
        *lock(&self.last_sync) = Some(now);
        if let Err(e) = save_json(self.storage.as_ref(), LAST_SYNC_KEY, &now).await {
            warn!(error = %e, "Failed to persist last sync time");
        }
    }

    // ===== Timers =====

    /// Schedule one deferred sync after `delay`, replacing any earlier timer.
    fn schedule_retry(&self, delay: Duration) {
        let generation = self.retry_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(service) = me.upgrade() else { return };
            service.clear_retry_timer(generation);
            if service.is_syncing() {
                debug!("Sync in progress, deferring retry");
                service.schedule_retry(delay);
                return;
            }
            debug!("Retry timer fired");
            service.sync().await;
        });

        debug!(delay_ms = delay.as_millis() as u64, "Retry scheduled");
        if let Some(previous) = lock(&self.retry_timer).replace(RetryTimer { generation, task }) {
            previous.task.abort();
        }
    }

    /// Forget the timer slot if it still holds `generation` (the task that is
    /// now running), so a later reschedule does not abort it.
    fn clear_retry_timer(&self, generation: u64) {
        let mut slot = lock(&self.retry_timer);
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            *slot = None;
        }
    }

    fn cancel_retry(&self) {
        if let Some(timer) = lock(&self.retry_timer).take() {
            timer.task.abort();
            debug!("Retry timer cancelled");
        }
    }

    pub fn has_retry_scheduled(&self) -> bool {
        lock(&self.retry_timer)
            .as_ref()
            .is_some_and(|t| !t.task.is_finished())
    }

    /// Sync every `interval` while online and there is pending work.
    pub fn start_auto_sync(&self, interval: Duration) {
        if interval.is_zero() {
            warn!("Ignoring zero auto-sync interval");
            return;
        }
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = me.upgrade() else { break };
                if service.is_online() && service.has_pending().await {
                    service.sync().await;
                }
            }
        });
        if let Some(previous) = lock(&self.auto_sync).replace(task) {
            previous.abort();
        }
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = lock(&self.auto_sync).take() {
            task.abort();
        }
    }

    /// Stop background timers. Queued work stays persisted for the next run.
    pub fn shutdown(&self) {
        self.cancel_retry();
        self.stop_auto_sync();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
