//! Shared fixtures: an in-memory remote store with scripted failures, and a
//! fully wired service over in-memory storage and a manual clock.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use leaguesync_core::{
    CacheConfig, CacheManager, ListQuery, ManualClock, MemoryStorage, NetworkState, RemoteError,
    RemoteStore, Storage, SyncConfig, SyncReport, SyncService, Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// A 5xx; retried.
    Transient,
    /// A validation rejection.
    Permanent,
}

impl Failure {
    fn to_error(self) -> RemoteError {
        match self {
            Failure::Transient => RemoteError::ServerError("upstream unavailable".to_string()),
            Failure::Permanent => RemoteError::Rejected("violates check constraint".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub table: Table,
    pub action: &'static str,
    pub id: Option<String>,
}

#[derive(Default)]
struct State {
    rows: HashMap<Table, Vec<Value>>,
    calls: Vec<Call>,
    next_failures: VecDeque<Failure>,
    failing_tables: HashMap<Table, Failure>,
}

/// A remote store that keeps rows in memory.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: Table, row: Value) {
        self.state().rows.entry(table).or_default().push(row);
    }

    /// Insert or replace a row behind the client's back.
    pub fn put(&self, table: Table, row: Value) {
        let id = id_of(&row);
        let mut state = self.state();
        let rows = state.rows.entry(table).or_default();
        rows.retain(|r| id_of(r) != id);
        rows.push(row);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state().rows.get(&table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        self.rows(table).into_iter().find(|r| id_of(r).as_deref() == Some(id))
    }

    /// Fail the next `n` mutation calls, whatever their table.
    pub fn fail_next(&self, n: usize, failure: Failure) {
        let mut state = self.state();
        state.next_failures.extend(std::iter::repeat(failure).take(n));
    }

    /// Fail every mutation on `table` until `heal` is called.
    pub fn fail_table(&self, table: Table, failure: Failure) {
        self.state().failing_tables.insert(table, failure);
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.next_failures.clear();
        state.failing_tables.clear();
    }

    /// Make every call take `latency` of (tokio) time.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !c.action.starts_with("fetch"))
            .collect()
    }

    pub fn fetch_count(&self, table: Table) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.table == table && c.action.starts_with("fetch"))
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn begin_mutation(&self, table: Table, action: &'static str, id: Option<String>) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.calls.push(Call { table, action, id });
        if let Some(failure) = state.next_failures.pop_front() {
            return Err(failure.to_error());
        }
        if let Some(failure) = state.failing_tables.get(&table) {
            return Err(failure.to_error());
        }
        Ok(())
    }
}

fn id_of(row: &Value) -> Option<String> {
    leaguesync_core::models::record_id(row)
}

fn merge(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        self.simulate_latency().await;
        self.begin_mutation(table, "insert", id_of(payload))?;
        let mut row = payload.clone();
        if id_of(&row).is_none() {
            merge(&mut row, &serde_json::json!({ "id": uuid::Uuid::new_v4().to_string() }));
        }
        let mut state = self.state();
        let rows = state.rows.entry(table).or_default();
        if let Some(id) = id_of(&row) {
            if rows.iter().any(|r| id_of(r).as_deref() == Some(id.as_str())) {
                return Err(RemoteError::Conflict(format!("duplicate key {}", id)));
            }
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.simulate_latency().await;
        self.begin_mutation(table, "update", Some(id.to_string()))?;
        let mut state = self.state();
        let rows = state.rows.entry(table).or_default();
        match rows.iter_mut().find(|r| id_of(r).as_deref() == Some(id)) {
            Some(row) => {
                merge(row, payload);
                Ok(row.clone())
            }
            None => Err(RemoteError::NotFound(format!("{} {}", table, id))),
        }
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        self.begin_mutation(table, "delete", Some(id.to_string()))?;
        let mut state = self.state();
        if let Some(rows) = state.rows.get_mut(&table) {
            rows.retain(|r| id_of(r).as_deref() != Some(id));
        }
        Ok(())
    }

    async fn upsert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        self.simulate_latency().await;
        let id = id_of(payload);
        self.begin_mutation(table, "upsert", id.clone())?;
        let mut state = self.state();
        let rows = state.rows.entry(table).or_default();
        match rows.iter_mut().find(|r| id.is_some() && id_of(r) == id) {
            Some(row) => merge(row, payload),
            None => rows.push(payload.clone()),
        }
        Ok(payload.clone())
    }

    async fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Value>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.calls.push(Call {
            table,
            action: "fetch_by_id",
            id: Some(id.to_string()),
        });
        Ok(state
            .rows
            .get(&table)
            .and_then(|rows| rows.iter().find(|r| id_of(r).as_deref() == Some(id)).cloned()))
    }

    async fn fetch_list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.calls.push(Call {
            table,
            action: "fetch_list",
            id: None,
        });
        let rows = state.rows.get(&table).cloned().unwrap_or_default();
        Ok(query.apply(rows))
    }
}

pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<CacheManager>,
    pub service: Arc<SyncService>,
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Defaults spelled out, so tests read against known numbers.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        batch_size: 10,
        batch_delay_ms: 100,
        retry_base_delay_ms: 1_000,
        max_retry_delay_ms: 60_000,
        max_retries: 5,
        fail_fast_on_permanent: false,
        auto_sync_interval_ms: None,
    }
}

pub async fn harness(config: SyncConfig) -> Harness {
    harness_on(Arc::new(MemoryStorage::new()), Arc::new(FakeRemote::new()), config).await
}

/// Wire and initialize a service over existing storage and remote, as after a
/// restart. The service starts offline.
pub async fn harness_on(
    storage: Arc<MemoryStorage>,
    remote: Arc<FakeRemote>,
    config: SyncConfig,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let cache = Arc::new(CacheManager::new(
        storage.clone() as Arc<dyn Storage>,
        clock.clone(),
        CacheConfig::default(),
    ));
    let service = SyncService::new(
        storage.clone(),
        remote.clone(),
        cache.clone(),
        clock.clone(),
        config,
    );
    service.initialize().await;
    Harness {
        storage,
        remote,
        clock,
        cache,
        service,
    }
}

/// Report connectivity and wait for the sync it triggers, if any.
pub async fn go_online(service: &SyncService) -> Option<SyncReport> {
    let handle = service.set_network_status(NetworkState::online()).await?;
    Some(handle.await.unwrap())
}

/// Let spawned tasks run until `done` holds, giving up after a bounded number
/// of rounds.
pub async fn settle<F, Fut>(done: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1_000 {
        if done().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
