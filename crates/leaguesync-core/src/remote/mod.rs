//! Remote data store collaborator.
//!
//! The sync service only needs the four mutation calls; entity services also
//! read single rows and filtered listings for cache-aside reads.
//! `RestRemoteStore` talks to a PostgREST-style HTTP backend.

pub mod client;
pub mod error;
pub mod query;

pub use client::RestRemoteStore;
pub use error::RemoteError;
pub use query::ListQuery;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::Table;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a row; returns the stored row.
    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError>;

    /// Patch the row with `id`; returns the updated row.
    async fn update(&self, table: Table, id: &str, payload: &Value) -> Result<Value, RemoteError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;

    /// Create or replace by primary key; returns the stored row.
    async fn upsert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError>;

    async fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Value>, RemoteError>;

    async fn fetch_list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, RemoteError>;
}
