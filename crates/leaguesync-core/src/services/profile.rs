use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use super::{decode, decode_rows, read_through, spawn_refresh, store};
use crate::cache::{keys, CacheManager};
use crate::error::{Error, Result};
use crate::models::{OperationKind, Profile, ProfileUpdate, Table};
use crate::queue::AddOutcome;
use crate::remote::{ListQuery, RemoteError, RemoteStore};
use crate::sync::{QueueOptions, SyncService};

/// Player profiles and the leaderboard built from them.
pub struct ProfileService {
    sync: Arc<SyncService>,
    remote: Arc<dyn RemoteStore>,
}

impl ProfileService {
    pub fn new(sync: Arc<SyncService>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { sync, remote }
    }

    fn cache(&self) -> &Arc<CacheManager> {
        self.sync.cache()
    }

    /// `Ok(None)` when the backend has no such profile.
    pub async fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        let remote = self.remote.clone();
        let owned_id = id.to_string();
        let result = read_through(self.cache(), keys::entity(Table::Profiles, id), None, move || {
            fetch_profile(remote, owned_id)
        })
        .await;

        match result {
            Ok(profile) => Ok(Some(profile)),
            Err(Error::Remote(RemoteError::NotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Profiles for `ids`, in the order given. Cached profiles come from one
    /// batched lookup; the rest are fetched concurrently. Ids the backend cannot
    /// resolve are left out.
    pub async fn get_profiles(&self, ids: &[&str]) -> Vec<Profile> {
        let cache = self.cache();
        let hits = cache
            .get_many::<Profile, _, _>(ids.iter().map(|id| keys::entity(Table::Profiles, id)))
            .await;

        let mut misses = Vec::new();
        for id in ids {
            let key = keys::entity(Table::Profiles, id);
            match hits.get(&key) {
                Some(hit) if hit.is_stale => spawn_refresh(
                    cache.clone(),
                    key,
                    None,
                    fetch_profile(self.remote.clone(), id.to_string()),
                ),
                Some(_) => {}
                None => misses.push(*id),
            }
        }

        let fetched = join_all(
            misses
                .iter()
                .map(|id| fetch_profile(self.remote.clone(), id.to_string())),
        )
        .await;

        let mut resolved: HashMap<String, Profile> = hits
            .into_iter()
            .map(|(key, cached)| (key, cached.data))
            .collect();
        for (id, result) in misses.iter().zip(fetched) {
            match result {
                Ok(profile) => {
                    let key = keys::entity(Table::Profiles, id);
                    store(cache, &key, &profile, None).await;
                    resolved.insert(key, profile);
                }
                Err(RemoteError::NotFound(_)) => debug!(user_id = %id, "Profile not found"),
                Err(e) => warn!(user_id = %id, error = %e, "Failed to fetch profile"),
            }
        }

        ids.iter()
            .filter_map(|id| resolved.remove(&keys::entity(Table::Profiles, id)))
            .collect()
    }

    /// Queue a profile edit and show it locally right away, unless an unsent
    /// edit of the same profile already claimed the queue slot.
    pub async fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<AddOutcome> {
        let mut payload = serde_json::to_value(update)?;
        if let Value::Object(ref mut fields) = payload {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }

        let outcome = self
            .sync
            .queue_operation(
                Table::Profiles,
                OperationKind::Update,
                payload,
                QueueOptions::with_reference(id),
            )
            .await?;

        // A discarded duplicate is never sent, so it must not show either.
        if outcome.is_duplicate() {
            return Ok(outcome);
        }
        let key = keys::entity(Table::Profiles, id);
        if let Some(cached) = self.cache().get::<Profile>(&key).await {
            let mut profile = cached.data;
            profile.apply(update);
            profile.updated_at = Some(self.sync.clock().now());
            store(self.cache(), &key, &profile, None).await;
        }
        Ok(outcome)
    }

    /// Top `limit` players by ranking position. Unranked players sort last.
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<Profile>> {
        let remote = self.remote.clone();
        read_through(self.cache(), keys::leaderboard(limit), None, move || async move {
            let query = ListQuery::new()
                .order_by("ranking_position", true)
                .limit(limit);
            decode_rows(remote.fetch_list(Table::Profiles, &query).await?)
        })
        .await
    }
}

async fn fetch_profile(
    remote: Arc<dyn RemoteStore>,
    id: String,
) -> std::result::Result<Profile, RemoteError> {
    match remote.fetch_by_id(Table::Profiles, &id).await? {
        Some(row) => decode(row),
        None => Err(RemoteError::NotFound(format!("profile {}", id))),
    }
}
