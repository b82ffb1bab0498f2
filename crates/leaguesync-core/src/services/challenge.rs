use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use super::{decode_rows, read_through, store};
use crate::cache::{keys, CacheManager};
use crate::error::Result;
use crate::models::{Challenge, ChallengeStatus, NewChallenge, OperationKind, Table, ValidationError};
use crate::queue::AddOutcome;
use crate::remote::{ListQuery, RemoteStore};
use crate::sync::{QueueOptions, SyncService};

/// Challenges between players.
pub struct ChallengeService {
    sync: Arc<SyncService>,
    remote: Arc<dyn RemoteStore>,
}

impl ChallengeService {
    pub fn new(sync: Arc<SyncService>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { sync, remote }
    }

    fn cache(&self) -> &Arc<CacheManager> {
        self.sync.cache()
    }

    /// Every challenge `user_id` sent or received, newest first.
    pub async fn challenges_for_user(&self, user_id: &str) -> Result<Vec<Challenge>> {
        let remote = self.remote.clone();
        let user = user_id.to_string();
        read_through(self.cache(), keys::challenges_for_user(user_id), None, move || async move {
            let query = ListQuery::new()
                .any_eq(&[("challenger_id", user.as_str()), ("challenged_id", user.as_str())])
                .order_by("created_at", false);
            decode_rows(remote.fetch_list(Table::Challenges, &query).await?)
        })
        .await
    }

    /// Queue a new challenge. The id is assigned here so the challenge can be
    /// shown (and cached) before the backend has seen it. Repeating the same
    /// challenger/challenged pair while the first is unsent is a duplicate.
    pub async fn create_challenge(&self, new: NewChallenge) -> Result<(AddOutcome, Challenge)> {
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            challenger_id: new.challenger_id,
            challenged_id: new.challenged_id,
            status: ChallengeStatus::Pending,
            message: new.message,
            scheduled_for: new.scheduled_for,
            created_at: Some(self.sync.clock().now()),
        };
        let reference = format!("{}:{}", challenge.challenger_id, challenge.challenged_id);

        let outcome = self
            .sync
            .queue_operation(
                Table::Challenges,
                OperationKind::Insert,
                serde_json::to_value(&challenge)?,
                QueueOptions::with_reference(reference),
            )
            .await?;

        if !outcome.is_duplicate() {
            self.show_locally(&challenge).await;
        }
        Ok((outcome, challenge))
    }

    /// Accept or decline a challenge addressed to the caller.
    pub async fn respond_to_challenge(
        &self,
        challenge: &Challenge,
        response: ChallengeStatus,
    ) -> Result<AddOutcome> {
        if !matches!(response, ChallengeStatus::Accepted | ChallengeStatus::Declined) {
            return Err(ValidationError::InvalidField {
                table: Table::Challenges,
                operation: OperationKind::Update,
                field: "status",
                reason: format!("a response must be accepted or declined, got {:?}", response),
            }
            .into());
        }
        if challenge.status != ChallengeStatus::Pending {
            return Err(ValidationError::InvalidField {
                table: Table::Challenges,
                operation: OperationKind::Update,
                field: "status",
                reason: format!("challenge {} is no longer awaiting a response", challenge.id),
            }
            .into());
        }

        // Participants ride along so the sync can clear both players' lists.
        let payload = json!({
            "id": challenge.id,
            "status": response,
            "challenger_id": challenge.challenger_id,
            "challenged_id": challenge.challenged_id,
        });
        let outcome = self
            .sync
            .queue_operation(
                Table::Challenges,
                OperationKind::Update,
                payload,
                QueueOptions::with_reference(challenge.id.clone()),
            )
            .await?;

        if !outcome.is_duplicate() {
            let mut updated = challenge.clone();
            updated.status = response;
            self.show_locally(&updated).await;
        }
        Ok(outcome)
    }

    /// Withdraw a challenge. It disappears from local listings immediately.
    pub async fn cancel_challenge(&self, challenge: &Challenge) -> Result<AddOutcome> {
        let payload = json!({
            "id": challenge.id,
            "challenger_id": challenge.challenger_id,
            "challenged_id": challenge.challenged_id,
        });
        let outcome = self
            .sync
            .queue_operation(
                Table::Challenges,
                OperationKind::Delete,
                payload,
                QueueOptions::with_reference(challenge.id.clone()),
            )
            .await?;

        let cache = self.cache();
        cache
            .invalidate(&keys::entity(Table::Challenges, &challenge.id))
            .await;
        for user in [&challenge.challenger_id, &challenge.challenged_id] {
            let key = keys::challenges_for_user(user);
            if let Some(cached) = cache.get::<Vec<Challenge>>(&key).await {
                let remaining: Vec<Challenge> = cached
                    .data
                    .into_iter()
                    .filter(|c| c.id != challenge.id)
                    .collect();
                store(cache, &key, &remaining, None).await;
            }
        }
        Ok(outcome)
    }

    /// Put `challenge` into the entity cache and into both players' cached
    /// listings, replacing an older copy if present.
    async fn show_locally(&self, challenge: &Challenge) {
        let cache = self.cache();
        store(cache, &keys::entity(Table::Challenges, &challenge.id), challenge, None).await;

        for user in [&challenge.challenger_id, &challenge.challenged_id] {
            let key = keys::challenges_for_user(user);
            let Some(cached) = cache.get::<Vec<Challenge>>(&key).await else {
                continue;
            };
            let mut list = cached.data;
            match list.iter_mut().find(|c| c.id == challenge.id) {
                Some(existing) => *existing = challenge.clone(),
                None => list.insert(0, challenge.clone()),
            }
            store(cache, &key, &list, None).await;
        }
    }
}
