use std::sync::Arc;

use uuid::Uuid;

use super::{decode_rows, read_through, store};
use crate::cache::keys;
use crate::error::Result;
use crate::models::{Activity, NewActivity, OperationKind, Table};
use crate::queue::AddOutcome;
use crate::remote::{ListQuery, RemoteStore};
use crate::sync::{QueueOptions, SyncService};

/// The league activity feed.
pub struct ActivityService {
    sync: Arc<SyncService>,
    remote: Arc<dyn RemoteStore>,
}

impl ActivityService {
    pub fn new(sync: Arc<SyncService>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { sync, remote }
    }

    /// The newest `limit` activities across the league.
    pub async fn feed(&self, limit: usize) -> Result<Vec<Activity>> {
        let remote = self.remote.clone();
        read_through(self.sync.cache(), keys::activity_feed(limit), None, move || async move {
            let query = ListQuery::new().order_by("created_at", false).limit(limit);
            decode_rows(remote.fetch_list(Table::Activities, &query).await?)
        })
        .await
    }

    pub async fn activities_for_user(&self, user_id: &str) -> Result<Vec<Activity>> {
        let remote = self.remote.clone();
        let user = user_id.to_string();
        read_through(self.sync.cache(), keys::activities_for_user(user_id), None, move || async move {
            let query = ListQuery::new()
                .eq("user_id", &user)
                .order_by("created_at", false);
            decode_rows(remote.fetch_list(Table::Activities, &query).await?)
        })
        .await
    }

    /// Queue an activity. Each call is a distinct event, so nothing is deduplicated.
    pub async fn log_activity(&self, new: NewActivity) -> Result<(AddOutcome, Activity)> {
        let activity = Activity {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            activity_type: new.activity_type,
            description: new.description,
            created_at: Some(self.sync.clock().now()),
        };

        let outcome = self
            .sync
            .queue_operation(
                Table::Activities,
                OperationKind::Insert,
                serde_json::to_value(&activity)?,
                QueueOptions::default(),
            )
            .await?;

        store(
            self.sync.cache(),
            &keys::entity(Table::Activities, &activity.id),
            &activity,
            None,
        )
        .await;
        Ok((outcome, activity))
    }
}
