use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{record_id, OperationKind, Table};

/// Send order for each `table:operation` pair; lower goes first.
///
/// Profile changes go before the challenges and matches that reference them, and
/// feed entries and notifications trail behind the writes they describe.
const PRIORITIES: &[(&str, u8)] = &[
    ("profiles:insert", 1),
    ("profiles:upsert", 1),
    ("profiles:update", 1),
    ("challenges:insert", 2),
    ("challenges:update", 2),
    ("challenges:upsert", 2),
    ("matches:insert", 3),
    ("matches:update", 3),
    ("matches:upsert", 3),
    ("payments:insert", 3),
    ("activities:insert", 4),
    ("notifications:insert", 5),
    ("notifications:update", 5),
    ("challenges:delete", 6),
    ("activities:delete", 7),
];

/// Priority for pairs missing from the table.
pub const DEFAULT_PRIORITY: u8 = 10;

pub fn priority(table: Table, operation: OperationKind) -> u8 {
    let key = format!("{}:{}", table, operation);
    PRIORITIES
        .iter()
        .find(|(pair, _)| *pair == key)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PRIORITY)
}

/// Lifecycle of a queued operation:
///
/// ```text
/// pending -> syncing -> completed
///                    -> pending   (retry)
///                    -> failed    (retries exhausted)
/// failed  -> pending              (explicit retry-all)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    /// Pending or syncing: the operation's effect has not been settled yet.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Syncing)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Completed)
                | (Syncing, Pending)
                | (Syncing, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub table: Table,
    pub operation: OperationKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl SyncOperation {
    pub fn new(
        table: Table,
        operation: OperationKind,
        data: Value,
        reference_id: Option<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table,
            operation,
            data,
            timestamp: now,
            retry_count: 0,
            max_retries,
            status: OperationStatus::Pending,
            error: None,
            reference_id,
        }
    }

    pub fn priority(&self) -> u8 {
        priority(self.table, self.operation)
    }

    /// Id of the remote row this operation touches, if the payload carries one.
    pub fn record_id(&self) -> Option<String> {
        record_id(&self.data)
    }

    /// Same (table, operation, referenceId) intent. Operations without a
    /// reference id never match anything.
    pub fn same_intent(
        &self,
        table: Table,
        operation: OperationKind,
        reference_id: Option<&str>,
    ) -> bool {
        match (self.reference_id.as_deref(), reference_id) {
            (Some(mine), Some(theirs)) => {
                self.table == table && self.operation == operation && mine == theirs
            }
            _ => false,
        }
    }

    /// Short label for logs and listings: `profiles:update`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.table, self.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_lookup() {
        assert_eq!(priority(Table::Profiles, OperationKind::Update), 1);
        assert_eq!(priority(Table::Activities, OperationKind::Insert), 4);
        assert_eq!(priority(Table::Payments, OperationKind::Delete), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_status_transitions() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Syncing.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_same_intent_requires_reference_id() {
        let now = Utc::now();
        let op = SyncOperation::new(
            Table::Profiles,
            OperationKind::Update,
            json!({"id": "u1"}),
            Some("u1".to_string()),
            5,
            now,
        );
        assert!(op.same_intent(Table::Profiles, OperationKind::Update, Some("u1")));
        assert!(!op.same_intent(Table::Profiles, OperationKind::Delete, Some("u1")));
        assert!(!op.same_intent(Table::Profiles, OperationKind::Update, None));

        let anonymous = SyncOperation::new(
            Table::Activities,
            OperationKind::Insert,
            json!({}),
            None,
            5,
            now,
        );
        assert!(!anonymous.same_intent(Table::Activities, OperationKind::Insert, None));
    }

    #[test]
    fn test_serialized_field_names() {
        let op = SyncOperation::new(
            Table::Challenges,
            OperationKind::Insert,
            json!({"challenger_id": "a", "challenged_id": "b"}),
            Some("a:b".to_string()),
            5,
            Utc::now(),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["table"], "challenges");
        assert_eq!(json["operation"], "insert");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["referenceId"], "a:b");
        assert!(json.get("error").is_none());

        let back: SyncOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
