//! Which cache entries a completed operation makes stale.
//!
//! Every operation clears its own row and the table's listings. On top of that,
//! each table cascades into the derived caches built from it.

use serde_json::Value;

use crate::cache::keys;
use crate::models::Table;
use crate::queue::SyncOperation;

fn str_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Cache patterns to invalidate once `op` has reached the remote store.
pub fn patterns_for(op: &SyncOperation) -> Vec<String> {
    let mut patterns = Vec::new();
    if let Some(id) = op.record_id() {
        patterns.push(keys::entity(op.table, &id));
    }
    patterns.push(keys::list_pattern(op.table));

    let data = &op.data;
    match op.table {
        Table::Profiles => {
            patterns.push(keys::LEADERBOARD_PATTERN.to_string());
        }
        Table::Challenges => {
            for field in ["challenger_id", "challenged_id"] {
                if let Some(user) = str_field(data, field) {
                    patterns.extend(keys::family(&keys::challenges_for_user(user)));
                }
            }
            // Without participant ids (e.g. a bare status update) we cannot tell
            // whose lists changed.
            if str_field(data, "challenger_id").is_none() && str_field(data, "challenged_id").is_none() {
                patterns.push("challenges:user:*".to_string());
            }
        }
        Table::Matches => {
            // Results move rankings and close out the originating challenge.
            patterns.push(keys::LEADERBOARD_PATTERN.to_string());
            if let Some(challenge) = str_field(data, "challenge_id") {
                patterns.push(keys::entity(Table::Challenges, challenge));
            }
            for field in ["winner_id", "loser_id"] {
                if let Some(user) = str_field(data, field) {
                    patterns.push(keys::entity(Table::Profiles, user));
                    patterns.extend(keys::family(&keys::challenges_for_user(user)));
                }
            }
        }
        Table::Activities => {
            patterns.push(keys::ACTIVITY_FEED_PATTERN.to_string());
            if let Some(user) = str_field(data, "user_id") {
                patterns.extend(keys::family(&keys::activities_for_user(user)));
            }
        }
        Table::Notifications | Table::Payments => {
            if let Some(user) = str_field(data, "user_id") {
                patterns.extend(keys::family(&keys::user_scoped(op.table, user)));
            }
        }
    }

    patterns
}
