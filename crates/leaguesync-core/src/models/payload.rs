//! Payload shapes checked when a mutation is queued.
//!
//! Payloads travel through the queue as JSON so any table can be synced
//! generically, but each (table, operation) pair is checked against a typed shape
//! before it is accepted. A payload that would be rejected by the backend for a
//! structural reason never enters the queue.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{ChallengeStatus, OperationKind, Table};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{table} payload must be a JSON object")]
    NotAnObject { table: Table },

    #[error("{table}:{operation} payload requires an id")]
    MissingId {
        table: Table,
        operation: OperationKind,
    },

    #[error("{table}:{operation} payload is malformed: {reason}")]
    Shape {
        table: Table,
        operation: OperationKind,
        reason: String,
    },

    #[error("{table}:{operation} field `{field}` is invalid: {reason}")]
    InvalidField {
        table: Table,
        operation: OperationKind,
        field: &'static str,
        reason: String,
    },
}

#[derive(Deserialize)]
struct ProfileRow {
    #[allow(dead_code)]
    id: String,
}

#[derive(Deserialize)]
struct ChallengeInsert {
    challenger_id: String,
    challenged_id: String,
}

#[derive(Deserialize)]
struct ChallengeChange {
    #[allow(dead_code)]
    #[serde(default)]
    status: Option<ChallengeStatus>,
}

#[derive(Deserialize)]
struct MatchInsert {
    #[allow(dead_code)]
    challenge_id: String,
}

#[derive(Deserialize)]
struct ActivityInsert {
    #[allow(dead_code)]
    user_id: String,
    activity_type: String,
}

#[derive(Deserialize)]
struct NotificationInsert {
    #[allow(dead_code)]
    user_id: String,
}

#[derive(Deserialize)]
struct PaymentInsert {
    #[allow(dead_code)]
    user_id: String,
    amount_cents: i64,
}

/// Extract the row id from a payload. Accepts string or integer ids.
pub fn record_id(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Check `data` against the shape required for `table:operation`.
pub fn validate_payload(
    table: Table,
    operation: OperationKind,
    data: &Value,
) -> Result<(), ValidationError> {
    if !data.is_object() {
        return Err(ValidationError::NotAnObject { table });
    }
    if operation.requires_id() && record_id(data).is_none() {
        return Err(ValidationError::MissingId { table, operation });
    }

    use OperationKind::*;
    match (table, operation) {
        (Table::Profiles, Insert | Upsert) => {
            shape::<ProfileRow>(table, operation, data)?;
        }
        (Table::Challenges, Insert) => {
            let c: ChallengeInsert = shape(table, operation, data)?;
            if c.challenger_id == c.challenged_id {
                return Err(ValidationError::InvalidField {
                    table,
                    operation,
                    field: "challenged_id",
                    reason: "a player cannot challenge themselves".to_string(),
                });
            }
        }
        (Table::Challenges, Update | Upsert) => {
            shape::<ChallengeChange>(table, operation, data)?;
        }
        (Table::Matches, Insert | Upsert) => {
            shape::<MatchInsert>(table, operation, data)?;
        }
        (Table::Activities, Insert | Upsert) => {
            let a: ActivityInsert = shape(table, operation, data)?;
            if a.activity_type.trim().is_empty() {
                return Err(ValidationError::InvalidField {
                    table,
                    operation,
                    field: "activity_type",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        (Table::Notifications, Insert | Upsert) => {
            shape::<NotificationInsert>(table, operation, data)?;
        }
        (Table::Payments, Insert | Upsert) => {
            let p: PaymentInsert = shape(table, operation, data)?;
            if p.amount_cents <= 0 {
                return Err(ValidationError::InvalidField {
                    table,
                    operation,
                    field: "amount_cents",
                    reason: format!("must be positive, got {}", p.amount_cents),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

fn shape<T: DeserializeOwned>(
    table: Table,
    operation: OperationKind,
    data: &Value,
) -> Result<T, ValidationError> {
    T::deserialize(data).map_err(|e| ValidationError::Shape {
        table,
        operation,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_string_and_number() {
        assert_eq!(record_id(&json!({"id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(record_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_non_object_rejected() {
        let err = validate_payload(Table::Profiles, OperationKind::Update, &json!([1, 2]));
        assert_eq!(err, Err(ValidationError::NotAnObject { table: Table::Profiles }));
    }

    #[test]
    fn test_update_and_delete_need_id() {
        for op in [OperationKind::Update, OperationKind::Delete] {
            let err = validate_payload(Table::Activities, op, &json!({"user_id": "u1"}));
            assert!(matches!(err, Err(ValidationError::MissingId { .. })));
        }
        assert!(validate_payload(Table::Activities, OperationKind::Delete, &json!({"id": 7})).is_ok());
    }

    #[test]
    fn test_challenge_insert_shape() {
        let ok = json!({"challenger_id": "a", "challenged_id": "b", "message": "rematch?"});
        assert!(validate_payload(Table::Challenges, OperationKind::Insert, &ok).is_ok());

        let missing = json!({"challenger_id": "a"});
        assert!(matches!(
            validate_payload(Table::Challenges, OperationKind::Insert, &missing),
            Err(ValidationError::Shape { .. })
        ));

        let self_challenge = json!({"challenger_id": "a", "challenged_id": "a"});
        assert!(matches!(
            validate_payload(Table::Challenges, OperationKind::Insert, &self_challenge),
            Err(ValidationError::InvalidField { field: "challenged_id", .. })
        ));
    }

    #[test]
    fn test_challenge_update_status_must_be_known() {
        let ok = json!({"id": "c1", "status": "accepted"});
        assert!(validate_payload(Table::Challenges, OperationKind::Update, &ok).is_ok());

        let bad = json!({"id": "c1", "status": "maybe"});
        assert!(validate_payload(Table::Challenges, OperationKind::Update, &bad).is_err());
    }

    #[test]
    fn test_activity_type_not_blank() {
        let bad = json!({"user_id": "u1", "activity_type": "  "});
        assert!(matches!(
            validate_payload(Table::Activities, OperationKind::Insert, &bad),
            Err(ValidationError::InvalidField { field: "activity_type", .. })
        ));
    }

    #[test]
    fn test_payment_amount_positive() {
        let bad = json!({"user_id": "u1", "amount_cents": 0});
        assert!(validate_payload(Table::Payments, OperationKind::Insert, &bad).is_err());
        let ok = json!({"user_id": "u1", "amount_cents": 2500});
        assert!(validate_payload(Table::Payments, OperationKind::Insert, &ok).is_ok());
    }

    #[test]
    fn test_profile_upsert_needs_id_shape() {
        assert!(validate_payload(Table::Profiles, OperationKind::Upsert, &json!({"display_name": "x"})).is_err());
        assert!(validate_payload(Table::Profiles, OperationKind::Upsert, &json!({"id": "u1"})).is_ok());
    }
}
