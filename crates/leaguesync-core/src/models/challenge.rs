use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Accepted,
    Declined,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Challenge {
    pub id: String,
    pub challenger_id: String,
    pub challenged_id: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewChallenge {
    pub challenger_id: String,
    pub challenged_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Challenge {
    pub fn involves(&self, user_id: &str) -> bool {
        self.challenger_id == user_id || self.challenged_id == user_id
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&str> {
        if self.challenger_id == user_id {
            Some(&self.challenged_id)
        } else if self.challenged_id == user_id {
            Some(&self.challenger_id)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, ChallengeStatus::Pending | ChallengeStatus::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge() -> Challenge {
        Challenge {
            id: "c1".to_string(),
            challenger_id: "a".to_string(),
            challenged_id: "b".to_string(),
            status: ChallengeStatus::Pending,
            message: None,
            scheduled_for: None,
            created_at: None,
        }
    }

    #[test]
    fn test_opponent_of() {
        let c = challenge();
        assert_eq!(c.opponent_of("a"), Some("b"));
        assert_eq!(c.opponent_of("b"), Some("a"));
        assert_eq!(c.opponent_of("z"), None);
        assert!(c.involves("b"));
    }

    #[test]
    fn test_is_open() {
        let mut c = challenge();
        assert!(c.is_open());
        c.status = ChallengeStatus::Declined;
        assert!(!c.is_open());
    }
}
