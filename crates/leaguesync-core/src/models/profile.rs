use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub ranking_position: Option<u32>,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields a player may change on their own profile. `None` leaves a field as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Profile {
    /// Apply a local edit ahead of the server, for optimistic display.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(ref name) = update.display_name {
            self.display_name = name.clone();
        }
        if let Some(ref url) = update.avatar_url {
            self.avatar_url = Some(url.clone());
        }
        if let Some(ref bio) = update.bio {
            self.bio = Some(bio.clone());
        }
    }

    pub fn record_display(&self) -> String {
        format!("{}-{}", self.wins, self.losses)
    }

    pub fn display_rank(&self) -> String {
        match self.ranking_position {
            Some(pos) => format!("#{}", pos),
            None => "Unranked".to_string(),
        }
    }
}
