//! Data models for league entities and queued mutations.
//!
//! - `Table`, `OperationKind`: what a queued mutation targets and does
//! - Payload validation: the shape each (table, operation) pair must have
//! - `Profile`, `Challenge`, `Activity`: rows read through the cache

pub mod activity;
pub mod challenge;
pub mod payload;
pub mod profile;
pub mod table;

pub use activity::{Activity, NewActivity};
pub use challenge::{Challenge, ChallengeStatus, NewChallenge};
pub use payload::{record_id, validate_payload, ValidationError};
pub use profile::{Profile, ProfileUpdate};
pub use table::{OperationKind, Table};
