use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub message: String,
    pub images: Vec<String>,
    pub open_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub notified: bool,
}

impl Capsule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.open_at <= now
    }

    pub fn has_image(&self, key: &str) -> bool {
        self.images.iter().any(|image| image == key)
    }
}

/// Capsule fields before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCapsule {
    pub owner_id: Uuid,
    pub message: String,
    pub open_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCapsuleRequest {
    pub message: String,
    pub open_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCapsuleRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_at: Option<DateTime<Utc>>,
}

impl UpdateCapsuleRequest {
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.open_at.is_none()
    }
}

/// Single-record mutation applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsuleUpdate {
    /// Partial overwrite; `None` fields are left untouched.
    Set {
        message: Option<String>,
        open_at: Option<DateTime<Utc>>,
    },
    PushImage(String),
    PullImage(String),
    /// Conditional false -> true flip of the notified flag. Only applies
    /// while the capsule is still due at `now`.
    MarkNotified { now: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleFilter {
    Owner(Uuid),
    DueUnnotified { now: DateTime<Utc> },
}

impl CapsuleFilter {
    pub fn matches(&self, capsule: &Capsule) -> bool {
        match self {
            Self::Owner(owner_id) => capsule.owner_id == *owner_id,
            Self::DueUnnotified { now } => capsule.is_due(*now) && !capsule.notified,
        }
    }
}
