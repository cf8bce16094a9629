use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::capsule::store::{CapsuleStore, CapsuleStoreError};
use crate::capsule::types::{
    Capsule, CapsuleFilter, CapsuleUpdate, CreateCapsuleRequest, NewCapsule, UpdateCapsuleRequest,
};
use crate::clock::{self, Clock};
use crate::object_store::ObjectStore;

pub const MIN_MESSAGE_CHARS: usize = 5;
pub const MIN_LOCK_HOURS: i64 = 24;
pub const DEFAULT_EDIT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapsuleError {
    #[error("message must be at least 5 characters long")]
    ShortMessage,
    #[error("opening time must be in the future")]
    InvalidOpenTime,
    #[error("opening time must be at least {0} hours after creation")]
    OpenTimeTooEarly(i64),
    #[error("no changes to apply")]
    EmptyUpdate,
    #[error("updating the capsule is not allowed more than {0} minutes after creation")]
    UpdateTooLate(i64),
    #[error("not found")]
    NotFound,
    #[error("not allowed")]
    Forbidden,
    #[error("something went wrong, try again later")]
    StorageFailure,
    #[error("something went wrong, try again later")]
    DbFailure,
}

impl CapsuleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ShortMessage => "short_message",
            Self::InvalidOpenTime => "invalid_open_time",
            Self::OpenTimeTooEarly(_) => "open_time_too_early",
            Self::EmptyUpdate => "empty_update",
            Self::UpdateTooLate(_) => "update_too_late",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::StorageFailure => "storage_failure",
            Self::DbFailure => "db_failure",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ShortMessage
                | Self::InvalidOpenTime
                | Self::OpenTimeTooEarly(_)
                | Self::EmptyUpdate
                | Self::UpdateTooLate(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapsulePolicy {
    pub min_message_chars: usize,
    pub min_lock: Duration,
    /// `None` allows updates at any point before the capsule is deleted.
    pub edit_window: Option<Duration>,
}

impl Default for CapsulePolicy {
    fn default() -> Self {
        Self {
            min_message_chars: MIN_MESSAGE_CHARS,
            min_lock: Duration::hours(MIN_LOCK_HOURS),
            edit_window: Some(Duration::minutes(DEFAULT_EDIT_WINDOW_MINUTES)),
        }
    }
}

/// Owns every capsule invariant: creation rules, ownership, the time
/// windows for update, and the image-purge-before-delete ordering.
#[derive(Clone)]
pub struct CapsuleService {
    store: Arc<dyn CapsuleStore>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    policy: CapsulePolicy,
}

impl CapsuleService {
    pub fn new(store: Arc<dyn CapsuleStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self::new_with_policy(store, objects, clock::system(), CapsulePolicy::default())
    }

    pub fn new_with_policy(
        store: Arc<dyn CapsuleStore>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        policy: CapsulePolicy,
    ) -> Self {
        Self {
            store,
            objects,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &CapsulePolicy {
        &self.policy
    }

    pub async fn create_capsule(
        &self,
        owner_id: Uuid,
        request: CreateCapsuleRequest,
    ) -> Result<Capsule, CapsuleError> {
        let now = self.clock.now();
        self.validate_message(&request.message)?;
        self.validate_open_at(request.open_at, now, now)?;

        self.store
            .insert_capsule(NewCapsule {
                owner_id,
                message: request.message,
                open_at: request.open_at,
                created_at: now,
            })
            .await
            .map_err(|error| db_failure("create_capsule", None, error))
    }

    pub async fn get_all_capsules(&self, caller_id: Uuid) -> Result<Vec<Capsule>, CapsuleError> {
        self.store
            .get_capsules(CapsuleFilter::Owner(caller_id))
            .await
            .map_err(|error| db_failure("get_all_capsules", None, error))
    }

    pub async fn get_capsule_by_id(
        &self,
        caller_id: Uuid,
        capsule_id: Uuid,
    ) -> Result<Capsule, CapsuleError> {
        let capsule = self
            .store
            .get_capsule(capsule_id)
            .await
            .map_err(|error| db_failure("get_capsule_by_id", Some(capsule_id), error))?
            .ok_or(CapsuleError::NotFound)?;

        if capsule.owner_id != caller_id {
            tracing::warn!(
                caller_id = %caller_id,
                capsule_id = %capsule_id,
                "capsule access denied to non-owner"
            );
            return Err(CapsuleError::Forbidden);
        }
        Ok(capsule)
    }

    pub async fn update_capsule(
        &self,
        caller_id: Uuid,
        capsule_id: Uuid,
        request: UpdateCapsuleRequest,
    ) -> Result<(), CapsuleError> {
        if request.is_empty() {
            return Err(CapsuleError::EmptyUpdate);
        }

        let capsule = self.get_capsule_by_id(caller_id, capsule_id).await?;
        let now = self.clock.now();

        if let Some(window) = self.policy.edit_window {
            if now - capsule.created_at > window {
                return Err(CapsuleError::UpdateTooLate(window.num_minutes()));
            }
        }
        if let Some(message) = request.message.as_deref() {
            self.validate_message(message)?;
        }
        if let Some(open_at) = request.open_at {
            self.validate_open_at(open_at, now, capsule.created_at)?;
        }

        let matched = self
            .store
            .update_capsule(
                capsule_id,
                CapsuleUpdate::Set {
                    message: request.message,
                    open_at: request.open_at,
                },
            )
            .await
            .map_err(|error| db_failure("update_capsule", Some(capsule_id), error))?;
        if !matched {
            // Deleted between the ownership check and the write.
            return Err(CapsuleError::NotFound);
        }
        Ok(())
    }

    /// Purges every attached image before removing the record. Stops at the
    /// first failed image deletion and leaves the record in place.
    pub async fn delete_capsule(&self, caller_id: Uuid, capsule_id: Uuid) -> Result<(), CapsuleError> {
        let capsule = self.get_capsule_by_id(caller_id, capsule_id).await?;

        for image in &capsule.images {
            if let Err(error) = self.objects.delete(image).await {
                tracing::error!(
                    capsule_id = %capsule_id,
                    image = %image,
                    reason = %error,
                    "delete_capsule: image deletion failed, keeping capsule record"
                );
                return Err(CapsuleError::StorageFailure);
            }
        }

        self.store
            .delete_capsule(capsule_id)
            .await
            .map_err(|error| db_failure("delete_capsule", Some(capsule_id), error))?;
        tracing::info!(
            capsule_id = %capsule_id,
            images = capsule.images.len(),
            "capsule deleted"
        );
        Ok(())
    }

    pub async fn add_image(
        &self,
        caller_id: Uuid,
        capsule_id: Uuid,
        image_key: &str,
    ) -> Result<(), CapsuleError> {
        self.get_capsule_by_id(caller_id, capsule_id).await?;
        self.apply_image_update(
            "add_image",
            capsule_id,
            CapsuleUpdate::PushImage(image_key.to_string()),
        )
        .await
    }

    pub async fn remove_image(
        &self,
        caller_id: Uuid,
        capsule_id: Uuid,
        image_key: &str,
    ) -> Result<(), CapsuleError> {
        self.get_capsule_by_id(caller_id, capsule_id).await?;
        self.apply_image_update(
            "remove_image",
            capsule_id,
            CapsuleUpdate::PullImage(image_key.to_string()),
        )
        .await
    }

    async fn apply_image_update(
        &self,
        operation: &'static str,
        capsule_id: Uuid,
        update: CapsuleUpdate,
    ) -> Result<(), CapsuleError> {
        let matched = self
            .store
            .update_capsule(capsule_id, update)
            .await
            .map_err(|error| db_failure(operation, Some(capsule_id), error))?;
        if matched {
            Ok(())
        } else {
            Err(CapsuleError::NotFound)
        }
    }

    fn validate_message(&self, message: &str) -> Result<(), CapsuleError> {
        if message.chars().count() < self.policy.min_message_chars {
            return Err(CapsuleError::ShortMessage);
        }
        Ok(())
    }

    /// `anchor` is "now" on create and the stored creation time on update.
    fn validate_open_at(
        &self,
        open_at: DateTime<Utc>,
        now: DateTime<Utc>,
        anchor: DateTime<Utc>,
    ) -> Result<(), CapsuleError> {
        if open_at <= now {
            return Err(CapsuleError::InvalidOpenTime);
        }
        if open_at - anchor < self.policy.min_lock {
            return Err(CapsuleError::OpenTimeTooEarly(self.policy.min_lock.num_hours()));
        }
        Ok(())
    }
}

fn db_failure(operation: &str, capsule_id: Option<Uuid>, error: CapsuleStoreError) -> CapsuleError {
    match capsule_id {
        Some(capsule_id) => tracing::error!(
            operation,
            capsule_id = %capsule_id,
            reason = %error,
            "capsule store failure"
        ),
        None => tracing::error!(operation, reason = %error, "capsule store failure"),
    }
    CapsuleError::DbFailure
}
