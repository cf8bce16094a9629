use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use super::service::{CapsuleError, CapsulePolicy, CapsuleService};
use super::store::{self, CapsuleStore, CapsuleStoreError};
use super::types::{
    Capsule, CapsuleFilter, CapsuleUpdate, CreateCapsuleRequest, NewCapsule, UpdateCapsuleRequest,
};
use crate::clock::ManualClock;
use crate::object_store::{self, ObjectStore, ObjectStoreError, StoredFile};

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

struct Harness {
    service: CapsuleService,
    store: Arc<dyn CapsuleStore>,
    clock: Arc<ManualClock>,
}

fn harness_with(
    store: Arc<dyn CapsuleStore>,
    objects: Arc<dyn ObjectStore>,
    policy: CapsulePolicy,
) -> Harness {
    let clock = ManualClock::shared(epoch());
    let service = CapsuleService::new_with_policy(store.clone(), objects, clock.clone(), policy);
    Harness {
        service,
        store,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(store::memory(), object_store::memory(), CapsulePolicy::default())
}

fn request(message: &str, open_at: DateTime<Utc>) -> CreateCapsuleRequest {
    CreateCapsuleRequest {
        message: message.to_string(),
        open_at,
    }
}

/// Counts every call and fails all of them.
#[derive(Default)]
struct FailingCapsuleStore {
    calls: AtomicUsize,
}

impl FailingCapsuleStore {
    fn fail(&self) -> CapsuleStoreError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CapsuleStoreError::Db("connection reset by peer".to_string())
    }
}

#[async_trait]
impl CapsuleStore for FailingCapsuleStore {
    async fn insert_capsule(&self, _capsule: NewCapsule) -> Result<Capsule, CapsuleStoreError> {
        Err(self.fail())
    }

    async fn get_capsule(&self, _capsule_id: Uuid) -> Result<Option<Capsule>, CapsuleStoreError> {
        Err(self.fail())
    }

    async fn get_capsules(
        &self,
        _filter: CapsuleFilter,
    ) -> Result<Vec<Capsule>, CapsuleStoreError> {
        Err(self.fail())
    }

    async fn update_capsule(
        &self,
        _capsule_id: Uuid,
        _update: CapsuleUpdate,
    ) -> Result<bool, CapsuleStoreError> {
        Err(self.fail())
    }

    async fn delete_capsule(&self, _capsule_id: Uuid) -> Result<bool, CapsuleStoreError> {
        Err(self.fail())
    }
}

/// Accepts uploads but refuses every delete.
struct UndeletableObjectStore;

#[async_trait]
impl ObjectStore for UndeletableObjectStore {
    async fn upload(&self, _file: StoredFile) -> Result<(), ObjectStoreError> {
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<StoredFile, ObjectStoreError> {
        Err(ObjectStoreError::NotFound(name.to_string()))
    }

    async fn delete(&self, _name: &str) -> Result<(), ObjectStoreError> {
        Err(ObjectStoreError::Backend("bucket unavailable".to_string()))
    }

    fn driver_name(&self) -> &'static str {
        "undeletable"
    }
}

#[tokio::test]
async fn create_capsule_persists_a_sealed_capsule() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let open_at = h.clock.now_plus(Duration::hours(24) + Duration::seconds(1));

    let capsule = h
        .service
        .create_capsule(owner, request("hello world", open_at))
        .await?;

    assert_eq!(capsule.owner_id, owner);
    assert_eq!(capsule.message, "hello world");
    assert_eq!(capsule.open_at, open_at);
    assert_eq!(capsule.created_at, epoch());
    assert!(capsule.images.is_empty());
    assert!(!capsule.notified);

    let stored = h.store.get_capsule(capsule.id).await?;
    assert_eq!(stored, Some(capsule));
    Ok(())
}

#[tokio::test]
async fn create_capsule_reports_the_specific_validation_error() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let far = h.clock.now_plus(Duration::days(2));

    let cases = [
        (request("hey", far), CapsuleError::ShortMessage),
        (
            request("hello world", h.clock.now_plus(Duration::minutes(-1))),
            CapsuleError::InvalidOpenTime,
        ),
        (request("hello world", epoch()), CapsuleError::InvalidOpenTime),
        (
            request("hello world", h.clock.now_plus(Duration::hours(23))),
            CapsuleError::OpenTimeTooEarly(24),
        ),
    ];
    for (input, expected) in cases {
        let result = h.service.create_capsule(owner, input).await;
        assert_eq!(result, Err(expected));
    }

    assert!(h.service.get_all_capsules(owner).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn message_length_counts_characters_not_bytes() -> Result<()> {
    let h = harness();
    let open_at = h.clock.now_plus(Duration::days(2));
    // Four characters, twelve bytes.
    let short = h
        .service
        .create_capsule(Uuid::new_v4(), request("日本語だ", open_at))
        .await;
    assert_eq!(short, Err(CapsuleError::ShortMessage));

    h.service
        .create_capsule(Uuid::new_v4(), request("日本語です", open_at))
        .await?;
    Ok(())
}

#[tokio::test]
async fn non_owner_is_forbidden_and_missing_capsule_is_not_found() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(2))))
        .await?;

    assert_eq!(
        h.service.get_capsule_by_id(stranger, capsule.id).await,
        Err(CapsuleError::Forbidden)
    );
    assert_eq!(
        h.service
            .update_capsule(
                stranger,
                capsule.id,
                UpdateCapsuleRequest {
                    message: Some("rewritten".to_string()),
                    open_at: None,
                },
            )
            .await,
        Err(CapsuleError::Forbidden)
    );
    assert_eq!(
        h.service.delete_capsule(stranger, capsule.id).await,
        Err(CapsuleError::Forbidden)
    );
    assert_eq!(
        h.service.add_image(stranger, capsule.id, "a.png").await,
        Err(CapsuleError::Forbidden)
    );
    assert_eq!(
        h.service.get_capsule_by_id(owner, Uuid::new_v4()).await,
        Err(CapsuleError::NotFound)
    );

    assert_eq!(h.service.get_capsule_by_id(owner, capsule.id).await?, capsule);
    Ok(())
}

#[tokio::test]
async fn get_all_capsules_only_returns_the_callers_capsules() -> Result<()> {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let open_at = h.clock.now_plus(Duration::days(3));

    let first = h.service.create_capsule(alice, request("first one", open_at)).await?;
    h.clock.advance(Duration::seconds(5));
    let second = h
        .service
        .create_capsule(alice, request("second one", open_at))
        .await?;
    h.service.create_capsule(bob, request("not alice's", open_at)).await?;

    let ids: Vec<Uuid> = h
        .service
        .get_all_capsules(alice)
        .await?
        .into_iter()
        .map(|capsule| capsule.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id]);
    Ok(())
}

#[tokio::test]
async fn empty_update_is_rejected_before_the_store_is_touched() -> Result<()> {
    let failing = Arc::new(FailingCapsuleStore::default());
    let h = harness_with(
        failing.clone(),
        object_store::memory(),
        CapsulePolicy::default(),
    );

    let result = h
        .service
        .update_capsule(Uuid::new_v4(), Uuid::new_v4(), UpdateCapsuleRequest::default())
        .await;

    assert_eq!(result, Err(CapsuleError::EmptyUpdate));
    assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn update_applies_only_the_supplied_fields() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let open_at = h.clock.now_plus(Duration::days(2));
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", open_at))
        .await?;

    h.clock.advance(Duration::minutes(5));
    h.service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: Some("goodbye world".to_string()),
                open_at: None,
            },
        )
        .await?;
    let updated = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(updated.message, "goodbye world");
    assert_eq!(updated.open_at, open_at);

    let later = h.clock.now_plus(Duration::days(10));
    h.service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: None,
                open_at: Some(later),
            },
        )
        .await?;
    let updated = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(updated.message, "goodbye world");
    assert_eq!(updated.open_at, later);
    assert_eq!(updated.created_at, capsule.created_at);
    Ok(())
}

#[tokio::test]
async fn update_revalidates_open_time_against_creation() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(
            owner,
            request(
                "hello world",
                h.clock.now_plus(Duration::hours(24) + Duration::seconds(1)),
            ),
        )
        .await?;

    let too_soon = h
        .service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: None,
                open_at: Some(h.clock.now_plus(Duration::seconds(1))),
            },
        )
        .await;
    assert_eq!(too_soon, Err(CapsuleError::OpenTimeTooEarly(24)));

    let in_the_past = h
        .service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: None,
                open_at: Some(h.clock.now_plus(Duration::seconds(-1))),
            },
        )
        .await;
    assert_eq!(in_the_past, Err(CapsuleError::InvalidOpenTime));

    let short = h
        .service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: Some("hi".to_string()),
                open_at: None,
            },
        )
        .await;
    assert_eq!(short, Err(CapsuleError::ShortMessage));

    let unchanged = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(unchanged, capsule);
    Ok(())
}

#[tokio::test]
async fn update_after_the_edit_window_is_too_late() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(5))))
        .await?;

    h.clock.advance(Duration::minutes(31));
    let result = h
        .service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: Some("too late now".to_string()),
                open_at: None,
            },
        )
        .await;
    assert_eq!(result, Err(CapsuleError::UpdateTooLate(30)));
    Ok(())
}

#[tokio::test]
async fn disabled_edit_window_allows_late_updates() -> Result<()> {
    let h = harness_with(
        store::memory(),
        object_store::memory(),
        CapsulePolicy {
            edit_window: None,
            ..CapsulePolicy::default()
        },
    );
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(5))))
        .await?;

    h.clock.advance(Duration::days(1));
    h.service
        .update_capsule(
            owner,
            capsule.id,
            UpdateCapsuleRequest {
                message: Some("still editable".to_string()),
                open_at: None,
            },
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn images_are_added_once_and_removed() -> Result<()> {
    let h = harness();
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(2))))
        .await?;

    h.service.add_image(owner, capsule.id, "one.png").await?;
    h.service.add_image(owner, capsule.id, "two.jpg").await?;
    h.service.add_image(owner, capsule.id, "one.png").await?;
    let stored = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(stored.images, vec!["one.png".to_string(), "two.jpg".to_string()]);

    h.service.remove_image(owner, capsule.id, "one.png").await?;
    let stored = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(stored.images, vec!["two.jpg".to_string()]);
    Ok(())
}

#[tokio::test]
async fn delete_purges_images_before_the_record() -> Result<()> {
    let objects = object_store::memory();
    let h = harness_with(store::memory(), objects.clone(), CapsulePolicy::default());
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(2))))
        .await?;
    objects
        .upload(StoredFile::new("kept.png", vec![0x89, b'P', b'N', b'G']))
        .await?;
    h.service.add_image(owner, capsule.id, "kept.png").await?;

    h.service.delete_capsule(owner, capsule.id).await?;

    assert!(!objects.contains("kept.png").await);
    assert_eq!(
        h.service.get_capsule_by_id(owner, capsule.id).await,
        Err(CapsuleError::NotFound)
    );
    Ok(())
}

#[tokio::test]
async fn failed_image_deletion_keeps_the_record() -> Result<()> {
    let h = harness_with(
        store::memory(),
        Arc::new(UndeletableObjectStore),
        CapsulePolicy::default(),
    );
    let owner = Uuid::new_v4();
    let capsule = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(2))))
        .await?;
    h.service.add_image(owner, capsule.id, "stuck.jpg").await?;

    let result = h.service.delete_capsule(owner, capsule.id).await;
    assert_eq!(result, Err(CapsuleError::StorageFailure));

    let still_there = h.service.get_capsule_by_id(owner, capsule.id).await?;
    assert_eq!(still_there.images, vec!["stuck.jpg".to_string()]);
    Ok(())
}

#[tokio::test]
async fn store_failures_surface_as_a_generic_db_failure() -> Result<()> {
    let h = harness_with(
        Arc::new(FailingCapsuleStore::default()),
        object_store::memory(),
        CapsulePolicy::default(),
    );
    let owner = Uuid::new_v4();

    let created = h
        .service
        .create_capsule(owner, request("hello world", h.clock.now_plus(Duration::days(2))))
        .await;
    assert_eq!(created, Err(CapsuleError::DbFailure));
    assert_eq!(
        h.service.get_all_capsules(owner).await,
        Err(CapsuleError::DbFailure)
    );

    let error = h
        .service
        .get_capsule_by_id(owner, Uuid::new_v4())
        .await
        .err()
        .unwrap_or(CapsuleError::NotFound);
    assert_eq!(error, CapsuleError::DbFailure);
    assert!(!error.message().contains("connection reset"));
    Ok(())
}

#[tokio::test]
async fn mark_notified_flips_once() -> Result<()> {
    let store = store::memory();
    let capsule = store
        .insert_capsule(NewCapsule {
            owner_id: Uuid::new_v4(),
            message: "hello world".to_string(),
            open_at: epoch(),
            created_at: epoch() - Duration::days(2),
        })
        .await?;

    let due = CapsuleFilter::DueUnnotified { now: epoch() };
    assert_eq!(store.get_capsules(due).await?.len(), 1);

    let mark = CapsuleUpdate::MarkNotified { now: epoch() };
    assert!(store.update_capsule(capsule.id, mark.clone()).await?);
    assert!(!store.update_capsule(capsule.id, mark.clone()).await?);
    assert!(store.get_capsules(due).await?.is_empty());

    assert!(store.delete_capsule(capsule.id).await?);
    assert!(!store.update_capsule(capsule.id, mark).await?);
    Ok(())
}

#[tokio::test]
async fn mark_notified_skips_a_capsule_rescheduled_after_the_scan() -> Result<()> {
    let store = store::memory();
    let capsule = store
        .insert_capsule(NewCapsule {
            owner_id: Uuid::new_v4(),
            message: "hello world".to_string(),
            open_at: epoch(),
            created_at: epoch() - Duration::days(2),
        })
        .await?;
    let scanned_at = epoch();
    assert_eq!(
        store
            .get_capsules(CapsuleFilter::DueUnnotified { now: scanned_at })
            .await?
            .len(),
        1
    );

    let later = epoch() + Duration::days(3);
    assert!(
        store
            .update_capsule(
                capsule.id,
                CapsuleUpdate::Set {
                    message: None,
                    open_at: Some(later),
                },
            )
            .await?
    );

    assert!(
        !store
            .update_capsule(capsule.id, CapsuleUpdate::MarkNotified { now: scanned_at })
            .await?
    );
    let stored = store
        .get_capsule(capsule.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("capsule missing"))?;
    assert!(!stored.notified);
    assert_eq!(
        store
            .get_capsules(CapsuleFilter::DueUnnotified { now: later })
            .await?
            .len(),
        1
    );
    Ok(())
}

trait ClockExt {
    fn now_plus(&self, by: Duration) -> DateTime<Utc>;
}

impl ClockExt for ManualClock {
    fn now_plus(&self, by: Duration) -> DateTime<Utc> {
        crate::clock::Clock::now(self) + by
    }
}
