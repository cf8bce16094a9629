use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::capsule::types::{Capsule, CapsuleFilter, CapsuleUpdate, NewCapsule};
use crate::db::CapsuleDb;

#[derive(Debug, thiserror::Error)]
pub enum CapsuleStoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Record store contract for capsules.
///
/// Every method touches at most one record and is atomic on its own; callers
/// never hold a lock across calls.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    async fn insert_capsule(&self, capsule: NewCapsule) -> Result<Capsule, CapsuleStoreError>;

    async fn get_capsule(&self, capsule_id: Uuid) -> Result<Option<Capsule>, CapsuleStoreError>;

    async fn get_capsules(&self, filter: CapsuleFilter)
    -> Result<Vec<Capsule>, CapsuleStoreError>;

    /// Returns `false` when no record matched (missing id, or a
    /// `MarkNotified` against a capsule that is already notified or no
    /// longer due).
    async fn update_capsule(
        &self,
        capsule_id: Uuid,
        update: CapsuleUpdate,
    ) -> Result<bool, CapsuleStoreError>;

    async fn delete_capsule(&self, capsule_id: Uuid) -> Result<bool, CapsuleStoreError>;
}

pub fn memory() -> Arc<dyn CapsuleStore> {
    Arc::new(MemoryCapsuleStore::default())
}

pub fn postgres(db: Arc<CapsuleDb>) -> Arc<dyn CapsuleStore> {
    Arc::new(PostgresCapsuleStore { db })
}

#[derive(Default)]
pub struct MemoryCapsuleStore {
    capsules: Mutex<HashMap<Uuid, Capsule>>,
}

#[async_trait]
impl CapsuleStore for MemoryCapsuleStore {
    async fn insert_capsule(&self, capsule: NewCapsule) -> Result<Capsule, CapsuleStoreError> {
        let row = Capsule {
            id: Uuid::new_v4(),
            owner_id: capsule.owner_id,
            message: capsule.message,
            images: Vec::new(),
            open_at: capsule.open_at,
            created_at: capsule.created_at,
            notified: false,
        };
        let mut capsules = self.capsules.lock().await;
        capsules.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_capsule(&self, capsule_id: Uuid) -> Result<Option<Capsule>, CapsuleStoreError> {
        let capsules = self.capsules.lock().await;
        Ok(capsules.get(&capsule_id).cloned())
    }

    async fn get_capsules(
        &self,
        filter: CapsuleFilter,
    ) -> Result<Vec<Capsule>, CapsuleStoreError> {
        let capsules = self.capsules.lock().await;
        let mut out: Vec<Capsule> = capsules
            .values()
            .filter(|capsule| filter.matches(capsule))
            .cloned()
            .collect();
        match filter {
            CapsuleFilter::Owner(_) => {
                out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            }
            CapsuleFilter::DueUnnotified { .. } => {
                out.sort_by(|a, b| a.open_at.cmp(&b.open_at).then(a.id.cmp(&b.id)));
            }
        }
        Ok(out)
    }

    async fn update_capsule(
        &self,
        capsule_id: Uuid,
        update: CapsuleUpdate,
    ) -> Result<bool, CapsuleStoreError> {
        let mut capsules = self.capsules.lock().await;
        let Some(capsule) = capsules.get_mut(&capsule_id) else {
            return Ok(false);
        };
        match update {
            CapsuleUpdate::Set { message, open_at } => {
                if let Some(message) = message {
                    capsule.message = message;
                }
                if let Some(open_at) = open_at {
                    capsule.open_at = open_at;
                }
            }
            CapsuleUpdate::PushImage(key) => {
                if !capsule.has_image(&key) {
                    capsule.images.push(key);
                }
            }
            CapsuleUpdate::PullImage(key) => {
                capsule.images.retain(|image| *image != key);
            }
            CapsuleUpdate::MarkNotified { now } => {
                if capsule.notified || !capsule.is_due(now) {
                    return Ok(false);
                }
                capsule.notified = true;
            }
        }
        Ok(true)
    }

    async fn delete_capsule(&self, capsule_id: Uuid) -> Result<bool, CapsuleStoreError> {
        let mut capsules = self.capsules.lock().await;
        Ok(capsules.remove(&capsule_id).is_some())
    }
}

struct PostgresCapsuleStore {
    db: Arc<CapsuleDb>,
}

const CAPSULE_COLUMNS: &str =
    "capsule_id, owner_id, message, images, open_at, created_at, notified";

#[async_trait]
impl CapsuleStore for PostgresCapsuleStore {
    async fn insert_capsule(&self, capsule: NewCapsule) -> Result<Capsule, CapsuleStoreError> {
        let capsule_id = Uuid::new_v4();
        let client = self.db.client();
        let row = client
            .query_one(
                format!(
                    r#"
                    INSERT INTO capsule.capsules (
                        capsule_id, owner_id, message, images, open_at, created_at, notified
                    ) VALUES ($1, $2, $3, '{{}}', $4, $5, FALSE)
                    RETURNING {CAPSULE_COLUMNS}
                    "#
                )
                .as_str(),
                &[
                    &capsule_id,
                    &capsule.owner_id,
                    &capsule.message,
                    &capsule.open_at,
                    &capsule.created_at,
                ],
            )
            .await
            .map_err(|error| CapsuleStoreError::Db(error.to_string()))?;
        map_capsule_row(&row).map_err(CapsuleStoreError::Db)
    }

    async fn get_capsule(&self, capsule_id: Uuid) -> Result<Option<Capsule>, CapsuleStoreError> {
        let client = self.db.client();
        let row = client
            .query_opt(
                format!(
                    r#"
                    SELECT {CAPSULE_COLUMNS}
                      FROM capsule.capsules
                     WHERE capsule_id = $1
                    "#
                )
                .as_str(),
                &[&capsule_id],
            )
            .await
            .map_err(|error| CapsuleStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_capsule_row)
            .transpose()
            .map_err(CapsuleStoreError::Db)
    }

    async fn get_capsules(
        &self,
        filter: CapsuleFilter,
    ) -> Result<Vec<Capsule>, CapsuleStoreError> {
        let client = self.db.client();
        let rows = match filter {
            CapsuleFilter::Owner(owner_id) => {
                client
                    .query(
                        format!(
                            r#"
                            SELECT {CAPSULE_COLUMNS}
                              FROM capsule.capsules
                             WHERE owner_id = $1
                             ORDER BY created_at ASC, capsule_id ASC
                            "#
                        )
                        .as_str(),
                        &[&owner_id],
                    )
                    .await
            }
            CapsuleFilter::DueUnnotified { now } => {
                client
                    .query(
                        format!(
                            r#"
                            SELECT {CAPSULE_COLUMNS}
                              FROM capsule.capsules
                             WHERE open_at <= $1
                               AND notified = FALSE
                             ORDER BY open_at ASC, capsule_id ASC
                            "#
                        )
                        .as_str(),
                        &[&now],
                    )
                    .await
            }
        }
        .map_err(|error| CapsuleStoreError::Db(error.to_string()))?;

        rows.iter()
            .map(map_capsule_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CapsuleStoreError::Db)
    }

    async fn update_capsule(
        &self,
        capsule_id: Uuid,
        update: CapsuleUpdate,
    ) -> Result<bool, CapsuleStoreError> {
        let client = self.db.client();
        let updated = match update {
            CapsuleUpdate::Set { message, open_at } => {
                client
                    .execute(
                        r#"
                        UPDATE capsule.capsules
                           SET message = COALESCE($2::text, message),
                               open_at = COALESCE($3::timestamptz, open_at)
                         WHERE capsule_id = $1
                        "#,
                        &[&capsule_id, &message, &open_at],
                    )
                    .await
            }
            CapsuleUpdate::PushImage(key) => {
                client
                    .execute(
                        r#"
                        UPDATE capsule.capsules
                           SET images = CASE
                                   WHEN $2::text = ANY(images) THEN images
                                   ELSE array_append(images, $2::text)
                               END
                         WHERE capsule_id = $1
                        "#,
                        &[&capsule_id, &key],
                    )
                    .await
            }
            CapsuleUpdate::PullImage(key) => {
                client
                    .execute(
                        r#"
                        UPDATE capsule.capsules
                           SET images = array_remove(images, $2::text)
                         WHERE capsule_id = $1
                        "#,
                        &[&capsule_id, &key],
                    )
                    .await
            }
            CapsuleUpdate::MarkNotified { now } => {
                client
                    .execute(
                        r#"
                        UPDATE capsule.capsules
                           SET notified = TRUE
                         WHERE capsule_id = $1
                           AND notified = FALSE
                           AND open_at <= $2
                        "#,
                        &[&capsule_id, &now],
                    )
                    .await
            }
        }
        .map_err(|error| CapsuleStoreError::Db(error.to_string()))?;
        Ok(updated > 0)
    }

    async fn delete_capsule(&self, capsule_id: Uuid) -> Result<bool, CapsuleStoreError> {
        let client = self.db.client();
        let deleted = client
            .execute(
                "DELETE FROM capsule.capsules WHERE capsule_id = $1",
                &[&capsule_id],
            )
            .await
            .map_err(|error| CapsuleStoreError::Db(error.to_string()))?;
        Ok(deleted > 0)
    }
}

fn map_capsule_row(row: &Row) -> Result<Capsule, String> {
    Ok(Capsule {
        id: row.try_get("capsule_id").map_err(|e| e.to_string())?,
        owner_id: row.try_get("owner_id").map_err(|e| e.to_string())?,
        message: row.try_get("message").map_err(|e| e.to_string())?,
        images: row.try_get("images").map_err(|e| e.to_string())?,
        open_at: row.try_get("open_at").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        notified: row.try_get("notified").map_err(|e| e.to_string())?,
    })
}
