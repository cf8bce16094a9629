use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_postgres::{Client, NoTls};

pub const USERNAME_UNIQUE_CONSTRAINT: &str = "capsule_accounts_username_key";
pub const EMAIL_UNIQUE_CONSTRAINT: &str = "capsule_accounts_email_key";

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS capsule;

CREATE TABLE IF NOT EXISTS capsule.accounts (
    account_id     UUID PRIMARY KEY,
    username       TEXT NOT NULL,
    email          TEXT NOT NULL,
    password_hash  TEXT NOT NULL,
    registered_at  TIMESTAMPTZ NOT NULL,
    CONSTRAINT capsule_accounts_username_key UNIQUE (username),
    CONSTRAINT capsule_accounts_email_key UNIQUE (email)
);

CREATE TABLE IF NOT EXISTS capsule.capsules (
    capsule_id  UUID PRIMARY KEY,
    owner_id    UUID NOT NULL,
    message     TEXT NOT NULL,
    images      TEXT[] NOT NULL DEFAULT '{}',
    open_at     TIMESTAMPTZ NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    notified    BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS capsules_owner_idx
    ON capsule.capsules (owner_id, created_at);

CREATE INDEX IF NOT EXISTS capsules_due_idx
    ON capsule.capsules (open_at)
 WHERE notified = FALSE;
"#;

/// Shared connection. `Client` pipelines concurrent queries, so callers
/// borrow it directly.
#[derive(Clone)]
pub struct CapsuleDb {
    client: Arc<Client>,
}

impl CapsuleDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "capsule postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Applies the idempotent schema. Safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply capsule schema")?;
        tracing::info!("capsule schema applied");
        Ok(())
    }
}
