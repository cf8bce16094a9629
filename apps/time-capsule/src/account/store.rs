use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::account::types::{Account, AccountFilter, NewAccount, UniqueField};
use crate::db::{CapsuleDb, EMAIL_UNIQUE_CONSTRAINT, USERNAME_UNIQUE_CONSTRAINT};

#[derive(Debug, thiserror::Error)]
pub enum AccountStoreError {
    #[error("duplicate {}", .0.as_str())]
    Duplicate(UniqueField),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `Duplicate` naming the colliding column when the username
    /// or email is already registered.
    async fn insert_account(&self, account: NewAccount) -> Result<Account, AccountStoreError>;

    async fn get_account(&self, filter: AccountFilter)
    -> Result<Option<Account>, AccountStoreError>;
}

pub fn memory() -> Arc<dyn AccountStore> {
    Arc::new(MemoryAccountStore::default())
}

pub fn postgres(db: Arc<CapsuleDb>) -> Arc<dyn AccountStore> {
    Arc::new(PostgresAccountStore { db })
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<Vec<Account>>,
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn insert_account(&self, account: NewAccount) -> Result<Account, AccountStoreError> {
        let mut accounts = self.accounts.lock().await;
        if accounts
            .iter()
            .any(|existing| existing.username == account.username)
        {
            return Err(AccountStoreError::Duplicate(UniqueField::Username));
        }
        if accounts.iter().any(|existing| existing.email == account.email) {
            return Err(AccountStoreError::Duplicate(UniqueField::Email));
        }
        let row = Account {
            id: Uuid::new_v4(),
            username: account.username,
            email: account.email,
            password_hash: account.password_hash,
            registered_at: account.registered_at,
        };
        accounts.push(row.clone());
        Ok(row)
    }

    async fn get_account(
        &self,
        filter: AccountFilter,
    ) -> Result<Option<Account>, AccountStoreError> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .iter()
            .find(|account| filter.matches(account))
            .cloned())
    }
}

struct PostgresAccountStore {
    db: Arc<CapsuleDb>,
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn insert_account(&self, account: NewAccount) -> Result<Account, AccountStoreError> {
        let account_id = Uuid::new_v4();
        let client = self.db.client();
        let row = client
            .query_one(
                r#"
                INSERT INTO capsule.accounts (
                    account_id, username, email, password_hash, registered_at
                ) VALUES ($1, $2, $3, $4, $5)
                RETURNING account_id, username, email, password_hash, registered_at
                "#,
                &[
                    &account_id,
                    &account.username,
                    &account.email,
                    &account.password_hash,
                    &account.registered_at,
                ],
            )
            .await
            .map_err(map_insert_error)?;
        map_account_row(&row).map_err(AccountStoreError::Db)
    }

    async fn get_account(
        &self,
        filter: AccountFilter,
    ) -> Result<Option<Account>, AccountStoreError> {
        let client = self.db.client();
        let row = match &filter {
            AccountFilter::Id(account_id) => {
                client
                    .query_opt(
                        r#"
                        SELECT account_id, username, email, password_hash, registered_at
                          FROM capsule.accounts
                         WHERE account_id = $1
                        "#,
                        &[account_id],
                    )
                    .await
            }
            AccountFilter::Email(email) => {
                client
                    .query_opt(
                        r#"
                        SELECT account_id, username, email, password_hash, registered_at
                          FROM capsule.accounts
                         WHERE email = $1
                        "#,
                        &[email],
                    )
                    .await
            }
            AccountFilter::Username(username) => {
                client
                    .query_opt(
                        r#"
                        SELECT account_id, username, email, password_hash, registered_at
                          FROM capsule.accounts
                         WHERE username = $1
                        "#,
                        &[username],
                    )
                    .await
            }
        }
        .map_err(|error| AccountStoreError::Db(error.to_string()))?;

        row.as_ref()
            .map(map_account_row)
            .transpose()
            .map_err(AccountStoreError::Db)
    }
}

/// Unique violations are classified by constraint name, never by message text.
fn map_insert_error(error: tokio_postgres::Error) -> AccountStoreError {
    let Some(db_error) = error.as_db_error() else {
        return AccountStoreError::Db(error.to_string());
    };
    if db_error.code() != &SqlState::UNIQUE_VIOLATION {
        return AccountStoreError::Db(error.to_string());
    }
    match unique_field_for_constraint(db_error.constraint()) {
        Some(field) => AccountStoreError::Duplicate(field),
        None => AccountStoreError::Db(error.to_string()),
    }
}

fn unique_field_for_constraint(constraint: Option<&str>) -> Option<UniqueField> {
    match constraint? {
        USERNAME_UNIQUE_CONSTRAINT => Some(UniqueField::Username),
        EMAIL_UNIQUE_CONSTRAINT => Some(UniqueField::Email),
        _ => None,
    }
}

fn map_account_row(row: &Row) -> Result<Account, String> {
    Ok(Account {
        id: row.try_get("account_id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        password_hash: row.try_get("password_hash").map_err(|e| e.to_string())?,
        registered_at: row.try_get("registered_at").map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::unique_field_for_constraint;
    use crate::account::types::UniqueField;
    use crate::db::{EMAIL_UNIQUE_CONSTRAINT, USERNAME_UNIQUE_CONSTRAINT};

    #[test]
    fn constraint_names_map_to_unique_fields() {
        assert_eq!(
            unique_field_for_constraint(Some(USERNAME_UNIQUE_CONSTRAINT)),
            Some(UniqueField::Username)
        );
        assert_eq!(
            unique_field_for_constraint(Some(EMAIL_UNIQUE_CONSTRAINT)),
            Some(UniqueField::Email)
        );
        assert_eq!(unique_field_for_constraint(Some("accounts_pkey")), None);
        assert_eq!(unique_field_for_constraint(None), None);
    }
}
