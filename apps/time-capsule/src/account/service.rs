use std::sync::{Arc, LazyLock};

use regex::Regex;
use uuid::Uuid;

use crate::account::password::PasswordHashing;
use crate::account::store::{AccountStore, AccountStoreError};
use crate::account::token::{SessionTokens, TokenError};
use crate::account::types::{
    Account, AccountFilter, NewAccount, RegisterRequest, SessionToken, UniqueField,
};
use crate::clock::Clock;

// Both patterns are literals; `patterns_compile` in the tests forces them.
#[expect(clippy::expect_used, reason = "literal pattern, checked by tests")]
pub(crate) static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{3,30}$").expect("invalid username pattern"));
#[expect(clippy::expect_used, reason = "literal pattern, checked by tests")]
pub(crate) static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("invalid email pattern")
});

pub const MIN_PASSWORD_CHARS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error(
        "username must be between 3 and 30 characters long and contain only letters and digits"
    )]
    InvalidUsername,
    #[error("use a valid email address")]
    InvalidEmail,
    #[error(
        "password must be at least 8 characters long and include at least one uppercase letter and one digit"
    )]
    InvalidPassword,
    #[error("something went wrong, try again later")]
    PasswordHashFailure,
    #[error("username is already taken")]
    UsernameDuplicate,
    #[error("email is already registered")]
    EmailDuplicate,
    #[error("something went wrong, try again later")]
    DbFailure,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("something went wrong, try again later")]
    TokenCreationFailed,
    #[error("session token expired")]
    TokenExpired,
    #[error("invalid session token")]
    InvalidToken,
    #[error("account not found")]
    NotFound,
}

impl AccountError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUsername => "invalid_username",
            Self::InvalidEmail => "invalid_email",
            Self::InvalidPassword => "invalid_password",
            Self::PasswordHashFailure => "password_hash_failure",
            Self::UsernameDuplicate => "username_duplicate",
            Self::EmailDuplicate => "email_duplicate",
            Self::DbFailure => "db_failure",
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenCreationFailed => "token_creation_failed",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken => "invalid_token",
            Self::NotFound => "not_found",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<TokenError> for AccountError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::TokenExpired => Self::TokenExpired,
            TokenError::Signing(_) => Self::TokenCreationFailed,
            TokenError::MissingAuthorization
            | TokenError::InvalidAuthorizationScheme
            | TokenError::InvalidToken => Self::InvalidToken,
        }
    }
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    passwords: PasswordHashing,
    tokens: SessionTokens,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        passwords: PasswordHashing,
        tokens: SessionTokens,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            passwords,
            tokens,
            clock,
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<Account, AccountError> {
        validate_username(&request.username)?;
        validate_email(&request.email)?;
        validate_password(&request.password)?;

        let passwords = self.passwords.clone();
        let password = request.password;
        let password_hash = tokio::task::spawn_blocking(move || passwords.hash(&password))
            .await
            .map_err(|error| {
                tracing::error!(reason = %error, "password hashing task failed");
                AccountError::PasswordHashFailure
            })?
            .map_err(|error| {
                tracing::error!(reason = %error, "password hashing failed");
                AccountError::PasswordHashFailure
            })?;

        let account = self
            .store
            .insert_account(NewAccount {
                username: request.username,
                email: request.email,
                password_hash,
                registered_at: self.clock.now(),
            })
            .await
            .map_err(|error| match error {
                AccountStoreError::Duplicate(UniqueField::Username) => {
                    AccountError::UsernameDuplicate
                }
                AccountStoreError::Duplicate(UniqueField::Email) => AccountError::EmailDuplicate,
                AccountStoreError::Db(reason) => {
                    tracing::error!(reason = %reason, "register: account insert failed");
                    AccountError::DbFailure
                }
            })?;

        tracing::info!(account_id = %account.id, "account registered");
        Ok(account)
    }

    /// Unknown email and wrong password are indistinguishable to the caller.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionToken, AccountError> {
        let account = self
            .store
            .get_account(AccountFilter::Email(email.to_string()))
            .await
            .map_err(|error| {
                tracing::error!(reason = %error, "authenticate: account lookup failed");
                AccountError::DbFailure
            })?
            .ok_or(AccountError::InvalidCredentials)?;

        let passwords = self.passwords.clone();
        let password = password.to_string();
        let phc = account.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || passwords.verify(&password, &phc))
            .await
            .map_err(|error| {
                tracing::error!(reason = %error, "password verification task failed");
                AccountError::DbFailure
            })?;
        if !verified {
            return Err(AccountError::InvalidCredentials);
        }

        self.tokens.issue(account.id).map_err(|error| {
            tracing::error!(account_id = %account.id, reason = %error, "session token signing failed");
            AccountError::TokenCreationFailed
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Uuid, AccountError> {
        self.tokens.verify(token).map_err(AccountError::from)
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Account, AccountError> {
        self.store
            .get_account(AccountFilter::Id(account_id))
            .await
            .map_err(|error| {
                tracing::error!(account_id = %account_id, reason = %error, "account lookup failed");
                AccountError::DbFailure
            })?
            .ok_or(AccountError::NotFound)
    }
}

fn validate_username(username: &str) -> Result<(), AccountError> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(AccountError::InvalidUsername)
    }
}

fn validate_email(email: &str) -> Result<(), AccountError> {
    if email.len() <= 254 && EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(AccountError::InvalidEmail)
    }
}

fn validate_password(password: &str) -> Result<(), AccountError> {
    let long_enough = password.chars().count() >= MIN_PASSWORD_CHARS;
    let has_upper = password.chars().any(|ch| ch.is_ascii_uppercase());
    let has_digit = password.chars().any(|ch| ch.is_ascii_digit());
    if long_enough && has_upper && has_digit {
        Ok(())
    } else {
        Err(AccountError::InvalidPassword)
    }
}
