use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::types::SessionToken;
use crate::clock::Clock;

pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
/// Ten years. Longer lifetimes are refused at config load.
pub const MAX_TOKEN_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;
pub const BEARER: &str = "Bearer";

#[derive(Clone, Debug)]
pub struct SessionTokenConfig {
    pub signing_key: String,
    pub issuer: String,
    pub ttl_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid session token")]
    InvalidToken,
    #[error("session token expired")]
    TokenExpired,
    #[error("session token signing failed: {0}")]
    Signing(String),
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::Signing(_) => "token_signing_failed",
        }
    }
}

/// Issues and verifies HS256 session tokens. Expiry is checked against the
/// injected clock rather than the wall clock.
#[derive(Clone)]
pub struct SessionTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionTokens {
    pub fn from_config(config: SessionTokenConfig, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.validate_exp = false;
        validation.leeway = 0;
        let ttl = i64::try_from(config.ttl_seconds.max(1))
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self {
            encoding_key: EncodingKey::from_secret(config.signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            validation,
            issuer: config.issuer,
            ttl,
            clock,
        }
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, TokenError> {
        let raw = header_value.ok_or(TokenError::MissingAuthorization)?;
        let Some(token) = raw.trim().strip_prefix("Bearer ") else {
            return Err(TokenError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }

    pub fn issue(&self, account_id: Uuid) -> Result<SessionToken, TokenError> {
        let issued_at = self.clock.now();
        let expires_at = issued_at
            .checked_add_signed(self.ttl)
            .ok_or_else(|| TokenError::Signing("token lifetime out of range".to_string()))?;
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            sub: account_id.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|error| TokenError::Signing(error.to_string()))?;
        Ok(SessionToken {
            access_token,
            token_type: BEARER.to_string(),
            expires_at: truncate_to_seconds(expires_at),
        })
    }

    pub fn verify(&self, token: &str) -> Result<Uuid, TokenError> {
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|decoded| decoded.claims)
            .map_err(map_decode_error)?;
        if self.clock.now().timestamp() >= claims.exp {
            return Err(TokenError::TokenExpired);
        }
        Uuid::parse_str(&claims.sub).map_err(|_| TokenError::InvalidToken)
    }
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> TokenError {
    match error.kind() {
        ErrorKind::ExpiredSignature => TokenError::TokenExpired,
        _ => TokenError::InvalidToken,
    }
}

fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}
