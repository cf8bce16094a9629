use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
};

use thiserror::Error;

use crate::account::token::{DEFAULT_TOKEN_TTL_SECONDS, MAX_TOKEN_TTL_SECONDS};
use crate::notifier::{DEFAULT_SMTP_PORT, SmtpTls};
use crate::object_store::DEFAULT_OBJECT_STORE_TIMEOUT_MS;
use crate::rate_limit::{DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_PER_SECOND};
use crate::worker::{DEFAULT_WORKER_CONCURRENCY, DEFAULT_WORKER_INTERVAL_MS};

const DEV_JWT_SECRET: &str = "time-capsule-dev-secret";
const DEFAULT_MAIL_FROM: &str = "Time Capsule <no-reply@time-capsule.local>";
pub const DEFAULT_EDIT_WINDOW_SECONDS: u64 = 30 * 60;
pub const MAX_EDIT_WINDOW_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectStoreDriver {
    Memory,
    Fs { root: PathBuf },
    S3 { bucket: String, endpoint: Option<String> },
}

impl ObjectStoreDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fs { .. } => "fs",
            Self::S3 { .. } => "s3",
        }
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub token_ttl_seconds: u64,
    pub object_store: ObjectStoreDriver,
    pub object_store_timeout_ms: u64,
    pub mail_relay_url: Option<String>,
    pub mail_relay_token: Option<String>,
    pub mail_from: String,
    /// SMTP wins over the relay when both are configured.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_tls: SmtpTls,
    pub worker_enabled: bool,
    pub worker_interval_ms: u64,
    pub worker_concurrency: usize,
    /// `None` disables the post-creation edit cutoff.
    pub edit_window_seconds: Option<u64>,
    pub rate_limit_burst: u32,
    pub rate_limit_per_second: u32,
    pub request_timeout_ms: u64,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CAPSULE_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("CAPSULE_JWT_SECRET is required when DB_URL is set")]
    MissingJwtSecret,
    #[error("invalid CAPSULE_TOKEN_TTL_SECONDS: {0}")]
    InvalidTokenTtlSeconds(String),
    #[error("invalid CAPSULE_OBJECT_STORE: {0}")]
    InvalidObjectStore(String),
    #[error("CAPSULE_S3_BUCKET is required when CAPSULE_OBJECT_STORE=s3")]
    MissingS3Bucket,
    #[error("invalid CAPSULE_OBJECT_STORE_TIMEOUT_MS: {0}")]
    InvalidObjectStoreTimeoutMs(String),
    #[error("invalid CAPSULE_SMTP_PORT: {0}")]
    InvalidSmtpPort(String),
    #[error("invalid CAPSULE_SMTP_TLS: {0}")]
    InvalidSmtpTls(String),
    #[error("CAPSULE_SMTP_USERNAME and CAPSULE_SMTP_PASSWORD must be set together")]
    IncompleteSmtpCredentials,
    #[error("invalid CAPSULE_WORKER_ENABLED: {0}")]
    InvalidWorkerEnabled(String),
    #[error("invalid CAPSULE_WORKER_INTERVAL_MS: {0}")]
    InvalidWorkerIntervalMs(String),
    #[error("invalid CAPSULE_WORKER_CONCURRENCY: {0}")]
    InvalidWorkerConcurrency(String),
    #[error("invalid CAPSULE_EDIT_WINDOW_SECONDS: {0}")]
    InvalidEditWindowSeconds(String),
    #[error("invalid CAPSULE_RATE_LIMIT_BURST: {0}")]
    InvalidRateLimitBurst(String),
    #[error("invalid CAPSULE_RATE_LIMIT_PER_SECOND: {0}")]
    InvalidRateLimitPerSecond(String),
    #[error("invalid CAPSULE_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeoutMs(String),
    #[error("invalid CAPSULE_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("CAPSULE_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;
        let service_name =
            env::var("CAPSULE_SERVICE_NAME").unwrap_or_else(|_| "time-capsule".to_string());
        let db_url = non_empty_env("DB_URL").or_else(|| non_empty_env("DATABASE_URL"));

        let jwt_secret = match non_empty_env("CAPSULE_JWT_SECRET") {
            Some(secret) => secret,
            None if db_url.is_some() => return Err(ConfigError::MissingJwtSecret),
            None => DEV_JWT_SECRET.to_string(),
        };
        let jwt_issuer =
            env::var("CAPSULE_JWT_ISSUER").unwrap_or_else(|_| "time-capsule".to_string());
        let token_ttl_seconds = parse_token_ttl_seconds(
            env::var("CAPSULE_TOKEN_TTL_SECONDS")
                .unwrap_or_else(|_| DEFAULT_TOKEN_TTL_SECONDS.to_string())
                .as_str(),
        )?;

        let object_store = parse_object_store_driver(
            env::var("CAPSULE_OBJECT_STORE")
                .unwrap_or_else(|_| "memory".to_string())
                .as_str(),
        )?;
        let object_store_timeout_ms = env::var("CAPSULE_OBJECT_STORE_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_OBJECT_STORE_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidObjectStoreTimeoutMs(error.to_string()))?;

        let mail_relay_url = non_empty_env("CAPSULE_MAIL_RELAY_URL");
        let mail_relay_token = non_empty_env("CAPSULE_MAIL_RELAY_TOKEN");
        let smtp_host = non_empty_env("CAPSULE_SMTP_HOST");
        let smtp_port = env::var("CAPSULE_SMTP_PORT")
            .unwrap_or_else(|_| DEFAULT_SMTP_PORT.to_string())
            .parse::<u16>()
            .map_err(|error| ConfigError::InvalidSmtpPort(error.to_string()))?;
        let smtp_username = non_empty_env("CAPSULE_SMTP_USERNAME");
        let smtp_password = non_empty_env("CAPSULE_SMTP_PASSWORD");
        if smtp_username.is_some() != smtp_password.is_some() {
            return Err(ConfigError::IncompleteSmtpCredentials);
        }
        let smtp_tls = parse_smtp_tls(
            env::var("CAPSULE_SMTP_TLS")
                .unwrap_or_else(|_| "starttls".to_string())
                .as_str(),
        )?;
        // Mail goes out as the SMTP account unless a sender is given.
        let mail_from = non_empty_env("CAPSULE_MAIL_FROM")
            .or_else(|| smtp_username.clone().filter(|username| username.contains('@')))
            .unwrap_or_else(|| DEFAULT_MAIL_FROM.to_string());

        let worker_enabled = parse_bool_env("CAPSULE_WORKER_ENABLED", true)
            .map_err(ConfigError::InvalidWorkerEnabled)?;
        let worker_interval_ms = env::var("CAPSULE_WORKER_INTERVAL_MS")
            .unwrap_or_else(|_| DEFAULT_WORKER_INTERVAL_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidWorkerIntervalMs(error.to_string()))?;
        let worker_concurrency = env::var("CAPSULE_WORKER_CONCURRENCY")
            .unwrap_or_else(|_| DEFAULT_WORKER_CONCURRENCY.to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidWorkerConcurrency(error.to_string()))?;

        let edit_window_seconds = parse_edit_window_seconds(
            env::var("CAPSULE_EDIT_WINDOW_SECONDS")
                .unwrap_or_else(|_| DEFAULT_EDIT_WINDOW_SECONDS.to_string())
                .as_str(),
        )?;

        let rate_limit_burst = env::var("CAPSULE_RATE_LIMIT_BURST")
            .unwrap_or_else(|_| DEFAULT_RATE_LIMIT_BURST.to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidRateLimitBurst(error.to_string()))?;
        let rate_limit_per_second = env::var("CAPSULE_RATE_LIMIT_PER_SECOND")
            .unwrap_or_else(|_| DEFAULT_RATE_LIMIT_PER_SECOND.to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidRateLimitPerSecond(error.to_string()))?;
        let request_timeout_ms = env::var("CAPSULE_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRequestTimeoutMs(error.to_string()))?;
        let log_format = parse_log_format(
            env::var("CAPSULE_LOG_FORMAT")
                .unwrap_or_else(|_| "text".to_string())
                .as_str(),
        )?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            jwt_secret,
            jwt_issuer,
            token_ttl_seconds,
            object_store,
            object_store_timeout_ms,
            mail_relay_url,
            mail_relay_token,
            mail_from,
            smtp_host,
            smtp_port,
            smtp_username,
            smtp_password,
            smtp_tls,
            worker_enabled,
            worker_interval_ms,
            worker_concurrency,
            edit_window_seconds,
            rate_limit_burst,
            rate_limit_per_second,
            request_timeout_ms,
            log_format,
        })
    }

    /// In-memory everything, worker disabled. Used by tests and local runs.
    pub fn for_local() -> Self {
        Self {
            service_name: "time-capsule".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_url: None,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: "time-capsule".to_string(),
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            object_store: ObjectStoreDriver::Memory,
            object_store_timeout_ms: DEFAULT_OBJECT_STORE_TIMEOUT_MS,
            mail_relay_url: None,
            mail_relay_token: None,
            mail_from: DEFAULT_MAIL_FROM.to_string(),
            smtp_host: None,
            smtp_port: DEFAULT_SMTP_PORT,
            smtp_username: None,
            smtp_password: None,
            smtp_tls: SmtpTls::StartTls,
            worker_enabled: false,
            worker_interval_ms: DEFAULT_WORKER_INTERVAL_MS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            edit_window_seconds: Some(DEFAULT_EDIT_WINDOW_SECONDS),
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            request_timeout_ms: 30_000,
            log_format: LogFormat::Text,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, String> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

fn parse_object_store_driver(raw: &str) -> Result<ObjectStoreDriver, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(ObjectStoreDriver::Memory),
        "fs" => Ok(ObjectStoreDriver::Fs {
            root: non_empty_env("CAPSULE_OBJECT_STORE_DIR")
                .map_or_else(|| PathBuf::from("./data/images"), PathBuf::from),
        }),
        "s3" => Ok(ObjectStoreDriver::S3 {
            bucket: non_empty_env("CAPSULE_S3_BUCKET").ok_or(ConfigError::MissingS3Bucket)?,
            endpoint: non_empty_env("CAPSULE_S3_ENDPOINT"),
        }),
        other => Err(ConfigError::InvalidObjectStore(other.to_string())),
    }
}

fn parse_token_ttl_seconds(raw: &str) -> Result<u64, ConfigError> {
    let seconds = raw
        .trim()
        .parse::<u64>()
        .map_err(|error| ConfigError::InvalidTokenTtlSeconds(error.to_string()))?;
    if seconds == 0 || seconds > MAX_TOKEN_TTL_SECONDS {
        return Err(ConfigError::InvalidTokenTtlSeconds(format!(
            "{seconds} is outside 1..={MAX_TOKEN_TTL_SECONDS}"
        )));
    }
    Ok(seconds)
}

/// `0` turns the edit cutoff off.
fn parse_edit_window_seconds(raw: &str) -> Result<Option<u64>, ConfigError> {
    let seconds = raw
        .trim()
        .parse::<u64>()
        .map_err(|error| ConfigError::InvalidEditWindowSeconds(error.to_string()))?;
    if seconds > MAX_EDIT_WINDOW_SECONDS {
        return Err(ConfigError::InvalidEditWindowSeconds(format!(
            "{seconds} exceeds {MAX_EDIT_WINDOW_SECONDS}"
        )));
    }
    Ok((seconds > 0).then_some(seconds))
}

fn parse_smtp_tls(raw: &str) -> Result<SmtpTls, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "starttls" => Ok(SmtpTls::StartTls),
        "tls" | "implicit" => Ok(SmtpTls::Implicit),
        "none" | "plain" => Ok(SmtpTls::None),
        other => Err(ConfigError::InvalidSmtpTls(other.to_string())),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}
