#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    account::{
        AccountService, SessionTokenConfig, SessionTokens, password::PasswordHashing,
        store as account_store,
    },
    capsule::{CapsulePolicy, CapsuleService, store as capsule_store},
    config::{Config, ObjectStoreDriver},
    db::CapsuleDb,
    notifier::{
        DEFAULT_MAIL_RELAY_TIMEOUT_MS, HttpMailNotifier, LogNotifier, MailRelayConfig, Notifier,
        SmtpConfig, SmtpNotifier,
    },
    object_store::{FsObjectStore, ObjectStore, S3ObjectStore},
    rate_limit::RateLimiter,
    server::{AppState, build_router},
    worker::ExpiryWorker,
};

pub mod account;
pub mod capsule;
pub mod clock;
pub mod config;
pub mod db;
pub mod notifier;
pub mod object_store;
pub mod rate_limit;
pub mod server;
pub mod worker;

/// Everything `serve` runs: the HTTP state and the background expiry worker.
pub struct Runtime {
    pub state: AppState,
    pub worker: ExpiryWorker,
}

pub async fn build_runtime(config: &Config) -> Result<Runtime> {
    let clock = clock::system();

    let (capsule_records, account_records) = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(CapsuleDb::connect(url).await?);
            db.migrate().await?;
            (capsule_store::postgres(db.clone()), account_store::postgres(db))
        }
        None => {
            warn!("DB_URL not set; records are kept in memory");
            (capsule_store::memory(), account_store::memory())
        }
    };

    let objects = build_object_store(config).await?;
    let policy = CapsulePolicy {
        edit_window: config
            .edit_window_seconds
            .map(|seconds| {
                i64::try_from(seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .context("edit window out of range")
            })
            .transpose()?,
        ..CapsulePolicy::default()
    };
    let capsules = CapsuleService::new_with_policy(
        capsule_records.clone(),
        objects.clone(),
        clock.clone(),
        policy,
    );

    let tokens = SessionTokens::from_config(
        SessionTokenConfig {
            signing_key: config.jwt_secret.clone(),
            issuer: config.jwt_issuer.clone(),
            ttl_seconds: config.token_ttl_seconds,
        },
        clock.clone(),
    );
    let accounts = AccountService::new(
        account_records,
        PasswordHashing::default(),
        tokens,
        clock.clone(),
    );

    let worker = ExpiryWorker::new(
        capsule_records,
        accounts.clone(),
        build_notifier(config)?,
        clock,
    )
    .with_interval(Duration::from_millis(config.worker_interval_ms))
    .with_concurrency(config.worker_concurrency);

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_burst,
        config.rate_limit_per_second,
    ));
    let state = AppState::new(capsules, accounts, objects, rate_limiter)
        .with_request_timeout(Duration::from_millis(config.request_timeout_ms));

    Ok(Runtime { state, worker })
}

async fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let timeout_ms = config.object_store_timeout_ms;
    let objects: Arc<dyn ObjectStore> = match &config.object_store {
        ObjectStoreDriver::Memory => object_store::memory(),
        ObjectStoreDriver::Fs { root } => Arc::new(FsObjectStore::open(root, timeout_ms).await?),
        ObjectStoreDriver::S3 { bucket, endpoint } => Arc::new(
            S3ObjectStore::new(bucket.clone(), endpoint.clone(), timeout_ms).await,
        ),
    };
    info!(driver = objects.driver_name(), "object store ready");
    Ok(objects)
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match (&config.smtp_host, &config.mail_relay_url) {
        (Some(host), _) => {
            info!(host = %host, port = config.smtp_port, tls = config.smtp_tls.as_str(), "smtp mail");
            Arc::new(SmtpNotifier::new(SmtpConfig {
                host: host.clone(),
                port: config.smtp_port,
                username: config.smtp_username.clone(),
                password: config.smtp_password.clone(),
                tls: config.smtp_tls,
                from: config.mail_from.clone(),
                timeout_ms: DEFAULT_MAIL_RELAY_TIMEOUT_MS,
            })?)
        }
        (None, Some(url)) => Arc::new(HttpMailNotifier::new(MailRelayConfig {
            url: url.clone(),
            auth_token: config.mail_relay_token.clone(),
            from: config.mail_from.clone(),
            timeout_ms: DEFAULT_MAIL_RELAY_TIMEOUT_MS,
        })),
        (None, None) => {
            warn!("no mail transport configured; notifications are logged only");
            Arc::new(LogNotifier)
        }
    };
    Ok(notifier)
}

pub async fn build_app(config: &Config) -> Result<axum::Router> {
    Ok(build_router(build_runtime(config).await?.state))
}

pub async fn serve(config: Config) -> Result<()> {
    let Runtime { state, worker } = build_runtime(&config).await?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %listener.local_addr()?,
        worker_enabled = config.worker_enabled,
        "time capsule service listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = config
        .worker_enabled
        .then(|| tokio::spawn(worker.run(shutdown_rx)));

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        handle.await?;
    }
    info!("time capsule service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(reason = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(reason = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
