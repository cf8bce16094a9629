use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::account::AccountService;
use crate::capsule::store::CapsuleStore;
use crate::capsule::types::{Capsule, CapsuleFilter, CapsuleUpdate};
use crate::clock::Clock;
use crate::notifier::{self, Notifier};

pub const DEFAULT_WORKER_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub notified: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Notified,
    Skipped,
    Failed,
}

/// Periodically notifies owners of capsules whose open time has passed.
///
/// The only write it performs is the conditional `notified` flip, so it can
/// run alongside API requests against the same store.
#[derive(Clone)]
pub struct ExpiryWorker {
    capsules: Arc<dyn CapsuleStore>,
    accounts: AccountService,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    concurrency: usize,
}

impl ExpiryWorker {
    pub fn new(
        capsules: Arc<dyn CapsuleStore>,
        accounts: AccountService,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            capsules,
            accounts,
            notifier,
            clock,
            interval: Duration::from_millis(DEFAULT_WORKER_INTERVAL_MS),
            concurrency: DEFAULT_WORKER_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs cycles until `shutdown` flips to `true` or its sender is dropped.
    /// A cycle already in progress is allowed to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            concurrency = self.concurrency,
            notifier = self.notifier.driver_name(),
            "expiry worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("expiry worker stopped");
    }

    /// One scan, notify, mark pass. Never returns an error; per-capsule
    /// failures are logged and the capsule is retried next cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();
        let due = match self
            .capsules
            .get_capsules(CapsuleFilter::DueUnnotified { now })
            .await
        {
            Ok(due) => due,
            Err(error) => {
                tracing::error!(reason = %error, "expiry worker: scan failed");
                return CycleReport::default();
            }
        };

        let mut report = CycleReport {
            scanned: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            return report;
        }

        let outcomes: Vec<Outcome> = futures::stream::iter(due)
            .map(|capsule| self.notify_one(capsule, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                Outcome::Notified => report.notified += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        tracing::info!(
            scanned = report.scanned,
            notified = report.notified,
            skipped = report.skipped,
            failed = report.failed,
            "expiry worker cycle finished"
        );
        report
    }

    async fn notify_one(&self, capsule: Capsule, now: DateTime<Utc>) -> Outcome {
        let owner = match self.accounts.get_account(capsule.owner_id).await {
            Ok(owner) => owner,
            Err(error) => {
                tracing::warn!(
                    capsule_id = %capsule.id,
                    owner_id = %capsule.owner_id,
                    reason = %error,
                    "expiry worker: owner lookup failed, skipping"
                );
                return Outcome::Skipped;
            }
        };

        let body = notifier::render_open_notification(&owner.username);
        let recipients = [owner.email];
        if let Err(error) = self
            .notifier
            .send(notifier::OPEN_NOTIFICATION_SUBJECT, &body, &recipients)
            .await
        {
            tracing::error!(
                capsule_id = %capsule.id,
                reason = %error,
                "expiry worker: notification send failed, retrying next cycle"
            );
            return Outcome::Failed;
        }

        match self
            .capsules
            .update_capsule(capsule.id, CapsuleUpdate::MarkNotified { now })
            .await
        {
            Ok(true) => {
                tracing::info!(capsule_id = %capsule.id, "capsule open notification sent");
                Outcome::Notified
            }
            Ok(false) => {
                tracing::debug!(
                    capsule_id = %capsule.id,
                    "expiry worker: capsule gone, rescheduled or already notified"
                );
                Outcome::Skipped
            }
            Err(error) => {
                tracing::error!(
                    capsule_id = %capsule.id,
                    reason = %error,
                    "expiry worker: mark notified failed, email may be resent"
                );
                Outcome::Failed
            }
        }
    }
}
