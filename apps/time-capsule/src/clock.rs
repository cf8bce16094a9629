use std::sync::Arc;

use chrono::{DateTime, Utc};

#[cfg(test)]
pub use manual::ManualClock;

/// Source of "now" for every time-window rule.
///
/// Services and the expiry worker read the clock through this trait so tests
/// can move time forward without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
