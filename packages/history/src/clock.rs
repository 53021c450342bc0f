use chrono::{DateTime, Utc};

/// Source of "now" for staleness checks, injectable so tests can move time
/// around without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
