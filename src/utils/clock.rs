use chrono::{DateTime, Utc};

/// Source of wall-clock time. All session arithmetic goes through this
/// trait so tests can move time by hand instead of sleeping.
pub trait Clock: Send + Sync + 'static {
    fn time(&self) -> DateTime<Utc>;

    /// Current wall-clock instant as epoch milliseconds.
    fn epoch_millis(&self) -> i64 {
        self.time().timestamp_millis()
    }
}

pub struct DefaultClock;

impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
