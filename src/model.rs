use serde::{Deserialize, Serialize};

/// One logged, time-bounded activity.
///
/// Field names follow the document schema shared with the UI and the
/// remote replica, hence the camelCase serialization.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Assigned once at creation, stable for the record's lifetime.
    pub id: String,
    pub category: String,
    pub activity: String,
    /// ISO-8601 with millisecond precision, UTC.
    pub start_time: String,
    pub end_time: String,
    /// Minutes. Never negative.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// The logical day the record belongs to (`YYYY-MM-DD`), assigned
    /// when the record is created rather than re-derived from
    /// `start_time` later.
    pub date: String,
}

impl ActivityRecord {
    /// Clamps the duration to zero; a clock that moved backwards must
    /// not produce a negative record.
    pub fn with_clamped_duration(mut self) -> Self {
        self.duration = self.duration.max(0.0);
        self
    }
}

/// The single synchronized document: an ordered list of records.
pub type ActivityLog = Vec<ActivityRecord>;

/// Appends a freshly created record.
pub fn append_record(mut log: ActivityLog, record: ActivityRecord) -> ActivityLog {
    log.push(record.with_clamped_duration());
    log
}

/// Replaces every mutable field of the record with `id` wholesale. The
/// id itself is preserved; an unknown id leaves the log untouched.
pub fn replace_record(mut log: ActivityLog, id: &str, record: ActivityRecord) -> ActivityLog {
    if let Some(slot) = log.iter_mut().find(|r| r.id == id) {
        let mut record = record.with_clamped_duration();
        record.id = slot.id.clone();
        *slot = record;
    }
    log
}

/// Deletes the record with `id`, if any.
pub fn remove_record(mut log: ActivityLog, id: &str) -> ActivityLog {
    log.retain(|r| r.id != id);
    log
}

/// Records belonging to one calendar day, by their assigned `date`.
pub fn records_for_date<'a>(log: &'a [ActivityRecord], date: &str) -> Vec<&'a ActivityRecord> {
    log.iter().filter(|r| r.date == date).collect()
}

/// Total logged minutes across the whole log.
pub fn total_minutes(log: &[ActivityRecord]) -> f64 {
    log.iter().map(|r| r.duration).sum()
}
