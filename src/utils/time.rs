use chrono::{DateTime, SecondsFormat, Utc};

/// The standard day key for an activity's calendar `date` field.
pub fn day_string(moment: DateTime<Utc>) -> String {
    moment.format("%Y-%m-%d").to_string()
}

/// ISO-8601 with fixed millisecond precision, e.g.
/// `2025-01-01T09:00:00.000Z`.
pub fn iso_millis(moment: DateTime<Utc>) -> String {
    moment.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// None only for instants outside chrono's representable range.
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn day_string_is_calendar_date() {
        let moment = Utc.with_ymd_and_hms(2025, 1, 1, 23, 59, 59).unwrap();
        assert_eq!(day_string(moment), "2025-01-01");
    }

    #[test]
    fn iso_millis_keeps_three_fraction_digits() {
        let moment = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        assert_eq!(iso_millis(moment), "2025-01-01T09:00:00.000Z");
    }

    #[test]
    fn epoch_millis_round_trip() {
        let moment = Utc.with_ymd_and_hms(2025, 6, 15, 12, 30, 45).unwrap();
        let millis = moment.timestamp_millis();
        assert_eq!(from_epoch_millis(millis), Some(moment));
    }
}
