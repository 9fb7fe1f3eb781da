use chrono::{NaiveDate, NaiveTime, Timelike};

/// This is the standard way of converting a date to a day key in worktally. Snapshots and daily
/// stats are keyed by it.
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Converts milliseconds reported by the OS into a chrono duration.
pub fn millis(value: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::{day_key, minute_of_day};

    #[test]
    fn day_key_is_iso_date() {
        let date = NaiveDate::from_ymd_opt(2018, 7, 4).unwrap();
        assert_eq!(day_key(date), "2018-07-04");
    }

    #[test]
    fn minute_of_day_ignores_seconds() {
        assert_eq!(minute_of_day(NaiveTime::from_hms_opt(0, 0, 0).unwrap()), 0);
        assert_eq!(minute_of_day(NaiveTime::from_hms_opt(9, 5, 59).unwrap()), 545);
        assert_eq!(minute_of_day(NaiveTime::from_hms_opt(23, 59, 0).unwrap()), 1439);
    }
}
