use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStats {
    pub user_id: Uuid,
    /// First day of the calendar month in UTC — the unique key alongside `user_id`.
    pub month: DateTime<Utc>,
    pub records_synced: u64,
    pub sync_configs_created: u64,
}

/// Normalizes an arbitrary instant to the first day of its UTC month at
/// midnight, the canonical `(user_id, month)` key.
pub fn month_key(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .expect("valid calendar month")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_truncates_to_first_of_month() {
        let t = Utc.with_ymd_and_hms(2026, 7, 28, 15, 30, 0).unwrap();
        let key = month_key(t);
        assert_eq!(key, Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
    }
}
