use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// §3: trial window is always exactly 14 days from `trial_started_at`.
pub const TRIAL_DURATION_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    CancelAtPeriodEnd,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub plan: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl User {
    /// Builds a trial window satisfying the `trial_ends_at = trial_started_at
    /// + 14 days` invariant. Callers that already have both timestamps from
    /// storage should set the fields directly instead.
    pub fn start_trial(&mut self, started_at: DateTime<Utc>) {
        self.trial_started_at = Some(started_at);
        self.trial_ends_at = Some(started_at + Duration::days(TRIAL_DURATION_DAYS));
    }

    /// Case-insensitive email comparison, per the unique-email invariant.
    pub fn email_matches(&self, other: &str) -> bool {
        self.email.eq_ignore_ascii_case(other)
    }
}
