//! Subscription-state evaluation and the per-plan record budget (§4.9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use xsync_schemas::{SubscriptionStatus, User};

/// §4.9: `SubscriptionState ∈ {trial_active, trial_expired, subscribed,
/// subscription_inactive}`, computed from `User` fields alone — no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    TrialActive,
    TrialExpired,
    Subscribed,
    SubscriptionInactive,
}

impl SubscriptionState {
    /// `shouldPauseSyncs` is true iff `trial_expired` or `subscription_inactive`.
    pub fn should_pause_syncs(self) -> bool {
        matches!(self, SubscriptionState::TrialExpired | SubscriptionState::SubscriptionInactive)
    }
}

/// Per-plan `maxRecordsPerSync` ceilings, keyed by `User.plan`. A plan name
/// absent from the map falls back to `default_max_records`.
#[derive(Debug, Clone)]
pub struct PlanLimits {
    pub default_max_records: u64,
    pub by_plan: HashMap<String, u64>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self { default_max_records: 5_000, by_plan: HashMap::new() }
    }
}

impl PlanLimits {
    pub fn max_records_for(&self, plan: Option<&str>) -> u64 {
        plan.and_then(|p| self.by_plan.get(p)).copied().unwrap_or(self.default_max_records)
    }
}

/// The fraction of a plan's record budget at which a run report should
/// start carrying an `approaching_limit` warning (§4.9: "within 80% of the
/// cap").
const APPROACHING_LIMIT_FRACTION: f64 = 0.8;

pub struct PlanGuard {
    limits: PlanLimits,
}

impl PlanGuard {
    pub fn new(limits: PlanLimits) -> Self {
        Self { limits }
    }

    /// §4.9: derives the subscription state from `user`'s fields as of `now`.
    ///
    /// An explicit `subscription_status` of `active` or `cancel_at_period_end`
    /// (still paid through the current period) takes precedence over trial
    /// fields. `past_due`/`deleted` are always `subscription_inactive`. With
    /// no subscription status at all the trial window decides: active until
    /// `trial_ends_at`, expired once it passes, and expired (not active) for
    /// a user with no trial recorded either — there is nothing admitting
    /// runs for that user.
    pub fn evaluate(&self, user: &User, now: DateTime<Utc>) -> SubscriptionState {
        match user.subscription_status {
            Some(SubscriptionStatus::Active) | Some(SubscriptionStatus::CancelAtPeriodEnd) => {
                SubscriptionState::Subscribed
            }
            Some(SubscriptionStatus::PastDue) | Some(SubscriptionStatus::Deleted) => {
                SubscriptionState::SubscriptionInactive
            }
            None => match user.trial_ends_at {
                Some(ends_at) if now < ends_at => SubscriptionState::TrialActive,
                Some(_) => SubscriptionState::TrialExpired,
                None => SubscriptionState::TrialExpired,
            },
        }
    }

    pub fn should_pause_syncs(&self, user: &User, now: DateTime<Utc>) -> bool {
        self.evaluate(user, now).should_pause_syncs()
    }

    /// §4.9: `approaching_limit` warning text once a run's successful write
    /// count reaches 80% of the user's plan budget. `None` below that
    /// threshold.
    pub fn approaching_limit_warning(&self, plan: Option<&str>, records_synced: u64) -> Option<String> {
        let max = self.limits.max_records_for(plan);
        if max == 0 {
            return None;
        }
        let threshold = (max as f64 * APPROACHING_LIMIT_FRACTION).ceil() as u64;
        if records_synced >= threshold {
            Some(format!(
                "approaching_limit: {records_synced}/{max} records synced this run, plan cap is {max}"
            ))
        } else {
            None
        }
    }

    pub fn max_records_per_sync(&self, plan: Option<&str>) -> u64 {
        self.limits.max_records_for(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn user(status: Option<SubscriptionStatus>, trial_ends_at: Option<DateTime<Utc>>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@b.com".into(),
            plan: Some("pro".into()),
            subscription_status: status,
            trial_started_at: trial_ends_at.map(|e| e - Duration::days(14)),
            trial_ends_at,
        }
    }

    #[test]
    fn active_subscription_is_subscribed_regardless_of_trial() {
        let guard = PlanGuard::new(PlanLimits::default());
        let u = user(Some(SubscriptionStatus::Active), None);
        assert_eq!(guard.evaluate(&u, Utc::now()), SubscriptionState::Subscribed);
        assert!(!guard.should_pause_syncs(&u, Utc::now()));
    }

    #[test]
    fn past_due_and_deleted_pause_syncs() {
        let guard = PlanGuard::new(PlanLimits::default());
        for status in [SubscriptionStatus::PastDue, SubscriptionStatus::Deleted] {
            let u = user(Some(status), None);
            assert_eq!(guard.evaluate(&u, Utc::now()), SubscriptionState::SubscriptionInactive);
            assert!(guard.should_pause_syncs(&u, Utc::now()));
        }
    }

    #[test]
    fn trial_active_before_trial_end() {
        let guard = PlanGuard::new(PlanLimits::default());
        let u = user(None, Some(Utc::now() + Duration::days(3)));
        assert_eq!(guard.evaluate(&u, Utc::now()), SubscriptionState::TrialActive);
        assert!(!guard.should_pause_syncs(&u, Utc::now()));
    }

    #[test]
    fn trial_expired_after_trial_end_pauses_syncs() {
        let guard = PlanGuard::new(PlanLimits::default());
        let u = user(None, Some(Utc::now() - Duration::days(1)));
        assert_eq!(guard.evaluate(&u, Utc::now()), SubscriptionState::TrialExpired);
        assert!(guard.should_pause_syncs(&u, Utc::now()));
    }

    #[test]
    fn no_subscription_and_no_trial_is_treated_as_expired() {
        let guard = PlanGuard::new(PlanLimits::default());
        let u = User {
            id: Uuid::new_v4(),
            email: "a@b.com".into(),
            plan: None,
            subscription_status: None,
            trial_started_at: None,
            trial_ends_at: None,
        };
        assert_eq!(guard.evaluate(&u, Utc::now()), SubscriptionState::TrialExpired);
        assert!(guard.should_pause_syncs(&u, Utc::now()));
    }

    #[test]
    fn approaching_limit_warns_at_eighty_percent() {
        let mut limits = PlanLimits::default();
        limits.by_plan.insert("pro".into(), 100);
        let guard = PlanGuard::new(limits);
        assert!(guard.approaching_limit_warning(Some("pro"), 79).is_none());
        assert!(guard.approaching_limit_warning(Some("pro"), 80).is_some());
        assert!(guard.approaching_limit_warning(Some("pro"), 100).is_some());
    }

    #[test]
    fn unknown_plan_falls_back_to_default_budget() {
        let guard = PlanGuard::new(PlanLimits::default());
        assert_eq!(guard.max_records_per_sync(Some("unknown-plan")), 5_000);
    }
}
