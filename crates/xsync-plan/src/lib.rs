//! `PlanGuard` and `UsageTracker` (§4.9): subscription-state evaluation,
//! the admit/pause decision for a scheduled or manual run, and monthly
//! usage accrual.

pub mod guard;
pub mod usage;

pub use guard::{PlanGuard, PlanLimits, SubscriptionState};
pub use usage::UsageTracker;
