//! Timer identifiers and time helpers.
//!
//! Every timer the enforcer arms is identified by a purpose plus the
//! session (or subscriber) it belongs to. Callbacks re-check the session
//! state when they fire, so a timer that outlives its session is a no-op.

use std::time::{SystemTime, UNIX_EPOCH};

/// Enforcer timer purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessiondTimerId {
    /// A scheduled rule reached its activation time.
    RuleActivation,
    /// An installed rule reached its deactivation time.
    RuleDeactivation,
    /// The policy controller's revalidation time elapsed.
    Revalidation,
    /// Termination did not complete within the configured window.
    ForceTermination,
    /// CWF session created without quota; terminate after grace period.
    QuotaExhaustion,
    /// Re-push flows after a failed pipeline programming call.
    PipelineRetry,
}

impl SessiondTimerId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RuleActivation => "SESSIOND_TIMER_RULE_ACTIVATION",
            Self::RuleDeactivation => "SESSIOND_TIMER_RULE_DEACTIVATION",
            Self::Revalidation => "SESSIOND_TIMER_REVALIDATION",
            Self::ForceTermination => "SESSIOND_TIMER_FORCE_TERMINATION",
            Self::QuotaExhaustion => "SESSIOND_TIMER_QUOTA_EXHAUSTION",
            Self::PipelineRetry => "SESSIOND_TIMER_PIPELINE_RETRY",
        }
    }
}

/// Current wall-clock time as epoch seconds.
pub fn now_epoch() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Milliseconds from now until `target` (epoch seconds), clamped at zero.
pub fn millis_until(target: i64) -> u64 {
    let delta = target.saturating_sub(now_epoch());
    if delta <= 0 {
        0
    } else {
        (delta as u64).saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_id_names() {
        assert_eq!(SessiondTimerId::RuleActivation.name(), "SESSIOND_TIMER_RULE_ACTIVATION");
        assert_eq!(SessiondTimerId::ForceTermination.name(), "SESSIOND_TIMER_FORCE_TERMINATION");
    }

    #[test]
    fn test_now_epoch_is_positive() {
        assert!(now_epoch() > 0);
    }

    #[test]
    fn test_millis_until() {
        assert_eq!(millis_until(0), 0);
        assert_eq!(millis_until(now_epoch() - 10), 0);
        let ahead = millis_until(now_epoch() + 10);
        assert!(ahead > 0 && ahead <= 10_000);
    }
}
