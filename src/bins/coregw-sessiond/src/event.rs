//! Reactor event definitions.
//!
//! Timer tasks never capture session state or the enforcer itself; they
//! post one of these id-only events back into the reactor queue, and the
//! handler re-resolves everything through the session store.

use crate::timer::SessiondTimerId;

/// Events consumed by the enforcer reactor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessiondEvent {
    /// A scheduled rule reached its activation time.
    ScheduledRuleActivation { imsi: String, rule_id: String },
    /// An installed rule reached its deactivation time.
    ScheduledRuleDeactivation { imsi: String, rule_id: String },
    /// The revalidation time for a session elapsed.
    RevalidationTimeout { imsi: String, session_id: String },
    /// Termination grace period elapsed without pipeline confirmation.
    ForceTermination { imsi: String, session_id: String },
    /// CWF quota-exhaustion grace period elapsed for these subscribers.
    QuotaExhaustionTermination { imsis: Vec<String> },
    /// Retry a failed pipeline flow activation for a subscriber.
    PipelineActivateRetry { imsi: String },
}

impl SessiondEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduledRuleActivation { .. } => "SESSIOND_EVT_RULE_ACTIVATION",
            Self::ScheduledRuleDeactivation { .. } => "SESSIOND_EVT_RULE_DEACTIVATION",
            Self::RevalidationTimeout { .. } => "SESSIOND_EVT_REVALIDATION_TIMEOUT",
            Self::ForceTermination { .. } => "SESSIOND_EVT_FORCE_TERMINATION",
            Self::QuotaExhaustionTermination { .. } => "SESSIOND_EVT_QUOTA_EXHAUSTION",
            Self::PipelineActivateRetry { .. } => "SESSIOND_EVT_PIPELINE_RETRY",
        }
    }

    /// The timer purpose that fires this event.
    pub fn timer_id(&self) -> SessiondTimerId {
        match self {
            Self::ScheduledRuleActivation { .. } => SessiondTimerId::RuleActivation,
            Self::ScheduledRuleDeactivation { .. } => SessiondTimerId::RuleDeactivation,
            Self::RevalidationTimeout { .. } => SessiondTimerId::Revalidation,
            Self::ForceTermination { .. } => SessiondTimerId::ForceTermination,
            Self::QuotaExhaustionTermination { .. } => SessiondTimerId::QuotaExhaustion,
            Self::PipelineActivateRetry { .. } => SessiondTimerId::PipelineRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = SessiondEvent::ForceTermination {
            imsi: "IMSI1".to_string(),
            session_id: "sid1".to_string(),
        };
        assert_eq!(event.name(), "SESSIOND_EVT_FORCE_TERMINATION");
        let event = SessiondEvent::QuotaExhaustionTermination { imsis: vec![] };
        assert_eq!(event.name(), "SESSIOND_EVT_QUOTA_EXHAUSTION");
    }
}
