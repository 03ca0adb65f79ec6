//! Durable session layout and the update-criteria journal.
//!
//! `StoredSessionState` is the tagged record persisted to the session
//! store. `SessionStateUpdateCriteria` is the value-type journal every
//! session method appends to; the store merge-applies it onto the stored
//! copy or discards it wholesale.

use std::collections::{BTreeSet, HashMap};

use coregw_proto::{
    CreditKey, CreditLimitType, EventTrigger, GrantedUnits, PolicyRule, SessionConfig,
    SubscriberQuotaState, TgppContext,
};
use serde::{Deserialize, Serialize};

use crate::charging_grant::{FinalActionInfo, ReAuthState, ServiceState};
use crate::credit::{GrantTrackingType, BUCKET_COUNT};

/// Session lifecycle states.
///
/// ```text
/// Active -----------------------.
///   |                            \
///   | (start_termination)         TerminationScheduled
///   v                            /
/// Released <--------------------'
///   |  (pipeline flows confirmed gone OR forced timeout)
///   v
/// Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionFsmState {
    #[default]
    Active,
    TerminationScheduled,
    Released,
    Terminated,
}

/// Lifecycle of a pending event trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventTriggerState {
    /// Trigger installed, nothing to report yet.
    #[default]
    Pending,
    /// Ready to be reported on the next update cycle.
    Ready,
    /// Successfully reported.
    Cleared,
}

/// Activation window of an installed or scheduled rule.
/// Times are epoch seconds; 0 means "immediately" / "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleLifetime {
    pub activation_time: i64,
    pub deactivation_time: i64,
}

impl RuleLifetime {
    /// A rule installed with no scheduling constraints.
    pub fn always() -> Self {
        RuleLifetime::default()
    }

    pub fn should_be_active(&self, time: i64) -> bool {
        let deactivated = self.deactivation_time > 0 && self.deactivation_time < time;
        self.activation_time < time && !deactivated
    }

    pub fn should_be_deactivated(&self, time: i64) -> bool {
        self.deactivation_time > 0 && self.deactivation_time < time
    }
}

/// Whether a rule is catalog-resident or carried by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Static,
    Dynamic,
}

/// Key of the policy-to-dedicated-bearer mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId {
    pub policy_type: PolicyType,
    pub rule_id: String,
}

impl PolicyId {
    pub fn new(policy_type: PolicyType, rule_id: &str) -> Self {
        PolicyId { policy_type, rule_id: rule_id.to_string() }
    }
}

// ============================================================================
// Stored snapshots
// ============================================================================

/// Durable snapshot of a `SessionCredit`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredSessionCredit {
    pub reporting: bool,
    pub credit_limit_type: CreditLimitType,
    pub buckets: [u64; BUCKET_COUNT],
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: GrantedUnits,
}

/// Durable snapshot of a usage monitor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredMonitor {
    pub credit: StoredSessionCredit,
    pub level: coregw_proto::MonitoringLevel,
}

/// Durable snapshot of a charging grant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredChargingGrant {
    pub credit: StoredSessionCredit,
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: i64,
}

/// Durable snapshot of a full session.
///
/// Keyed maps with structured keys are stored as pair lists so the record
/// stays representable in plain JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredSessionState {
    pub imsi: String,
    pub session_id: String,
    pub fsm_state: SessionFsmState,
    pub config: SessionConfig,
    pub subscriber_quota_state: SubscriberQuotaState,
    pub tgpp_context: TgppContext,
    pub request_number: u32,
    pub pdp_start_time: u64,
    pub pdp_end_time: u64,
    pub pending_event_triggers: HashMap<EventTrigger, EventTriggerState>,
    pub revalidation_time: i64,
    pub bearer_id_by_policy: Vec<(PolicyId, u32)>,
    pub monitor_map: HashMap<String, StoredMonitor>,
    pub session_level_key: String,
    pub credit_map: Vec<(CreditKey, StoredChargingGrant)>,
    pub static_rule_ids: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules: Vec<PolicyRule>,
    pub scheduled_static_rules: BTreeSet<String>,
    pub scheduled_dynamic_rules: Vec<PolicyRule>,
    pub restrict_rules: Vec<String>,
    pub rule_lifetimes: HashMap<String, RuleLifetime>,
}

// ============================================================================
// Update criteria
// ============================================================================

/// Per-credit sub-journal. Bucket deltas are additive; `Reporting*`
/// buckets are never journaled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionCreditUpdateCriteria {
    // maintained by the charging grant
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: i64,

    // maintained by the session credit
    pub reporting: bool,
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: GrantedUnits,
    pub bucket_deltas: [u64; BUCKET_COUNT],

    pub deleted: bool,
}

/// Journal of every delta one session operation produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStateUpdateCriteria {
    pub is_session_ended: bool,
    pub updated_fsm_state: Option<SessionFsmState>,
    pub updated_config: Option<SessionConfig>,
    pub updated_subscriber_quota_state: Option<SubscriberQuotaState>,
    pub updated_tgpp_context: Option<TgppContext>,
    pub pending_event_triggers: HashMap<EventTrigger, EventTriggerState>,
    /// Only meaningful when one of the updated triggers is
    /// `RevalidationTimeout`.
    pub revalidation_time: Option<i64>,
    pub request_number_increment: u32,
    /// 0 means unchanged.
    pub updated_pdp_end_time: u64,

    pub static_rules_to_install: BTreeSet<String>,
    pub static_rules_to_uninstall: BTreeSet<String>,
    pub new_scheduled_static_rules: BTreeSet<String>,
    pub dynamic_rules_to_install: Vec<PolicyRule>,
    pub dynamic_rules_to_uninstall: BTreeSet<String>,
    pub new_scheduled_dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules_to_install: Vec<PolicyRule>,
    pub gy_dynamic_rules_to_uninstall: BTreeSet<String>,
    pub restrict_rules_to_install: BTreeSet<String>,
    pub restrict_rules_to_uninstall: BTreeSet<String>,
    pub new_rule_lifetimes: HashMap<String, RuleLifetime>,

    pub charging_credit_to_install: HashMap<CreditKey, StoredChargingGrant>,
    pub charging_credit_map: HashMap<CreditKey, SessionCreditUpdateCriteria>,
    /// `Some("")` means the session-level key was cleared.
    pub updated_session_level_key: Option<String>,
    pub monitor_credit_to_install: HashMap<String, StoredMonitor>,
    pub monitor_credit_map: HashMap<String, SessionCreditUpdateCriteria>,

    pub updated_bearer_id_by_policy: Option<HashMap<PolicyId, u32>>,
}

impl SessionStateUpdateCriteria {
    /// True when the journal records no change at all.
    pub fn is_empty(&self) -> bool {
        *self == SessionStateUpdateCriteria::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_lifetime_windows() {
        let now = 1_000_000;
        let always = RuleLifetime::always();
        assert!(always.should_be_active(now));
        assert!(!always.should_be_deactivated(now));

        let windowed = RuleLifetime { activation_time: now - 1, deactivation_time: now + 1 };
        assert!(windowed.should_be_active(now));

        let expired = RuleLifetime { activation_time: now - 10, deactivation_time: now - 1 };
        assert!(!expired.should_be_active(now));
        assert!(expired.should_be_deactivated(now));

        let future = RuleLifetime { activation_time: now + 5, deactivation_time: 0 };
        assert!(!future.should_be_active(now));
    }

    #[test]
    fn test_update_criteria_is_empty() {
        let mut uc = SessionStateUpdateCriteria::default();
        assert!(uc.is_empty());
        uc.request_number_increment = 1;
        assert!(!uc.is_empty());
    }

    #[test]
    fn test_stored_session_serde_roundtrip() {
        let mut stored = StoredSessionState {
            imsi: "IMSI000000000000001".to_string(),
            session_id: "IMSI000000000000001-1".to_string(),
            request_number: 7,
            ..Default::default()
        };
        stored
            .pending_event_triggers
            .insert(EventTrigger::RevalidationTimeout, EventTriggerState::Ready);
        stored.credit_map.push((CreditKey::new(1), StoredChargingGrant::default()));
        stored
            .bearer_id_by_policy
            .push((PolicyId::new(PolicyType::Static, "rule1"), 5));

        let encoded = serde_json::to_string(&stored).unwrap();
        let decoded: StoredSessionState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(stored, decoded);
    }
}
