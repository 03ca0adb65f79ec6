#![allow(dead_code)]

//! Per-subscriber session state.
//!
//! `SessionState` is the aggregate behind every `(imsi, session_id)`
//! pair: the session FSM, the installed/scheduled rule collections, the
//! charging and monitoring credit maps, pending event triggers, and the
//! policy-to-bearer mapping. Every mutating method takes a
//! [`SessionStateUpdateCriteria`] and records exactly the deltas it
//! produced, so the store can merge-apply or discard the whole call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use coregw_proto::{
    AggregatedMaximumBitrate, CreditKey, CreditLimitType, CreateBearerRequest, CreditUsage,
    CreditUsageUpdate, CreditUsageUpdateType, DeleteBearerRequest, DynamicRuleInstall,
    EventTrigger, GrantedUnits, MonitorAction, MonitoringLevel, PolicyBearerBindingRequest,
    PolicyRule, RatType, ReAuthResult, RuleSet, RulesPerSubscriber, SessionConfig,
    SessionTerminateRequest, StaticRuleInstall, SubscriberQuotaState, TgppContext,
    UpdateSessionRequest, UsageMonitorUpdate, UsageMonitoringUpdateRequest,
    UsageMonitoringUpdateResponse, CreditUpdateResponse,
};

use crate::charging_grant::{ChargingGrant, ReAuthState, ServiceAction, ServiceActionType, ServiceState};
use crate::credit::Bucket;
use crate::monitor::Monitor;
use crate::reporter::SessionReporter;
use crate::rule_store::{DynamicRuleStore, StaticRuleStore};
use crate::stored::{
    EventTriggerState, PolicyId, PolicyType, RuleLifetime, SessionCreditUpdateCriteria,
    SessionFsmState, SessionStateUpdateCriteria, StoredSessionState,
};

/// Rule ids and definitions collected for one pipeline call.
#[derive(Debug, Clone, Default)]
pub struct RulesToProcess {
    pub static_rules: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
}

impl RulesToProcess {
    pub fn is_empty(&self) -> bool {
        self.static_rules.is_empty() && self.dynamic_rules.is_empty()
    }
}

/// Desired rule state for a session, in lookup-friendly form.
#[derive(Debug, Clone, Default)]
pub struct RuleSetToApply {
    pub static_rules: BTreeSet<String>,
    pub dynamic_rules: HashMap<String, PolicyRule>,
}

impl RuleSetToApply {
    pub fn from_rule_set(rule_set: &RuleSet) -> Self {
        let mut out = RuleSetToApply::default();
        for install in &rule_set.static_rules {
            out.static_rules.insert(install.rule_id.clone());
        }
        for install in &rule_set.dynamic_rules {
            out.dynamic_rules
                .insert(install.policy_rule.id.clone(), install.policy_rule.clone());
        }
        out
    }

    pub fn combine_rule_set(&mut self, other: &RuleSetToApply) {
        for rule_id in &other.static_rules {
            self.static_rules.insert(rule_id.clone());
        }
        for (rule_id, rule) in &other.dynamic_rules {
            self.dynamic_rules.insert(rule_id.clone(), rule.clone());
        }
    }
}

/// Desired rule state for one subscriber across APNs.
#[derive(Debug, Clone, Default)]
pub struct RuleSetBySubscriber {
    pub imsi: String,
    pub rule_set_by_apn: HashMap<String, RuleSetToApply>,
    pub subscriber_wide_rule_set: Option<RuleSetToApply>,
}

impl RuleSetBySubscriber {
    pub fn from_rules_per_subscriber(rules: &RulesPerSubscriber) -> Self {
        let mut out = RuleSetBySubscriber { imsi: rules.imsi.clone(), ..Default::default() };
        for rule_set in &rules.rule_set {
            if rule_set.apply_subscriber_wide {
                out.subscriber_wide_rule_set = Some(RuleSetToApply::from_rule_set(rule_set));
            } else {
                out.rule_set_by_apn
                    .insert(rule_set.apn.clone(), RuleSetToApply::from_rule_set(rule_set));
            }
        }
        out
    }

    pub fn get_combined_rule_set_for_apn(&self, apn: &str) -> Option<RuleSetToApply> {
        match (self.rule_set_by_apn.get(apn), &self.subscriber_wide_rule_set) {
            (Some(apn_set), Some(wide)) => {
                let mut combined = apn_set.clone();
                combined.combine_rule_set(wide);
                Some(combined)
            }
            (None, Some(wide)) => Some(wide.clone()),
            (Some(apn_set), None) => Some(apn_set.clone()),
            (None, None) => None,
        }
    }
}

/// Dedicated-bearer work produced by a rule change.
#[derive(Debug, Clone, Default)]
pub struct BearerUpdate {
    pub create_req: Option<CreateBearerRequest>,
    pub delete_req: Option<DeleteBearerRequest>,
}

/// Session totals across every unique charging/monitoring key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalCreditUsage {
    pub monitoring_tx: u64,
    pub monitoring_rx: u64,
    pub charging_tx: u64,
    pub charging_rx: u64,
}

/// Everything the pipeline needs to (re)program one session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub imsi: String,
    pub ip_addr: String,
    pub static_rules: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules: Vec<PolicyRule>,
    pub restrict_rules: Vec<String>,
    pub ambr: Option<AggregatedMaximumBitrate>,
}

/// The per-session aggregate.
#[derive(Debug, Clone)]
pub struct SessionState {
    imsi: String,
    session_id: String,
    request_number: u32,
    curr_state: SessionFsmState,
    config: SessionConfig,
    pdp_start_time: u64,
    pdp_end_time: u64,
    subscriber_quota_state: SubscriberQuotaState,
    tgpp_context: TgppContext,

    /// Gateway-wide static rule catalog.
    static_rules: Arc<StaticRuleStore>,
    active_static_rules: Vec<String>,
    dynamic_rules: DynamicRuleStore,
    gy_dynamic_rules: DynamicRuleStore,
    active_restrict_rules: Vec<String>,
    scheduled_static_rules: BTreeSet<String>,
    scheduled_dynamic_rules: DynamicRuleStore,
    rule_lifetimes: HashMap<String, RuleLifetime>,

    pending_event_triggers: HashMap<EventTrigger, EventTriggerState>,
    revalidation_time: i64,

    credit_map: HashMap<CreditKey, ChargingGrant>,
    monitor_map: HashMap<String, Monitor>,
    /// Empty string means no session-level monitor.
    session_level_key: String,

    bearer_id_by_policy: HashMap<PolicyId, u32>,
}

impl SessionState {
    pub fn new(
        imsi: &str,
        session_id: &str,
        config: SessionConfig,
        static_rules: Arc<StaticRuleStore>,
        tgpp_context: TgppContext,
        pdp_start_time: u64,
    ) -> Self {
        SessionState {
            imsi: imsi.to_string(),
            session_id: session_id.to_string(),
            // request 0 is the session-init call
            request_number: 1,
            curr_state: SessionFsmState::Active,
            config,
            pdp_start_time,
            pdp_end_time: 0,
            subscriber_quota_state: SubscriberQuotaState::default(),
            tgpp_context,
            static_rules,
            active_static_rules: Vec::new(),
            dynamic_rules: DynamicRuleStore::default(),
            gy_dynamic_rules: DynamicRuleStore::default(),
            active_restrict_rules: Vec::new(),
            scheduled_static_rules: BTreeSet::new(),
            scheduled_dynamic_rules: DynamicRuleStore::default(),
            rule_lifetimes: HashMap::new(),
            pending_event_triggers: HashMap::new(),
            revalidation_time: 0,
            credit_map: HashMap::new(),
            monitor_map: HashMap::new(),
            session_level_key: String::new(),
            bearer_id_by_policy: HashMap::new(),
        }
    }

    // ========================================================================
    // Marshaling
    // ========================================================================

    pub fn unmarshal(marshaled: &StoredSessionState, static_rules: Arc<StaticRuleStore>) -> Self {
        let mut session = SessionState::new(
            &marshaled.imsi,
            &marshaled.session_id,
            marshaled.config.clone(),
            static_rules,
            marshaled.tgpp_context.clone(),
            marshaled.pdp_start_time,
        );
        session.request_number = marshaled.request_number;
        session.curr_state = marshaled.fsm_state;
        session.pdp_end_time = marshaled.pdp_end_time;
        session.subscriber_quota_state = marshaled.subscriber_quota_state;
        session.pending_event_triggers = marshaled.pending_event_triggers.clone();
        session.revalidation_time = marshaled.revalidation_time;
        session.session_level_key = marshaled.session_level_key.clone();
        for (mkey, monitor) in &marshaled.monitor_map {
            session.monitor_map.insert(mkey.clone(), Monitor::unmarshal(monitor));
        }
        for (key, grant) in &marshaled.credit_map {
            session.credit_map.insert(*key, ChargingGrant::unmarshal(grant));
        }
        session.active_static_rules = marshaled.static_rule_ids.clone();
        for rule in &marshaled.dynamic_rules {
            session.dynamic_rules.insert_rule(rule.clone());
        }
        for rule in &marshaled.gy_dynamic_rules {
            session.gy_dynamic_rules.insert_rule(rule.clone());
        }
        session.scheduled_static_rules = marshaled.scheduled_static_rules.clone();
        for rule in &marshaled.scheduled_dynamic_rules {
            session.scheduled_dynamic_rules.insert_rule(rule.clone());
        }
        session.rule_lifetimes = marshaled.rule_lifetimes.clone();
        session.active_restrict_rules = marshaled.restrict_rules.clone();
        for (policy_id, bearer_id) in &marshaled.bearer_id_by_policy {
            session.bearer_id_by_policy.insert(policy_id.clone(), *bearer_id);
        }
        session
    }

    pub fn marshal(&self) -> StoredSessionState {
        let mut credit_map: Vec<_> = self
            .credit_map
            .iter()
            .map(|(key, grant)| (*key, grant.marshal()))
            .collect();
        credit_map.sort_by_key(|(key, _)| (key.rating_group, key.service_identifier));

        let mut bearer_id_by_policy: Vec<_> = self
            .bearer_id_by_policy
            .iter()
            .map(|(policy_id, bearer_id)| (policy_id.clone(), *bearer_id))
            .collect();
        bearer_id_by_policy.sort_by(|a, b| a.0.rule_id.cmp(&b.0.rule_id));

        StoredSessionState {
            imsi: self.imsi.clone(),
            session_id: self.session_id.clone(),
            fsm_state: self.curr_state,
            config: self.config.clone(),
            subscriber_quota_state: self.subscriber_quota_state,
            tgpp_context: self.tgpp_context.clone(),
            request_number: self.request_number,
            pdp_start_time: self.pdp_start_time,
            pdp_end_time: self.pdp_end_time,
            pending_event_triggers: self.pending_event_triggers.clone(),
            revalidation_time: self.revalidation_time,
            bearer_id_by_policy,
            monitor_map: self
                .monitor_map
                .iter()
                .map(|(mkey, monitor)| (mkey.clone(), monitor.marshal()))
                .collect(),
            session_level_key: self.session_level_key.clone(),
            credit_map,
            static_rule_ids: self.active_static_rules.clone(),
            dynamic_rules: self.dynamic_rules.get_rules(),
            gy_dynamic_rules: self.gy_dynamic_rules.get_rules(),
            scheduled_static_rules: self.scheduled_static_rules.clone(),
            scheduled_dynamic_rules: self.scheduled_dynamic_rules.get_rules(),
            restrict_rules: self.active_restrict_rules.clone(),
            rule_lifetimes: self.rule_lifetimes.clone(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn get_imsi(&self) -> &str {
        &self.imsi
    }

    pub fn get_session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get_config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn get_state(&self) -> SessionFsmState {
        self.curr_state
    }

    pub fn is_active(&self) -> bool {
        self.curr_state == SessionFsmState::Active
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self.curr_state, SessionFsmState::Released | SessionFsmState::Terminated)
    }

    fn is_terminated(&self) -> bool {
        self.curr_state == SessionFsmState::Terminated
    }

    pub fn is_radius_cwf_session(&self) -> bool {
        self.config.common_context.rat_type == RatType::Wlan
    }

    pub fn get_request_number(&self) -> u32 {
        self.request_number
    }

    pub fn increment_request_number(&mut self, incr: u32) {
        self.request_number += incr;
    }

    pub fn get_pdp_start_time(&self) -> u64 {
        self.pdp_start_time
    }

    pub fn get_pdp_end_time(&self) -> u64 {
        self.pdp_end_time
    }

    pub fn set_pdp_end_time(&mut self, epoch: u64) {
        self.pdp_end_time = epoch;
    }

    pub fn get_subscriber_quota_state(&self) -> SubscriberQuotaState {
        self.subscriber_quota_state
    }

    pub fn set_subscriber_quota_state(
        &mut self,
        state: SubscriberQuotaState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.subscriber_quota_state = state;
        uc.updated_subscriber_quota_state = Some(state);
    }

    pub fn set_tgpp_context(&mut self, tgpp_context: TgppContext, uc: &mut SessionStateUpdateCriteria) {
        uc.updated_tgpp_context = Some(tgpp_context.clone());
        self.tgpp_context = tgpp_context;
    }

    pub fn set_fsm_state(&mut self, new_state: SessionFsmState, uc: &mut SessionStateUpdateCriteria) {
        if self.curr_state != new_state {
            log::debug!(
                "Session {} FSM state change from {:?} to {:?}",
                self.session_id,
                self.curr_state,
                new_state
            );
            self.curr_state = new_state;
            uc.updated_fsm_state = Some(new_state);
        }
    }

    pub fn mark_as_awaiting_termination(&mut self, uc: &mut SessionStateUpdateCriteria) {
        self.set_fsm_state(SessionFsmState::TerminationScheduled, uc);
    }

    pub fn get_session_info(&self) -> SessionInfo {
        SessionInfo {
            imsi: self.imsi.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            static_rules: self.active_static_rules.clone(),
            dynamic_rules: self.dynamic_rules.get_rules(),
            gy_dynamic_rules: self.gy_dynamic_rules.get_rules(),
            restrict_rules: self.active_restrict_rules.clone(),
            ambr: self.config.get_apn_ambr(),
        }
    }

    // ========================================================================
    // Rule bookkeeping
    // ========================================================================

    pub fn is_static_rule_installed(&self, rule_id: &str) -> bool {
        self.active_static_rules.iter().any(|id| id == rule_id)
    }

    pub fn is_static_rule_scheduled(&self, rule_id: &str) -> bool {
        self.scheduled_static_rules.contains(rule_id)
    }

    pub fn is_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.dynamic_rules.get_rule(rule_id).is_some()
    }

    pub fn is_dynamic_rule_scheduled(&self, rule_id: &str) -> bool {
        self.scheduled_dynamic_rules.get_rule(rule_id).is_some()
    }

    pub fn is_gy_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.gy_dynamic_rules.get_rule(rule_id).is_some()
    }

    pub fn is_restrict_rule_installed(&self, rule_id: &str) -> bool {
        self.active_restrict_rules.iter().any(|id| id == rule_id)
    }

    pub fn get_static_rules(&self) -> &Vec<String> {
        &self.active_static_rules
    }

    pub fn get_scheduled_static_rules(&self) -> &BTreeSet<String> {
        &self.scheduled_static_rules
    }

    pub fn get_restrict_rules(&self) -> &Vec<String> {
        &self.active_restrict_rules
    }

    pub fn get_dynamic_rules(&self) -> &DynamicRuleStore {
        &self.dynamic_rules
    }

    pub fn get_scheduled_dynamic_rules(&self) -> &DynamicRuleStore {
        &self.scheduled_dynamic_rules
    }

    pub fn get_gy_dynamic_rules(&self) -> &DynamicRuleStore {
        &self.gy_dynamic_rules
    }

    pub fn get_rule_lifetime(&self, rule_id: &str) -> Option<RuleLifetime> {
        self.rule_lifetimes.get(rule_id).copied()
    }

    /// Infer whether an installed rule is static or dynamic.
    pub fn get_policy_type(&self, rule_id: &str) -> Option<PolicyType> {
        if self.is_static_rule_installed(rule_id) {
            Some(PolicyType::Static)
        } else if self.is_dynamic_rule_installed(rule_id) {
            Some(PolicyType::Dynamic)
        } else {
            None
        }
    }

    pub fn insert_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() || self.is_dynamic_rule_installed(&rule.id) {
            return;
        }
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.dynamic_rules_to_install.push(rule.clone());
        self.dynamic_rules.insert_rule(rule);
    }

    pub fn insert_gy_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        if self.is_gy_dynamic_rule_installed(&rule.id) {
            log::debug!("Gy dynamic rule {} already installed", rule.id);
            return;
        }
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.gy_dynamic_rules_to_install.push(rule.clone());
        self.gy_dynamic_rules.insert_rule(rule);
    }

    pub fn activate_static_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() || self.is_static_rule_installed(rule_id) {
            return;
        }
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.active_static_rules.push(rule_id.to_string());
        uc.static_rules_to_install.insert(rule_id.to_string());
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    pub fn activate_restrict_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() || self.is_restrict_rule_installed(rule_id) {
            return;
        }
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.active_restrict_rules.push(rule_id.to_string());
        uc.restrict_rules_to_install.insert(rule_id.to_string());
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    pub fn remove_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        if self.is_terminated() {
            return None;
        }
        let removed = self.dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    pub fn remove_scheduled_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        if self.is_terminated() {
            return None;
        }
        let removed = self.scheduled_dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    pub fn remove_gy_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        if self.is_terminated() {
            return None;
        }
        let removed = self.gy_dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.gy_dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    pub fn deactivate_static_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        let Some(pos) = self.active_static_rules.iter().position(|id| id == rule_id) else {
            return false;
        };
        self.active_static_rules.remove(pos);
        uc.static_rules_to_uninstall.insert(rule_id.to_string());
        true
    }

    pub fn deactivate_scheduled_static_rule(
        &mut self,
        rule_id: &str,
        _uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.scheduled_static_rules.remove(rule_id)
    }

    pub fn deactivate_restrict_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        let Some(pos) = self.active_restrict_rules.iter().position(|id| id == rule_id) else {
            return false;
        };
        self.active_restrict_rules.remove(pos);
        uc.restrict_rules_to_uninstall.insert(rule_id.to_string());
        true
    }

    pub fn schedule_static_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
        uc.new_scheduled_static_rules.insert(rule_id.to_string());
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.scheduled_static_rules.insert(rule_id.to_string());
    }

    pub fn schedule_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_scheduled_dynamic_rules.push(rule.clone());
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        self.scheduled_dynamic_rules.insert_rule(rule);
    }

    pub fn install_scheduled_static_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        if !self.scheduled_static_rules.remove(rule_id) {
            log::error!("Cannot mark scheduled static rule {rule_id} installed: not scheduled");
            return;
        }
        uc.static_rules_to_install.insert(rule_id.to_string());
        self.active_static_rules.push(rule_id.to_string());
    }

    pub fn install_scheduled_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        let Some(rule) = self.scheduled_dynamic_rules.remove_rule(rule_id) else {
            log::error!("Cannot mark scheduled dynamic rule {rule_id} installed: not scheduled");
            return;
        };
        uc.dynamic_rules_to_install.push(rule.clone());
        self.dynamic_rules.insert_rule(rule);
    }

    pub fn get_static_rule_install(&self, rule_id: &str, lifetime: RuleLifetime) -> StaticRuleInstall {
        StaticRuleInstall {
            rule_id: rule_id.to_string(),
            activation_time: lifetime.activation_time,
            deactivation_time: lifetime.deactivation_time,
        }
    }

    pub fn get_dynamic_rule_install(
        &self,
        rule_id: &str,
        lifetime: RuleLifetime,
    ) -> DynamicRuleInstall {
        let policy_rule = self
            .dynamic_rules
            .get_rule(rule_id)
            .or_else(|| self.scheduled_dynamic_rules.get_rule(rule_id))
            .cloned()
            .unwrap_or_default();
        DynamicRuleInstall {
            policy_rule,
            activation_time: lifetime.activation_time,
            deactivation_time: lifetime.deactivation_time,
        }
    }

    /// Reconcile installed and scheduled rules against their lifetimes at
    /// wall-clock `current_time`. Going backwards in time is undefined.
    pub fn sync_rules_to_time(&mut self, current_time: i64, uc: &mut SessionStateUpdateCriteria) {
        if self.is_terminated() {
            return;
        }
        for rule_id in self.active_static_rules.clone() {
            if self.rule_should_be_deactivated(&rule_id, current_time) {
                self.deactivate_static_rule(&rule_id, uc);
            }
        }
        for rule_id in self.scheduled_static_rules.clone() {
            if self.rule_should_be_active(&rule_id, current_time) {
                self.install_scheduled_static_rule(&rule_id, uc);
            } else if self.rule_should_be_deactivated(&rule_id, current_time) {
                self.scheduled_static_rules.remove(&rule_id);
                uc.static_rules_to_uninstall.insert(rule_id);
            }
        }
        for rule_id in self.dynamic_rules.get_rule_ids() {
            if self.rule_should_be_deactivated(&rule_id, current_time) {
                self.remove_dynamic_rule(&rule_id, uc);
            }
        }
        for rule_id in self.scheduled_dynamic_rules.get_rule_ids() {
            if self.rule_should_be_active(&rule_id, current_time) {
                self.install_scheduled_dynamic_rule(&rule_id, uc);
            } else if self.rule_should_be_deactivated(&rule_id, current_time) {
                self.remove_scheduled_dynamic_rule(&rule_id, uc);
            }
        }
    }

    fn rule_should_be_active(&self, rule_id: &str, time: i64) -> bool {
        self.rule_lifetimes
            .get(rule_id)
            .map_or(false, |lifetime| lifetime.should_be_active(time))
    }

    fn rule_should_be_deactivated(&self, rule_id: &str, time: i64) -> bool {
        self.rule_lifetimes
            .get(rule_id)
            .map_or(false, |lifetime| lifetime.should_be_deactivated(time))
    }

    pub fn total_monitored_rules_count(&self) -> u32 {
        let monitored_static = self
            .active_static_rules
            .iter()
            .filter(|id| self.static_rules.get_monitoring_key_for_rule_id(id).is_some())
            .count() as u32;
        self.dynamic_rules.monitored_rules_count() + monitored_static
    }

    pub fn active_monitored_rules_exist(&self) -> bool {
        self.total_monitored_rules_count() > 0
    }

    // ========================================================================
    // Usage accounting
    // ========================================================================

    /// Attribute a usage record to the rule's charging and monitoring
    /// grants. Usage also feeds the session-level monitor when that is a
    /// different key.
    pub fn add_rule_usage(
        &mut self,
        rule_id: &str,
        used_tx: u64,
        used_rx: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        let charging_key = self
            .dynamic_rules
            .get_charging_key_for_rule_id(rule_id)
            .or_else(|| self.static_rules.get_charging_key_for_rule_id(rule_id));
        if let Some(key) = charging_key {
            if self.credit_map.contains_key(&key) {
                log::debug!("Adding {used_tx}/{used_rx} bytes to charging key {key} for {rule_id}");
                self.ensure_credit_uc(&key, uc);
                if let (Some(credit_uc), Some(grant)) =
                    (uc.charging_credit_map.get_mut(&key), self.credit_map.get_mut(&key))
                {
                    grant.credit.add_used_credit(used_tx, used_rx, credit_uc);
                    if grant.should_deactivate_service() {
                        grant.set_service_state(ServiceState::NeedsDeactivation, credit_uc);
                    }
                }
            } else {
                log::debug!("Charging key {key} not tracked, dropping usage for {rule_id}");
            }
        }
        let monitoring_key = self
            .dynamic_rules
            .get_monitoring_key_for_rule_id(rule_id)
            .or_else(|| self.static_rules.get_monitoring_key_for_rule_id(rule_id));
        if let Some(mkey) = &monitoring_key {
            log::debug!("Adding {used_tx}/{used_rx} bytes to monitoring key {mkey} for {rule_id}");
            self.add_to_monitor(mkey, used_tx, used_rx, uc);
        }
        let session_level_key = self.session_level_key.clone();
        if !session_level_key.is_empty() && monitoring_key.as_deref() != Some(&session_level_key) {
            self.add_to_monitor(&session_level_key, used_tx, used_rx, uc);
        }
    }

    /// Collate unique charging/monitoring keys across installed rules and
    /// sum their used counters.
    pub fn get_total_credit_usage(&self) -> TotalCreditUsage {
        let mut used_charging_keys: HashSet<CreditKey> = HashSet::new();
        let mut used_monitoring_keys: HashSet<String> = HashSet::new();

        for rule_id in &self.active_static_rules {
            if let Some(key) = self.static_rules.get_charging_key_for_rule_id(rule_id) {
                used_charging_keys.insert(key);
            }
            if let Some(mkey) = self.static_rules.get_monitoring_key_for_rule_id(rule_id) {
                used_monitoring_keys.insert(mkey);
            }
        }
        for rule_id in self.dynamic_rules.get_rule_ids() {
            if let Some(key) = self.dynamic_rules.get_charging_key_for_rule_id(&rule_id) {
                used_charging_keys.insert(key);
            }
            if let Some(mkey) = self.dynamic_rules.get_monitoring_key_for_rule_id(&rule_id) {
                used_monitoring_keys.insert(mkey);
            }
        }

        let mut usage = TotalCreditUsage::default();
        for mkey in used_monitoring_keys {
            usage.monitoring_tx += self.get_monitor(&mkey, Bucket::UsedTx);
            usage.monitoring_rx += self.get_monitor(&mkey, Bucket::UsedRx);
        }
        for key in used_charging_keys {
            usage.charging_tx += self.get_charging_credit(&key, Bucket::UsedTx);
            usage.charging_rx += self.get_charging_credit(&key, Bucket::UsedRx);
        }
        usage
    }

    // ========================================================================
    // Charging credits
    // ========================================================================

    fn ensure_credit_uc(&self, key: &CreditKey, uc: &mut SessionStateUpdateCriteria) {
        if !uc.charging_credit_map.contains_key(key) {
            if let Some(grant) = self.credit_map.get(key) {
                uc.charging_credit_map.insert(*key, grant.get_update_criteria());
            }
        }
    }

    pub fn get_charging_credit(&self, key: &CreditKey, bucket: Bucket) -> u64 {
        self.credit_map
            .get(key)
            .map_or(0, |grant| grant.credit.get_credit(bucket))
    }

    pub fn is_credit_in_final_unit_state(&self, key: &CreditKey) -> bool {
        self.credit_map.get(key).map_or(false, |grant| {
            grant.service_state == ServiceState::Redirected
                || grant.service_state == ServiceState::Restricted
        })
    }

    pub fn set_charging_credit(
        &mut self,
        key: CreditKey,
        grant: ChargingGrant,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        uc.charging_credit_to_install.insert(key, grant.marshal());
        self.credit_map.insert(key, grant);
    }

    /// Create or refresh a charging grant from a controller response.
    /// Returns whether traffic for the key is allowed afterwards.
    pub fn receive_charging_credit(
        &mut self,
        update: &CreditUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        let key = update.credit_key();
        if !self.credit_map.contains_key(&key) {
            return self.init_charging_credit(update, uc);
        }
        self.ensure_credit_uc(&key, uc);
        let (Some(credit_uc), Some(grant)) =
            (uc.charging_credit_map.get_mut(&key), self.credit_map.get_mut(&key))
        else {
            return false;
        };
        if !update.success {
            log::debug!("{} unsuccessful credit update for {key}", self.session_id);
            grant.credit.mark_failure(update.result_code, credit_uc);
            if grant.should_deactivate_service() {
                grant.set_service_state(ServiceState::NeedsDeactivation, credit_uc);
            }
            return false;
        }
        log::info!("{} received charging credit for {key}", self.session_id);
        grant.receive_charging_grant(&update.credit, credit_uc);
        if grant.reauth_state == ReAuthState::Processing {
            grant.set_reauth_state(ReAuthState::NotNeeded, credit_uc);
        }
        if !grant.credit.is_quota_exhausted(1.0) && grant.service_state != ServiceState::Enabled {
            log::info!("Quota available again for {key}, activating service");
            grant.set_service_state(ServiceState::NeedsActivation, credit_uc);
        }
        Self::contains_credit(&update.credit.granted_units) || Self::is_infinite_credit(update)
    }

    fn init_charging_credit(
        &mut self,
        update: &CreditUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if !update.success {
            log::error!(
                "Credit init failed for {} and charging key {}",
                self.imsi,
                update.credit_key()
            );
            return false;
        }
        log::info!("{} initialized charging credit for {}", self.session_id, update.credit_key());
        let mut grant = ChargingGrant::new(update.limit_type);
        let mut scratch = SessionCreditUpdateCriteria::default();
        grant.receive_charging_grant(&update.credit, &mut scratch);
        uc.charging_credit_to_install.insert(update.credit_key(), grant.marshal());
        self.credit_map.insert(update.credit_key(), grant);
        Self::contains_credit(&update.credit.granted_units) || Self::is_infinite_credit(update)
    }

    fn contains_credit(gsu: &GrantedUnits) -> bool {
        (gsu.total.is_valid && gsu.total.volume > 0)
            || (gsu.tx.is_valid && gsu.tx.volume > 0)
            || (gsu.rx.is_valid && gsu.rx.volume > 0)
    }

    fn is_infinite_credit(update: &CreditUpdateResponse) -> bool {
        matches!(
            update.limit_type,
            CreditLimitType::InfiniteMetered | CreditLimitType::InfiniteUnmetered
        )
    }

    pub fn reset_reporting_charging_credit(
        &mut self,
        key: &CreditKey,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        self.ensure_credit_uc(key, uc);
        let (Some(credit_uc), Some(grant)) =
            (uc.charging_credit_map.get_mut(key), self.credit_map.get_mut(key))
        else {
            log::error!("Cannot reset reporting for {} and key {key}: not found", self.imsi);
            return false;
        };
        grant.credit.reset_reporting_credit(credit_uc);
        true
    }

    /// Flag one charging key for reauthorization. Keys mid-report are
    /// skipped; an unknown key gets a disabled placeholder grant.
    pub fn reauth_key(&mut self, key: CreditKey, uc: &mut SessionStateUpdateCriteria) -> ReAuthResult {
        if self.is_terminated() {
            return ReAuthResult::UpdateNotNeeded;
        }
        if let Some(grant) = self.credit_map.get_mut(&key) {
            if grant.credit.is_reporting() {
                return ReAuthResult::UpdateNotNeeded;
            }
            let mut credit_uc = grant.get_update_criteria();
            grant.set_reauth_state(ReAuthState::Required, &mut credit_uc);
            uc.charging_credit_map.insert(key, credit_uc);
            return ReAuthResult::UpdateInitiated;
        }
        // unknown key: provision a disabled grant pending reauth
        let mut grant = ChargingGrant::default();
        grant.service_state = ServiceState::Disabled;
        grant.reauth_state = ReAuthState::Required;
        uc.charging_credit_to_install.insert(key, grant.marshal());
        self.credit_map.insert(key, grant);
        ReAuthResult::UpdateInitiated
    }

    pub fn reauth_all(&mut self, uc: &mut SessionStateUpdateCriteria) -> ReAuthResult {
        if self.is_terminated() {
            return ReAuthResult::UpdateNotNeeded;
        }
        let mut result = ReAuthResult::UpdateNotNeeded;
        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in keys {
            let Some(grant) = self.credit_map.get_mut(&key) else { continue };
            if grant.credit.is_reporting() {
                continue;
            }
            let mut credit_uc = grant.get_update_criteria();
            grant.set_reauth_state(ReAuthState::Required, &mut credit_uc);
            uc.charging_credit_map.insert(key, credit_uc);
            result = ReAuthResult::UpdateInitiated;
        }
        result
    }

    // ========================================================================
    // Monitors
    // ========================================================================

    fn ensure_monitor_uc(&self, mkey: &str, uc: &mut SessionStateUpdateCriteria) {
        if !uc.monitor_credit_map.contains_key(mkey) {
            if let Some(monitor) = self.monitor_map.get(mkey) {
                uc.monitor_credit_map
                    .insert(mkey.to_string(), monitor.credit.get_update_criteria());
            }
        }
    }

    pub fn get_monitor(&self, mkey: &str, bucket: Bucket) -> u64 {
        self.monitor_map
            .get(mkey)
            .map_or(0, |monitor| monitor.credit.get_credit(bucket))
    }

    pub fn get_session_level_key(&self) -> &str {
        &self.session_level_key
    }

    pub fn set_session_level_key(&mut self, new_key: &str) {
        self.session_level_key = new_key.to_string();
    }

    pub fn set_monitor(&mut self, mkey: &str, monitor: Monitor, uc: &mut SessionStateUpdateCriteria) {
        uc.monitor_credit_to_install.insert(mkey.to_string(), monitor.marshal());
        self.monitor_map.insert(mkey.to_string(), monitor);
    }

    /// Create or refresh a monitor from a controller response. Responses
    /// without a credit payload only carry event-trigger info and are
    /// accepted as-is.
    pub fn receive_monitor(
        &mut self,
        update: &UsageMonitoringUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        let Some(credit) = &update.credit else {
            log::info!("Monitoring response without credit payload, nothing to install");
            return true;
        };
        if update.success && credit.level == MonitoringLevel::SessionLevel {
            self.update_session_level_key(credit.monitoring_key.clone(), credit.action, uc);
        }
        let mkey = credit.monitoring_key.clone();
        if uc.monitor_credit_map.get(&mkey).map_or(false, |m| m.deleted) {
            // late refill for a monitor already slated for deletion
            log::debug!("Ignoring monitor update for {mkey}: marked for deletion");
            return false;
        }
        if !self.monitor_map.contains_key(&mkey) {
            return self.init_new_monitor(update, uc);
        }
        self.ensure_monitor_uc(&mkey, uc);
        if update.success && credit.action == MonitorAction::Disable {
            log::info!("Monitor {mkey} disabled by controller, removing");
            if let Some(credit_uc) = uc.monitor_credit_map.get_mut(&mkey) {
                credit_uc.deleted = true;
            }
            self.monitor_map.remove(&mkey);
            if self.session_level_key == mkey {
                self.session_level_key.clear();
                uc.updated_session_level_key = Some(String::new());
            }
            return true;
        }
        let (Some(credit_uc), Some(monitor)) =
            (uc.monitor_credit_map.get_mut(&mkey), self.monitor_map.get_mut(&mkey))
        else {
            return false;
        };
        if !update.success {
            monitor.credit.mark_failure(update.result_code, credit_uc);
            return false;
        }
        log::info!("{} received monitor credit for {mkey}", self.session_id);
        monitor.credit.receive_credit(&credit.granted_units, credit_uc);
        true
    }

    fn init_new_monitor(
        &mut self,
        update: &UsageMonitoringUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let Some(credit) = &update.credit else { return false };
        if !update.success {
            log::error!(
                "Monitor init failed for {} and key {}",
                self.imsi,
                credit.monitoring_key
            );
            return false;
        }
        if credit.action == MonitorAction::Disable {
            log::warn!(
                "Monitor init arrived disabled for {} and key {}",
                self.imsi,
                credit.monitoring_key
            );
            return false;
        }
        log::debug!("{} initialized monitor for {}", self.session_id, credit.monitoring_key);
        let mut monitor = Monitor::new(credit.level);
        // validity time and final units do not apply to monitors
        let mut scratch = SessionCreditUpdateCriteria::default();
        monitor.credit.receive_credit(&credit.granted_units, &mut scratch);
        uc.monitor_credit_to_install
            .insert(credit.monitoring_key.clone(), monitor.marshal());
        self.monitor_map.insert(credit.monitoring_key.clone(), monitor);
        true
    }

    fn update_session_level_key(
        &mut self,
        new_key: String,
        action: MonitorAction,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if !self.session_level_key.is_empty() && self.session_level_key != new_key {
            log::info!(
                "Session level monitoring key updated from {} to {}",
                self.session_level_key,
                new_key
            );
        }
        self.session_level_key = if action == MonitorAction::Disable { String::new() } else { new_key };
        uc.updated_session_level_key = Some(self.session_level_key.clone());
    }

    /// Accumulate usage into one monitor, or delete it when it ran dry
    /// with no refill in sight.
    pub fn add_to_monitor(
        &mut self,
        mkey: &str,
        used_tx: u64,
        used_rx: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if self.is_terminated() || !self.monitor_map.contains_key(mkey) {
            log::debug!("Monitoring key {mkey} not tracked, dropping usage");
            return false;
        }
        self.ensure_monitor_uc(mkey, uc);
        let should_delete = self
            .monitor_map
            .get(mkey)
            .map_or(false, |monitor| monitor.should_delete_monitor());
        if should_delete {
            log::info!("Erasing monitor {mkey}: quota exhausted with no refill");
            if let Some(monitor) = self.monitor_map.get(mkey) {
                if monitor.level == MonitoringLevel::SessionLevel {
                    self.session_level_key.clear();
                    uc.updated_session_level_key = Some(String::new());
                }
            }
            if let Some(credit_uc) = uc.monitor_credit_map.get_mut(mkey) {
                credit_uc.deleted = true;
            }
            self.monitor_map.remove(mkey);
            return true;
        }
        if let (Some(credit_uc), Some(monitor)) =
            (uc.monitor_credit_map.get_mut(mkey), self.monitor_map.get_mut(mkey))
        {
            monitor.credit.add_used_credit(used_tx, used_rx, credit_uc);
        }
        true
    }

    pub fn reset_reporting_monitor(&mut self, mkey: &str, uc: &mut SessionStateUpdateCriteria) -> bool {
        self.ensure_monitor_uc(mkey, uc);
        let (Some(credit_uc), Some(monitor)) =
            (uc.monitor_credit_map.get_mut(mkey), self.monitor_map.get_mut(mkey))
        else {
            log::error!("Cannot reset reporting for {} and monitor {mkey}: not found", self.imsi);
            return false;
        };
        monitor.credit.reset_reporting_credit(credit_uc);
        true
    }

    // ========================================================================
    // Event triggers
    // ========================================================================

    pub fn get_event_triggers(&self) -> &HashMap<EventTrigger, EventTriggerState> {
        &self.pending_event_triggers
    }

    pub fn get_revalidation_time(&self) -> i64 {
        self.revalidation_time
    }

    pub fn set_revalidation_time(&mut self, time: i64, uc: &mut SessionStateUpdateCriteria) {
        self.revalidation_time = time;
        uc.revalidation_time = Some(time);
    }

    pub fn add_new_event_trigger(&mut self, trigger: EventTrigger, uc: &mut SessionStateUpdateCriteria) {
        log::info!("Event trigger {trigger:?} pending for {}", self.session_id);
        self.set_event_trigger(trigger, EventTriggerState::Pending, uc);
    }

    pub fn mark_event_trigger_as_triggered(
        &mut self,
        trigger: EventTrigger,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.pending_event_triggers.get(&trigger) != Some(&EventTriggerState::Pending) {
            log::warn!("Event trigger {trigger:?} is not pending for {}", self.session_id);
        }
        log::info!("Event trigger {trigger:?} ready to report for {}", self.session_id);
        self.set_event_trigger(trigger, EventTriggerState::Ready, uc);
    }

    pub fn remove_event_trigger(&mut self, trigger: EventTrigger, uc: &mut SessionStateUpdateCriteria) {
        log::info!("Event trigger {trigger:?} removed for {}", self.session_id);
        self.pending_event_triggers.remove(&trigger);
        uc.pending_event_triggers.insert(trigger, EventTriggerState::Cleared);
    }

    pub fn set_event_trigger(
        &mut self,
        trigger: EventTrigger,
        state: EventTriggerState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.pending_event_triggers.insert(trigger, state);
        uc.pending_event_triggers.insert(trigger, state);
    }

    // ========================================================================
    // Update collection
    // ========================================================================

    /// Collect every due charging, monitoring, and event-trigger update
    /// for this session, plus the service actions the enforcer must take.
    /// Only ACTIVE sessions produce anything.
    pub fn get_updates(
        &mut self,
        update_request_out: &mut UpdateSessionRequest,
        actions_out: &mut Vec<ServiceAction>,
        uc: &mut SessionStateUpdateCriteria,
        usage_reporting_threshold: f64,
    ) {
        if self.curr_state != SessionFsmState::Active {
            return;
        }
        self.get_charging_updates(update_request_out, actions_out, uc, usage_reporting_threshold);
        self.get_monitor_updates(update_request_out, uc, usage_reporting_threshold);
        self.get_event_trigger_updates(update_request_out, uc);
    }

    fn get_charging_updates(
        &mut self,
        update_request_out: &mut UpdateSessionRequest,
        actions_out: &mut Vec<ServiceAction>,
        uc: &mut SessionStateUpdateCriteria,
        usage_reporting_threshold: f64,
    ) {
        enum Decision {
            Nothing,
            Usage(CreditUsage),
            Action(ServiceAction),
        }

        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in keys {
            self.ensure_credit_uc(&key, uc);
            let decision = {
                let (Some(credit_uc), Some(grant)) =
                    (uc.charging_credit_map.get_mut(&key), self.credit_map.get_mut(&key))
                else {
                    continue;
                };
                let action_type = grant.get_action(credit_uc);
                match action_type {
                    ServiceActionType::ContinueService => {
                        match grant.get_update_type(usage_reporting_threshold) {
                            None => Decision::Nothing,
                            Some(update_type) => {
                                if update_type == CreditUsageUpdateType::ReauthRequired {
                                    grant.set_reauth_state(ReAuthState::Processing, credit_uc);
                                }
                                let mut usage =
                                    grant.get_credit_usage(update_type, credit_uc, false);
                                usage.charging_key = key.rating_group;
                                usage.service_identifier = key.service_identifier;
                                Decision::Usage(usage)
                            }
                        }
                    }
                    ServiceActionType::Redirect => {
                        if grant.service_state == ServiceState::Redirected {
                            log::debug!("Redirection already active for {key}");
                            Decision::Nothing
                        } else {
                            grant.set_service_state(ServiceState::Redirected, credit_uc);
                            Decision::Action(ServiceAction {
                                action_type,
                                redirect_server: Some(
                                    grant.final_action_info.redirect_server.clone(),
                                ),
                                ..Default::default()
                            })
                        }
                    }
                    ServiceActionType::RestrictAccess => {
                        if grant.service_state == ServiceState::Restricted {
                            log::debug!("Restriction already active for {key}");
                            Decision::Nothing
                        } else {
                            grant.set_service_state(ServiceState::Restricted, credit_uc);
                            Decision::Action(ServiceAction {
                                action_type,
                                restrict_rule_ids: grant.final_action_info.restrict_rules.clone(),
                                ..Default::default()
                            })
                        }
                    }
                    ServiceActionType::ActivateService => Decision::Action(ServiceAction {
                        action_type,
                        ambr: self.config.get_apn_ambr(),
                        ..Default::default()
                    }),
                    ServiceActionType::TerminateService => {
                        Decision::Action(ServiceAction { action_type, ..Default::default() })
                    }
                }
            };
            match decision {
                Decision::Nothing => {}
                Decision::Usage(usage) => {
                    self.request_number += 1;
                    uc.request_number_increment += 1;
                    log::debug!(
                        "{} rating group {key} reporting {:?} with request number {}",
                        self.imsi,
                        usage.update_type,
                        self.request_number
                    );
                    let req = self.make_credit_usage_update_req(usage);
                    update_request_out.updates.push(req);
                }
                Decision::Action(mut action) => {
                    log::debug!("{} rating group {key} action {:?}", self.imsi, action.action_type);
                    action.credit_key = key;
                    action.imsi = self.imsi.clone();
                    action.session_id = self.session_id.clone();
                    action.ip_addr = self.config.common_context.ue_ipv4.clone();
                    action.rule_ids = self.static_rules.get_rule_ids_for_charging_key(&key);
                    action.rule_definitions =
                        self.dynamic_rules.get_rule_definitions_for_charging_key(&key);
                    actions_out.push(action);
                }
            }
        }
    }

    fn get_monitor_updates(
        &mut self,
        update_request_out: &mut UpdateSessionRequest,
        uc: &mut SessionStateUpdateCriteria,
        usage_reporting_threshold: f64,
    ) {
        let keys: Vec<String> = self.monitor_map.keys().cloned().collect();
        for mkey in keys {
            let Some(monitor) = self.monitor_map.get(&mkey) else { continue };
            if monitor.credit.is_reporting() {
                continue;
            }
            let partially_exhausted =
                monitor.credit.is_quota_exhausted(usage_reporting_threshold);
            let totally_exhausted = monitor.credit.is_quota_exhausted(1.0);
            if !partially_exhausted
                || (!totally_exhausted && monitor.credit.current_grant_contains_zero())
            {
                // not enough consumed yet, or an empty grant still draining
                continue;
            }
            self.ensure_monitor_uc(&mkey, uc);
            let (usage, level) = {
                let (Some(credit_uc), Some(monitor)) =
                    (uc.monitor_credit_map.get_mut(&mkey), self.monitor_map.get_mut(&mkey))
                else {
                    continue;
                };
                (monitor.credit.get_usage_for_reporting(credit_uc), monitor.level)
            };
            self.request_number += 1;
            uc.request_number_increment += 1;
            log::debug!(
                "Session {} monitoring key {mkey} reporting with request number {}",
                self.session_id,
                self.request_number
            );
            let mut req = self.make_usage_monitor_request_base();
            req.update = Some(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
            req.event_trigger = Some(EventTrigger::UsageReport);
            update_request_out.usage_monitors.push(req);
        }
    }

    fn get_event_trigger_updates(
        &mut self,
        update_request_out: &mut UpdateSessionRequest,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.pending_event_triggers.get(&EventTrigger::RevalidationTimeout)
            != Some(&EventTriggerState::Ready)
        {
            return;
        }
        self.request_number += 1;
        uc.request_number_increment += 1;
        log::debug!(
            "Session {} reporting REVALIDATION_TIMEOUT with request number {}",
            self.session_id,
            self.request_number
        );
        let mut req = self.make_usage_monitor_request_base();
        req.event_trigger = Some(EventTrigger::RevalidationTimeout);
        update_request_out.usage_monitors.push(req);
        self.remove_event_trigger(EventTrigger::RevalidationTimeout, uc);
    }

    fn make_usage_monitor_request_base(&self) -> UsageMonitoringUpdateRequest {
        UsageMonitoringUpdateRequest {
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            sid: self.imsi.clone(),
            ue_ipv4: self.config.common_context.ue_ipv4.clone(),
            rat_type: self.config.common_context.rat_type,
            hardware_addr: self
                .config
                .wlan_context()
                .map(|wlan| wlan.mac_addr.clone())
                .unwrap_or_default(),
            tgpp_ctx: self.tgpp_context.clone(),
            update: None,
            event_trigger: None,
        }
    }

    fn make_credit_usage_update_req(&self, usage: CreditUsage) -> CreditUsageUpdate {
        let common = &self.config.common_context;
        let mut req = CreditUsageUpdate {
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            sid: self.imsi.clone(),
            msisdn: common.msisdn.clone(),
            ue_ipv4: common.ue_ipv4.clone(),
            apn: common.apn.clone(),
            rat_type: common.rat_type,
            tgpp_ctx: self.tgpp_context.clone(),
            usage,
            ..Default::default()
        };
        if let Some(lte) = self.config.lte_context() {
            req.spgw_ipv4 = lte.spgw_ipv4.clone();
            req.imei = lte.imei.clone();
            req.plmn_id = lte.plmn_id.clone();
            req.imsi_plmn_id = lte.imsi_plmn_id.clone();
            req.user_location = lte.user_location.clone();
        } else if let Some(wlan) = self.config.wlan_context() {
            req.hardware_addr = wlan.mac_addr.clone();
        }
        req
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Finalize the session: set the FSM to TERMINATED, bundle every
    /// remaining usage into a terminate request, and submit it. ACTIVE
    /// sessions refuse; TERMINATED sessions no-op.
    pub fn complete_termination(
        &mut self,
        reporter: &dyn SessionReporter,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        match self.curr_state {
            SessionFsmState::Active => {
                log::error!(
                    "{} unexpected ACTIVE state while completing termination, refusing",
                    self.session_id
                );
                return;
            }
            SessionFsmState::Terminated => return,
            SessionFsmState::Released => {
                log::info!(
                    "{} forcefully terminating session, pipeline never confirmed rule removal",
                    self.session_id
                );
            }
            SessionFsmState::TerminationScheduled => {}
        }
        self.set_fsm_state(SessionFsmState::Terminated, uc);
        let req = self.make_termination_request(uc);
        if let Err(e) = reporter.report_terminate_session(&req) {
            log::error!("Failed to report termination for {}: {e}", self.session_id);
        }
    }

    fn make_termination_request(&mut self, uc: &mut SessionStateUpdateCriteria) -> SessionTerminateRequest {
        let common = &self.config.common_context;
        let mut req = SessionTerminateRequest {
            sid: self.imsi.clone(),
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            ue_ipv4: common.ue_ipv4.clone(),
            msisdn: common.msisdn.clone(),
            apn: common.apn.clone(),
            rat_type: common.rat_type,
            tgpp_ctx: self.tgpp_context.clone(),
            ..Default::default()
        };
        if let Some(lte) = self.config.lte_context() {
            req.spgw_ipv4 = lte.spgw_ipv4.clone();
            req.imei = lte.imei.clone();
            req.plmn_id = lte.plmn_id.clone();
            req.imsi_plmn_id = lte.imsi_plmn_id.clone();
            req.user_location = lte.user_location.clone();
        } else if let Some(wlan) = self.config.wlan_context() {
            req.hardware_addr = wlan.mac_addr.clone();
        }

        let monitor_keys: Vec<String> = self.monitor_map.keys().cloned().collect();
        for mkey in monitor_keys {
            self.ensure_monitor_uc(&mkey, uc);
            let (Some(credit_uc), Some(monitor)) =
                (uc.monitor_credit_map.get_mut(&mkey), self.monitor_map.get_mut(&mkey))
            else {
                continue;
            };
            let usage = monitor.credit.get_all_unreported_usage_for_reporting(credit_uc);
            req.monitor_usages.push(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level: monitor.level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
        }
        let credit_keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in credit_keys {
            self.ensure_credit_uc(&key, uc);
            let (Some(credit_uc), Some(grant)) =
                (uc.charging_credit_map.get_mut(&key), self.credit_map.get_mut(&key))
            else {
                continue;
            };
            let mut usage =
                grant.get_credit_usage(CreditUsageUpdateType::Terminated, credit_uc, true);
            usage.charging_key = key.rating_group;
            usage.service_identifier = key.service_identifier;
            req.credit_usages.push(usage);
        }
        req
    }

    // ========================================================================
    // Declarative rule sets
    // ========================================================================

    /// Diff a desired rule set against the current state, producing
    /// installs for rules we miss and uninstalls for extras.
    pub fn apply_session_rule_set(
        &mut self,
        rule_set: &RuleSetToApply,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        self.apply_session_static_rule_set(
            &rule_set.static_rules,
            rules_to_activate,
            rules_to_deactivate,
            uc,
        );
        self.apply_session_dynamic_rule_set(
            &rule_set.dynamic_rules,
            rules_to_activate,
            rules_to_deactivate,
            uc,
        );
    }

    fn apply_session_static_rule_set(
        &mut self,
        static_rules: &BTreeSet<String>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        // the rule-set interface carries no scheduling info
        let lifetime = RuleLifetime::always();
        for rule_id in static_rules {
            if !self.is_static_rule_installed(rule_id) {
                log::info!("Installing static rule {rule_id} for {}", self.session_id);
                self.activate_static_rule(rule_id, lifetime, uc);
                rules_to_activate.static_rules.push(rule_id.clone());
            }
        }
        let to_remove: Vec<String> = self
            .active_static_rules
            .iter()
            .filter(|id| !static_rules.contains(*id))
            .cloned()
            .collect();
        for rule_id in to_remove {
            log::info!("Removing static rule {rule_id} for {}", self.session_id);
            self.deactivate_static_rule(&rule_id, uc);
            rules_to_deactivate.static_rules.push(rule_id);
        }
    }

    fn apply_session_dynamic_rule_set(
        &mut self,
        dynamic_rules: &HashMap<String, PolicyRule>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let lifetime = RuleLifetime::always();
        for (rule_id, rule) in dynamic_rules {
            if !self.is_dynamic_rule_installed(rule_id) {
                log::info!("Installing dynamic rule {rule_id} for {}", self.session_id);
                self.insert_dynamic_rule(rule.clone(), lifetime, uc);
                rules_to_activate.dynamic_rules.push(rule.clone());
            }
        }
        for rule in self.dynamic_rules.get_rules() {
            if !dynamic_rules.contains_key(&rule.id) {
                log::info!("Removing dynamic rule {} for {}", rule.id, self.session_id);
                self.remove_dynamic_rule(&rule.id, uc);
                rules_to_deactivate.dynamic_rules.push(rule);
            }
        }
    }

    // ========================================================================
    // Bearer management
    // ========================================================================

    /// Compute dedicated-bearer work for LTE sessions: creation for
    /// activated policies with a non-default QCI, deletion for
    /// deactivated policies with an existing bearer mapping.
    pub fn get_dedicated_bearer_updates(
        &mut self,
        rules_to_activate: &RulesToProcess,
        rules_to_deactivate: &RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) -> BearerUpdate {
        let mut update = BearerUpdate::default();
        for rule_id in &rules_to_activate.static_rules {
            self.update_bearer_creation_req(PolicyType::Static, rule_id, &mut update);
        }
        for rule in &rules_to_activate.dynamic_rules {
            self.update_bearer_creation_req(PolicyType::Dynamic, &rule.id, &mut update);
        }
        for rule_id in &rules_to_deactivate.static_rules {
            self.update_bearer_deletion_req(PolicyType::Static, rule_id, &mut update, uc);
        }
        for rule in &rules_to_deactivate.dynamic_rules {
            self.update_bearer_deletion_req(PolicyType::Dynamic, &rule.id, &mut update, uc);
        }
        update
    }

    fn policy_has_qos(&self, policy_type: PolicyType, rule_id: &str) -> Option<PolicyRule> {
        let rule = match policy_type {
            PolicyType::Static => self.static_rules.get_rule(rule_id),
            PolicyType::Dynamic => self.dynamic_rules.get_rule(rule_id).cloned(),
        };
        rule.filter(|r| r.has_qos())
    }

    fn update_bearer_creation_req(
        &mut self,
        policy_type: PolicyType,
        rule_id: &str,
        update: &mut BearerUpdate,
    ) {
        let Some(lte) = self.config.lte_context() else { return };
        if self.bearer_id_by_policy.contains_key(&PolicyId::new(policy_type, rule_id)) {
            return; // policy already has a bearer
        }
        let Some(rule) = self.policy_has_qos(policy_type, rule_id) else { return };
        let Some(qos_info) = lte.qos_info else { return };
        let rule_qci = rule.qos.map(|q| q.qci).unwrap_or_default();
        if rule_qci == qos_info.qos_class_id {
            // covered by the default bearer
            return;
        }
        let req = update.create_req.get_or_insert_with(|| CreateBearerRequest {
            sid: self.config.common_context.sid.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            link_bearer_id: lte.bearer_id,
            policy_rules: Vec::new(),
        });
        req.policy_rules.push(rule);
        // the policy-to-bearer mapping is recorded once the access
        // network confirms the creation
    }

    fn update_bearer_deletion_req(
        &mut self,
        policy_type: PolicyType,
        rule_id: &str,
        update: &mut BearerUpdate,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let Some(lte) = self.config.lte_context() else { return };
        let link_bearer_id = lte.bearer_id;
        let policy_id = PolicyId::new(policy_type, rule_id);
        let Some(bearer_id) = self.bearer_id_by_policy.remove(&policy_id) else { return };
        uc.updated_bearer_id_by_policy = Some(self.bearer_id_by_policy.clone());
        let req = update.delete_req.get_or_insert_with(|| DeleteBearerRequest {
            sid: self.config.common_context.sid.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            link_bearer_id,
            eps_bearer_ids: Vec::new(),
        });
        req.eps_bearer_ids.push(bearer_id);
    }

    /// Record the policy-to-bearer association once the access network
    /// confirms the bearer. Requests carrying bearer id 0 are refusals
    /// and are handled by the enforcer, not here.
    pub fn bind_policy_to_bearer(
        &mut self,
        request: &PolicyBearerBindingRequest,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_terminated() {
            return;
        }
        let rule_id = &request.policy_rule_id;
        let Some(policy_type) = self.get_policy_type(rule_id) else {
            log::debug!("Policy {rule_id} not found while binding to bearer {}", request.bearer_id);
            return;
        };
        log::info!(
            "{} policy {rule_id} now tied to bearer {}",
            self.session_id,
            request.bearer_id
        );
        self.bearer_id_by_policy
            .insert(PolicyId::new(policy_type, rule_id), request.bearer_id);
        uc.updated_bearer_id_by_policy = Some(self.bearer_id_by_policy.clone());
    }

    // ========================================================================
    // Criteria merge
    // ========================================================================

    /// Merge-apply a journal onto this session, re-running the
    /// higher-level mutations it recorded. Returns false on any
    /// pre-existing-state conflict, in which case the caller must
    /// discard this copy and reload from the store.
    pub fn apply_update_criteria(&mut self, uc: &SessionStateUpdateCriteria) -> bool {
        let mut merge_uc = SessionStateUpdateCriteria::default();

        if let Some(fsm_state) = uc.updated_fsm_state {
            self.curr_state = fsm_state;
        }
        for (trigger, state) in &uc.pending_event_triggers {
            if *state == EventTriggerState::Cleared {
                self.pending_event_triggers.remove(trigger);
            } else {
                self.pending_event_triggers.insert(*trigger, *state);
            }
            if *trigger == EventTrigger::RevalidationTimeout {
                if let Some(time) = uc.revalidation_time {
                    self.revalidation_time = time;
                }
            }
        }
        if let Some(bearer_map) = &uc.updated_bearer_id_by_policy {
            self.bearer_id_by_policy = bearer_map.clone();
        }
        if let Some(config) = &uc.updated_config {
            self.config = config.clone();
        }
        if let Some(tgpp_context) = &uc.updated_tgpp_context {
            self.tgpp_context = tgpp_context.clone();
        }
        if let Some(state) = uc.updated_subscriber_quota_state {
            self.subscriber_quota_state = state;
        }

        // static rules
        for rule_id in &uc.static_rules_to_install {
            if self.is_static_rule_installed(rule_id) {
                log::error!("Merge failed for {}: static rule {rule_id} already installed", self.session_id);
                return false;
            }
            if let Some(lifetime) = uc.new_rule_lifetimes.get(rule_id) {
                self.activate_static_rule(rule_id, *lifetime, &mut merge_uc);
            } else if self.is_static_rule_scheduled(rule_id) {
                self.install_scheduled_static_rule(rule_id, &mut merge_uc);
            } else {
                log::error!("Merge failed for {}: lifetime unspecified for {rule_id}", self.session_id);
                return false;
            }
        }
        for rule_id in &uc.static_rules_to_uninstall {
            if self.is_static_rule_installed(rule_id) {
                self.deactivate_static_rule(rule_id, &mut merge_uc);
            } else if self.is_static_rule_scheduled(rule_id) {
                self.install_scheduled_static_rule(rule_id, &mut merge_uc);
                self.deactivate_static_rule(rule_id, &mut merge_uc);
            } else {
                log::error!("Merge failed for {}: static rule {rule_id} already uninstalled", self.session_id);
                return false;
            }
        }
        for rule_id in &uc.new_scheduled_static_rules {
            if self.is_static_rule_scheduled(rule_id) {
                log::error!("Merge failed for {}: static rule {rule_id} already scheduled", self.session_id);
                return false;
            }
            let Some(lifetime) = uc.new_rule_lifetimes.get(rule_id) else {
                log::error!("Merge failed for {}: lifetime unspecified for {rule_id}", self.session_id);
                return false;
            };
            self.schedule_static_rule(rule_id, *lifetime, &mut merge_uc);
        }

        // dynamic rules
        for rule in &uc.dynamic_rules_to_install {
            if self.is_dynamic_rule_installed(&rule.id) {
                log::error!("Merge failed for {}: dynamic rule {} already installed", self.session_id, rule.id);
                return false;
            }
            if let Some(lifetime) = uc.new_rule_lifetimes.get(&rule.id) {
                self.insert_dynamic_rule(rule.clone(), *lifetime, &mut merge_uc);
            } else if self.is_dynamic_rule_scheduled(&rule.id) {
                self.install_scheduled_dynamic_rule(&rule.id, &mut merge_uc);
            } else {
                log::error!("Merge failed for {}: lifetime unspecified for {}", self.session_id, rule.id);
                return false;
            }
        }
        for rule_id in &uc.dynamic_rules_to_uninstall {
            if self.is_dynamic_rule_installed(rule_id) {
                self.dynamic_rules.remove_rule(rule_id);
            } else if self.is_dynamic_rule_scheduled(rule_id) {
                self.install_scheduled_dynamic_rule(rule_id, &mut merge_uc);
                self.dynamic_rules.remove_rule(rule_id);
            } else {
                log::error!("Merge failed for {}: dynamic rule {rule_id} already uninstalled", self.session_id);
                return false;
            }
        }
        for rule in &uc.new_scheduled_dynamic_rules {
            if self.is_dynamic_rule_scheduled(&rule.id) {
                log::error!("Merge failed for {}: dynamic rule {} already scheduled", self.session_id, rule.id);
                return false;
            }
            let Some(lifetime) = uc.new_rule_lifetimes.get(&rule.id) else {
                log::error!("Merge failed for {}: lifetime unspecified for {}", self.session_id, rule.id);
                return false;
            };
            self.schedule_dynamic_rule(rule.clone(), *lifetime, &mut merge_uc);
        }

        // gy dynamic rules
        for rule in &uc.gy_dynamic_rules_to_install {
            if self.is_gy_dynamic_rule_installed(&rule.id) {
                log::error!("Merge failed for {}: gy dynamic rule {} already installed", self.session_id, rule.id);
                return false;
            }
            let Some(lifetime) = uc.new_rule_lifetimes.get(&rule.id) else {
                log::error!("Merge failed for {}: gy rule lifetime not found for {}", self.session_id, rule.id);
                return false;
            };
            self.insert_gy_dynamic_rule(rule.clone(), *lifetime, &mut merge_uc);
        }
        for rule_id in &uc.gy_dynamic_rules_to_uninstall {
            if self.is_gy_dynamic_rule_installed(rule_id) {
                self.gy_dynamic_rules.remove_rule(rule_id);
            } else {
                log::error!("Merge failed for {}: gy dynamic rule {rule_id} already uninstalled", self.session_id);
                return false;
            }
        }

        // restrict rules
        for rule_id in &uc.restrict_rules_to_install {
            if self.is_restrict_rule_installed(rule_id) {
                log::error!("Merge failed for {}: restrict rule {rule_id} already installed", self.session_id);
                return false;
            }
            let Some(lifetime) = uc.new_rule_lifetimes.get(rule_id) else {
                log::error!("Merge failed for {}: lifetime unspecified for {rule_id}", self.session_id);
                return false;
            };
            self.activate_restrict_rule(rule_id, *lifetime, &mut merge_uc);
        }
        for rule_id in &uc.restrict_rules_to_uninstall {
            if !self.deactivate_restrict_rule(rule_id, &mut merge_uc) {
                log::error!("Merge failed for {}: restrict rule {rule_id} already uninstalled", self.session_id);
                return false;
            }
        }

        // charging credit
        for (key, credit_update) in &uc.charging_credit_map {
            self.apply_charging_credit_update(key, credit_update);
        }
        for (key, stored_grant) in &uc.charging_credit_to_install {
            self.credit_map.insert(*key, ChargingGrant::unmarshal(stored_grant));
        }

        // monitors
        if let Some(new_key) = &uc.updated_session_level_key {
            self.session_level_key = new_key.clone();
        }
        for (mkey, credit_update) in &uc.monitor_credit_map {
            self.apply_monitor_update(mkey, credit_update);
        }
        for (mkey, stored_monitor) in &uc.monitor_credit_to_install {
            self.monitor_map.insert(mkey.clone(), Monitor::unmarshal(stored_monitor));
        }

        if uc.updated_pdp_end_time > 0 {
            self.pdp_end_time = uc.updated_pdp_end_time;
        }
        self.request_number += uc.request_number_increment;

        true
    }

    fn apply_charging_credit_update(&mut self, key: &CreditKey, credit_update: &SessionCreditUpdateCriteria) {
        if credit_update.deleted {
            self.credit_map.remove(key);
            return;
        }
        let Some(grant) = self.credit_map.get_mut(key) else { return };
        let mut scratch = SessionCreditUpdateCriteria::default();
        grant.credit.set_reporting(credit_update.reporting);
        grant
            .credit
            .set_grant_tracking_type(credit_update.grant_tracking_type, &mut scratch);
        grant
            .credit
            .set_received_granted_units(credit_update.received_granted_units, &mut scratch);
        for bucket in Bucket::ALL {
            grant
                .credit
                .add_credit(credit_update.bucket_deltas[bucket as usize], bucket, &mut scratch);
        }
        grant.is_final_grant = credit_update.is_final;
        grant.final_action_info = credit_update.final_action_info.clone();
        grant.expiry_time = credit_update.expiry_time;
        grant.reauth_state = credit_update.reauth_state;
        grant.service_state = credit_update.service_state;
    }

    fn apply_monitor_update(&mut self, mkey: &str, credit_update: &SessionCreditUpdateCriteria) {
        if credit_update.deleted {
            self.monitor_map.remove(mkey);
            if self.session_level_key == mkey {
                self.session_level_key.clear();
            }
            return;
        }
        let Some(monitor) = self.monitor_map.get_mut(mkey) else { return };
        let mut scratch = SessionCreditUpdateCriteria::default();
        monitor.credit.set_reporting(credit_update.reporting);
        monitor
            .credit
            .set_grant_tracking_type(credit_update.grant_tracking_type, &mut scratch);
        monitor
            .credit
            .set_received_granted_units(credit_update.received_granted_units, &mut scratch);
        for bucket in Bucket::ALL {
            monitor
                .credit
                .add_credit(credit_update.bucket_deltas[bucket as usize], bucket, &mut scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use coregw_proto::{
        ChargingCredit, CreateSessionRequest, CreateSessionResponse, FinalAction, FlowQos,
        LteSessionContext, QosInformation, RatSpecificContext, RedirectServer, TrackingType,
        WlanSessionContext,
    };

    use crate::credit::{grant_total, USAGE_REPORTING_THRESHOLD};
    use crate::error::SessionResult;

    const IMSI: &str = "IMSI000000000000001";
    const SESSION_ID: &str = "IMSI000000000000001-1";

    #[derive(Default)]
    struct RecordingReporter {
        terminations: RefCell<Vec<SessionTerminateRequest>>,
    }

    impl SessionReporter for RecordingReporter {
        fn report_create_session(
            &self,
            _req: &CreateSessionRequest,
        ) -> SessionResult<CreateSessionResponse> {
            Ok(CreateSessionResponse::default())
        }

        fn report_update_session(
            &self,
            _req: &UpdateSessionRequest,
        ) -> SessionResult<coregw_proto::UpdateSessionResponse> {
            Ok(coregw_proto::UpdateSessionResponse::default())
        }

        fn report_terminate_session(&self, req: &SessionTerminateRequest) -> SessionResult<()> {
            self.terminations.borrow_mut().push(req.clone());
            Ok(())
        }
    }

    fn static_rule(id: &str, rating_group: u32, mkey: &str, qci: Option<u8>) -> PolicyRule {
        let tracking_type = match (rating_group > 0, !mkey.is_empty()) {
            (true, true) => TrackingType::OcsAndPcrf,
            (true, false) => TrackingType::OnlyOcs,
            (false, true) => TrackingType::OnlyPcrf,
            (false, false) => TrackingType::NoTracking,
        };
        PolicyRule {
            id: id.to_string(),
            rating_group,
            monitoring_key: mkey.to_string(),
            tracking_type,
            qos: qci.map(|qci| FlowQos { qci, ..Default::default() }),
            ..Default::default()
        }
    }

    fn rule_store() -> Arc<StaticRuleStore> {
        let store = StaticRuleStore::new();
        store.insert_rule(static_rule("rule1", 1, "", None));
        store.insert_rule(static_rule("rule2", 2, "", None));
        store.insert_rule(static_rule("monitored1", 0, "mk1", None));
        store.insert_rule(static_rule("rule-A", 0, "", None));
        store.insert_rule(static_rule("rule-B", 0, "", None));
        store.insert_rule(static_rule("rule-C", 0, "", Some(5)));
        Arc::new(store)
    }

    fn lte_config() -> SessionConfig {
        SessionConfig {
            common_context: coregw_proto::CommonSessionContext {
                sid: IMSI.to_string(),
                ue_ipv4: "192.168.128.11".to_string(),
                msisdn: "5100001111".to_string(),
                apn: "magic.apn".to_string(),
                rat_type: RatType::Lte,
                apn_ambr: None,
            },
            rat_specific_context: Some(RatSpecificContext::Lte(LteSessionContext {
                bearer_id: 5,
                qos_info: Some(QosInformation { qos_class_id: 9 }),
                ..Default::default()
            })),
        }
    }

    fn wlan_config() -> SessionConfig {
        SessionConfig {
            common_context: coregw_proto::CommonSessionContext {
                sid: IMSI.to_string(),
                ue_ipv4: "192.168.128.12".to_string(),
                apn: "00-11-22-33-44-55:wifi".to_string(),
                rat_type: RatType::Wlan,
                ..Default::default()
            },
            rat_specific_context: Some(RatSpecificContext::Wlan(WlanSessionContext {
                mac_addr: "00:aa:bb:cc:dd:ee".to_string(),
                radius_session_id: "radius-1".to_string(),
            })),
        }
    }

    fn new_session() -> SessionState {
        SessionState::new(IMSI, SESSION_ID, lte_config(), rule_store(), TgppContext::default(), 100)
    }

    fn credit_response(rating_group: u32, volume: u64) -> CreditUpdateResponse {
        CreditUpdateResponse {
            success: true,
            sid: IMSI.to_string(),
            session_id: SESSION_ID.to_string(),
            charging_key: rating_group,
            credit: ChargingCredit { granted_units: grant_total(volume), ..Default::default() },
            ..Default::default()
        }
    }

    fn final_credit_response(
        rating_group: u32,
        volume: u64,
        action: FinalAction,
    ) -> CreditUpdateResponse {
        let mut resp = credit_response(rating_group, volume);
        resp.credit.is_final = true;
        resp.credit.final_action = action;
        resp.credit.redirect_server = RedirectServer {
            redirect_server_address: "http://captive.example".to_string(),
            ..Default::default()
        };
        resp.credit.restrict_rules = vec!["restrict-1".to_string()];
        resp
    }

    fn monitor_response(mkey: &str, level: MonitoringLevel, volume: u64) -> UsageMonitoringUpdateResponse {
        UsageMonitoringUpdateResponse {
            success: true,
            sid: IMSI.to_string(),
            session_id: SESSION_ID.to_string(),
            credit: Some(coregw_proto::UsageMonitoringCredit {
                action: MonitorAction::Continue,
                monitoring_key: mkey.to_string(),
                level,
                granted_units: grant_total(volume),
            }),
            ..Default::default()
        }
    }

    fn uc() -> SessionStateUpdateCriteria {
        SessionStateUpdateCriteria::default()
    }

    #[test]
    fn test_init_usage_and_quota_exhausted_report() {
        let mut session = new_session();
        let mut update_uc = uc();
        assert!(session.receive_charging_credit(&credit_response(1, 1000), &mut update_uc));
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);

        session.add_rule_usage("rule1", 500, 300, &mut update_uc);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        let mut report_uc = uc();
        session.get_updates(&mut request, &mut actions, &mut report_uc, USAGE_REPORTING_THRESHOLD);

        assert_eq!(request.updates.len(), 1);
        assert!(actions.is_empty());
        let update = &request.updates[0];
        assert_eq!(update.request_number, 2);
        assert_eq!(update.usage.update_type, CreditUsageUpdateType::QuotaExhausted);
        assert_eq!(update.usage.bytes_tx + update.usage.bytes_rx, 800);
        assert_eq!(report_uc.request_number_increment, 1);

        // no duplicate update while the report is in flight
        let mut request2 = UpdateSessionRequest::default();
        session.get_updates(&mut request2, &mut actions, &mut report_uc, USAGE_REPORTING_THRESHOLD);
        assert!(request2.updates.is_empty());

        // the acknowledgment grants 1000 more
        assert!(session.receive_charging_credit(&credit_response(1, 1000), &mut report_uc));
        assert_eq!(session.get_charging_credit(&CreditKey::new(1), Bucket::AllowedTotal), 2000);
        assert_eq!(session.get_charging_credit(&CreditKey::new(1), Bucket::ReportedTx), 500);
        assert_eq!(session.get_charging_credit(&CreditKey::new(1), Bucket::ReportedRx), 300);
    }

    #[test]
    fn test_final_unit_redirect_action() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(
            &final_credit_response(1, 500, FinalAction::Redirect),
            &mut update_uc,
        );
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);

        session.add_rule_usage("rule1", 500, 0, &mut update_uc);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);

        // no usage update for an exhausted final grant, only the action
        assert!(request.updates.is_empty());
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.action_type, ServiceActionType::Redirect);
        assert_eq!(
            action.redirect_server.as_ref().map(|r| r.redirect_server_address.as_str()),
            Some("http://captive.example")
        );
        assert_eq!(action.imsi, IMSI);
        assert_eq!(action.ip_addr, "192.168.128.11");
        assert_eq!(action.rule_ids, vec!["rule1".to_string()]);
        // installed rules are untouched by the redirect
        assert_eq!(session.get_static_rules(), &vec!["rule1".to_string()]);
        assert!(session.is_credit_in_final_unit_state(&CreditKey::new(1)));

        // the action is not emitted twice
        let mut actions2 = Vec::new();
        session.get_updates(&mut request, &mut actions2, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert!(actions2.is_empty());
    }

    #[test]
    fn test_final_unit_restrict_action() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(
            &final_credit_response(1, 500, FinalAction::RestrictAccess),
            &mut update_uc,
        );
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("rule1", 250, 250, &mut update_uc);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ServiceActionType::RestrictAccess);
        assert_eq!(actions[0].restrict_rule_ids, vec!["restrict-1".to_string()]);
    }

    #[test]
    fn test_reauth_gated_while_reporting() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(&credit_response(2, 1000), &mut update_uc);
        session.activate_static_rule("rule2", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("rule2", 800, 0, &mut update_uc);

        // push the credit into a reporting cycle
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(request.updates.len(), 1);

        let mut reauth_uc = uc();
        assert_eq!(
            session.reauth_key(CreditKey::new(2), &mut reauth_uc),
            ReAuthResult::UpdateNotNeeded
        );

        // controller acknowledges; reauth can now proceed
        session.receive_charging_credit(&credit_response(2, 1000), &mut reauth_uc);
        assert_eq!(
            session.reauth_key(CreditKey::new(2), &mut reauth_uc),
            ReAuthResult::UpdateInitiated
        );

        let mut request2 = UpdateSessionRequest::default();
        session.get_updates(&mut request2, &mut actions, &mut reauth_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(request2.updates.len(), 1);
        assert_eq!(request2.updates[0].usage.update_type, CreditUsageUpdateType::ReauthRequired);
    }

    #[test]
    fn test_reauth_unknown_key_installs_disabled_grant() {
        let mut session = new_session();
        let mut reauth_uc = uc();
        assert_eq!(
            session.reauth_key(CreditKey::new(77), &mut reauth_uc),
            ReAuthResult::UpdateInitiated
        );
        assert!(reauth_uc.charging_credit_to_install.contains_key(&CreditKey::new(77)));
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut reauth_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(request.updates.len(), 1);
        assert_eq!(request.updates[0].usage.update_type, CreditUsageUpdateType::ReauthRequired);
    }

    #[test]
    fn test_monitor_updates_and_session_level_accumulation() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_monitor(&monitor_response("mk1", MonitoringLevel::PccRuleLevel, 1000), &mut update_uc);
        session.receive_monitor(&monitor_response("session-mk", MonitoringLevel::SessionLevel, 10_000), &mut update_uc);
        assert_eq!(session.get_session_level_key(), "session-mk");
        session.activate_static_rule("monitored1", RuleLifetime::always(), &mut update_uc);

        session.add_rule_usage("monitored1", 500, 400, &mut update_uc);
        // usage lands on the rule monitor and on the session-level monitor
        assert_eq!(session.get_monitor("mk1", Bucket::UsedTx), 500);
        assert_eq!(session.get_monitor("session-mk", Bucket::UsedTx), 500);
        assert_eq!(session.get_monitor("session-mk", Bucket::UsedRx), 400);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        // only mk1 crossed its threshold
        assert_eq!(request.usage_monitors.len(), 1);
        let monitor_req = &request.usage_monitors[0];
        assert_eq!(
            monitor_req.update.as_ref().map(|u| u.monitoring_key.as_str()),
            Some("mk1")
        );
        assert_eq!(monitor_req.event_trigger, Some(EventTrigger::UsageReport));
    }

    #[test]
    fn test_monitor_disable_removes_and_clears_session_key() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_monitor(&monitor_response("session-mk", MonitoringLevel::SessionLevel, 1000), &mut update_uc);
        assert_eq!(session.get_session_level_key(), "session-mk");

        let mut disable = monitor_response("session-mk", MonitoringLevel::SessionLevel, 0);
        if let Some(credit) = disable.credit.as_mut() {
            credit.action = MonitorAction::Disable;
        }
        let mut disable_uc = uc();
        assert!(session.receive_monitor(&disable, &mut disable_uc));
        assert_eq!(session.get_monitor("session-mk", Bucket::AllowedTotal), 0);
        assert_eq!(session.get_session_level_key(), "");
        assert_eq!(disable_uc.updated_session_level_key, Some(String::new()));
        assert!(disable_uc.monitor_credit_map.get("session-mk").map_or(false, |m| m.deleted));
    }

    #[test]
    fn test_monitor_zero_grant_exhaustion_deletes() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_monitor(&monitor_response("mk1", MonitoringLevel::PccRuleLevel, 1000), &mut update_uc);
        session.activate_static_rule("monitored1", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("monitored1", 1000, 0, &mut update_uc);
        // refill with a zero grant, then exhaust: the monitor goes away
        session.receive_monitor(&monitor_response("mk1", MonitoringLevel::PccRuleLevel, 0), &mut update_uc);
        let mut usage_uc = uc();
        session.add_rule_usage("monitored1", 1, 0, &mut usage_uc);
        assert!(usage_uc.monitor_credit_map.get("mk1").map_or(false, |m| m.deleted));
        assert_eq!(session.get_monitor("mk1", Bucket::AllowedTotal), 0);
    }

    #[test]
    fn test_apply_session_rule_set_diff() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.activate_static_rule("rule-A", RuleLifetime::always(), &mut update_uc);
        session.activate_static_rule("rule-B", RuleLifetime::always(), &mut update_uc);

        let mut desired = RuleSetToApply::default();
        desired.static_rules.insert("rule-B".to_string());
        desired.static_rules.insert("rule-C".to_string());

        let mut to_activate = RulesToProcess::default();
        let mut to_deactivate = RulesToProcess::default();
        let mut diff_uc = uc();
        session.apply_session_rule_set(&desired, &mut to_activate, &mut to_deactivate, &mut diff_uc);

        assert_eq!(to_activate.static_rules, vec!["rule-C".to_string()]);
        assert_eq!(to_deactivate.static_rules, vec!["rule-A".to_string()]);
        assert!(session.is_static_rule_installed("rule-B"));
        assert!(session.is_static_rule_installed("rule-C"));
        assert!(!session.is_static_rule_installed("rule-A"));

        // rule-C has QCI 5, distinct from the default QCI 9: bearer needed
        let bearer_update =
            session.get_dedicated_bearer_updates(&to_activate, &to_deactivate, &mut diff_uc);
        let create_req = bearer_update.create_req.expect("bearer creation expected");
        assert_eq!(create_req.link_bearer_id, 5);
        assert_eq!(create_req.policy_rules.len(), 1);
        assert_eq!(create_req.policy_rules[0].id, "rule-C");
        assert!(bearer_update.delete_req.is_none());
    }

    #[test]
    fn test_bearer_deletion_on_rule_removal() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.activate_static_rule("rule-C", RuleLifetime::always(), &mut update_uc);
        session.bind_policy_to_bearer(
            &PolicyBearerBindingRequest {
                sid: IMSI.to_string(),
                linked_bearer_id: 5,
                policy_rule_id: "rule-C".to_string(),
                bearer_id: 6,
            },
            &mut update_uc,
        );

        let mut to_activate = RulesToProcess::default();
        let mut to_deactivate = RulesToProcess::default();
        to_deactivate.static_rules.push("rule-C".to_string());
        let bearer_update =
            session.get_dedicated_bearer_updates(&to_activate, &to_deactivate, &mut update_uc);
        let delete_req = bearer_update.delete_req.expect("bearer deletion expected");
        assert_eq!(delete_req.eps_bearer_ids, vec![6]);
    }

    #[test]
    fn test_sync_rules_to_time_boundaries() {
        let now = 1_000_000;
        let mut session = new_session();
        let mut update_uc = uc();
        session.schedule_static_rule(
            "rule-A",
            RuleLifetime { activation_time: now - 1, deactivation_time: now + 1 },
            &mut update_uc,
        );
        session.schedule_static_rule(
            "rule-B",
            RuleLifetime { activation_time: now - 10, deactivation_time: now - 1 },
            &mut update_uc,
        );

        let mut sync_uc = uc();
        session.sync_rules_to_time(now, &mut sync_uc);
        assert!(session.is_static_rule_installed("rule-A"));
        assert!(!session.is_static_rule_installed("rule-B"));
        assert!(!session.is_static_rule_scheduled("rule-B"));
        assert!(sync_uc.static_rules_to_uninstall.contains("rule-B"));
    }

    #[test]
    fn test_revalidation_event_trigger_update() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.add_new_event_trigger(EventTrigger::RevalidationTimeout, &mut update_uc);
        session.set_revalidation_time(12345, &mut update_uc);

        // pending triggers do not produce updates
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert!(request.usage_monitors.is_empty());

        session.mark_event_trigger_as_triggered(EventTrigger::RevalidationTimeout, &mut update_uc);
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(request.usage_monitors.len(), 1);
        assert_eq!(
            request.usage_monitors[0].event_trigger,
            Some(EventTrigger::RevalidationTimeout)
        );
        // reported triggers are cleared
        assert!(!session.get_event_triggers().contains_key(&EventTrigger::RevalidationTimeout));
    }

    #[test]
    fn test_complete_termination_fsm_gates() {
        let reporter = RecordingReporter::default();
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(&credit_response(1, 1000), &mut update_uc);
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("rule1", 111, 222, &mut update_uc);

        // ACTIVE sessions refuse
        session.complete_termination(&reporter, &mut update_uc);
        assert_eq!(session.get_state(), SessionFsmState::Active);
        assert!(reporter.terminations.borrow().is_empty());

        session.set_fsm_state(SessionFsmState::Released, &mut update_uc);
        session.complete_termination(&reporter, &mut update_uc);
        assert_eq!(session.get_state(), SessionFsmState::Terminated);
        {
            let terminations = reporter.terminations.borrow();
            assert_eq!(terminations.len(), 1);
            let req = &terminations[0];
            assert_eq!(req.sid, IMSI);
            assert_eq!(req.credit_usages.len(), 1);
            assert_eq!(req.credit_usages[0].bytes_tx, 111);
            assert_eq!(req.credit_usages[0].bytes_rx, 222);
            assert_eq!(req.credit_usages[0].update_type, CreditUsageUpdateType::Terminated);
        }

        // terminated sessions are inert
        session.complete_termination(&reporter, &mut update_uc);
        assert_eq!(reporter.terminations.borrow().len(), 1);
        let mut late_uc = uc();
        session.add_rule_usage("rule1", 999, 0, &mut late_uc);
        assert_eq!(session.get_charging_credit(&CreditKey::new(1), Bucket::UsedTx), 111);
        session.activate_static_rule("rule2", RuleLifetime::always(), &mut late_uc);
        assert!(!session.is_static_rule_installed("rule2"));
        assert_eq!(
            session.reauth_key(CreditKey::new(1), &mut late_uc),
            ReAuthResult::UpdateNotNeeded
        );
    }

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let mut session = SessionState::new(
            IMSI,
            SESSION_ID,
            wlan_config(),
            rule_store(),
            TgppContext { gx_dest_host: "gx.example".to_string(), gy_dest_host: "gy.example".to_string() },
            4242,
        );
        let mut update_uc = uc();
        session.receive_charging_credit(&credit_response(1, 1000), &mut update_uc);
        session.receive_charging_credit(
            &final_credit_response(2, 500, FinalAction::RestrictAccess),
            &mut update_uc,
        );
        session.receive_monitor(&monitor_response("mk1", MonitoringLevel::PccRuleLevel, 2000), &mut update_uc);
        session.receive_monitor(&monitor_response("session-mk", MonitoringLevel::SessionLevel, 9000), &mut update_uc);
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.schedule_static_rule(
            "rule-A",
            RuleLifetime { activation_time: 10_000, deactivation_time: 20_000 },
            &mut update_uc,
        );
        session.insert_dynamic_rule(
            static_rule("dyn1", 1, "mk1", Some(7)),
            RuleLifetime::always(),
            &mut update_uc,
        );
        session.insert_gy_dynamic_rule(
            static_rule("redirect", 0, "", None),
            RuleLifetime::always(),
            &mut update_uc,
        );
        session.add_rule_usage("rule1", 10, 20, &mut update_uc);
        session.add_new_event_trigger(EventTrigger::RevalidationTimeout, &mut update_uc);
        session.set_revalidation_time(777, &mut update_uc);

        let marshaled = session.marshal();
        let restored = SessionState::unmarshal(&marshaled, rule_store());
        assert_eq!(restored.marshal(), marshaled);
    }

    #[test]
    fn test_apply_update_criteria_replays_mutations() {
        let mut session = new_session();
        // session creation commits separately; replay starts from there
        let mut init_uc = uc();
        session.receive_charging_credit(&credit_response(1, 1000), &mut init_uc);
        let pre_state = session.marshal();

        // one transaction's worth of mutations, all recorded in a single uc
        let mut update_uc = uc();
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.insert_dynamic_rule(
            static_rule("dyn1", 1, "", None),
            RuleLifetime::always(),
            &mut update_uc,
        );
        session.add_rule_usage("rule1", 700, 100, &mut update_uc);
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);

        // replaying the journal onto the pre-state reproduces the post-state,
        // modulo in-flight reporting counters which are never journaled
        let mut replayed = SessionState::unmarshal(&pre_state, rule_store());
        assert!(replayed.apply_update_criteria(&update_uc));

        let mut post = session.marshal();
        let mut replay_post = replayed.marshal();
        for stored in [&mut post, &mut replay_post] {
            for (_, grant) in stored.credit_map.iter_mut() {
                grant.credit.reporting = false;
                grant.credit.buckets[Bucket::ReportingTx as usize] = 0;
                grant.credit.buckets[Bucket::ReportingRx as usize] = 0;
            }
        }
        assert_eq!(replay_post, post);
    }

    #[test]
    fn test_apply_update_criteria_refuses_conflicts() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);

        // installing an already-installed rule is a conflict
        let mut fresh = new_session();
        let mut conflict_uc = uc();
        fresh.activate_static_rule("rule1", RuleLifetime::always(), &mut conflict_uc);
        assert!(!session.apply_update_criteria(&conflict_uc));

        // uninstalling a rule that is not there is a conflict
        let mut missing_uc = uc();
        missing_uc.static_rules_to_uninstall.insert("rule2".to_string());
        assert!(!session.apply_update_criteria(&missing_uc));

        // install without a lifetime is a conflict
        let mut no_lifetime_uc = uc();
        no_lifetime_uc.static_rules_to_install.insert("rule2".to_string());
        assert!(!session.apply_update_criteria(&no_lifetime_uc));
    }

    #[test]
    fn test_charging_failure_marks_deactivation_for_final_grant() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(
            &final_credit_response(1, 500, FinalAction::Terminate),
            &mut update_uc,
        );
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("rule1", 500, 0, &mut update_uc);

        let mut failure = credit_response(1, 0);
        failure.success = false;
        failure.result_code = 5003;
        assert!(!session.receive_charging_credit(&failure, &mut update_uc));

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut update_uc, USAGE_REPORTING_THRESHOLD);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ServiceActionType::TerminateService);
    }

    #[test]
    fn test_total_credit_usage_collates_unique_keys() {
        let mut session = new_session();
        let mut update_uc = uc();
        session.receive_charging_credit(&credit_response(1, 10_000), &mut update_uc);
        session.receive_monitor(&monitor_response("mk1", MonitoringLevel::PccRuleLevel, 10_000), &mut update_uc);
        session.activate_static_rule("rule1", RuleLifetime::always(), &mut update_uc);
        session.activate_static_rule("monitored1", RuleLifetime::always(), &mut update_uc);
        session.add_rule_usage("rule1", 100, 200, &mut update_uc);
        session.add_rule_usage("monitored1", 10, 20, &mut update_uc);

        let total = session.get_total_credit_usage();
        assert_eq!(total.charging_tx, 100);
        assert_eq!(total.charging_rx, 200);
        assert_eq!(total.monitoring_tx, 10);
        assert_eq!(total.monitoring_rx, 20);
    }
}
