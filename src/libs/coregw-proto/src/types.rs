//! Protocol message and policy type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Policy rules
// ============================================================================

/// Radio access technology of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RatType {
    #[default]
    Lte,
    Wlan,
}

/// Which controllers account traffic for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackingType {
    #[default]
    NoTracking,
    /// Online charging only (rating group).
    OnlyOcs,
    /// Usage monitoring only (monitoring key).
    OnlyPcrf,
    /// Both online charging and usage monitoring.
    OcsAndPcrf,
}

/// Direction of a traffic flow match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowDirection {
    #[default]
    Bidirectional,
    UplinkOnly,
    DownlinkOnly,
}

/// A single flow match belonging to a policy rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowDescription {
    pub direction: FlowDirection,
    /// Flow match in textual filter form.
    pub description: String,
}

/// Per-rule QoS descriptor (QCI plus requested bitrates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowQos {
    pub qci: u8,
    pub max_req_bw_ul: u64,
    pub max_req_bw_dl: u64,
}

/// Address family of a redirect target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RedirectAddressType {
    #[default]
    Ipv4,
    Ipv6,
    Url,
    SipUri,
}

/// Redirect target carried by a final-unit indication.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RedirectServer {
    pub redirect_address_type: RedirectAddressType,
    pub redirect_server_address: String,
}

/// Redirect enforcement info attached to a policy rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RedirectInformation {
    pub support_enabled: bool,
    pub address_type: RedirectAddressType,
    pub server_address: String,
}

/// A policy-and-charging-control rule.
///
/// Static rules live in the gateway-wide catalog and are referenced by id;
/// dynamic rules are carried by value on the session that installed them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub priority: u32,
    pub rating_group: u32,
    pub service_identifier: Option<u32>,
    /// Empty when the rule is not monitored.
    pub monitoring_key: String,
    pub tracking_type: TrackingType,
    pub qos: Option<FlowQos>,
    pub redirect: Option<RedirectInformation>,
    pub flow_list: Vec<FlowDescription>,
}

impl PolicyRule {
    /// Charging key of this rule, when online charging tracks it.
    pub fn charging_key(&self) -> Option<CreditKey> {
        match self.tracking_type {
            TrackingType::OnlyOcs | TrackingType::OcsAndPcrf => Some(CreditKey {
                rating_group: self.rating_group,
                service_identifier: self.service_identifier,
            }),
            _ => None,
        }
    }

    /// Monitoring key of this rule, when usage monitoring tracks it.
    pub fn monitoring_key(&self) -> Option<&str> {
        match self.tracking_type {
            TrackingType::OnlyPcrf | TrackingType::OcsAndPcrf
                if !self.monitoring_key.is_empty() =>
            {
                Some(&self.monitoring_key)
            }
            _ => None,
        }
    }

    pub fn has_qos(&self) -> bool {
        self.qos.is_some()
    }
}

/// Aggregate maximum bitrate for an APN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedMaximumBitrate {
    pub max_bandwidth_ul: u64,
    pub max_bandwidth_dl: u64,
}

// ============================================================================
// Credit
// ============================================================================

/// One granted volume dimension. Invalid units carry no grant at all,
/// which is distinct from a grant of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditUnit {
    pub is_valid: bool,
    pub volume: u64,
}

/// Volume granted by the charging controller, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GrantedUnits {
    pub total: CreditUnit,
    pub tx: CreditUnit,
    pub rx: CreditUnit,
}

/// Identifies a charging grant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CreditKey {
    pub rating_group: u32,
    pub service_identifier: Option<u32>,
}

impl CreditKey {
    pub fn new(rating_group: u32) -> Self {
        CreditKey { rating_group, service_identifier: None }
    }
}

impl fmt::Display for CreditKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_identifier {
            Some(si) => write!(f, "RG={} SI={}", self.rating_group, si),
            None => write!(f, "RG={}", self.rating_group),
        }
    }
}

/// How a rating group is limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreditLimitType {
    #[default]
    Finite,
    InfiniteUnmetered,
    InfiniteMetered,
}

/// Action to take once the final granted quota is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinalAction {
    #[default]
    Terminate,
    Redirect,
    RestrictAccess,
}

/// Charging grant payload of a credit response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChargingCredit {
    pub granted_units: GrantedUnits,
    pub is_final: bool,
    pub final_action: FinalAction,
    pub redirect_server: RedirectServer,
    pub restrict_rules: Vec<String>,
    /// Seconds of validity; 0 means the grant never expires.
    pub validity_time: u32,
}

/// Per-rating-group response from the charging controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreditUpdateResponse {
    pub success: bool,
    /// Subscriber id (IMSI).
    pub sid: String,
    pub session_id: String,
    pub charging_key: u32,
    pub service_identifier: Option<u32>,
    pub credit: ChargingCredit,
    pub result_code: u32,
    pub limit_type: CreditLimitType,
    pub tgpp_ctx: TgppContext,
}

impl CreditUpdateResponse {
    pub fn credit_key(&self) -> CreditKey {
        CreditKey {
            rating_group: self.charging_key,
            service_identifier: self.service_identifier,
        }
    }
}

// ============================================================================
// Usage monitoring
// ============================================================================

/// Scope of a usage monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitoringLevel {
    SessionLevel,
    #[default]
    PccRuleLevel,
    AdcRuleLevel,
}

/// Controller instruction attached to a monitoring grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitorAction {
    #[default]
    Continue,
    Disable,
}

/// Monitoring grant payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageMonitoringCredit {
    pub action: MonitorAction,
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub granted_units: GrantedUnits,
}

/// Per-monitoring-key response from the policy controller. Responses
/// without a credit payload carry only rule or event-trigger changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageMonitoringUpdateResponse {
    pub success: bool,
    pub sid: String,
    pub session_id: String,
    pub result_code: u32,
    pub credit: Option<UsageMonitoringCredit>,
    pub event_triggers: Vec<EventTrigger>,
    /// Epoch seconds; meaningful when `event_triggers` carries
    /// `RevalidationTimeout`.
    pub revalidation_time: i64,
    pub static_rules_to_install: Vec<StaticRuleInstall>,
    pub dynamic_rules_to_install: Vec<DynamicRuleInstall>,
    pub rules_to_remove: Vec<String>,
    pub tgpp_ctx: TgppContext,
}

/// Conditions the policy controller asked to be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTrigger {
    UsageReport,
    RevalidationTimeout,
    RatChange,
    PlmnChange,
}

// ============================================================================
// Rule installs
// ============================================================================

/// Reference to a catalog rule with its lifetime window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaticRuleInstall {
    pub rule_id: String,
    /// Epoch seconds; 0 means immediately.
    pub activation_time: i64,
    /// Epoch seconds; 0 means never.
    pub deactivation_time: i64,
}

/// A dynamic rule carried by value with its lifetime window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DynamicRuleInstall {
    pub policy_rule: PolicyRule,
    pub activation_time: i64,
    pub deactivation_time: i64,
}

// ============================================================================
// Session context
// ============================================================================

/// Gx/Gy destination realm bookkeeping forwarded with every report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TgppContext {
    pub gx_dest_host: String,
    pub gy_dest_host: String,
}

/// QoS profile of the default bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosInformation {
    pub qos_class_id: u8,
}

/// Fields shared by every access technology.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommonSessionContext {
    pub sid: String,
    pub ue_ipv4: String,
    pub msisdn: String,
    pub apn: String,
    pub rat_type: RatType,
    pub apn_ambr: Option<AggregatedMaximumBitrate>,
}

/// LTE-only session attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LteSessionContext {
    pub spgw_ipv4: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    /// Default bearer id the session is anchored on.
    pub bearer_id: u32,
    pub qos_info: Option<QosInformation>,
}

/// Carrier-WiFi-only session attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WlanSessionContext {
    pub mac_addr: String,
    pub radius_session_id: String,
}

/// Access-specific half of the session config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RatSpecificContext {
    Lte(LteSessionContext),
    Wlan(WlanSessionContext),
}

/// Full configuration of one subscriber session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub common_context: CommonSessionContext,
    pub rat_specific_context: Option<RatSpecificContext>,
}

impl SessionConfig {
    pub fn get_apn_ambr(&self) -> Option<AggregatedMaximumBitrate> {
        self.common_context.apn_ambr
    }

    pub fn lte_context(&self) -> Option<&LteSessionContext> {
        match &self.rat_specific_context {
            Some(RatSpecificContext::Lte(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn wlan_context(&self) -> Option<&WlanSessionContext> {
        match &self.rat_specific_context {
            Some(RatSpecificContext::Wlan(ctx)) => Some(ctx),
            _ => None,
        }
    }
}

// ============================================================================
// Controller requests and responses
// ============================================================================

/// Ask the controller to authorize a new session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub config: SessionConfig,
}

/// Create-session answer from the controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub credits: Vec<CreditUpdateResponse>,
    pub usage_monitors: Vec<UsageMonitoringUpdateResponse>,
    pub static_rules: Vec<StaticRuleInstall>,
    pub dynamic_rules: Vec<DynamicRuleInstall>,
    pub event_triggers: Vec<EventTrigger>,
    pub revalidation_time: i64,
    pub tgpp_ctx: TgppContext,
}

/// Why a charging usage record is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreditUsageUpdateType {
    #[default]
    QuotaExhausted,
    ValidityTimerExpired,
    Terminated,
    ReauthRequired,
}

/// Usage accumulated against one charging key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreditUsage {
    pub charging_key: u32,
    pub service_identifier: Option<u32>,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub update_type: CreditUsageUpdateType,
}

/// One charging usage report, addressed with full session identity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreditUsageUpdate {
    pub session_id: String,
    pub request_number: u32,
    pub sid: String,
    pub msisdn: String,
    pub ue_ipv4: String,
    pub apn: String,
    pub rat_type: RatType,
    /// WLAN hardware address, empty otherwise.
    pub hardware_addr: String,
    pub spgw_ipv4: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub tgpp_ctx: TgppContext,
    pub usage: CreditUsage,
}

/// Usage accumulated against one monitoring key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageMonitorUpdate {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// One monitoring report or event-trigger notification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageMonitoringUpdateRequest {
    pub session_id: String,
    pub request_number: u32,
    pub sid: String,
    pub ue_ipv4: String,
    pub rat_type: RatType,
    pub hardware_addr: String,
    pub tgpp_ctx: TgppContext,
    pub update: Option<UsageMonitorUpdate>,
    pub event_trigger: Option<EventTrigger>,
}

/// Batched upstream report covering many sessions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub updates: Vec<CreditUsageUpdate>,
    pub usage_monitors: Vec<UsageMonitoringUpdateRequest>,
}

impl UpdateSessionRequest {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.usage_monitors.is_empty()
    }
}

/// Controller answer to a batched report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateSessionResponse {
    pub responses: Vec<CreditUpdateResponse>,
    pub usage_monitor_responses: Vec<UsageMonitoringUpdateResponse>,
}

/// Final report bundling all remaining usage of a terminating session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionTerminateRequest {
    pub sid: String,
    pub session_id: String,
    pub request_number: u32,
    pub ue_ipv4: String,
    pub msisdn: String,
    pub apn: String,
    pub rat_type: RatType,
    pub hardware_addr: String,
    pub spgw_ipv4: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub tgpp_ctx: TgppContext,
    pub monitor_usages: Vec<UsageMonitorUpdate>,
    pub credit_usages: Vec<CreditUsage>,
}

// ============================================================================
// Reauthorization
// ============================================================================

/// Outcome of a reauthorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReAuthResult {
    #[default]
    UpdateInitiated,
    UpdateNotNeeded,
    SessionNotFound,
    OtherFailure,
}

/// Scope of a charging reauth request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChargingReAuthType {
    #[default]
    SingleService,
    EntireSession,
}

/// Charging controller asks for an immediate usage update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChargingReAuthRequest {
    pub sid: String,
    pub session_id: String,
    pub charging_key: u32,
    pub service_identifier: Option<u32>,
    pub reauth_type: ChargingReAuthType,
}

impl ChargingReAuthRequest {
    pub fn credit_key(&self) -> CreditKey {
        CreditKey {
            rating_group: self.charging_key,
            service_identifier: self.service_identifier,
        }
    }
}

/// Policy controller pushes rule and monitor changes mid-session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyReAuthRequest {
    /// Empty session id applies the request to every session of the
    /// subscriber.
    pub session_id: String,
    pub imsi: String,
    pub rules_to_remove: Vec<String>,
    pub rules_to_install: Vec<StaticRuleInstall>,
    pub dynamic_rules_to_install: Vec<DynamicRuleInstall>,
    pub event_triggers: Vec<EventTrigger>,
    pub revalidation_time: i64,
    pub usage_monitoring_credits: Vec<UsageMonitoringCredit>,
    pub qos_info: Option<QosInformation>,
}

/// Gateway answer to a policy reauth.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyReAuthAnswer {
    pub session_id: String,
    pub result: ReAuthResult,
    pub failed_rules: Vec<String>,
}

// ============================================================================
// Declarative rule sets
// ============================================================================

/// Desired rule state for one APN (or subscriber-wide).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub apply_subscriber_wide: bool,
    pub apn: String,
    pub static_rules: Vec<StaticRuleInstall>,
    pub dynamic_rules: Vec<DynamicRuleInstall>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RulesPerSubscriber {
    pub imsi: String,
    pub rule_set: Vec<RuleSet>,
}

/// Full desired-state push across subscribers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionRules {
    pub rules_per_subscriber: Vec<RulesPerSubscriber>,
}

// ============================================================================
// Gateway-local messages
// ============================================================================

/// Usage record for one rule of one subscriber, as reported by the
/// user-plane pipeline. Counters are cumulative for the flow's lifetime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Subscriber id (IMSI).
    pub sid: String,
    pub rule_id: String,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// One periodic usage report from the pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleRecordTable {
    pub records: Vec<RuleRecord>,
    pub epoch: u64,
}

/// Subscriber wallet state propagated to the pipeline (CWF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriberQuotaState {
    #[default]
    ValidQuota,
    NoQuota,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriberQuotaUpdate {
    pub sid: String,
    pub mac_addr: String,
    pub state: SubscriberQuotaState,
}

/// Access network confirms (or refuses) a dedicated bearer for a policy.
/// A `bearer_id` of zero means the bearer could not be created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyBearerBindingRequest {
    pub sid: String,
    pub linked_bearer_id: u32,
    pub policy_rule_id: String,
    pub bearer_id: u32,
}

/// Ask the access network for a dedicated bearer carrying these policies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateBearerRequest {
    pub sid: String,
    pub ip_addr: String,
    pub link_bearer_id: u32,
    pub policy_rules: Vec<PolicyRule>,
}

/// Ask the access network to tear down dedicated bearers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteBearerRequest {
    pub sid: String,
    pub ip_addr: String,
    pub link_bearer_id: u32,
    pub eps_bearer_ids: Vec<u32>,
}

/// Which enforcement plane originated a flow removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestOrigin {
    #[default]
    Gx,
    Gy,
    Wildcard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charging_key_tracking() {
        let mut rule = PolicyRule {
            id: "rule1".to_string(),
            rating_group: 7,
            tracking_type: TrackingType::OnlyOcs,
            ..Default::default()
        };
        assert_eq!(rule.charging_key(), Some(CreditKey::new(7)));
        assert_eq!(rule.monitoring_key(), None);

        rule.tracking_type = TrackingType::OnlyPcrf;
        assert_eq!(rule.charging_key(), None);
        // monitored tracking without a key is not a monitored rule
        assert_eq!(rule.monitoring_key(), None);

        rule.monitoring_key = "mk1".to_string();
        assert_eq!(rule.monitoring_key(), Some("mk1"));
    }

    #[test]
    fn test_credit_key_display() {
        assert_eq!(CreditKey::new(3).to_string(), "RG=3");
        let key = CreditKey { rating_group: 3, service_identifier: Some(9) };
        assert_eq!(key.to_string(), "RG=3 SI=9");
    }

    #[test]
    fn test_session_config_rat_accessors() {
        let mut config = SessionConfig::default();
        assert!(config.lte_context().is_none());
        config.rat_specific_context = Some(RatSpecificContext::Wlan(WlanSessionContext {
            mac_addr: "00:11:22:33:44:55".to_string(),
            radius_session_id: "radius-1".to_string(),
        }));
        assert!(config.lte_context().is_none());
        assert!(config.wlan_context().is_some());
    }

    #[test]
    fn test_update_session_request_is_empty() {
        let mut req = UpdateSessionRequest::default();
        assert!(req.is_empty());
        req.usage_monitors.push(UsageMonitoringUpdateRequest::default());
        assert!(!req.is_empty());
    }

    #[test]
    fn test_policy_rule_serde_roundtrip() {
        let rule = PolicyRule {
            id: "redirect".to_string(),
            priority: 2000,
            redirect: Some(RedirectInformation {
                support_enabled: true,
                address_type: RedirectAddressType::Url,
                server_address: "http://example.invalid".to_string(),
            }),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&rule).unwrap();
        let decoded: PolicyRule = serde_json::from_str(&encoded).unwrap();
        assert_eq!(rule, decoded);
    }
}
