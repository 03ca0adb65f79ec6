//! Charging grant state on top of a session credit.
//!
//! A `ChargingGrant` wraps the raw counters with final-unit semantics,
//! a validity window, and the reauth/service sub-state machines that
//! decide which action the enforcer takes for the rating group.

use coregw_proto::{
    AggregatedMaximumBitrate, ChargingCredit, CreditKey, CreditLimitType, CreditUsage,
    CreditUsageUpdateType, FinalAction, PolicyRule, RedirectServer,
};
use serde::{Deserialize, Serialize};

use crate::credit::SessionCredit;
use crate::stored::{SessionCreditUpdateCriteria, StoredChargingGrant};
use crate::timer::now_epoch;

/// Whether TERMINATE final actions tear the whole session down once the
/// final grant is exhausted.
pub const TERMINATE_SERVICE_WHEN_QUOTA_EXHAUSTED: bool = true;

/// Reauthorization sub-state of a charging grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReAuthState {
    #[default]
    NotNeeded,
    Required,
    Processing,
}

/// Service sub-state of a charging grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Enabled,
    NeedsDeactivation,
    Disabled,
    NeedsActivation,
    Redirected,
    Restricted,
}

/// Final-unit instruction carried by the last grant of a rating group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalActionInfo {
    pub final_action: FinalAction,
    pub redirect_server: RedirectServer,
    pub restrict_rules: Vec<String>,
}

/// What the enforcer must do for a rating group right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceActionType {
    #[default]
    ContinueService,
    ActivateService,
    TerminateService,
    Redirect,
    RestrictAccess,
}

/// A fully addressed action the enforcer dispatches downstream.
#[derive(Debug, Clone, Default)]
pub struct ServiceAction {
    pub action_type: ServiceActionType,
    pub credit_key: CreditKey,
    pub imsi: String,
    pub session_id: String,
    pub ip_addr: String,
    pub ambr: Option<AggregatedMaximumBitrate>,
    pub redirect_server: Option<RedirectServer>,
    pub restrict_rule_ids: Vec<String>,
    /// Static rules resolved against the charging key.
    pub rule_ids: Vec<String>,
    /// Dynamic rule definitions resolved against the charging key.
    pub rule_definitions: Vec<PolicyRule>,
}

/// Per-rating-group grant with final-unit and sub-state bookkeeping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChargingGrant {
    pub credit: SessionCredit,
    pub is_final_grant: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    /// Epoch seconds after which a validity-timer update is due.
    pub expiry_time: i64,
}

impl ChargingGrant {
    pub fn new(limit_type: CreditLimitType) -> Self {
        ChargingGrant { credit: SessionCredit::new(limit_type), ..Default::default() }
    }

    pub fn unmarshal(stored: &StoredChargingGrant) -> Self {
        ChargingGrant {
            credit: SessionCredit::unmarshal(&stored.credit),
            is_final_grant: stored.is_final,
            final_action_info: stored.final_action_info.clone(),
            reauth_state: stored.reauth_state,
            service_state: stored.service_state,
            expiry_time: stored.expiry_time,
        }
    }

    pub fn marshal(&self) -> StoredChargingGrant {
        StoredChargingGrant {
            credit: self.credit.marshal(),
            is_final: self.is_final_grant,
            final_action_info: self.final_action_info.clone(),
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
        }
    }

    /// Apply a grant from the controller: volume, final-unit info, expiry.
    pub fn receive_charging_grant(
        &mut self,
        p_credit: &ChargingCredit,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        self.credit.receive_credit(&p_credit.granted_units, uc);

        self.is_final_grant = p_credit.is_final;
        if self.is_final_grant {
            self.final_action_info.final_action = p_credit.final_action;
            match p_credit.final_action {
                FinalAction::Redirect => {
                    self.final_action_info.redirect_server = p_credit.redirect_server.clone();
                }
                FinalAction::RestrictAccess => {
                    self.final_action_info.restrict_rules = p_credit.restrict_rules.clone();
                }
                FinalAction::Terminate => {}
            }
            self.log_final_action_info();
        }

        self.expiry_time = if p_credit.validity_time == 0 {
            i64::MAX
        } else {
            now_epoch().saturating_add(p_credit.validity_time as i64)
        };

        uc.is_final = self.is_final_grant;
        uc.final_action_info = self.final_action_info.clone();
        uc.expiry_time = self.expiry_time;
    }

    /// Full snapshot of the grant-owned fields as a sub-journal seed.
    pub fn get_update_criteria(&self) -> SessionCreditUpdateCriteria {
        let mut uc = self.credit.get_update_criteria();
        uc.is_final = self.is_final_grant;
        uc.final_action_info = self.final_action_info.clone();
        uc.expiry_time = self.expiry_time;
        uc.reauth_state = self.reauth_state;
        uc.service_state = self.service_state;
        uc
    }

    /// Produce the usage payload for one outbound report.
    pub fn get_credit_usage(
        &mut self,
        update_type: CreditUsageUpdateType,
        uc: &mut SessionCreditUpdateCriteria,
        is_terminate: bool,
    ) -> CreditUsage {
        let usage = if self.is_final_grant || is_terminate {
            self.credit.get_all_unreported_usage_for_reporting(uc)
        } else {
            self.credit.get_usage_for_reporting(uc)
        };
        CreditUsage {
            bytes_tx: usage.bytes_tx,
            bytes_rx: usage.bytes_rx,
            update_type,
            ..Default::default()
        }
    }

    /// Whether an update is due for this grant, and why.
    pub fn get_update_type(&self, usage_reporting_threshold: f64) -> Option<CreditUsageUpdateType> {
        if self.credit.is_reporting() {
            return None; // already one report in flight
        }
        if self.reauth_state == ReAuthState::Required {
            return Some(CreditUsageUpdateType::ReauthRequired);
        }
        if self.is_final_grant && self.credit.is_quota_exhausted(1.0) {
            // no more quota will be granted, the final action handles it
            return None;
        }
        if self.credit.is_quota_exhausted(usage_reporting_threshold) {
            return Some(CreditUsageUpdateType::QuotaExhausted);
        }
        if now_epoch() >= self.expiry_time {
            return Some(CreditUsageUpdateType::ValidityTimerExpired);
        }
        None
    }

    /// Service is only cut once the final grant is fully consumed.
    pub fn should_deactivate_service(&self) -> bool {
        if self.final_action_info.final_action == FinalAction::Terminate
            && !TERMINATE_SERVICE_WHEN_QUOTA_EXHAUSTED
        {
            return false;
        }
        if self.service_state != ServiceState::Enabled {
            return false;
        }
        if self.is_final_grant && self.credit.is_quota_exhausted(1.0) {
            log::info!(
                "Deactivating service: final grant exhausted, action={:?}",
                self.final_action_info.final_action
            );
            return true;
        }
        false
    }

    /// Resolve the pending sub-state into the action to dispatch.
    pub fn get_action(&mut self, uc: &mut SessionCreditUpdateCriteria) -> ServiceActionType {
        match self.service_state {
            ServiceState::NeedsDeactivation => {
                self.set_service_state(ServiceState::Disabled, uc);
                if !self.is_final_grant {
                    ServiceActionType::TerminateService
                } else {
                    self.final_action_to_action()
                }
            }
            ServiceState::NeedsActivation => {
                self.set_service_state(ServiceState::Enabled, uc);
                ServiceActionType::ActivateService
            }
            _ => ServiceActionType::ContinueService,
        }
    }

    fn final_action_to_action(&self) -> ServiceActionType {
        match self.final_action_info.final_action {
            FinalAction::Redirect => ServiceActionType::Redirect,
            FinalAction::RestrictAccess => ServiceActionType::RestrictAccess,
            FinalAction::Terminate => ServiceActionType::TerminateService,
        }
    }

    pub fn set_reauth_state(&mut self, new_state: ReAuthState, uc: &mut SessionCreditUpdateCriteria) {
        if self.reauth_state != new_state {
            log::debug!("ReAuth state change from {:?} to {:?}", self.reauth_state, new_state);
        }
        self.reauth_state = new_state;
        uc.reauth_state = new_state;
    }

    pub fn set_service_state(
        &mut self,
        new_state: ServiceState,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        if self.service_state != new_state {
            log::debug!("Service state change from {:?} to {:?}", self.service_state, new_state);
        }
        self.service_state = new_state;
        uc.service_state = new_state;
    }

    fn log_final_action_info(&self) {
        match self.final_action_info.final_action {
            FinalAction::Redirect => log::info!(
                "Final grant, action=REDIRECT server={}",
                self.final_action_info.redirect_server.redirect_server_address
            ),
            FinalAction::RestrictAccess => log::info!(
                "Final grant, action=RESTRICT_ACCESS rules={:?}",
                self.final_action_info.restrict_rules
            ),
            FinalAction::Terminate => log::info!("Final grant, action=TERMINATE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::grant_total;
    use crate::credit::USAGE_REPORTING_THRESHOLD;

    fn scratch() -> SessionCreditUpdateCriteria {
        SessionCreditUpdateCriteria::default()
    }

    fn grant_with(volume: u64, is_final: bool, action: FinalAction) -> ChargingGrant {
        let mut grant = ChargingGrant::default();
        let p_credit = ChargingCredit {
            granted_units: grant_total(volume),
            is_final,
            final_action: action,
            redirect_server: RedirectServer {
                redirect_server_address: "http://captive.example".to_string(),
                ..Default::default()
            },
            restrict_rules: vec!["restrict-1".to_string()],
            validity_time: 0,
        };
        grant.receive_charging_grant(&p_credit, &mut scratch());
        grant
    }

    #[test]
    fn test_receive_grant_records_final_action() {
        let grant = grant_with(500, true, FinalAction::Redirect);
        assert!(grant.is_final_grant);
        assert_eq!(grant.final_action_info.final_action, FinalAction::Redirect);
        assert_eq!(
            grant.final_action_info.redirect_server.redirect_server_address,
            "http://captive.example"
        );
        assert_eq!(grant.expiry_time, i64::MAX);
    }

    #[test]
    fn test_update_type_quota_exhausted() {
        let mut grant = grant_with(1000, false, FinalAction::Terminate);
        grant.credit.add_used_credit(800, 0, &mut scratch());
        assert_eq!(
            grant.get_update_type(USAGE_REPORTING_THRESHOLD),
            Some(CreditUsageUpdateType::QuotaExhausted)
        );
    }

    #[test]
    fn test_update_type_gated_while_reporting() {
        let mut grant = grant_with(1000, false, FinalAction::Terminate);
        grant.credit.add_used_credit(900, 0, &mut scratch());
        grant.credit.get_usage_for_reporting(&mut scratch());
        assert_eq!(grant.get_update_type(USAGE_REPORTING_THRESHOLD), None);
    }

    #[test]
    fn test_update_type_reauth_required() {
        let mut grant = grant_with(1000, false, FinalAction::Terminate);
        grant.set_reauth_state(ReAuthState::Required, &mut scratch());
        assert_eq!(
            grant.get_update_type(USAGE_REPORTING_THRESHOLD),
            Some(CreditUsageUpdateType::ReauthRequired)
        );
    }

    #[test]
    fn test_no_update_for_exhausted_final_grant() {
        let mut grant = grant_with(500, true, FinalAction::Redirect);
        grant.credit.add_used_credit(500, 0, &mut scratch());
        assert_eq!(grant.get_update_type(USAGE_REPORTING_THRESHOLD), None);
    }

    #[test]
    fn test_validity_timer_expired() {
        let mut grant = grant_with(1000, false, FinalAction::Terminate);
        grant.expiry_time = now_epoch() - 1;
        assert_eq!(
            grant.get_update_type(USAGE_REPORTING_THRESHOLD),
            Some(CreditUsageUpdateType::ValidityTimerExpired)
        );
    }

    #[test]
    fn test_should_deactivate_only_final_and_exhausted() {
        let mut grant = grant_with(500, true, FinalAction::Redirect);
        assert!(!grant.should_deactivate_service());
        grant.credit.add_used_credit(500, 0, &mut scratch());
        assert!(grant.should_deactivate_service());

        let mut non_final = grant_with(500, false, FinalAction::Terminate);
        non_final.credit.add_used_credit(500, 0, &mut scratch());
        assert!(!non_final.should_deactivate_service());
    }

    #[test]
    fn test_get_action_resolves_final_action() {
        let mut uc = scratch();
        let mut grant = grant_with(500, true, FinalAction::Redirect);
        grant.set_service_state(ServiceState::NeedsDeactivation, &mut uc);
        assert_eq!(grant.get_action(&mut uc), ServiceActionType::Redirect);
        assert_eq!(grant.service_state, ServiceState::Disabled);

        let mut grant = grant_with(500, true, FinalAction::RestrictAccess);
        grant.set_service_state(ServiceState::NeedsDeactivation, &mut uc);
        assert_eq!(grant.get_action(&mut uc), ServiceActionType::RestrictAccess);

        let mut grant = grant_with(500, false, FinalAction::Terminate);
        grant.set_service_state(ServiceState::NeedsDeactivation, &mut uc);
        assert_eq!(grant.get_action(&mut uc), ServiceActionType::TerminateService);
    }

    #[test]
    fn test_get_action_activation_and_continue() {
        let mut uc = scratch();
        let mut grant = grant_with(500, false, FinalAction::Terminate);
        assert_eq!(grant.get_action(&mut uc), ServiceActionType::ContinueService);

        grant.set_service_state(ServiceState::NeedsActivation, &mut uc);
        assert_eq!(grant.get_action(&mut uc), ServiceActionType::ActivateService);
        assert_eq!(grant.service_state, ServiceState::Enabled);
    }

    #[test]
    fn test_terminate_usage_reports_everything_unacked() {
        let mut uc = scratch();
        let mut grant = grant_with(1000, false, FinalAction::Terminate);
        grant.credit.add_used_credit(100, 200, &mut uc);
        let usage = grant.get_credit_usage(CreditUsageUpdateType::Terminated, &mut uc, true);
        assert_eq!(usage.bytes_tx, 100);
        assert_eq!(usage.bytes_rx, 200);
        assert_eq!(usage.update_type, CreditUsageUpdateType::Terminated);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let grant = grant_with(750, true, FinalAction::RestrictAccess);
        let restored = ChargingGrant::unmarshal(&grant.marshal());
        assert_eq!(grant, restored);
    }
}
