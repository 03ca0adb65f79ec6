//! Local enforcement orchestration.
//!
//! The enforcer drives every per-session operation on the single reactor
//! loop: it ingests pipeline usage reports, collects and dispatches
//! batched upstream updates, executes service actions, schedules rule
//! and termination timers, and fans out to the pipeline, directory,
//! serving gateway, and AAA collaborators.
//!
//! Transactions follow one shape: read sessions from the store, mutate
//! them while recording update criteria, commit the criteria, then issue
//! the downstream calls that depend on the committed state.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use coregw_proto::{
    ChargingReAuthRequest, ChargingReAuthType, CreateSessionResponse, CreditKey,
    DynamicRuleInstall, EventTrigger, PolicyBearerBindingRequest, PolicyReAuthRequest,
    PolicyReAuthAnswer, PolicyRule, RatType, ReAuthResult, RedirectInformation, RedirectServer,
    RequestOrigin, RuleRecordTable, SessionConfig, SessionRules, StaticRuleInstall,
    SubscriberQuotaState, SubscriberQuotaUpdate, TrackingType, UpdateSessionRequest,
    UpdateSessionResponse, UsageMonitoringUpdateResponse,
};

use crate::access::{AaaClient, SpgwServiceClient};
use crate::charging_grant::{ServiceAction, ServiceActionType};
use crate::config::SessiondConfig;
use crate::directoryd::DirectorydClient;
use crate::error::{SessionError, SessionResult};
use crate::event::SessiondEvent;
use crate::pipelined::PipelinedClient;
use crate::reporter::SessionReporter;
use crate::rule_store::StaticRuleStore;
use crate::session_state::{BearerUpdate, RuleSetBySubscriber, RulesToProcess, SessionState};
use crate::session_store::{SessionMap, SessionStore, SessionUpdate};
use crate::stored::{RuleLifetime, SessionStateUpdateCriteria};
use crate::timer::{millis_until, now_epoch};

/// Priority of the synthesized gy redirect rule.
pub const REDIRECT_FLOW_PRIORITY: u32 = 2000;

/// Rule id of the synthesized gy redirect rule.
const REDIRECT_RULE_ID: &str = "redirect";

/// Everything needed to finish a REDIRECT/RESTRICT install once the
/// subscriber's IP is known.
#[derive(Debug, Clone)]
struct FinalActionInstallInfo {
    imsi: String,
    session_id: String,
    action_type: ServiceActionType,
    restrict_rule_ids: Vec<String>,
    redirect_server: Option<RedirectServer>,
}

/// Orchestrates per-session operations and collaborator fan-out.
///
/// The live `sessions` map is the working copy: it carries the
/// in-flight reporting counters, which are never persisted. The store
/// holds the durable snapshots and is updated by
/// merge-applying the journals each transaction produced.
pub struct LocalEnforcer {
    reporter: Arc<dyn SessionReporter>,
    rule_store: Arc<StaticRuleStore>,
    session_store: Arc<SessionStore>,
    sessions: RefCell<SessionMap>,
    pipelined: Arc<dyn PipelinedClient>,
    directoryd: Arc<dyn DirectorydClient>,
    spgw_client: Arc<dyn SpgwServiceClient>,
    aaa_client: Arc<dyn AaaClient>,
    event_tx: mpsc::UnboundedSender<SessiondEvent>,

    session_force_termination_timeout_ms: u64,
    quota_exhaustion_termination_on_init_ms: u64,
    retry_timeout_ms: u64,
    usage_reporting_threshold: f64,
    terminate_on_wallet_exhaust: bool,
}

impl LocalEnforcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reporter: Arc<dyn SessionReporter>,
        rule_store: Arc<StaticRuleStore>,
        session_store: Arc<SessionStore>,
        pipelined: Arc<dyn PipelinedClient>,
        directoryd: Arc<dyn DirectorydClient>,
        spgw_client: Arc<dyn SpgwServiceClient>,
        aaa_client: Arc<dyn AaaClient>,
        config: &SessiondConfig,
        event_tx: mpsc::UnboundedSender<SessiondEvent>,
    ) -> Self {
        LocalEnforcer {
            reporter,
            rule_store,
            session_store,
            sessions: RefCell::new(SessionMap::new()),
            pipelined,
            directoryd,
            spgw_client,
            aaa_client,
            event_tx,
            session_force_termination_timeout_ms: config.session_force_termination_timeout_ms,
            quota_exhaustion_termination_on_init_ms: config.quota_exhaustion_termination_on_init_ms,
            retry_timeout_ms: config.retry_timeout_ms,
            usage_reporting_threshold: config.usage_reporting_threshold,
            terminate_on_wallet_exhaust: config.terminate_on_wallet_exhaust,
        }
    }

    // ========================================================================
    // Reactor entry points
    // ========================================================================

    /// One reactor tick: pull usage from the pipeline, account it, then
    /// collect and dispatch the batched upstream report.
    pub fn tick(&self) {
        match self.pipelined.poll_usage() {
            Ok(records) => self.ingest_usage_report(&records),
            Err(e) => log::warn!("Pipeline usage poll failed: {e}"),
        }
        self.collect_updates_and_report();
    }

    pub fn handle_event(&self, event: SessiondEvent) {
        log::debug!("Handling {}", event.name());
        match event {
            SessiondEvent::ScheduledRuleActivation { imsi, rule_id } => {
                self.handle_scheduled_rule_activation(&imsi, &rule_id)
            }
            SessiondEvent::ScheduledRuleDeactivation { imsi, rule_id } => {
                self.handle_scheduled_rule_deactivation(&imsi, &rule_id)
            }
            SessiondEvent::RevalidationTimeout { imsi, session_id } => {
                self.handle_revalidation_timeout(&imsi, &session_id)
            }
            SessiondEvent::ForceTermination { imsi, session_id } => {
                self.handle_force_termination_timeout(&imsi, &session_id)
            }
            SessiondEvent::QuotaExhaustionTermination { imsis } => {
                self.handle_quota_exhaust_termination(&imsis)
            }
            SessiondEvent::PipelineActivateRetry { imsi } => {
                self.handle_pipeline_activate_retry(&imsi)
            }
        }
    }

    /// Re-push every session into the pipeline after a pipeline restart.
    pub fn setup(&self, epoch: u64) -> SessionResult<()> {
        let session_map = self.sessions.borrow();
        let infos: Vec<_> = session_map
            .values()
            .flatten()
            .map(|session| session.get_session_info())
            .collect();
        self.pipelined.setup(&infos, epoch)
    }

    /// Reload the working session map from the store after a daemon
    /// restart, reconcile rule lifetimes, and re-arm the
    /// activation/deactivation timers that are still in the future.
    pub fn sync_sessions_on_restart(&self, current_time: i64) {
        *self.sessions.borrow_mut() = self.session_store.read_all_sessions();
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        for (imsi, sessions) in session_map.iter_mut() {
            for session in sessions.iter_mut() {
                let uc = Self::uc_for(&mut session_update, imsi, session.get_session_id());
                session.sync_rules_to_time(current_time, uc);
                for rule_id in session.get_scheduled_static_rules().clone() {
                    self.arm_lifetime_timers(imsi, &rule_id, session.get_rule_lifetime(&rule_id));
                }
                for rule_id in session.get_scheduled_dynamic_rules().get_rule_ids() {
                    self.arm_lifetime_timers(imsi, &rule_id, session.get_rule_lifetime(&rule_id));
                }
                for rule_id in session.get_static_rules().clone() {
                    self.arm_deactivation_timer(imsi, &rule_id, session.get_rule_lifetime(&rule_id));
                }
                for rule_id in session.get_dynamic_rules().get_rule_ids() {
                    self.arm_deactivation_timer(imsi, &rule_id, session.get_rule_lifetime(&rule_id));
                }
            }
        }
        self.commit(session_update);
    }

    fn arm_lifetime_timers(&self, imsi: &str, rule_id: &str, lifetime: Option<RuleLifetime>) {
        let Some(lifetime) = lifetime else { return };
        if lifetime.activation_time > now_epoch() {
            self.schedule_event(
                millis_until(lifetime.activation_time),
                SessiondEvent::ScheduledRuleActivation {
                    imsi: imsi.to_string(),
                    rule_id: rule_id.to_string(),
                },
            );
        }
        self.arm_deactivation_timer(imsi, rule_id, Some(lifetime));
    }

    fn arm_deactivation_timer(&self, imsi: &str, rule_id: &str, lifetime: Option<RuleLifetime>) {
        let Some(lifetime) = lifetime else { return };
        if lifetime.deactivation_time > now_epoch() {
            self.schedule_event(
                millis_until(lifetime.deactivation_time),
                SessiondEvent::ScheduledRuleDeactivation {
                    imsi: imsi.to_string(),
                    rule_id: rule_id.to_string(),
                },
            );
        }
    }

    // ========================================================================
    // Usage ingestion
    // ========================================================================

    /// Account one pipeline usage report against all touched sessions
    /// and finish terminations whose flows are confirmed gone.
    pub fn ingest_usage_report(&self, records: &RuleRecordTable) {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        if session_map.is_empty() {
            return;
        }
        let mut session_update = SessionStore::get_default_session_update(session_map);
        self.aggregate_records(session_map, records, &mut session_update);
        self.commit(session_update);
    }

    fn aggregate_records(
        &self,
        session_map: &mut SessionMap,
        records: &RuleRecordTable,
        session_update: &mut SessionUpdate,
    ) {
        let mut sessions_with_active_flows: HashSet<String> = HashSet::new();
        for record in &records.records {
            let Some(sessions) = session_map.get_mut(&record.sid) else {
                log::error!("No session for {} during record aggregation", record.sid);
                continue;
            };
            sessions_with_active_flows.insert(record.sid.clone());
            if record.bytes_tx > 0 || record.bytes_rx > 0 {
                log::info!(
                    "{} used {} tx / {} rx bytes for rule {}",
                    record.sid,
                    record.bytes_tx,
                    record.bytes_rx,
                    record.rule_id
                );
            }
            for session in sessions.iter_mut() {
                let uc = Self::uc_for(session_update, &record.sid, session.get_session_id());
                session.add_rule_usage(&record.rule_id, record.bytes_tx, record.bytes_rx, uc);
            }
        }
        self.complete_termination_for_released_sessions(
            session_map,
            &sessions_with_active_flows,
            session_update,
        );
    }

    /// Sessions in RELEASED state that no longer appear in the usage
    /// report have had all their flows removed: finish them.
    fn complete_termination_for_released_sessions(
        &self,
        session_map: &mut SessionMap,
        sessions_with_active_flows: &HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        let mut to_terminate: Vec<(String, String)> = Vec::new();
        for (imsi, sessions) in session_map.iter() {
            for session in sessions {
                if session.get_state() == crate::stored::SessionFsmState::Released
                    && !sessions_with_active_flows.contains(imsi)
                {
                    to_terminate.push((imsi.clone(), session.get_session_id().to_string()));
                }
            }
        }
        for (imsi, session_id) in to_terminate {
            self.complete_termination(session_map, &imsi, &session_id, session_update);
        }
    }

    // ========================================================================
    // Update collection and reporting
    // ========================================================================

    /// Run one full update cycle: collect, act, commit, report upstream,
    /// then apply (or roll back) the controller's answer.
    pub fn collect_updates_and_report(&self) {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        if session_map.is_empty() {
            return;
        }
        let mut session_update = SessionStore::get_default_session_update(session_map);
        let mut actions = Vec::new();
        let request = self.collect_updates(session_map, &mut actions, &mut session_update);
        if !self.commit(session_update) {
            return;
        }
        // actions go downstream only after their state change is durable
        self.execute_actions(session_map, actions);
        if request.is_empty() {
            return;
        }
        match self.reporter.report_update_session(&request) {
            Ok(response) => {
                let mut session_update = SessionStore::get_default_session_update(session_map);
                self.update_session_credits_and_rules(session_map, &response, &mut session_update);
                self.commit(session_update);
            }
            Err(e) => {
                log::error!("Update report failed, rolling back reporting state: {e}");
                let mut session_update = SessionStore::get_default_session_update(session_map);
                self.reset_updates(session_map, &request, &mut session_update);
                self.commit(session_update);
            }
        }
    }

    fn collect_updates(
        &self,
        session_map: &mut SessionMap,
        actions: &mut Vec<ServiceAction>,
        session_update: &mut SessionUpdate,
    ) -> UpdateSessionRequest {
        let mut request = UpdateSessionRequest::default();
        for (imsi, sessions) in session_map.iter_mut() {
            for session in sessions.iter_mut() {
                let uc = Self::uc_for(session_update, imsi, session.get_session_id());
                session.get_updates(&mut request, actions, uc, self.usage_reporting_threshold);
            }
        }
        request
    }

    /// Roll back the reporting counters of every credit and monitor in a
    /// request that could not be delivered. The usage stays accumulated
    /// and rides along with the next report.
    fn reset_updates(
        &self,
        session_map: &mut SessionMap,
        failed_request: &UpdateSessionRequest,
        session_update: &mut SessionUpdate,
    ) {
        for update in &failed_request.updates {
            let Some(sessions) = session_map.get_mut(&update.sid) else {
                log::error!("Cannot reset credit for {}: session not found", update.sid);
                continue;
            };
            let key = CreditKey {
                rating_group: update.usage.charging_key,
                service_identifier: update.usage.service_identifier,
            };
            for session in sessions.iter_mut() {
                let uc = Self::uc_for(session_update, &update.sid, session.get_session_id());
                session.reset_reporting_charging_credit(&key, uc);
            }
        }
        for monitor_req in &failed_request.usage_monitors {
            let Some(sessions) = session_map.get_mut(&monitor_req.sid) else {
                log::error!("Cannot reset monitor for {}: session not found", monitor_req.sid);
                continue;
            };
            let Some(update) = &monitor_req.update else { continue };
            for session in sessions.iter_mut() {
                let uc = Self::uc_for(session_update, &monitor_req.sid, session.get_session_id());
                session.reset_reporting_monitor(&update.monitoring_key, uc);
            }
        }
    }

    // ========================================================================
    // Service actions
    // ========================================================================

    fn execute_actions(&self, session_map: &mut SessionMap, actions: Vec<ServiceAction>) {
        for action in actions {
            match action.action_type {
                ServiceActionType::ActivateService => self.handle_activate_service_action(&action),
                ServiceActionType::Redirect | ServiceActionType::RestrictAccess => {
                    let info = FinalActionInstallInfo {
                        imsi: action.imsi.clone(),
                        session_id: action.session_id.clone(),
                        action_type: action.action_type,
                        restrict_rule_ids: action.restrict_rule_ids.clone(),
                        redirect_server: action.redirect_server.clone(),
                    };
                    self.start_final_unit_action_flows_install(session_map, info);
                }
                ServiceActionType::TerminateService => {
                    if !self.find_and_terminate_session(session_map, &action.imsi, &action.session_id)
                    {
                        log::error!(
                            "Cannot act on TERMINATE: session {} does not exist",
                            action.session_id
                        );
                    }
                }
                ServiceActionType::ContinueService => {}
            }
        }
    }

    fn handle_activate_service_action(&self, action: &ServiceAction) {
        if let Err(e) = self.pipelined.activate_flows_for_rules(
            &action.imsi,
            &action.ip_addr,
            action.ambr.as_ref(),
            &action.rule_ids,
            &action.rule_definitions,
        ) {
            log::error!("Could not activate rules for {}: {e}, retrying", action.imsi);
            self.schedule_event(
                self.retry_timeout_ms,
                SessiondEvent::PipelineActivateRetry { imsi: action.imsi.clone() },
            );
        }
    }

    /// Final-unit flows need the subscriber's current IP, resolved
    /// through the directory. A failed lookup cancels the install; the
    /// session stays up.
    fn start_final_unit_action_flows_install(
        &self,
        session_map: &mut SessionMap,
        info: FinalActionInstallInfo,
    ) {
        log::debug!("Resolving subscriber IP for final-unit install on {}", info.session_id);
        let ip_addr = match self.directoryd.get_directoryd_ip_field(&info.imsi) {
            Ok(ip_addr) => ip_addr,
            Err(e) => {
                // the session stays up, only the final-unit flows are skipped
                let err = SessionError::InvalidFinalUnitState(format!(
                    "no resolvable UE IP for {}: {e}",
                    info.session_id
                ));
                log::error!("{err}, cancelling final action install");
                return;
            }
        };
        let Some(sessions) = session_map.get_mut(&info.imsi) else {
            log::debug!("Session for {} not found", info.imsi);
            return;
        };
        let mut session_update = SessionUpdate::new();
        for session in sessions.iter_mut() {
            if session.get_session_id() != info.session_id {
                continue;
            }
            let uc = Self::uc_for(&mut session_update, &info.imsi, &info.session_id);
            match info.action_type {
                ServiceActionType::Redirect => {
                    let rule = self.create_redirect_rule(&info);
                    if !session.is_gy_dynamic_rule_installed(&rule.id) {
                        log::debug!("Installing redirect gy flow for {}", info.session_id);
                        if let Err(e) = self.pipelined.add_gy_final_action_flow(
                            &info.imsi,
                            &ip_addr,
                            &[],
                            &[rule.clone()],
                        ) {
                            log::error!("Redirect flow install failed for {}: {e}", info.session_id);
                        }
                        session.insert_gy_dynamic_rule(rule, RuleLifetime::always(), uc);
                    }
                }
                ServiceActionType::RestrictAccess => {
                    log::debug!("Installing restrict flows for {}", info.session_id);
                    if let Err(e) = self.pipelined.add_gy_final_action_flow(
                        &info.imsi,
                        &ip_addr,
                        &info.restrict_rule_ids,
                        &[],
                    ) {
                        log::error!("Restrict flow install failed for {}: {e}", info.session_id);
                    }
                    for rule_id in &info.restrict_rule_ids {
                        session.activate_restrict_rule(rule_id, RuleLifetime::always(), uc);
                    }
                }
                _ => {}
            }
        }
        if !self.commit(session_update) {
            log::error!("Failed to store final unit action flows for {}", info.session_id);
        }
    }

    fn create_redirect_rule(&self, info: &FinalActionInstallInfo) -> PolicyRule {
        let redirect_server = info.redirect_server.clone().unwrap_or_default();
        PolicyRule {
            id: REDIRECT_RULE_ID.to_string(),
            priority: REDIRECT_FLOW_PRIORITY,
            redirect: Some(RedirectInformation {
                support_enabled: true,
                address_type: redirect_server.redirect_address_type,
                server_address: redirect_server.redirect_server_address,
            }),
            ..Default::default()
        }
    }

    // ========================================================================
    // Session creation
    // ========================================================================

    /// Build a new session from the controller's create-response, program
    /// the pipeline, and persist it.
    pub fn init_session(
        &self,
        imsi: &str,
        session_id: &str,
        config: SessionConfig,
        response: &CreateSessionResponse,
    ) -> SessionResult<()> {
        let epoch = now_epoch() as u64;
        let mut session = SessionState::new(
            imsi,
            session_id,
            config,
            self.rule_store.clone(),
            response.tgpp_ctx.clone(),
            epoch,
        );
        // session creation persists wholesale, these criteria are scratch
        let mut init_uc = SessionStateUpdateCriteria::default();
        let mut charging_credits_received: HashSet<u32> = HashSet::new();
        for credit in &response.credits {
            if session.receive_charging_credit(credit, &mut init_uc) {
                charging_credits_received.insert(credit.charging_key);
            }
        }
        // command-level monitor errors are handled before they get here
        for monitor in &response.usage_monitors {
            session.receive_monitor(monitor, &mut init_uc);
        }

        self.handle_session_init_rule_updates(
            &mut session,
            response,
            &charging_credits_received,
            &mut init_uc,
        );

        self.update_ipfix_flow(imsi, session.get_config(), epoch);

        if session.is_radius_cwf_session() && self.terminate_on_wallet_exhaust {
            self.handle_session_init_subscriber_quota_state(&mut session, &mut init_uc);
        }

        if Self::revalidation_required(&response.event_triggers) {
            self.schedule_revalidation(&mut session, response.revalidation_time, &mut init_uc);
        }

        if !self.session_store.create_session(&session) {
            return Err(SessionError::Store(format!("failed to persist session {session_id}")));
        }
        self.sessions
            .borrow_mut()
            .entry(imsi.to_string())
            .or_default()
            .push(session);
        log::info!("Initialized session {session_id} for {imsi}");
        Ok(())
    }

    /// Convenience wrapper: allocate a gateway-local session id, ask the
    /// controller for grants, then init.
    pub fn create_session(&self, imsi: &str, config: SessionConfig) -> SessionResult<String> {
        let session_id = format!("{imsi}-{}", uuid::Uuid::new_v4());
        let request = coregw_proto::CreateSessionRequest {
            session_id: session_id.clone(),
            config: config.clone(),
        };
        let response = self.reporter.report_create_session(&request)?;
        self.init_session(imsi, &session_id, config, &response)?;
        Ok(session_id)
    }

    fn handle_session_init_rule_updates(
        &self,
        session: &mut SessionState,
        response: &CreateSessionResponse,
        charging_credits_received: &HashSet<u32>,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let mut static_installs = response.static_rules.clone();
        let mut dynamic_installs = response.dynamic_rules.clone();
        self.filter_rule_installs(&mut static_installs, &mut dynamic_installs, charging_credits_received);

        let mut rules_to_activate = RulesToProcess::default();
        let mut rules_to_deactivate = RulesToProcess::default();
        self.process_rules_to_install(
            session,
            static_installs,
            dynamic_installs,
            &mut rules_to_activate,
            &mut rules_to_deactivate,
            uc,
        );

        let config = session.get_config().clone();
        // the activate call goes out even with no rules: the pipeline
        // installs a drop-all rule for sessions without policies
        self.propagate_rule_updates_to_pipelined(
            &config,
            &rules_to_activate,
            &rules_to_deactivate,
            true,
        );

        if config.common_context.rat_type == RatType::Lte {
            let bearer_update =
                session.get_dedicated_bearer_updates(&rules_to_activate, &rules_to_deactivate, uc);
            self.propagate_bearer_updates_to_mme(&bearer_update);
        }
    }

    /// A rule charged by the online charging system needs credit to be
    /// enforced; monitored-only and untracked rules install regardless.
    fn should_activate(rule: &PolicyRule, successful_credits: &HashSet<u32>) -> bool {
        match rule.tracking_type {
            TrackingType::OnlyOcs | TrackingType::OcsAndPcrf => {
                if !successful_credits.contains(&rule.rating_group) {
                    log::error!(
                        "Not activating {}: no credit for rating group {}",
                        rule.id,
                        rule.rating_group
                    );
                    return false;
                }
                true
            }
            TrackingType::OnlyPcrf | TrackingType::NoTracking => true,
        }
    }

    fn filter_rule_installs(
        &self,
        static_installs: &mut Vec<StaticRuleInstall>,
        dynamic_installs: &mut Vec<DynamicRuleInstall>,
        successful_credits: &HashSet<u32>,
    ) {
        static_installs.retain(|install| {
            let Some(rule) = self.rule_store.get_rule(&install.rule_id) else {
                log::error!("Not activating rule {}: not in the catalog", install.rule_id);
                return false;
            };
            Self::should_activate(&rule, successful_credits)
        });
        dynamic_installs.retain(|install| Self::should_activate(&install.policy_rule, successful_credits));
    }

    /// [CWF] A session created without any monitored rules has no wallet:
    /// tell the pipeline and schedule the session for termination.
    fn handle_session_init_subscriber_quota_state(
        &self,
        session: &mut SessionState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_wallet_exhausted(session) {
            self.handle_subscriber_quota_state_change(session, SubscriberQuotaState::NoQuota, uc);
            session.mark_as_awaiting_termination(uc);
            log::info!(
                "{} scheduling session for termination in {} ms",
                session.get_imsi(),
                self.quota_exhaustion_termination_on_init_ms
            );
            self.schedule_event(
                self.quota_exhaustion_termination_on_init_ms,
                SessiondEvent::QuotaExhaustionTermination {
                    imsis: vec![session.get_imsi().to_string()],
                },
            );
            return;
        }
        self.handle_subscriber_quota_state_change(session, SubscriberQuotaState::ValidQuota, uc);
    }

    fn is_wallet_exhausted(&self, session: &SessionState) -> bool {
        session.is_radius_cwf_session() && !session.active_monitored_rules_exist()
    }

    // ========================================================================
    // Rule install processing
    // ========================================================================

    fn process_rules_to_install(
        &self,
        session: &mut SessionState,
        static_installs: Vec<StaticRuleInstall>,
        dynamic_installs: Vec<DynamicRuleInstall>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let current_time = now_epoch();
        let imsi = session.get_imsi().to_string();
        for install in static_installs {
            let rule_id = install.rule_id.clone();
            if session.is_static_rule_installed(&rule_id) {
                // duplicate installs arrive sometimes, ignore them
                continue;
            }
            let lifetime = RuleLifetime {
                activation_time: install.activation_time,
                deactivation_time: install.deactivation_time,
            };
            if lifetime.activation_time > current_time {
                session.schedule_static_rule(&rule_id, lifetime, uc);
                self.schedule_event(
                    millis_until(lifetime.activation_time),
                    SessiondEvent::ScheduledRuleActivation {
                        imsi: imsi.clone(),
                        rule_id: rule_id.clone(),
                    },
                );
            } else {
                session.activate_static_rule(&rule_id, lifetime, uc);
                rules_to_activate.static_rules.push(rule_id.clone());
            }
            if lifetime.deactivation_time > current_time {
                self.schedule_event(
                    millis_until(lifetime.deactivation_time),
                    SessiondEvent::ScheduledRuleDeactivation { imsi: imsi.clone(), rule_id },
                );
            } else if lifetime.deactivation_time > 0 {
                if !session.deactivate_static_rule(&rule_id, uc) {
                    log::warn!("Could not find rule {rule_id} for {imsi} during removal");
                }
                rules_to_deactivate.static_rules.push(rule_id);
            }
        }
        for install in dynamic_installs {
            let rule = install.policy_rule;
            let lifetime = RuleLifetime {
                activation_time: install.activation_time,
                deactivation_time: install.deactivation_time,
            };
            if lifetime.activation_time > current_time {
                session.schedule_dynamic_rule(rule.clone(), lifetime, uc);
                self.schedule_event(
                    millis_until(lifetime.activation_time),
                    SessiondEvent::ScheduledRuleActivation {
                        imsi: imsi.clone(),
                        rule_id: rule.id.clone(),
                    },
                );
            } else {
                session.insert_dynamic_rule(rule.clone(), lifetime, uc);
                rules_to_activate.dynamic_rules.push(rule.clone());
            }
            if lifetime.deactivation_time > current_time {
                self.schedule_event(
                    millis_until(lifetime.deactivation_time),
                    SessiondEvent::ScheduledRuleDeactivation {
                        imsi: imsi.clone(),
                        rule_id: rule.id.clone(),
                    },
                );
            } else if lifetime.deactivation_time > 0 {
                session.remove_dynamic_rule(&rule.id, uc);
                rules_to_deactivate.dynamic_rules.push(rule);
            }
        }
    }

    fn process_rules_to_remove(
        &self,
        session: &mut SessionState,
        rules_to_remove: &[String],
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        for rule_id in rules_to_remove {
            // dynamic first, static otherwise
            if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                rules_to_deactivate.dynamic_rules.push(rule);
            } else {
                if !session.deactivate_static_rule(rule_id, uc) {
                    log::warn!(
                        "Could not find rule {rule_id} for {} during removal",
                        session.get_imsi()
                    );
                }
                rules_to_deactivate.static_rules.push(rule_id.clone());
            }
        }
    }

    fn propagate_rule_updates_to_pipelined(
        &self,
        config: &SessionConfig,
        rules_to_activate: &RulesToProcess,
        rules_to_deactivate: &RulesToProcess,
        always_send_activate: bool,
    ) {
        let imsi = &config.common_context.sid;
        if always_send_activate || !rules_to_activate.is_empty() {
            let ambr = config.get_apn_ambr();
            if let Err(e) = self.pipelined.activate_flows_for_rules(
                imsi,
                &config.common_context.ue_ipv4,
                ambr.as_ref(),
                &rules_to_activate.static_rules,
                &rules_to_activate.dynamic_rules,
            ) {
                log::error!("Could not activate flows for {imsi}: {e}, retrying");
                self.schedule_event(
                    self.retry_timeout_ms,
                    SessiondEvent::PipelineActivateRetry { imsi: imsi.clone() },
                );
            }
        }
        // an empty deactivate would wipe every rule, so never send one
        if !rules_to_deactivate.is_empty() {
            if let Err(e) = self.pipelined.deactivate_flows_for_rules(
                imsi,
                &rules_to_deactivate.static_rules,
                &rules_to_deactivate.dynamic_rules,
                RequestOrigin::Gx,
            ) {
                log::error!("Could not deactivate flows for {imsi}: {e}");
            }
        }
    }

    // ========================================================================
    // Update-session responses
    // ========================================================================

    /// Apply the controller's answer to a batched report: refresh
    /// charging credits and monitors, apply rule changes, and terminate
    /// subscribers that hit permanent failures or exhausted wallets.
    pub fn update_session_credits_and_rules(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        session_update: &mut SessionUpdate,
    ) {
        let mut subscribers_to_terminate: HashSet<String> = HashSet::new();
        self.update_charging_credits(session_map, response, &mut subscribers_to_terminate, session_update);
        self.update_monitoring_credits_and_rules(
            session_map,
            response,
            &mut subscribers_to_terminate,
            session_update,
        );
        self.terminate_multiple_services(session_map, &subscribers_to_terminate, session_update);
    }

    fn update_charging_credits(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        subscribers_to_terminate: &mut HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        for credit_resp in &response.responses {
            let imsi = &credit_resp.sid;
            if !credit_resp.success {
                self.handle_command_level_result_code(
                    imsi,
                    credit_resp.result_code,
                    subscribers_to_terminate,
                );
                continue;
            }
            let Some(sessions) = session_map.get_mut(imsi) else {
                log::error!("No session for {imsi} during credit update");
                continue;
            };
            for session in sessions.iter_mut() {
                let session_id = session.get_session_id().to_string();
                let was_in_final_state =
                    session.is_credit_in_final_unit_state(&credit_resp.credit_key());
                {
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    session.receive_charging_credit(credit_resp, uc);
                    session.set_tgpp_context(credit_resp.tgpp_ctx.clone(), uc);
                }
                if was_in_final_state {
                    // fresh quota revives a redirected/restricted credit:
                    // drop the final-unit flows that enforced it
                    self.remove_final_action_flows(session, imsi, &session_id, session_update);
                }
            }
        }
    }

    fn remove_final_action_flows(
        &self,
        session: &mut SessionState,
        imsi: &str,
        session_id: &str,
        session_update: &mut SessionUpdate,
    ) {
        let info = session.get_session_info();
        let mut gy_rules_to_deactivate = Vec::new();
        let mut restrict_rules_to_deactivate = Vec::new();
        for rule in info.gy_dynamic_rules {
            let uc = Self::uc_for(session_update, imsi, session_id);
            if let Some(removed) = session.remove_gy_dynamic_rule(&rule.id, uc) {
                gy_rules_to_deactivate.push(removed);
            }
        }
        for rule_id in info.restrict_rules {
            let uc = Self::uc_for(session_update, imsi, session_id);
            if session.deactivate_restrict_rule(&rule_id, uc) {
                restrict_rules_to_deactivate.push(rule_id);
            }
        }
        if !gy_rules_to_deactivate.is_empty() || !restrict_rules_to_deactivate.is_empty() {
            if let Err(e) = self.pipelined.deactivate_flows_for_rules(
                imsi,
                &restrict_rules_to_deactivate,
                &gy_rules_to_deactivate,
                RequestOrigin::Gy,
            ) {
                log::error!("Could not deactivate final action flows for {imsi}: {e}");
            }
        }
    }

    fn update_monitoring_credits_and_rules(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        subscribers_to_terminate: &mut HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        // revalidation is session wide: schedule at most one per subscriber
        let mut imsis_with_revalidation: HashSet<String> = HashSet::new();
        for monitor_resp in &response.usage_monitor_responses {
            let imsi = &monitor_resp.sid;
            if !monitor_resp.success {
                self.handle_command_level_result_code(
                    imsi,
                    monitor_resp.result_code,
                    subscribers_to_terminate,
                );
                continue;
            }
            let Some(sessions) = session_map.get_mut(imsi) else {
                log::error!("No session for {imsi} during monitor update");
                continue;
            };
            for session in sessions.iter_mut() {
                let session_id = session.get_session_id().to_string();
                let config = session.get_config().clone();
                let mut rules_to_activate = RulesToProcess::default();
                let mut rules_to_deactivate = RulesToProcess::default();
                {
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    session.receive_monitor(monitor_resp, uc);
                    session.set_tgpp_context(monitor_resp.tgpp_ctx.clone(), uc);
                    self.process_rules_to_remove(
                        session,
                        &monitor_resp.rules_to_remove,
                        &mut rules_to_deactivate,
                        uc,
                    );
                    self.process_rules_to_install(
                        session,
                        monitor_resp.static_rules_to_install.clone(),
                        monitor_resp.dynamic_rules_to_install.clone(),
                        &mut rules_to_activate,
                        &mut rules_to_deactivate,
                        uc,
                    );
                }
                self.propagate_rule_updates_to_pipelined(
                    &config,
                    &rules_to_activate,
                    &rules_to_deactivate,
                    false,
                );
                if self.terminate_on_wallet_exhaust && self.is_wallet_exhausted(session) {
                    subscribers_to_terminate.insert(imsi.clone());
                }
                if Self::revalidation_required(&monitor_resp.event_triggers)
                    && !imsis_with_revalidation.contains(imsi)
                {
                    imsis_with_revalidation.insert(imsi.clone());
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    self.schedule_revalidation(session, monitor_resp.revalidation_time, uc);
                }
                if config.common_context.rat_type == RatType::Lte {
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    let bearer_update = session.get_dedicated_bearer_updates(
                        &rules_to_activate,
                        &rules_to_deactivate,
                        uc,
                    );
                    self.propagate_bearer_updates_to_mme(&bearer_update);
                }
            }
        }
    }

    fn handle_command_level_result_code(
        &self,
        imsi: &str,
        result_code: u32,
        subscribers_to_terminate: &mut HashSet<String>,
    ) {
        if Self::is_permanent_failure(result_code) {
            log::error!("{imsi} received permanent failure {result_code}, terminating");
            subscribers_to_terminate.insert(imsi.to_string());
        } else {
            log::warn!("{imsi} received transient failure {result_code}, will retry");
        }
    }

    fn is_permanent_failure(result_code: u32) -> bool {
        (5000..6000).contains(&result_code)
    }

    // ========================================================================
    // Reauthorization
    // ========================================================================

    /// Charging controller asked for an immediate usage update.
    pub fn init_charging_reauth(
        &self,
        session_map: &mut SessionMap,
        request: &ChargingReAuthRequest,
        session_update: &mut SessionUpdate,
    ) -> ReAuthResult {
        let Some(sessions) = session_map.get_mut(&request.sid) else {
            log::error!("No session for {} during reauth", request.sid);
            return ReAuthResult::SessionNotFound;
        };
        let Some(session) = sessions
            .iter_mut()
            .find(|s| s.get_session_id() == request.session_id)
        else {
            log::error!("No session {} for {} during reauth", request.session_id, request.sid);
            return ReAuthResult::SessionNotFound;
        };
        let uc = Self::uc_for(session_update, &request.sid, &request.session_id);
        match request.reauth_type {
            ChargingReAuthType::SingleService => {
                log::debug!(
                    "Initiating reauth of key {} for {}",
                    request.charging_key,
                    request.sid
                );
                session.reauth_key(request.credit_key(), uc)
            }
            ChargingReAuthType::EntireSession => {
                log::debug!("Initiating reauth of all keys for {}", request.sid);
                session.reauth_all(uc)
            }
        }
    }

    /// Policy controller pushed rule/monitor changes. An empty session id
    /// applies the request to every session of the subscriber.
    pub fn init_policy_reauth(
        &self,
        session_map: &mut SessionMap,
        request: &PolicyReAuthRequest,
        session_update: &mut SessionUpdate,
    ) -> PolicyReAuthAnswer {
        let mut answer = PolicyReAuthAnswer {
            session_id: request.session_id.clone(),
            ..Default::default()
        };
        let Some(sessions) = session_map.get_mut(&request.imsi) else {
            log::error!("No session for {} during policy reauth", request.imsi);
            answer.result = ReAuthResult::SessionNotFound;
            return answer;
        };
        if request.session_id.is_empty() {
            let session_ids: Vec<String> =
                sessions.iter().map(|s| s.get_session_id().to_string()).collect();
            for session_id in session_ids {
                self.init_policy_reauth_for_session(sessions, &session_id, request, session_update);
            }
        } else {
            let found = sessions
                .iter()
                .any(|s| s.get_session_id() == request.session_id);
            if !found {
                log::error!(
                    "Matching IMSI {} but no session id {} during policy reauth",
                    request.imsi,
                    request.session_id
                );
                answer.result = ReAuthResult::SessionNotFound;
                return answer;
            }
            let session_id = request.session_id.clone();
            self.init_policy_reauth_for_session(sessions, &session_id, request, session_update);
        }
        answer.result = ReAuthResult::UpdateInitiated;
        answer
    }

    fn init_policy_reauth_for_session(
        &self,
        sessions: &mut [SessionState],
        session_id: &str,
        request: &PolicyReAuthRequest,
        session_update: &mut SessionUpdate,
    ) {
        let Some(session) = sessions.iter_mut().find(|s| s.get_session_id() == session_id) else {
            return;
        };
        let imsi = request.imsi.clone();
        log::debug!("Processing policy reauth for {imsi} session {session_id}");
        let config = session.get_config().clone();
        let mut rules_to_activate = RulesToProcess::default();
        let mut rules_to_deactivate = RulesToProcess::default();
        {
            let uc = Self::uc_for(session_update, &imsi, session_id);
            self.receive_monitoring_credit_from_rar(session, request, uc);
            if Self::revalidation_required(&request.event_triggers) {
                self.schedule_revalidation(session, request.revalidation_time, uc);
            }
            self.process_rules_to_remove(session, &request.rules_to_remove, &mut rules_to_deactivate, uc);
            self.process_rules_to_install(
                session,
                request.rules_to_install.clone(),
                request.dynamic_rules_to_install.clone(),
                &mut rules_to_activate,
                &mut rules_to_deactivate,
                uc,
            );
        }
        self.propagate_rule_updates_to_pipelined(&config, &rules_to_activate, &rules_to_deactivate, false);
        if self.terminate_on_wallet_exhaust && self.is_wallet_exhausted(session) {
            let uc = Self::uc_for(session_update, &imsi, session_id);
            self.start_session_termination(session, true, uc);
            return;
        }
        if config.common_context.rat_type == RatType::Lte {
            self.create_bearer(session, request, &rules_to_activate.dynamic_rules);
        }
    }

    /// Monitoring grants carried inside a policy reauth are fed through
    /// the regular monitor path.
    fn receive_monitoring_credit_from_rar(
        &self,
        session: &mut SessionState,
        request: &PolicyReAuthRequest,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        for credit in &request.usage_monitoring_credits {
            let monitoring_response = UsageMonitoringUpdateResponse {
                success: true,
                sid: request.imsi.clone(),
                session_id: request.session_id.clone(),
                credit: Some(credit.clone()),
                ..Default::default()
            };
            session.receive_monitor(&monitoring_response, uc);
        }
    }

    fn revalidation_required(event_triggers: &[EventTrigger]) -> bool {
        event_triggers.contains(&EventTrigger::RevalidationTimeout)
    }

    fn schedule_revalidation(
        &self,
        session: &mut SessionState,
        revalidation_time: i64,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        session.add_new_event_trigger(EventTrigger::RevalidationTimeout, uc);
        session.set_revalidation_time(revalidation_time, uc);
        let delay_ms = millis_until(revalidation_time);
        log::info!("Scheduling revalidation in {delay_ms} ms for {}", session.get_session_id());
        self.schedule_event(
            delay_ms,
            SessiondEvent::RevalidationTimeout {
                imsi: session.get_imsi().to_string(),
                session_id: session.get_session_id().to_string(),
            },
        );
    }

    // ========================================================================
    // Declarative rule sets
    // ========================================================================

    /// Apply a desired-state rule push to every matching session and
    /// propagate the diffs to the pipeline and (for LTE) bearer layer.
    pub fn handle_set_session_rules(
        &self,
        session_map: &mut SessionMap,
        rules: &SessionRules,
        session_update: &mut SessionUpdate,
    ) {
        for rules_per_sub in &rules.rules_per_subscriber {
            let imsi = &rules_per_sub.imsi;
            let Some(sessions) = session_map.get_mut(imsi) else {
                log::error!("No session for {imsi} during rule set update");
                continue;
            };
            let rule_set_by_sub = RuleSetBySubscriber::from_rules_per_subscriber(rules_per_sub);
            for session in sessions.iter_mut() {
                let apn = session.get_config().common_context.apn.clone();
                let Some(rule_set) = rule_set_by_sub.get_combined_rule_set_for_apn(&apn) else {
                    continue;
                };
                let session_id = session.get_session_id().to_string();
                let config = session.get_config().clone();
                let mut rules_to_activate = RulesToProcess::default();
                let mut rules_to_deactivate = RulesToProcess::default();
                {
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    session.apply_session_rule_set(
                        &rule_set,
                        &mut rules_to_activate,
                        &mut rules_to_deactivate,
                        uc,
                    );
                }
                self.propagate_rule_updates_to_pipelined(
                    &config,
                    &rules_to_activate,
                    &rules_to_deactivate,
                    false,
                );
                if config.common_context.rat_type == RatType::Lte {
                    let uc = Self::uc_for(session_update, imsi, &session_id);
                    let bearer_update = session.get_dedicated_bearer_updates(
                        &rules_to_activate,
                        &rules_to_deactivate,
                        uc,
                    );
                    self.propagate_bearer_updates_to_mme(&bearer_update);
                }
            }
        }
    }

    // ========================================================================
    // Bearer management
    // ========================================================================

    /// Record a confirmed policy-to-bearer binding, or unwind the rule
    /// when the access network refused the bearer (id 0).
    pub fn bind_policy_to_bearer(
        &self,
        session_map: &mut SessionMap,
        request: &PolicyBearerBindingRequest,
        session_update: &mut SessionUpdate,
    ) -> bool {
        let imsi = &request.sid;
        let Some(sessions) = session_map.get_mut(imsi) else {
            log::error!("Cannot bind policy to bearer: no session for {imsi}");
            return false;
        };
        for session in sessions.iter_mut() {
            let Some(lte) = session.get_config().lte_context() else { continue };
            if lte.bearer_id != request.linked_bearer_id {
                continue;
            }
            let session_id = session.get_session_id().to_string();
            let uc = Self::uc_for(session_update, imsi, &session_id);
            if request.bearer_id != 0 {
                session.bind_policy_to_bearer(request, uc);
                return true;
            }
            // the QoS request cannot be honored, drop the rule
            self.remove_rule_due_to_bearer_creation_failure(session, &request.policy_rule_id, uc);
        }
        false
    }

    fn remove_rule_due_to_bearer_creation_failure(
        &self,
        session: &mut SessionState,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!("Removing {rule_id}: dedicated bearer creation failed");
        let Some(policy_type) = session.get_policy_type(rule_id) else {
            log::error!("Cannot remove rule {rule_id}: not found");
            return;
        };
        let mut static_rules = Vec::new();
        let mut dynamic_rules = Vec::new();
        match policy_type {
            crate::stored::PolicyType::Static => {
                session.deactivate_static_rule(rule_id, uc);
                static_rules.push(rule_id.to_string());
            }
            crate::stored::PolicyType::Dynamic => {
                if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                    dynamic_rules.push(rule);
                }
            }
        }
        if let Err(e) = self.pipelined.deactivate_flows_for_rules(
            session.get_imsi(),
            &static_rules,
            &dynamic_rules,
            RequestOrigin::Gx,
        ) {
            log::error!("Could not deactivate flows for {}: {e}", session.get_imsi());
        }
    }

    fn create_bearer(
        &self,
        session: &SessionState,
        request: &PolicyReAuthRequest,
        dynamic_rules: &[PolicyRule],
    ) {
        let config = session.get_config();
        let Some(lte) = config.lte_context() else {
            log::warn!("No LTE context for session {}", session.get_session_id());
            return;
        };
        let (Some(default_qos), Some(requested_qos)) = (lte.qos_info, request.qos_info) else {
            log::debug!("Not creating bearer: no QoS info");
            return;
        };
        if requested_qos.qos_class_id == default_qos.qos_class_id {
            return;
        }
        log::debug!("QCI in reauth differs from default, creating dedicated bearer");
        let req = coregw_proto::CreateBearerRequest {
            sid: config.common_context.sid.clone(),
            ip_addr: config.common_context.ue_ipv4.clone(),
            link_bearer_id: lte.bearer_id,
            policy_rules: dynamic_rules.to_vec(),
        };
        if let Err(e) = self.spgw_client.create_dedicated_bearer(&req) {
            log::error!("Dedicated bearer creation failed for {}: {e}", config.common_context.sid);
        }
    }

    fn propagate_bearer_updates_to_mme(&self, update: &BearerUpdate) {
        // deletions first so the final state is the desired one
        if let Some(delete_req) = &update.delete_req {
            if let Err(e) = self.spgw_client.delete_dedicated_bearer(delete_req) {
                log::error!("Dedicated bearer deletion failed: {e}");
            }
        }
        if let Some(create_req) = &update.create_req {
            if let Err(e) = self.spgw_client.create_dedicated_bearer(create_req) {
                log::error!("Dedicated bearer creation failed: {e}");
            }
        }
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Externally triggered termination for `(imsi, apn)` sessions. The
    /// access component initiated it, so it is not notified back.
    pub fn terminate_session(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        apn: &str,
        session_update: &mut SessionUpdate,
    ) -> SessionResult<()> {
        let Some(sessions) = session_map.get_mut(imsi) else {
            log::error!("No session for {imsi} during termination");
            return Err(SessionError::SessionNotFound(imsi.to_string()));
        };
        for session in sessions.iter_mut() {
            if session.get_config().common_context.apn == apn {
                let session_id = session.get_session_id().to_string();
                log::info!("Starting externally triggered termination for {session_id}");
                let uc = Self::uc_for(session_update, imsi, &session_id);
                self.start_session_termination(session, false, uc);
            }
        }
        Ok(())
    }

    fn find_and_terminate_session(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        session_id: &str,
    ) -> bool {
        let Some(sessions) = session_map.get_mut(imsi) else { return false };
        let Some(session) = sessions
            .iter_mut()
            .find(|s| s.get_session_id() == session_id)
        else {
            return false;
        };
        let mut session_update = SessionUpdate::new();
        let uc = Self::uc_for(&mut session_update, imsi, session_id);
        self.start_session_termination(session, true, uc);
        self.commit(session_update);
        true
    }

    fn terminate_multiple_services(
        &self,
        session_map: &mut SessionMap,
        imsis: &HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        for imsi in imsis {
            let Some(sessions) = session_map.get_mut(imsi) else { continue };
            for session in sessions.iter_mut() {
                let session_id = session.get_session_id().to_string();
                let uc = Self::uc_for(session_update, imsi, &session_id);
                self.start_session_termination(session, true, uc);
            }
        }
    }

    /// Start the termination protocol: mark RELEASED and persist that
    /// first, then strip pipeline flows, notify access, propagate wallet
    /// state, and arm the force-termination timer.
    fn start_session_termination(
        &self,
        session: &mut SessionState,
        notify_access: bool,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let imsi = session.get_imsi().to_string();
        let session_id = session.get_session_id().to_string();
        if session.is_terminating() {
            log::info!("Session {session_id} already terminating, ignoring");
            return;
        }
        log::info!("Initiating session termination for {session_id}");
        let epoch = now_epoch() as u64;
        session.set_pdp_end_time(epoch);
        uc.updated_pdp_end_time = epoch;

        let info = session.get_session_info();
        for rule_id in &info.static_rules {
            session.deactivate_static_rule(rule_id, uc);
        }
        for rule in &info.dynamic_rules {
            session.remove_dynamic_rule(&rule.id, uc);
        }
        for rule in &info.gy_dynamic_rules {
            session.remove_gy_dynamic_rule(&rule.id, uc);
        }
        for rule_id in &info.restrict_rules {
            session.deactivate_restrict_rule(rule_id, uc);
        }
        session.set_fsm_state(crate::stored::SessionFsmState::Released, uc);

        // the RELEASED state must be durable before the pipeline loses
        // the flows that report this session
        let mut fsm_update = SessionUpdate::new();
        let fsm_uc = Self::uc_for(&mut fsm_update, &imsi, &session_id);
        fsm_uc.updated_fsm_state = Some(crate::stored::SessionFsmState::Released);
        fsm_uc.updated_pdp_end_time = epoch;
        self.commit(fsm_update);

        let mut rules_to_deactivate = RulesToProcess {
            static_rules: info.static_rules.clone(),
            dynamic_rules: info.dynamic_rules.clone(),
        };
        rules_to_deactivate
            .static_rules
            .extend(info.restrict_rules.iter().cloned());
        rules_to_deactivate
            .dynamic_rules
            .extend(info.gy_dynamic_rules.iter().cloned());
        if !rules_to_deactivate.is_empty() {
            if let Err(e) = self.pipelined.deactivate_flows_for_rules(
                &imsi,
                &rules_to_deactivate.static_rules,
                &rules_to_deactivate.dynamic_rules,
                RequestOrigin::Wildcard,
            ) {
                log::error!("Could not deactivate flows for {imsi}: {e}");
            }
        }

        let config = session.get_config().clone();
        if notify_access {
            self.notify_termination_to_access_service(&imsi, &session_id, &config);
        }
        if let Some(wlan) = config.wlan_context() {
            log::debug!("Deleting UE MAC flow for {imsi}");
            if let Err(e) = self.pipelined.delete_ue_mac_flow(&imsi, &wlan.mac_addr) {
                log::error!("Could not delete UE MAC flow for {imsi}: {e}");
            }
        }
        if self.terminate_on_wallet_exhaust {
            self.handle_subscriber_quota_state_change(session, SubscriberQuotaState::Terminate, uc);
        }
        // termination completes when the usage report no longer carries
        // this session; the timer forces it through otherwise
        self.schedule_event(
            self.session_force_termination_timeout_ms,
            SessiondEvent::ForceTermination { imsi, session_id },
        );
    }

    fn notify_termination_to_access_service(
        &self,
        imsi: &str,
        session_id: &str,
        config: &SessionConfig,
    ) {
        match config.common_context.rat_type {
            RatType::Wlan => {
                let Some(wlan) = config.wlan_context() else {
                    log::warn!("{session_id} is WLAN but has no WLAN context");
                    return;
                };
                log::debug!(
                    "Asking AAA to terminate radius session {} for {imsi}",
                    wlan.radius_session_id
                );
                if let Err(e) = self.aaa_client.terminate_session(&wlan.radius_session_id, imsi) {
                    log::error!("AAA termination notify failed for {imsi}: {e}");
                }
            }
            RatType::Lte => {
                let Some(lte) = config.lte_context() else {
                    log::warn!("{session_id} is LTE but has no LTE context");
                    return;
                };
                if let Err(e) = self.spgw_client.delete_default_bearer(
                    imsi,
                    &config.common_context.ue_ipv4,
                    lte.bearer_id,
                ) {
                    log::error!("Default bearer deletion failed for {imsi}: {e}");
                }
            }
        }
    }

    fn complete_termination(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        session_id: &str,
        session_update: &mut SessionUpdate,
    ) {
        let Some(sessions) = session_map.get_mut(imsi) else {
            // already gone, or a fresh session replaced it
            log::debug!("No session for {imsi}/{session_id}, skipping termination");
            return;
        };
        let Some(pos) = sessions
            .iter()
            .position(|s| s.get_session_id() == session_id)
        else {
            log::debug!("Session {session_id} not found, skipping termination");
            return;
        };
        {
            let uc = Self::uc_for(session_update, imsi, session_id);
            sessions[pos].complete_termination(self.reporter.as_ref(), uc);
            uc.is_session_ended = true;
        }
        sessions.remove(pos);
        log::debug!("Terminated session {session_id} for {imsi}");
        if sessions.is_empty() {
            session_map.remove(imsi);
            log::debug!("All sessions terminated for {imsi}");
        }
    }

    // ========================================================================
    // Subscriber quota state (CWF)
    // ========================================================================

    fn handle_subscriber_quota_state_change(
        &self,
        session: &mut SessionState,
        new_state: SubscriberQuotaState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!(
            "{} subscriber wallet status is now {new_state:?}",
            session.get_session_id()
        );
        session.set_subscriber_quota_state(new_state, uc);
        let mac_addr = session
            .get_config()
            .wlan_context()
            .map(|wlan| wlan.mac_addr.clone())
            .unwrap_or_default();
        self.report_subscriber_state_to_pipelined(session.get_imsi(), &mac_addr, new_state);
    }

    fn report_subscriber_state_to_pipelined(
        &self,
        imsi: &str,
        mac_addr: &str,
        state: SubscriberQuotaState,
    ) {
        let update = SubscriberQuotaUpdate {
            sid: imsi.to_string(),
            mac_addr: mac_addr.to_string(),
            state,
        };
        if let Err(e) = self.pipelined.update_subscriber_quota_state(&[update]) {
            log::error!("Failed to update quota state to {state:?} for {imsi}: {e}");
        }
    }

    fn update_ipfix_flow(&self, imsi: &str, config: &SessionConfig, pdp_start_time: u64) {
        log::debug!("Updating IPFIX flow for {imsi}");
        if let Err(e) = self.pipelined.update_ipfix_flow(imsi, config, pdp_start_time) {
            log::error!("Failed to update IPFIX flow for {imsi}: {e}");
        }
    }

    // ========================================================================
    // CWF roaming
    // ========================================================================

    /// Replace the session config for every session of the subscriber
    /// (WLAN only) and refresh the IPFIX flow.
    pub fn handle_cwf_roaming(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        config: &SessionConfig,
        session_update: &mut SessionUpdate,
    ) {
        let Some(sessions) = session_map.get_mut(imsi) else { return };
        for session in sessions.iter_mut() {
            let session_id = session.get_session_id().to_string();
            let uc = Self::uc_for(session_update, imsi, &session_id);
            session.set_config(config.clone());
            uc.updated_config = Some(config.clone());
            self.update_ipfix_flow(imsi, config, session.get_pdp_start_time());
        }
    }

    // ========================================================================
    // Timer event handlers
    // ========================================================================

    fn handle_scheduled_rule_activation(&self, imsi: &str, rule_id: &str) {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        if let Some(sessions) = session_map.get_mut(imsi) {
            for session in sessions.iter_mut() {
                if !session.is_active() {
                    continue;
                }
                let session_id = session.get_session_id().to_string();
                let config = session.get_config().clone();
                let mut rules_to_activate = RulesToProcess::default();
                {
                    let uc = Self::uc_for(&mut session_update, imsi, &session_id);
                    if session.is_static_rule_scheduled(rule_id) {
                        session.install_scheduled_static_rule(rule_id, uc);
                        rules_to_activate.static_rules.push(rule_id.to_string());
                    } else if session.is_dynamic_rule_scheduled(rule_id) {
                        session.install_scheduled_dynamic_rule(rule_id, uc);
                        if let Some(rule) = session.get_dynamic_rules().get_rule(rule_id) {
                            rules_to_activate.dynamic_rules.push(rule.clone());
                        }
                    }
                }
                if !rules_to_activate.is_empty() {
                    self.propagate_rule_updates_to_pipelined(
                        &config,
                        &rules_to_activate,
                        &RulesToProcess::default(),
                        false,
                    );
                }
            }
        }
        self.commit(session_update);
    }

    fn handle_scheduled_rule_deactivation(&self, imsi: &str, rule_id: &str) {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        if let Some(sessions) = session_map.get_mut(imsi) {
            for session in sessions.iter_mut() {
                if !session.is_active() {
                    continue;
                }
                let session_id = session.get_session_id().to_string();
                let config = session.get_config().clone();
                let mut rules_to_deactivate = RulesToProcess::default();
                {
                    let uc = Self::uc_for(&mut session_update, imsi, &session_id);
                    if session.deactivate_static_rule(rule_id, uc) {
                        rules_to_deactivate.static_rules.push(rule_id.to_string());
                    } else if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                        rules_to_deactivate.dynamic_rules.push(rule);
                    }
                }
                if !rules_to_deactivate.is_empty() {
                    self.propagate_rule_updates_to_pipelined(
                        &config,
                        &RulesToProcess::default(),
                        &rules_to_deactivate,
                        false,
                    );
                }
            }
        }
        self.commit(session_update);
    }

    fn handle_revalidation_timeout(&self, imsi: &str, session_id: &str) {
        log::info!("Revalidation timeout for {session_id}");
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        if let Some(sessions) = session_map.get_mut(imsi) {
            for session in sessions.iter_mut() {
                if session.get_session_id() != session_id {
                    continue;
                }
                let uc = Self::uc_for(&mut session_update, imsi, session_id);
                session.mark_event_trigger_as_triggered(EventTrigger::RevalidationTimeout, uc);
            }
        }
        self.commit(session_update);
    }

    /// Force a termination through after the grace period. A session
    /// that already finished (or was replaced) is left alone.
    fn handle_force_termination_timeout(&self, imsi: &str, session_id: &str) {
        log::debug!("Checking if termination must be forced for {session_id}");
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let exists = session_map
            .get(imsi)
            .map_or(false, |sessions| sessions.iter().any(|s| s.get_session_id() == session_id));
        if !exists {
            log::debug!("Session {session_id} already terminated, nothing to force");
            return;
        }
        let mut session_update = SessionStore::get_default_session_update(session_map);
        self.complete_termination(session_map, imsi, session_id, &mut session_update);
        if self.commit(session_update) {
            log::debug!("Forcefully ended session {session_id}");
        } else {
            log::error!("Failed to update store with forced termination of {session_id}");
        }
    }

    fn handle_quota_exhaust_termination(&self, imsis: &[String]) {
        let imsi_set: HashSet<String> = imsis.iter().cloned().collect();
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        self.terminate_multiple_services(session_map, &imsi_set, &mut session_update);
        if !self.commit(session_update) {
            log::error!("Failed to update store with quota-exhaust termination");
        }
    }

    fn handle_pipeline_activate_retry(&self, imsi: &str) {
        let sessions_ref = self.sessions.borrow();
        let Some(sessions) = sessions_ref.get(imsi) else { return };
        for session in sessions {
            if !session.is_active() {
                continue;
            }
            let info = session.get_session_info();
            if let Err(e) = self.pipelined.activate_flows_for_rules(
                &info.imsi,
                &info.ip_addr,
                info.ambr.as_ref(),
                &info.static_rules,
                &info.dynamic_rules,
            ) {
                log::error!("Pipeline activate retry failed for {imsi}: {e}");
            }
        }
    }

    // ========================================================================
    // Public transaction wrappers
    // ========================================================================

    pub fn handle_charging_reauth(&self, request: &ChargingReAuthRequest) -> ReAuthResult {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        let result = self.init_charging_reauth(session_map, request, &mut session_update);
        self.commit(session_update);
        result
    }

    pub fn handle_policy_reauth(&self, request: &PolicyReAuthRequest) -> PolicyReAuthAnswer {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        let answer = self.init_policy_reauth(session_map, request, &mut session_update);
        self.commit(session_update);
        answer
    }

    pub fn handle_session_rules_update(&self, rules: &SessionRules) {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        self.handle_set_session_rules(session_map, rules, &mut session_update);
        self.commit(session_update);
    }

    pub fn handle_bind_policy_to_bearer(&self, request: &PolicyBearerBindingRequest) -> bool {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        let bound = self.bind_policy_to_bearer(session_map, request, &mut session_update);
        self.commit(session_update);
        bound
    }

    pub fn handle_terminate_session(&self, imsi: &str, apn: &str) -> SessionResult<()> {
        let mut sessions_ref = self.sessions.borrow_mut();
        let session_map = &mut *sessions_ref;
        let mut session_update = SessionStore::get_default_session_update(session_map);
        let result = self.terminate_session(session_map, imsi, apn, &mut session_update);
        self.commit(session_update);
        result
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn uc_for<'a>(
        session_update: &'a mut SessionUpdate,
        imsi: &str,
        session_id: &str,
    ) -> &'a mut SessionStateUpdateCriteria {
        session_update
            .entry(imsi.to_string())
            .or_default()
            .entry(session_id.to_string())
            .or_default()
    }

    fn commit(&self, session_update: SessionUpdate) -> bool {
        if !self.session_store.update_sessions(session_update) {
            log::error!("Session store commit failed, in-memory state discarded");
            return false;
        }
        true
    }

    fn schedule_event(&self, delay_ms: u64, event: SessiondEvent) {
        let tx = self.event_tx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("Armed {} for {delay_ms} ms", event.timer_id().name());
                handle.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = tx.send(event);
                });
            }
            Err(_) => {
                log::debug!("No reactor running, {} not armed", event.timer_id().name());
            }
        }
    }
}
