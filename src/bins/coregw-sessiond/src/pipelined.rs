//! User-plane pipeline client interface.
//!
//! The pipeline owns the actual enforcement flows. Programming it is
//! fire-and-forget from the session engine's perspective: the session
//! model reflects intent, and a pipeline restart triggers a full
//! [`PipelinedClient::setup`] re-push from the stored sessions.

use coregw_proto::{
    AggregatedMaximumBitrate, PolicyRule, RequestOrigin, RuleRecordTable, SessionConfig,
    SubscriberQuotaUpdate,
};

use crate::error::SessionResult;
use crate::session_state::SessionInfo;

/// RPC surface toward the user-plane pipeline.
pub trait PipelinedClient {
    /// Idempotent re-push of every session's rules after a pipeline
    /// restart.
    fn setup(&self, session_infos: &[SessionInfo], epoch: u64) -> SessionResult<()>;

    fn activate_flows_for_rules(
        &self,
        imsi: &str,
        ip_addr: &str,
        ambr: Option<&AggregatedMaximumBitrate>,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> SessionResult<()>;

    fn deactivate_flows_for_rules(
        &self,
        imsi: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
        origin: RequestOrigin,
    ) -> SessionResult<()>;

    /// Install the synthesized redirect rule or the restrict rules after
    /// a final-unit action fired.
    fn add_gy_final_action_flow(
        &self,
        imsi: &str,
        ip_addr: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> SessionResult<()>;

    fn update_ipfix_flow(
        &self,
        imsi: &str,
        config: &SessionConfig,
        pdp_start_time: u64,
    ) -> SessionResult<()>;

    fn update_subscriber_quota_state(
        &self,
        updates: &[SubscriberQuotaUpdate],
    ) -> SessionResult<()>;

    /// CWF only: drop the UE MAC flow when a session terminates.
    fn delete_ue_mac_flow(&self, imsi: &str, mac_addr: &str) -> SessionResult<()>;

    /// Pull the pending usage records. Counters are cumulative per flow.
    fn poll_usage(&self) -> SessionResult<RuleRecordTable>;
}

/// Stand-in pipeline client used when no user plane is attached.
#[derive(Debug, Default)]
pub struct LoggingPipelinedClient;

impl PipelinedClient for LoggingPipelinedClient {
    fn setup(&self, session_infos: &[SessionInfo], epoch: u64) -> SessionResult<()> {
        log::info!("pipeline setup with {} sessions at epoch {}", session_infos.len(), epoch);
        Ok(())
    }

    fn activate_flows_for_rules(
        &self,
        imsi: &str,
        ip_addr: &str,
        _ambr: Option<&AggregatedMaximumBitrate>,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> SessionResult<()> {
        log::info!(
            "activate_flows for {imsi} ip={ip_addr}: {} static, {} dynamic",
            static_rules.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn deactivate_flows_for_rules(
        &self,
        imsi: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
        origin: RequestOrigin,
    ) -> SessionResult<()> {
        log::info!(
            "deactivate_flows for {imsi} origin={origin:?}: {} static, {} dynamic",
            static_rules.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn add_gy_final_action_flow(
        &self,
        imsi: &str,
        ip_addr: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> SessionResult<()> {
        log::info!(
            "add_gy_final_action_flow for {imsi} ip={ip_addr}: {} static, {} dynamic",
            static_rules.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn update_ipfix_flow(
        &self,
        imsi: &str,
        _config: &SessionConfig,
        pdp_start_time: u64,
    ) -> SessionResult<()> {
        log::debug!("update_ipfix_flow for {imsi} pdp_start={pdp_start_time}");
        Ok(())
    }

    fn update_subscriber_quota_state(
        &self,
        updates: &[SubscriberQuotaUpdate],
    ) -> SessionResult<()> {
        for update in updates {
            log::info!("subscriber {} quota state -> {:?}", update.sid, update.state);
        }
        Ok(())
    }

    fn delete_ue_mac_flow(&self, imsi: &str, mac_addr: &str) -> SessionResult<()> {
        log::info!("delete_ue_mac_flow for {imsi} mac={mac_addr}");
        Ok(())
    }

    fn poll_usage(&self) -> SessionResult<RuleRecordTable> {
        Ok(RuleRecordTable::default())
    }
}
