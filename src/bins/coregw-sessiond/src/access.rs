//! Access-network notifier interfaces.
//!
//! LTE sessions talk to the serving gateway for dedicated-bearer
//! management and default-bearer teardown; CWF sessions notify the AAA
//! service when a radius session must go away.

use coregw_proto::{CreateBearerRequest, DeleteBearerRequest};

use crate::error::SessionResult;

/// Control surface toward the LTE serving gateway.
pub trait SpgwServiceClient {
    fn create_dedicated_bearer(&self, req: &CreateBearerRequest) -> SessionResult<()>;
    fn delete_dedicated_bearer(&self, req: &DeleteBearerRequest) -> SessionResult<()>;
    fn delete_default_bearer(&self, imsi: &str, ue_ipv4: &str, bearer_id: u32)
        -> SessionResult<()>;
}

/// Control surface toward the WLAN AAA service.
pub trait AaaClient {
    fn terminate_session(&self, radius_session_id: &str, imsi: &str) -> SessionResult<()>;
}

/// Stand-in SGW client.
#[derive(Debug, Default)]
pub struct LoggingSpgwClient;

impl SpgwServiceClient for LoggingSpgwClient {
    fn create_dedicated_bearer(&self, req: &CreateBearerRequest) -> SessionResult<()> {
        log::info!(
            "create_dedicated_bearer for {} with {} policy rules",
            req.sid,
            req.policy_rules.len()
        );
        Ok(())
    }

    fn delete_dedicated_bearer(&self, req: &DeleteBearerRequest) -> SessionResult<()> {
        log::info!("delete_dedicated_bearer for {} bearers {:?}", req.sid, req.eps_bearer_ids);
        Ok(())
    }

    fn delete_default_bearer(
        &self,
        imsi: &str,
        _ue_ipv4: &str,
        bearer_id: u32,
    ) -> SessionResult<()> {
        log::info!("delete_default_bearer for {imsi} bearer {bearer_id}");
        Ok(())
    }
}

/// Stand-in AAA client.
#[derive(Debug, Default)]
pub struct LoggingAaaClient;

impl AaaClient for LoggingAaaClient {
    fn terminate_session(&self, radius_session_id: &str, imsi: &str) -> SessionResult<()> {
        log::info!("AAA terminate radius session {radius_session_id} for {imsi}");
        Ok(())
    }
}
