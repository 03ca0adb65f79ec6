//! Upstream reporting interface to the policy/charging controller.

use coregw_proto::{
    CreateSessionRequest, CreateSessionResponse, SessionTerminateRequest, UpdateSessionRequest,
    UpdateSessionResponse,
};

use crate::error::SessionResult;

/// RPC surface toward the remote policy/charging controller.
pub trait SessionReporter {
    fn report_create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> SessionResult<CreateSessionResponse>;

    fn report_update_session(
        &self,
        req: &UpdateSessionRequest,
    ) -> SessionResult<UpdateSessionResponse>;

    fn report_terminate_session(&self, req: &SessionTerminateRequest) -> SessionResult<()>;
}

/// Stand-in reporter used when no controller is attached. Accepts every
/// request and answers with empty grants.
#[derive(Debug, Default)]
pub struct LoggingSessionReporter;

impl SessionReporter for LoggingSessionReporter {
    fn report_create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> SessionResult<CreateSessionResponse> {
        log::info!("report_create_session for {}", req.session_id);
        Ok(CreateSessionResponse::default())
    }

    fn report_update_session(
        &self,
        req: &UpdateSessionRequest,
    ) -> SessionResult<UpdateSessionResponse> {
        log::info!(
            "report_update_session with {} credit updates, {} monitor updates",
            req.updates.len(),
            req.usage_monitors.len()
        );
        Ok(UpdateSessionResponse::default())
    }

    fn report_terminate_session(&self, req: &SessionTerminateRequest) -> SessionResult<()> {
        log::info!(
            "report_terminate_session for {} with {} credit usages",
            req.session_id,
            req.credit_usages.len()
        );
        Ok(())
    }
}
