//! Subscriber-locator (directory) client interface.

use crate::error::{SessionError, SessionResult};

/// Lookup surface toward the subscriber directory.
pub trait DirectorydClient {
    /// Resolve the subscriber's current UE IPv4 address.
    fn get_directoryd_ip_field(&self, imsi: &str) -> SessionResult<String>;

    /// Reverse lookup: which subscriber currently holds this IP.
    fn get_subscriber_id_from_ip(&self, ip: &str) -> SessionResult<String>;
}

/// Stand-in directory client used when no directory service is attached.
#[derive(Debug, Default)]
pub struct LoggingDirectorydClient;

impl DirectorydClient for LoggingDirectorydClient {
    fn get_directoryd_ip_field(&self, imsi: &str) -> SessionResult<String> {
        log::warn!("No directory service attached, cannot resolve IP for {imsi}");
        Err(SessionError::Downstream("directory service unavailable".to_string()))
    }

    fn get_subscriber_id_from_ip(&self, ip: &str) -> SessionResult<String> {
        log::warn!("No directory service attached, cannot resolve subscriber for {ip}");
        Err(SessionError::Downstream("directory service unavailable".to_string()))
    }
}
