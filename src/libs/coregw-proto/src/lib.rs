//! Shared protocol types for the CoreGW packet core.
//!
//! These are the plain-data messages exchanged between the session
//! enforcement daemon and its peers: the policy/charging controller
//! upstream, the user-plane pipeline downstream, and the access-network
//! components. Everything here is serde-serializable so the same types
//! double as the durable wire layout.

pub mod types;

pub use types::*;
