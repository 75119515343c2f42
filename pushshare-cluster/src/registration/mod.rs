//! Registration of this process's instance with the push server

pub mod http;

use async_trait::async_trait;

use pushshare_core::models::{ConnectionId, InstanceId};

use crate::error::Result;

pub use http::{build_client, HttpRegistrationClient};

/// Identity handed out by `add/user`
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Registration {
    pub instance_id: InstanceId,
    pub connection_id: ConnectionId,
}

/// The three registration endpoints of the push server
///
/// Implementations carry no retry policy; callers decide whether to retry,
/// fall back or give up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Register a new instance, attached to `existing` when given, otherwise
    /// on a fresh connection. The server may hand back a different
    /// connection than the one requested.
    async fn register_new(&self, existing: Option<ConnectionId>) -> Result<Registration>;

    /// Move an existing instance onto another connection group
    async fn change_connection(&self, instance_id: InstanceId, connection_id: ConnectionId) -> Result<()>;

    async fn remove_instance(&self, instance_id: InstanceId) -> Result<()>;
}
