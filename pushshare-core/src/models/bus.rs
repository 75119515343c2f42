use serde::{Deserialize, Serialize};

use super::frame::RelayFrame;
use super::id::{ConnectionId, InstanceId, ProcessId};

/// Identity a process reports in `ack`, `ping` and `master` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "tabID")]
    pub process_id: ProcessId,
    #[serde(rename = "instanceId", default)]
    pub instance_id: Option<InstanceId>,
    #[serde(rename = "connectionId", default)]
    pub connection_id: Option<ConnectionId>,
}

impl PeerIdentity {
    #[must_use]
    pub const fn bare(process_id: ProcessId) -> Self {
        Self {
            process_id,
            instance_id: None,
            connection_id: None,
        }
    }
}

/// Messages exchanged between processes on the local bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusMessage {
    /// Announce presence and solicit acks
    New(ProcessId),
    Ack(PeerIdentity),
    Ping(PeerIdentity),
    /// Leadership claim
    Master(PeerIdentity),
    /// Server frame forwarded by the leader
    Data(RelayFrame),
    EventOpen,
    EventError,
    EventClose,
}

impl BusMessage {
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::New(_) => "new",
            Self::Ack(_) => "ack",
            Self::Ping(_) => "ping",
            Self::Master(_) => "master",
            Self::Data(_) => "data",
            Self::EventOpen => "event_open",
            Self::EventError => "event_error",
            Self::EventClose => "event_close",
        }
    }
}

/// Wire envelope: `{type, data, from}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ProcessId,
    #[serde(flatten)]
    pub message: BusMessage,
}

impl Envelope {
    #[must_use]
    pub const fn new(from: ProcessId, message: BusMessage) -> Self {
        Self { from, message }
    }
}
