pub mod bus;
pub mod frame;
pub mod id;

pub use bus::{BusMessage, Envelope, PeerIdentity};
pub use frame::{InstanceFrame, InstancePayload, RelayFrame, SysMessage, TopicInfo, TopicRef, TopicUpdate};
pub use id::{ConnectionId, InstanceId, ProcessId, TopicId};
