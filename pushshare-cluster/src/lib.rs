pub mod bus;
pub mod error;
pub mod handler;
pub mod membership;
pub mod pubsub;
pub mod registration;
pub mod relay;
pub mod topics;

pub use bus::{LocalBus, MemoryBus, RedisBus};
pub use error::{Error, Result};
pub use handler::PubSubHandler;
pub use membership::{Membership, RoleChange};
pub use pubsub::{ConnectionStatus, PubSub, PubSubBuilder, PubSubConfig, Status};
pub use registration::{HttpRegistrationClient, InstanceRegistry, Registration};
pub use relay::{FrameStream, RelayState, SseConnector, StreamConnector};
pub use topics::{Topic, TopicHooks, TopicSnapshot};
