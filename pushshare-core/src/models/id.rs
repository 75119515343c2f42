use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Identity of one participating process on the host.
///
/// Ordering is lexicographic over `(created_ms, salt)`: the process created
/// first sorts lowest and wins elections, the random salt breaks ties between
/// processes started in the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub created_ms: i64,
    pub salt: u64,
}

impl ProcessId {
    /// Create an id stamped with the current wall-clock millisecond
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(Utc::now().timestamp_millis(), rand::rng().random::<u64>())
    }

    #[must_use]
    pub const fn from_parts(created_ms: i64, salt: u64) -> Self {
        Self { created_ms, salt }
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:016x}", self.created_ms, self.salt)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub const fn from_string(id: String) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Server-side registration identity handed out by `add/user`
    InstanceId
);

string_id!(
    /// Server-side connection group shared by every instance attached to one stream
    ConnectionId
);

string_id!(
    /// Topic identifier as reported by the server
    TopicId
);
