//! Frames delivered by the server-push stream
//!
//! One frame multiplexes payloads for every instance attached to a
//! connection group:
//!
//! ```json
//! {"instances":[{"id":"I-1","data":{"sys":null,"updates":[{"topic":"T-1","data":"..."}]}}]}
//! ```

use serde::{Deserialize, Serialize};

use super::id::{InstanceId, TopicId};

/// A complete frame as received from the push stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    #[serde(default)]
    pub instances: Vec<InstanceFrame>,
}

impl RelayFrame {
    /// Payload addressed to `instance_id`, if the frame carries one
    #[must_use]
    pub fn payload_for(&self, instance_id: &InstanceId) -> Option<&InstancePayload> {
        self.instances
            .iter()
            .find(|instance| &instance.id == instance_id)
            .map(|instance| &instance.data)
    }

    /// Every instance id the server reported in this frame
    pub fn instance_ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.iter().map(|instance| &instance.id)
    }
}

/// Per-instance section of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceFrame {
    pub id: InstanceId,
    #[serde(default)]
    pub data: InstancePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstancePayload {
    #[serde(default)]
    pub sys: Option<Vec<SysMessage>>,
    #[serde(default)]
    pub updates: Option<Vec<TopicUpdate>>,
}

/// Topic lifecycle message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SysMessage {
    /// Authoritative full list of topics visible to the instance
    Topics {
        #[serde(default)]
        list: Vec<TopicRef>,
    },
    Subscribed {
        #[serde(default)]
        list: Vec<TopicRef>,
    },
    Unsubscribed {
        #[serde(default)]
        list: Vec<TopicRef>,
    },
}

impl SysMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Topics { .. } => "topics",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
        }
    }
}

/// Topic reference inside a `sys` list: either a bare id or an info object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicRef {
    Id(TopicId),
    Info(TopicInfo),
}

impl TopicRef {
    #[must_use]
    pub const fn id(&self) -> &TopicId {
        match self {
            Self::Id(id) => id,
            Self::Info(info) => &info.id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Id(_) => "",
            Self::Info(info) => &info.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    #[serde(alias = "name", alias = "ID")]
    pub id: TopicId,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Data published on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicUpdate {
    pub topic: TopicId,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_frame() {
        let json = r#"{"instances":[{"id":"I-ba6b","data":{"sys":null,"updates":[{"topic":"T-bc57","data":"DATAAAAAA"}]}}]}"#;
        let frame: RelayFrame = serde_json::from_str(json).unwrap();

        let payload = frame.payload_for(&InstanceId::from("I-ba6b")).unwrap();
        assert!(payload.sys.is_none());
        let updates = payload.updates.as_ref().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].topic.as_str(), "T-bc57");
        assert_eq!(updates[0].data, serde_json::json!("DATAAAAAA"));

        assert!(frame.payload_for(&InstanceId::from("I-other")).is_none());
    }

    #[test]
    fn test_parse_sys_messages_with_mixed_topic_refs() {
        let json = r#"{"instances":[{"id":"I-1","data":{"sys":[
            {"type":"topics","list":[{"name":"news","type":"public"},{"id":"chat"}]},
            {"type":"subscribed","list":[{"ID":"news"}]},
            {"type":"unsubscribed","list":["chat"]}
        ]}}]}"#;
        let frame: RelayFrame = serde_json::from_str(json).unwrap();
        let sys = frame.instances[0].data.sys.as_ref().unwrap();

        match &sys[0] {
            SysMessage::Topics { list } => {
                assert_eq!(list[0].id().as_str(), "news");
                assert_eq!(list[0].kind(), "public");
                assert_eq!(list[1].id().as_str(), "chat");
            }
            other => panic!("unexpected sys message {other:?}"),
        }
        assert_eq!(sys[1].kind(), "subscribed");
        match &sys[2] {
            SysMessage::Unsubscribed { list } => assert_eq!(list[0].id().as_str(), "chat"),
            other => panic!("unexpected sys message {other:?}"),
        }
    }

    #[test]
    fn test_missing_list_defaults_to_empty() {
        let sys: SysMessage = serde_json::from_str(r#"{"type":"topics"}"#).unwrap();
        assert_eq!(sys, SysMessage::Topics { list: Vec::new() });
    }

    #[test]
    fn test_instance_ids() {
        let json = r#"{"instances":[{"id":"I-1","data":{}},{"id":"I-2"}]}"#;
        let frame: RelayFrame = serde_json::from_str(json).unwrap();
        let ids: Vec<&str> = frame.instance_ids().map(InstanceId::as_str).collect();
        assert_eq!(ids, vec!["I-1", "I-2"]);
    }
}
