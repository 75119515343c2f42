//! Per-process topic registry and reconciliation
//!
//! The registry mirrors the server's view of which topics this instance can
//! see and which of them it is subscribed to. It is driven only by `sys`
//! messages from frames addressed to this instance.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, trace};

use pushshare_core::models::{InstancePayload, SysMessage, TopicId, TopicRef, TopicUpdate};

use crate::handler::PubSubHandler;

type Hook = Box<dyn FnMut() + Send>;
type UpdateHook = Box<dyn FnMut(&serde_json::Value) + Send>;

/// Optional per-topic callbacks
#[derive(Default)]
pub struct TopicHooks {
    pub on_subscribed: Option<Hook>,
    pub on_unsubscribed: Option<Hook>,
    pub on_update: Option<UpdateHook>,
}

impl TopicHooks {
    #[must_use]
    pub fn on_subscribed(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_subscribed = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_unsubscribed(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_unsubscribed = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_update(mut self, hook: impl FnMut(&serde_json::Value) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for TopicHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHooks")
            .field("on_subscribed", &self.on_subscribed.is_some())
            .field("on_unsubscribed", &self.on_unsubscribed.is_some())
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

/// A server-side topic visible to this instance
#[derive(Debug)]
pub struct Topic {
    id: TopicId,
    kind: String,
    subscribed: bool,
    pub hooks: TopicHooks,
}

impl Topic {
    fn new(id: TopicId, kind: String) -> Self {
        Self {
            id,
            kind,
            subscribed: false,
            hooks: TopicHooks::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TopicId {
        &self.id
    }

    /// Type tag reported by the server (empty when only the id was sent)
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    #[must_use]
    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            id: self.id.clone(),
            kind: self.kind.clone(),
            subscribed: self.subscribed,
        }
    }

    fn fire_subscribed(&mut self) {
        if let Some(hook) = self.hooks.on_subscribed.as_mut() {
            hook();
        }
    }

    fn fire_unsubscribed(&mut self) {
        if let Some(hook) = self.hooks.on_unsubscribed.as_mut() {
            hook();
        }
    }

    fn fire_update(&mut self, data: &serde_json::Value) {
        if let Some(hook) = self.hooks.on_update.as_mut() {
            hook(data);
        }
    }
}

/// Plain-data view of a topic, safe to hand across tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSnapshot {
    pub id: TopicId,
    pub kind: String,
    pub subscribed: bool,
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: BTreeMap<TopicId, Topic>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one instance payload: `sys` messages in order, then updates
    pub fn apply(&mut self, payload: &InstancePayload, handler: &mut dyn PubSubHandler) {
        for message in payload.sys.iter().flatten() {
            trace!(kind = message.kind(), "Applying sys message");
            match message {
                SysMessage::Topics { list } => self.reconcile(list, handler),
                SysMessage::Subscribed { list } => self.mark_subscribed(list),
                SysMessage::Unsubscribed { list } => self.mark_unsubscribed(list),
            }
        }
        if let Some(updates) = &payload.updates {
            self.dispatch_updates(updates);
        }
    }

    /// Bring the registry in line with the authoritative topic list
    ///
    /// New ids are created before missing ones are removed, so a handler
    /// observing `on_removed_topic` already sees the new topics in place.
    pub fn reconcile(&mut self, list: &[TopicRef], handler: &mut dyn PubSubHandler) {
        let wanted: HashSet<&TopicId> = list.iter().map(TopicRef::id).collect();

        for entry in list {
            if self.topics.contains_key(entry.id()) {
                continue;
            }
            debug!(topic_id = %entry.id(), kind = entry.kind(), "New topic");
            let mut topic = Topic::new(entry.id().clone(), entry.kind().to_string());
            handler.on_new_topic(&mut topic);
            self.topics.insert(topic.id.clone(), topic);
        }

        let stale: Vec<TopicId> = self
            .topics
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();

        for id in stale {
            if let Some(mut topic) = self.topics.remove(&id) {
                if topic.subscribed {
                    topic.fire_unsubscribed();
                    topic.subscribed = false;
                }
                debug!(topic_id = %id, "Topic removed");
                handler.on_removed_topic(&topic);
            }
        }
    }

    /// Flip known topics to subscribed; unknown ids are ignored
    pub fn mark_subscribed(&mut self, list: &[TopicRef]) {
        for entry in list {
            match self.topics.get_mut(entry.id()) {
                Some(topic) if !topic.subscribed => {
                    topic.subscribed = true;
                    topic.fire_subscribed();
                }
                Some(_) => {}
                None => debug!(topic_id = %entry.id(), "Subscribed to unknown topic, ignoring"),
            }
        }
    }

    /// Flip known topics to unsubscribed; unknown ids are ignored
    pub fn mark_unsubscribed(&mut self, list: &[TopicRef]) {
        for entry in list {
            match self.topics.get_mut(entry.id()) {
                Some(topic) if topic.subscribed => {
                    topic.subscribed = false;
                    topic.fire_unsubscribed();
                }
                Some(_) => {}
                None => debug!(topic_id = %entry.id(), "Unsubscribed from unknown topic, ignoring"),
            }
        }
    }

    /// Deliver each update to its topic's `on_update`; unknown topics drop silently
    pub fn dispatch_updates(&mut self, updates: &[TopicUpdate]) {
        for update in updates {
            if let Some(topic) = self.topics.get_mut(&update.topic) {
                topic.fire_update(&update.data);
            }
        }
    }

    /// Replace the hooks on a known topic. Returns false if the topic is unknown.
    pub fn set_hooks(&mut self, id: &TopicId, hooks: TopicHooks) -> bool {
        match self.topics.get_mut(id) {
            Some(topic) => {
                topic.hooks = hooks;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: &TopicId) -> Option<&Topic> {
        self.topics.get(id)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TopicSnapshot> {
        self.topics.values().map(Topic::snapshot).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
