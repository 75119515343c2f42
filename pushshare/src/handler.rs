use tracing::{error, info};

use pushshare_cluster::{Error, PubSubHandler, Topic, TopicHooks};

/// Logs every façade callback and follows each topic as it appears
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl PubSubHandler for LoggingHandler {
    fn on_connected(&mut self) {
        info!("Push stream connected");
    }

    fn on_disconnected(&mut self) {
        info!("Push stream disconnected");
    }

    fn on_error(&mut self, error: &Error) {
        error!(error = %error, "Push stream error");
    }

    fn on_new_topic(&mut self, topic: &mut Topic) {
        info!(topic_id = %topic.id(), kind = topic.kind(), "New topic");

        let (sub_id, unsub_id, update_id) = (topic.id().clone(), topic.id().clone(), topic.id().clone());
        topic.hooks = TopicHooks::default()
            .on_subscribed(move || info!(topic_id = %sub_id, "Subscribed"))
            .on_unsubscribed(move || info!(topic_id = %unsub_id, "Unsubscribed"))
            .on_update(move |data| info!(topic_id = %update_id, data = %data, "Topic update"));
    }

    fn on_removed_topic(&mut self, topic: &Topic) {
        info!(topic_id = %topic.id(), "Topic removed");
    }
}
