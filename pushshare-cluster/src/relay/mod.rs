//! Leader-side ownership of the single upstream push stream

pub mod gc;
pub mod sse;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pushshare_core::metrics;
use pushshare_core::models::{InstanceId, RelayFrame};

use crate::error::{Error, Result};

pub use gc::UnknownInstanceTracker;
pub use sse::{SseConnector, SseDecoder};

/// Ordered stream of frames from the push server
pub type FrameStream = BoxStream<'static, Result<RelayFrame>>;

/// Transport that opens the push stream for one instance
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, instance_id: &InstanceId) -> Result<FrameStream>;
}

/// Relay lifecycle within one leadership tenure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Registering,
    Streaming,
    Error,
    Closed,
}

/// Event posted by a stream task, tagged with the tenure that spawned it
#[derive(Debug)]
pub struct StreamEvent {
    pub tenure: u64,
    pub kind: StreamEventKind,
}

#[derive(Debug)]
pub enum StreamEventKind {
    Opened,
    Frame(RelayFrame),
    Failed(Error),
}

/// State of the leader's relay
///
/// Stream reads happen in a spawned task that posts [`StreamEvent`]s back to
/// the owner; events from a superseded tenure are recognised by their tag and
/// dropped.
pub struct StreamRelay {
    connector: Arc<dyn StreamConnector>,
    state: RelayState,
    tenure: u64,
    cancel: Option<CancellationToken>,
    tracker: UnknownInstanceTracker,
    backoff_builder: ExponentialBuilder,
    backoff: ExponentialBackoff,
    max_delay: Duration,
}

impl StreamRelay {
    #[must_use]
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        unknown_instance_threshold: u32,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(max_delay)
            .without_max_times();
        Self {
            connector,
            state: RelayState::Idle,
            tenure: 0,
            cancel: None,
            tracker: UnknownInstanceTracker::new(unknown_instance_threshold),
            backoff: backoff_builder.build(),
            backoff_builder,
            max_delay,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RelayState {
        self.state
    }

    #[must_use]
    pub const fn tenure(&self) -> u64 {
        self.tenure
    }

    /// True when `event` belongs to the stream currently running
    #[must_use]
    pub fn is_current(&self, event: &StreamEvent) -> bool {
        event.tenure == self.tenure && self.cancel.is_some()
    }

    pub fn begin_registering(&mut self) {
        self.state = RelayState::Registering;
    }

    /// Open the push stream for `instance_id` in a new tenure, replacing any
    /// stream already running
    pub fn start(&mut self, instance_id: InstanceId, events: mpsc::UnboundedSender<StreamEvent>) {
        self.stop_task();
        self.tenure += 1;
        self.state = RelayState::Streaming;

        let tenure = self.tenure;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let connector = self.connector.clone();

        info!(instance_id = %instance_id, tenure = tenure, "Starting push stream relay");

        tokio::spawn(async move {
            let send = |kind| events.send(StreamEvent { tenure, kind }).is_ok();

            let connected = tokio::select! {
                () = token.cancelled() => return,
                result = connector.connect(&instance_id) => result,
            };
            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    send(StreamEventKind::Failed(e));
                    return;
                }
            };
            if !send(StreamEventKind::Opened) {
                return;
            }

            loop {
                let item = tokio::select! {
                    () = token.cancelled() => {
                        debug!(tenure = tenure, "Push stream task cancelled");
                        return;
                    }
                    item = stream.next() => item,
                };
                let delivered = match item {
                    Some(Ok(frame)) => send(StreamEventKind::Frame(frame)),
                    Some(Err(e)) => {
                        send(StreamEventKind::Failed(e));
                        return;
                    }
                    None => {
                        send(StreamEventKind::Failed(Error::StreamFailed(
                            "server closed the push stream".to_string(),
                        )));
                        return;
                    }
                };
                if !delivered {
                    return;
                }
            }
        });
    }

    /// The stream opened; the next failure starts backing off from scratch
    pub fn on_opened(&mut self) {
        self.backoff = self.backoff_builder.build();
    }

    /// Record a stream failure and return how long to wait before reconnecting
    pub fn on_failure(&mut self, error: &Error) -> Duration {
        self.stop_task();
        self.state = RelayState::Error;
        metrics::STREAM_ERRORS.inc();

        let delay = self.backoff.next().unwrap_or(self.max_delay);
        warn!(error = %error, retry_in = ?delay, "Push stream failed");
        delay
    }

    /// Count a relayed frame and return the instances to garbage-collect
    pub fn observe(&mut self, frame: &RelayFrame, known: &HashSet<InstanceId>) -> Vec<InstanceId> {
        metrics::FRAMES_RELAYED.inc();
        self.tracker.observe(frame.instance_ids(), known)
    }

    /// Tear the stream down for good (graceful close or demotion)
    pub fn stop(&mut self) {
        self.stop_task();
        self.tracker.clear();
        self.state = if self.state == RelayState::Idle {
            RelayState::Idle
        } else {
            RelayState::Closed
        };
    }

    /// Return to idle after a demotion, ready for another tenure
    pub fn reset(&mut self) {
        self.stop();
        self.state = RelayState::Idle;
        self.backoff = self.backoff_builder.build();
    }

    fn stop_task(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.stop_task();
    }
}
