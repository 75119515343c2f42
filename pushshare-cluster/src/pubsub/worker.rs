use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pushshare_core::metrics;
use pushshare_core::models::{BusMessage, ConnectionId, Envelope, InstanceId, ProcessId, RelayFrame, TopicId};

use super::{ConnectionStatus, PubSubConfig, Status};
use crate::bus::{BusReceiver, LocalBus};
use crate::error::{Error, Result};
use crate::handler::PubSubHandler;
use crate::membership::{Membership, Outcome, RoleChange};
use crate::registration::{InstanceRegistry, Registration};
use crate::relay::{RelayState, StreamConnector, StreamEvent, StreamEventKind, StreamRelay};
use crate::topics::{TopicHooks, TopicRegistry, TopicSnapshot};

/// Requests from the [`super::PubSub`] handle
pub(crate) enum Command {
    Open,
    Close(oneshot::Sender<()>),
    SetTopicHooks(TopicId, TopicHooks, oneshot::Sender<bool>),
    Topics(oneshot::Sender<Vec<TopicSnapshot>>),
}

/// Completions posted back by tasks the worker spawned
#[derive(Debug)]
enum Internal {
    OpenPoll {
        attempt: u64,
    },
    Registered {
        attempt: u64,
        as_leader: bool,
        previous: Option<InstanceId>,
        result: Result<Registration>,
    },
    ConnectionChanged {
        attempt: u64,
        instance_id: InstanceId,
        connection_id: ConnectionId,
        result: Result<()>,
    },
    RetryDue {
        tenure: u64,
    },
}

/// Whether a follower's frames are being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    Detached,
    /// `change_connection` in flight
    Changing,
    Attached,
}

/// Receiving ends of the worker's internal channels
pub(crate) struct Inbox {
    internal: mpsc::UnboundedReceiver<Internal>,
    stream: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Single-consumer event loop owning all per-process state
pub(crate) struct Worker {
    me: ProcessId,
    config: PubSubConfig,
    bus: Arc<dyn LocalBus>,
    registry: Arc<dyn InstanceRegistry>,
    membership: Membership,
    topics: TopicRegistry,
    relay: StreamRelay,
    handler: Box<dyn PubSubHandler>,
    connection: ConnectionStatus,
    open_requested: bool,
    /// Bumped on every fresh connection attempt; completions carrying an
    /// older value are stale
    attempt: u64,
    attachment: Attachment,
    /// A failed `change_connection` already fell back to re-registration
    drift_reregistered: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    status_tx: watch::Sender<Status>,
}

impl Worker {
    pub(crate) fn new(
        me: ProcessId,
        config: PubSubConfig,
        bus: Arc<dyn LocalBus>,
        registry: Arc<dyn InstanceRegistry>,
        connector: Arc<dyn StreamConnector>,
        handler: Box<dyn PubSubHandler>,
        status_tx: watch::Sender<Status>,
    ) -> (Self, Inbox) {
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (stream_tx, stream) = mpsc::unbounded_channel();

        let relay = StreamRelay::new(
            connector,
            config.unknown_instance_threshold,
            config.reconnect_min_delay,
            config.reconnect_max_delay,
        );

        let worker = Self {
            me,
            membership: Membership::new(me, config.liveness_timeout, Instant::now()),
            config,
            bus,
            registry,
            topics: TopicRegistry::new(),
            relay,
            handler,
            connection: ConnectionStatus::Idle,
            open_requested: false,
            attempt: 0,
            attachment: Attachment::Detached,
            drift_reregistered: false,
            internal_tx,
            stream_tx,
            status_tx,
        };
        (worker, Inbox { internal, stream })
    }

    pub(crate) async fn run(
        mut self,
        mut inbox: Inbox,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut bus_rx: BusReceiver,
        cancel: CancellationToken,
    ) {
        self.publish(self.membership.announce()).await;

        let start = Instant::now();
        let heartbeat_period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let check_period = self.config.check_interval.max(Duration::from_millis(1));
        let mut heartbeat = time::interval_at(start + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = time::interval_at(start + check_period, check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let first_election = time::sleep(self.config.announce_window);
        tokio::pin!(first_election);
        let mut elected = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(process_id = %self.me, "Pub/sub worker shutting down");
                    break;
                }
                () = &mut first_election, if !elected => {
                    elected = true;
                    let outcome = self.membership.elect_leader(Instant::now());
                    self.apply_outcome(outcome).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await.is_break() {
                        self.publish_status();
                        break;
                    }
                }
                Some(event) = inbox.internal.recv() => self.handle_internal(event).await,
                Some(event) = inbox.stream.recv() => self.handle_stream_event(event).await,
                envelope = bus_rx.recv() => {
                    let Some(envelope) = envelope else {
                        warn!(process_id = %self.me, "Local bus closed, stopping worker");
                        break;
                    };
                    self.handle_envelope(envelope).await;
                }
                _ = heartbeat.tick() => self.publish(self.membership.heartbeat()).await,
                _ = check.tick() => {
                    let outcome = self.membership.check_liveness(Instant::now());
                    self.apply_outcome(outcome).await;
                }
            }
            self.publish_status();
        }

        self.relay.stop();
        metrics::forget_process(&self.me.to_string());
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Open => self.open(),
            Command::Close(reply) => {
                self.close().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Command::SetTopicHooks(topic_id, hooks, reply) => {
                let _ = reply.send(self.topics.set_hooks(&topic_id, hooks));
            }
            Command::Topics(reply) => {
                let _ = reply.send(self.topics.snapshot());
            }
        }
        ControlFlow::Continue(())
    }

    fn open(&mut self) {
        match self.connection {
            ConnectionStatus::Connecting => {
                debug!(process_id = %self.me, "Connection attempt in flight, open() ignored");
            }
            ConnectionStatus::Closed => {
                warn!(process_id = %self.me, "open() called after close(), ignored");
            }
            ConnectionStatus::Idle | ConnectionStatus::Connected => {
                self.open_requested = true;
                self.begin_open();
            }
        }
    }

    /// Start a connection attempt from scratch, dropping any current registration
    fn begin_open(&mut self) {
        self.attempt += 1;
        self.connection = ConnectionStatus::Connecting;
        self.attachment = Attachment::Detached;
        self.drift_reregistered = false;

        if let Some(previous) = self.membership.own_instance_id() {
            self.spawn_remove(previous);
        }
        self.membership.clear_registration();
        if self.relay.state() != RelayState::Idle {
            self.relay.reset();
        }

        debug!(process_id = %self.me, attempt = self.attempt, "Opening connection");
        self.try_register();
    }

    /// Register once a leader (and, for followers, its connection) is known;
    /// otherwise look again after a short deferral
    fn try_register(&mut self) {
        if self.membership.leader().is_none() {
            self.schedule_poll();
            return;
        }

        if self.membership.is_leader() {
            self.relay.begin_registering();
            self.spawn_register(None, true, None);
            return;
        }

        match self.membership.leader_connection_id() {
            Some(connection_id) => self.spawn_register(Some(connection_id), false, None),
            None => {
                debug!(process_id = %self.me, "Leader has no connection yet, waiting");
                self.schedule_poll();
            }
        }
    }

    fn schedule_poll(&self) {
        let tx = self.internal_tx.clone();
        let attempt = self.attempt;
        let delay = self.config.open_poll_interval;
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Internal::OpenPoll { attempt });
        });
    }

    fn spawn_register(&self, existing: Option<ConnectionId>, as_leader: bool, previous: Option<InstanceId>) {
        let registry = self.registry.clone();
        let tx = self.internal_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = registry.register_new(existing).await;
            let _ = tx.send(Internal::Registered {
                attempt,
                as_leader,
                previous,
                result,
            });
        });
    }

    fn spawn_remove(&self, instance_id: InstanceId) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.remove_instance(instance_id.clone()).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to remove instance");
            }
        });
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::OpenPoll { attempt } => {
                if attempt == self.attempt && self.connection == ConnectionStatus::Connecting {
                    self.try_register();
                }
            }
            Internal::Registered {
                attempt,
                as_leader,
                previous,
                result,
            } => self.on_registered(attempt, as_leader, previous, result).await,
            Internal::ConnectionChanged {
                attempt,
                instance_id,
                connection_id,
                result,
            } => self.on_connection_changed(attempt, instance_id, connection_id, result).await,
            Internal::RetryDue { tenure } => self.on_retry_due(tenure),
        }
    }

    async fn on_registered(
        &mut self,
        attempt: u64,
        as_leader: bool,
        previous: Option<InstanceId>,
        result: Result<Registration>,
    ) {
        if attempt != self.attempt || self.connection == ConnectionStatus::Closed {
            // Superseded by a newer attempt; don't leave the instance behind
            if let Ok(registration) = result {
                debug!(instance_id = %registration.instance_id, "Discarding late registration");
                self.spawn_remove(registration.instance_id);
            }
            return;
        }

        let registration = match result {
            Ok(registration) => registration,
            Err(e) => {
                warn!(process_id = %self.me, error = %e, "Registration failed");
                self.connection = ConnectionStatus::Idle;
                if as_leader {
                    self.relay.reset();
                }
                self.handler.on_error(&e);
                return;
            }
        };

        if let Some(previous) = previous.filter(|prev| *prev != registration.instance_id) {
            self.spawn_remove(previous);
        }

        info!(
            process_id = %self.me,
            instance_id = %registration.instance_id,
            connection_id = %registration.connection_id,
            leader = as_leader,
            "Instance registered"
        );
        self.membership
            .set_registration(registration.instance_id.clone(), registration.connection_id);
        // Let peers learn the instance before it shows up in relayed frames
        self.publish(self.membership.heartbeat()).await;

        if as_leader {
            self.connection = ConnectionStatus::Connected;
            self.relay.start(registration.instance_id, self.stream_tx.clone());
        } else {
            self.attach_to_leader();
        }
    }

    /// Follower only: accept relayed frames when our connection matches the
    /// leader's, otherwise move our instance onto the leader's connection
    fn attach_to_leader(&mut self) {
        if self.membership.is_leader()
            || matches!(self.connection, ConnectionStatus::Idle | ConnectionStatus::Closed)
        {
            return;
        }
        let (Some(instance_id), Some(own_connection)) =
            (self.membership.own_instance_id(), self.membership.own_connection_id())
        else {
            return;
        };
        let Some(leader_connection) = self.membership.leader_connection_id() else {
            return;
        };

        if own_connection == leader_connection {
            if self.attachment != Attachment::Attached {
                info!(
                    process_id = %self.me,
                    connection_id = %own_connection,
                    "Attached to leader's connection"
                );
                self.attachment = Attachment::Attached;
                self.connection = ConnectionStatus::Connected;
                self.drift_reregistered = false;
            }
            return;
        }

        if self.attachment == Attachment::Changing {
            return;
        }

        warn!(
            process_id = %self.me,
            own = %own_connection,
            leader = %leader_connection,
            "Connection drifted from leader's, moving instance"
        );
        self.attachment = Attachment::Changing;

        let registry = self.registry.clone();
        let tx = self.internal_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = registry
                .change_connection(instance_id.clone(), leader_connection.clone())
                .await;
            let _ = tx.send(Internal::ConnectionChanged {
                attempt,
                instance_id,
                connection_id: leader_connection,
                result,
            });
        });
    }

    async fn on_connection_changed(
        &mut self,
        attempt: u64,
        instance_id: InstanceId,
        connection_id: ConnectionId,
        result: Result<()>,
    ) {
        if attempt != self.attempt || self.membership.own_instance_id().as_ref() != Some(&instance_id) {
            return;
        }
        self.attachment = Attachment::Detached;

        match result {
            Ok(()) => {
                self.membership.set_registration(instance_id, connection_id);
                self.publish(self.membership.heartbeat()).await;
                self.attach_to_leader();
            }
            Err(e) if self.drift_reregistered => {
                let error = Error::ReconciliationDrift(format!(
                    "instance {instance_id} could not join connection {connection_id}: {e}"
                ));
                warn!(process_id = %self.me, error = %error, "Giving up on leader's connection");
                self.spawn_remove(instance_id);
                self.membership.clear_registration();
                self.connection = ConnectionStatus::Idle;
                self.handler.on_error(&error);
            }
            Err(e) => {
                warn!(
                    process_id = %self.me,
                    instance_id = %instance_id,
                    error = %e,
                    "change_connection failed, re-registering against leader's connection"
                );
                self.drift_reregistered = true;
                self.membership.clear_registration();
                match self.membership.leader_connection_id() {
                    Some(leader_connection) => {
                        self.spawn_register(Some(leader_connection), false, Some(instance_id));
                    }
                    None => {
                        self.spawn_remove(instance_id);
                        self.schedule_poll();
                    }
                }
            }
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        if !self.relay.is_current(&event) || !self.membership.is_leader() {
            return;
        }

        match event.kind {
            StreamEventKind::Opened => {
                self.relay.on_opened();
                info!(process_id = %self.me, "Push stream open");
                self.publish(BusMessage::EventOpen).await;
                self.handler.on_connected();
            }
            StreamEventKind::Frame(frame) => {
                self.publish(BusMessage::Data(frame.clone())).await;
                self.apply_frame(&frame);

                let known = self.membership.known_instance_ids();
                for instance_id in self.relay.observe(&frame, &known) {
                    info!(instance_id = %instance_id, "Unknown instance past threshold, removing");
                    metrics::INSTANCES_COLLECTED.with_label_values(&["unknown"]).inc();
                    self.spawn_remove(instance_id);
                }
            }
            StreamEventKind::Failed(error) => {
                let delay = self.relay.on_failure(&error);
                self.publish(BusMessage::EventError).await;
                self.handler.on_error(&error);

                let tx = self.internal_tx.clone();
                let tenure = self.relay.tenure();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    let _ = tx.send(Internal::RetryDue { tenure });
                });
            }
        }
    }

    /// Back off elapsed: register again on our own connection and reopen
    fn on_retry_due(&mut self, tenure: u64) {
        if tenure != self.relay.tenure()
            || self.relay.state() != RelayState::Error
            || !self.membership.is_leader()
            || self.connection == ConnectionStatus::Closed
        {
            return;
        }
        self.relay.begin_registering();
        self.spawn_register(
            self.membership.own_connection_id(),
            true,
            self.membership.own_instance_id(),
        );
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        let from_leader = self.membership.leader() == Some(from);

        match message {
            BusMessage::Data(frame) => {
                if from_leader && !self.membership.is_leader() && self.attachment == Attachment::Attached {
                    self.apply_frame(&frame);
                }
            }
            BusMessage::EventOpen => {
                if from_leader && self.follows_relay() {
                    self.handler.on_connected();
                }
            }
            BusMessage::EventError => {
                if from_leader && self.follows_relay() {
                    let error = Error::StreamFailed("leader's push stream failed".to_string());
                    self.handler.on_error(&error);
                }
            }
            BusMessage::EventClose => {
                if from_leader && self.follows_relay() {
                    self.handler.on_disconnected();
                }
            }
            message => {
                let outcome = self.membership.handle(from, &message, Instant::now());
                self.apply_outcome(outcome).await;
            }
        }
    }

    fn follows_relay(&self) -> bool {
        self.open_requested && !self.membership.is_leader() && self.connection != ConnectionStatus::Closed
    }

    async fn apply_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            outbound,
            role_change,
            collect,
        } = outcome;

        for message in outbound {
            self.publish(message).await;
        }

        for instance_id in collect {
            info!(instance_id = %instance_id, "Removing instance of timed-out peer");
            metrics::INSTANCES_COLLECTED.with_label_values(&["dead_peer"]).inc();
            self.spawn_remove(instance_id);
        }

        if let Some(change) = role_change {
            match change {
                RoleChange::Promoted => info!(process_id = %self.me, "Promoted to leader"),
                RoleChange::Demoted => {
                    info!(process_id = %self.me, "Demoted to follower");
                    self.relay.reset();
                }
            }
            if self.open_requested && self.connection != ConnectionStatus::Closed {
                self.begin_open();
            }
        }

        self.attach_to_leader();
    }

    /// Apply the part of `frame` addressed to our own instance
    fn apply_frame(&mut self, frame: &RelayFrame) {
        let Some(instance_id) = self.membership.own_instance_id() else {
            return;
        };
        if let Some(payload) = frame.payload_for(&instance_id) {
            self.topics.apply(payload, self.handler.as_mut());
        }
    }

    async fn close(&mut self) {
        let was_streaming = self.membership.is_leader() && self.relay.state() == RelayState::Streaming;
        self.relay.stop();
        if was_streaming {
            self.publish(BusMessage::EventClose).await;
        }
        if self.connection == ConnectionStatus::Connected {
            self.handler.on_disconnected();
        }

        if let Some(instance_id) = self.membership.own_instance_id() {
            if let Err(e) = self.registry.remove_instance(instance_id.clone()).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to remove instance on close");
            }
        }

        self.membership.clear_registration();
        self.attempt += 1;
        self.attachment = Attachment::Detached;
        self.open_requested = false;
        self.connection = ConnectionStatus::Closed;
        info!(process_id = %self.me, "Pub/sub closed");
    }

    async fn publish(&mut self, message: BusMessage) {
        let message_type = message.message_type();
        if let Err(e) = self.bus.publish(Envelope::new(self.me, message)).await {
            warn!(process_id = %self.me, message_type = message_type, error = %e, "Failed to publish on bus");
        }
    }

    fn publish_status(&self) {
        let status = Status {
            process_id: self.me,
            connection: self.connection,
            is_leader: self.membership.is_leader(),
            leader: self.membership.leader(),
            instance_id: self.membership.own_instance_id(),
            connection_id: self.membership.own_connection_id(),
            attached: self.attachment == Attachment::Attached,
            relay: self.relay.state(),
            members: self.membership.view().len(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
