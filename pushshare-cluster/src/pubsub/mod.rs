//! Pub/sub façade shared by every process on the host
//!
//! Each [`PubSub`] joins the local bus, takes part in leader election and
//! either owns the push stream (leader) or consumes the frames the leader
//! relays (follower). All state lives in a single worker task; the handle
//! only sends it commands and reads its status snapshots.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pushshare_core::config::BusKind;
use pushshare_core::models::{ConnectionId, InstanceId, ProcessId, TopicId};
use pushshare_core::Config;

use crate::bus::{LocalBus, MemoryBus, RedisBus};
use crate::error::{Error, Result};
use crate::handler::PubSubHandler;
use crate::registration::{build_client, HttpRegistrationClient, InstanceRegistry};
use crate::relay::{RelayState, SseConnector, StreamConnector};
use crate::topics::{TopicHooks, TopicSnapshot};

use worker::{Command, Worker};

/// Timing and threshold settings for one façade
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub heartbeat_interval: Duration,
    pub check_interval: Duration,
    pub liveness_timeout: Duration,
    /// Delay between the `new` announcement and the first election
    pub announce_window: Duration,
    pub open_poll_interval: Duration,
    pub unknown_instance_threshold: u32,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PubSubConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.membership.heartbeat_interval(),
            check_interval: config.membership.check_interval(),
            liveness_timeout: config.membership.liveness_timeout(),
            announce_window: config.membership.announce_window(),
            open_poll_interval: config.facade.open_poll_interval(),
            unknown_instance_threshold: config.relay.unknown_instance_threshold,
            reconnect_min_delay: config.relay.reconnect_min_delay(),
            reconnect_max_delay: config.relay.reconnect_max_delay(),
        }
    }
}

/// Connection status as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// `open()` has not been called, or the last attempt failed
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Point-in-time view of a façade's worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub process_id: ProcessId,
    pub connection: ConnectionStatus,
    pub is_leader: bool,
    pub leader: Option<ProcessId>,
    pub instance_id: Option<InstanceId>,
    pub connection_id: Option<ConnectionId>,
    /// Follower only: frames from the leader are being applied
    pub attached: bool,
    pub relay: RelayState,
    pub members: usize,
}

impl Status {
    fn initial(process_id: ProcessId) -> Self {
        Self {
            process_id,
            connection: ConnectionStatus::Idle,
            is_leader: false,
            leader: None,
            instance_id: None,
            connection_id: None,
            attached: false,
            relay: RelayState::Idle,
            members: 1,
        }
    }
}

/// Builder wiring the collaborators of a [`PubSub`]
pub struct PubSubBuilder {
    bus: Arc<dyn LocalBus>,
    registry: Arc<dyn InstanceRegistry>,
    connector: Arc<dyn StreamConnector>,
    config: PubSubConfig,
    process_id: Option<ProcessId>,
    handler: Box<dyn PubSubHandler>,
}

impl PubSubBuilder {
    #[must_use]
    pub fn config(mut self, config: PubSubConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a fixed process id instead of one stamped at start
    #[must_use]
    pub const fn process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: impl PubSubHandler) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Subscribe to the bus, announce this process and spawn its worker
    pub async fn start(self) -> Result<PubSub> {
        let process_id = self.process_id.unwrap_or_default();
        let bus_rx = self.bus.subscribe(process_id).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::initial(process_id));
        let cancel = CancellationToken::new();

        let (worker, inbox) = Worker::new(
            process_id,
            self.config,
            self.bus,
            self.registry,
            self.connector,
            self.handler,
            status_tx,
        );
        tokio::spawn(worker.run(inbox, commands_rx, bus_rx, cancel.clone()));

        info!(process_id = %process_id, "Pub/sub process started");

        Ok(PubSub {
            process_id,
            commands: commands_tx,
            status: status_rx,
            cancel,
        })
    }
}

/// Handle to one participating process
///
/// Dropping the handle stops the worker the same way [`PubSub::shutdown`]
/// does.
pub struct PubSub {
    process_id: ProcessId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    cancel: CancellationToken,
}

impl PubSub {
    #[must_use]
    pub fn builder(
        bus: Arc<dyn LocalBus>,
        registry: Arc<dyn InstanceRegistry>,
        connector: Arc<dyn StreamConnector>,
    ) -> PubSubBuilder {
        PubSubBuilder {
            bus,
            registry,
            connector,
            config: PubSubConfig::default(),
            process_id: None,
            handler: Box::new(()),
        }
    }

    /// Build every collaborator from configuration and start
    pub async fn from_config(config: &Config, handler: impl PubSubHandler) -> Result<Self> {
        let bus: Arc<dyn LocalBus> = match config.bus.kind {
            BusKind::Memory => Arc::new(MemoryBus::new(config.bus.capacity)),
            BusKind::Redis => Arc::new(RedisBus::new(&config.bus.redis_url, config.bus.channel.clone())?),
        };
        let request_timeout = config.registration.request_timeout();
        let client = build_client()?;
        let registry = Arc::new(HttpRegistrationClient::with_client(
            client.clone(),
            &config.server.base_url,
            request_timeout,
        )?);
        let connector = Arc::new(SseConnector::with_client(client, &config.server.base_url, request_timeout)?);

        Self::builder(bus, registry, connector)
            .config(PubSubConfig::from(config))
            .handler(handler)
            .start()
            .await
    }

    #[must_use]
    pub const fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Connect this process: register with the server once a leader is
    /// known, then stream (leader) or consume relayed frames (follower).
    /// A call while a connection attempt is in flight is ignored.
    pub fn open(&self) -> Result<()> {
        self.send(Command::Open)
    }

    /// Tear down the relay, remove this process's instance and stop the worker
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Stop the worker at once, without telling peers or the server.
    /// Peers notice through missed heartbeats.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader
    }

    /// Watch status changes, e.g. to wait for a condition with `wait_for`
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    pub async fn topics(&self) -> Result<Vec<TopicSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Topics(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Install hooks on a known topic; returns false if the topic is unknown
    pub async fn set_topic_hooks(&self, topic_id: TopicId, hooks: TopicHooks) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetTopicHooks(topic_id, hooks, tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use pushshare_core::models::RelayFrame;
    use tokio::sync::Semaphore;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::registration::{MockInstanceRegistry, Registration};
    use crate::relay::FrameStream;

    type FrameSender = futures::channel::mpsc::UnboundedSender<Result<RelayFrame>>;

    struct IdleConnector;

    /// Hands out one stream fed by the test, then streams that never yield
    struct FedConnector(Mutex<Option<FrameStream>>);

    impl FedConnector {
        fn new() -> (Self, FrameSender) {
            let (tx, rx) = futures::channel::mpsc::unbounded();
            (Self(Mutex::new(Some(rx.boxed()))), tx)
        }
    }

    #[async_trait]
    impl StreamConnector for FedConnector {
        async fn connect(&self, _instance_id: &InstanceId) -> Result<FrameStream> {
            let stream = self.0.lock().take();
            Ok(stream.unwrap_or_else(|| futures::stream::pending().boxed()))
        }
    }

    /// Registers on a foreign connection; `change_connection` waits for a permit
    struct GatedRegistry {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl InstanceRegistry for GatedRegistry {
        async fn register_new(&self, _existing: Option<ConnectionId>) -> Result<Registration> {
            Ok(Registration {
                instance_id: InstanceId::from("I-F1"),
                connection_id: ConnectionId::from("C-9"),
            })
        }

        async fn change_connection(&self, _instance_id: InstanceId, _connection_id: ConnectionId) -> Result<()> {
            let permit = self.gate.acquire().await.map_err(|_| Error::Closed)?;
            permit.forget();
            Ok(())
        }

        async fn remove_instance(&self, _instance_id: InstanceId) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl StreamConnector for IdleConnector {
        async fn connect(&self, _instance_id: &InstanceId) -> Result<FrameStream> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    impl PubSubHandler for Events {
        fn on_connected(&mut self) {
            self.0.lock().push("connected".to_string());
        }

        fn on_disconnected(&mut self) {
            self.0.lock().push("disconnected".to_string());
        }

        fn on_error(&mut self, error: &Error) {
            self.0.lock().push(format!("error: {error}"));
        }
    }

    fn test_config() -> PubSubConfig {
        PubSubConfig {
            heartbeat_interval: Duration::from_millis(100),
            check_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(300),
            announce_window: Duration::from_millis(20),
            open_poll_interval: Duration::from_millis(5),
            unknown_instance_threshold: 3,
            reconnect_min_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
        }
    }

    async fn wait_for(pubsub: &PubSub, condition: impl FnMut(&Status) -> bool) -> Status {
        let mut rx = pubsub.watch_status();
        let status = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(condition))
            .await
            .expect("condition not reached")
            .expect("worker stopped")
            .clone();
        status
    }

    impl Events {
        fn errors(&self) -> Vec<String> {
            self.0.lock().iter().filter(|e| e.starts_with("error")).cloned().collect()
        }
    }

    async fn start_process(
        bus: &Arc<MemoryBus>,
        ms: i64,
        registry: impl InstanceRegistry + 'static,
        connector: impl StreamConnector + 'static,
        events: Events,
    ) -> PubSub {
        PubSub::builder(bus.clone(), Arc::new(registry), Arc::new(connector))
            .config(test_config())
            .process_id(ProcessId::from_parts(ms, 0))
            .handler(events)
            .start()
            .await
            .unwrap()
    }

    fn frame_for(instances: &[&str], data: serde_json::Value) -> RelayFrame {
        let instances: Vec<serde_json::Value> = instances
            .iter()
            .map(|id| serde_json::json!({"id": id, "data": data}))
            .collect();
        serde_json::from_value(serde_json::json!({ "instances": instances })).unwrap()
    }

    /// Follower registry whose connections and `change_connection` results
    /// are scripted by the test
    struct DriftScript {
        registered: Arc<Mutex<Vec<Option<ConnectionId>>>>,
        changes: Arc<AtomicUsize>,
        removed: Arc<Mutex<Vec<InstanceId>>>,
    }

    fn drift_registry(connections: &'static [&'static str], change_fails_times: usize) -> (MockInstanceRegistry, DriftScript) {
        let script = DriftScript {
            registered: Arc::new(Mutex::new(Vec::new())),
            changes: Arc::new(AtomicUsize::new(0)),
            removed: Arc::new(Mutex::new(Vec::new())),
        };
        let mut registry = MockInstanceRegistry::new();

        let registered = script.registered.clone();
        registry.expect_register_new().returning(move |existing| {
            let mut calls = registered.lock();
            calls.push(existing);
            let n = calls.len();
            Ok(Registration {
                instance_id: InstanceId::from(format!("I-F{n}")),
                connection_id: ConnectionId::from(connections[(n - 1).min(connections.len() - 1)]),
            })
        });

        let changes = script.changes.clone();
        registry.expect_change_connection().returning(move |_, connection_id| {
            if changes.fetch_add(1, Ordering::SeqCst) < change_fails_times {
                Err(Error::RegistrationFailed(format!("connection {connection_id} refused")))
            } else {
                Ok(())
            }
        });

        let removed = script.removed.clone();
        registry.expect_remove_instance().returning(move |instance_id| {
            removed.lock().push(instance_id);
            Ok(())
        });

        (registry, script)
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> MockInstanceRegistry {
        let mut registry = MockInstanceRegistry::new();
        registry.expect_register_new().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Registration {
                instance_id: InstanceId::from(format!("I-{n}")),
                connection_id: ConnectionId::from("C-1"),
            })
        });
        registry.expect_remove_instance().returning(|_| Ok(()));
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_while_connecting_registers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pubsub = PubSub::builder(
            Arc::new(MemoryBus::default()),
            Arc::new(counting_registry(calls.clone())),
            Arc::new(IdleConnector),
        )
        .config(test_config())
        .start()
        .await
        .unwrap();

        pubsub.open().unwrap();
        pubsub.open().unwrap();

        let status = wait_for(&pubsub, |s| s.connection == ConnectionStatus::Connected).await;
        assert!(status.is_leader);
        assert_eq!(status.instance_id, Some(InstanceId::from("I-1")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_leader_streams_and_reports_connected() {
        let events = Events::default();
        let pubsub = PubSub::builder(
            Arc::new(MemoryBus::default()),
            Arc::new(counting_registry(Arc::new(AtomicUsize::new(0)))),
            Arc::new(IdleConnector),
        )
        .config(test_config())
        .handler(events.clone())
        .start()
        .await
        .unwrap();

        pubsub.open().unwrap();
        let status = wait_for(&pubsub, |s| s.relay == RelayState::Streaming).await;
        assert_eq!(status.members, 1);
        assert_eq!(status.leader, Some(pubsub.process_id()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*events.0.lock(), vec!["connected"]);

        pubsub.close().await.unwrap();
        assert_eq!(*events.0.lock(), vec!["connected", "disconnected"]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(pubsub.open().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_failure_surfaces_and_allows_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut registry = MockInstanceRegistry::new();
        registry.expect_register_new().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::RegistrationFailed("server unavailable".to_string()))
            } else {
                Ok(Registration {
                    instance_id: InstanceId::from("I-2"),
                    connection_id: ConnectionId::from("C-2"),
                })
            }
        });

        let events = Events::default();
        let pubsub = PubSub::builder(Arc::new(MemoryBus::default()), Arc::new(registry), Arc::new(IdleConnector))
            .config(test_config())
            .handler(events.clone())
            .start()
            .await
            .unwrap();

        pubsub.open().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pubsub.status().connection, ConnectionStatus::Idle);
        assert!(events.0.lock()[0].contains("server unavailable"));

        pubsub.open().unwrap();
        let status = wait_for(&pubsub, |s| s.connection == ConnectionStatus::Connected).await;
        assert_eq!(status.connection_id, Some(ConnectionId::from("C-2")));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_and_hooks_on_unknown_topic() {
        let pubsub = PubSub::builder(
            Arc::new(MemoryBus::default()),
            Arc::new(counting_registry(Arc::new(AtomicUsize::new(0)))),
            Arc::new(IdleConnector),
        )
        .config(test_config())
        .start()
        .await
        .unwrap();

        assert!(pubsub.topics().await.unwrap().is_empty());
        assert!(!pubsub
            .set_topic_hooks(TopicId::from("T-none"), TopicHooks::default())
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let pubsub = PubSub::builder(
            Arc::new(MemoryBus::default()),
            Arc::new(counting_registry(Arc::new(AtomicUsize::new(0)))),
            Arc::new(IdleConnector),
        )
        .config(test_config())
        .start()
        .await
        .unwrap();

        pubsub.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(pubsub.topics().await, Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_reregisters_after_failed_connection_change() {
        let bus = Arc::new(MemoryBus::default());
        let (connector, _frames) = FedConnector::new();
        let leader = start_process(&bus, 1, counting_registry(Arc::new(AtomicUsize::new(0))), connector, Events::default()).await;

        // First registration lands on a foreign connection, the move is refused,
        // the second registration joins the leader's connection
        let (registry, script) = drift_registry(&["C-9", "C-1"], 1);
        let events = Events::default();
        let follower = start_process(&bus, 2, registry, IdleConnector, events.clone()).await;

        leader.open().unwrap();
        follower.open().unwrap();

        let status = wait_for(&follower, |s| s.attached).await;
        assert_eq!(status.connection, ConnectionStatus::Connected);
        assert_eq!(status.instance_id, Some(InstanceId::from("I-F2")));
        assert_eq!(status.connection_id, Some(ConnectionId::from("C-1")));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let leader_connection = Some(ConnectionId::from("C-1"));
        assert_eq!(*script.registered.lock(), vec![leader_connection.clone(), leader_connection]);
        assert_eq!(script.changes.load(Ordering::SeqCst), 1);
        assert_eq!(*script.removed.lock(), vec![InstanceId::from("I-F1")]);
        assert!(events.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_drift_surfaces_error_and_goes_idle() {
        let bus = Arc::new(MemoryBus::default());
        let (connector, _frames) = FedConnector::new();
        let leader = start_process(&bus, 1, counting_registry(Arc::new(AtomicUsize::new(0))), connector, Events::default()).await;

        let (registry, script) = drift_registry(&["C-9"], usize::MAX);
        let events = Events::default();
        let follower = start_process(&bus, 2, registry, IdleConnector, events.clone()).await;

        leader.open().unwrap();
        follower.open().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while events.errors().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "drift never surfaced");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Several heartbeats later nothing retries on its own
        tokio::time::sleep(Duration::from_millis(500)).await;
        let errors = events.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Connection drift"), "unexpected error: {}", errors[0]);

        let status = follower.status();
        assert_eq!(status.connection, ConnectionStatus::Idle);
        assert_eq!(status.instance_id, None);
        assert!(!status.attached);
        assert_eq!(script.registered.lock().len(), 2);
        assert_eq!(script.changes.load(Ordering::SeqCst), 2);
        assert_eq!(
            *script.removed.lock(),
            vec![InstanceId::from("I-F1"), InstanceId::from("I-F2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_frames_ignored_until_connection_change_completes() {
        let bus = Arc::new(MemoryBus::default());
        let (connector, frames) = FedConnector::new();
        let leader = start_process(&bus, 1, counting_registry(Arc::new(AtomicUsize::new(0))), connector, Events::default()).await;

        let gate = Arc::new(Semaphore::new(0));
        let follower = start_process(
            &bus,
            2,
            GatedRegistry { gate: gate.clone() },
            IdleConnector,
            Events::default(),
        )
        .await;

        leader.open().unwrap();
        follower.open().unwrap();
        wait_for(&leader, |s| s.relay == RelayState::Streaming).await;
        let status = wait_for(&follower, |s| s.instance_id.is_some()).await;
        assert_eq!(status.connection_id, Some(ConnectionId::from("C-9")));
        assert!(!status.attached);

        let topics = serde_json::json!({"sys": [{"type": "topics", "list": ["news"]}]});
        frames.unbounded_send(Ok(frame_for(&["I-1", "I-F1"], topics.clone()))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(leader.topics().await.unwrap().len(), 1);
        assert!(follower.topics().await.unwrap().is_empty());
        assert!(!follower.status().attached);

        gate.add_permits(1);
        let status = wait_for(&follower, |s| s.attached).await;
        assert_eq!(status.connection_id, Some(ConnectionId::from("C-1")));

        frames.unbounded_send(Ok(frame_for(&["I-1", "I-F1"], topics))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = follower.topics().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, TopicId::from("news"));
    }

    #[tokio::test]
    async fn test_from_config_registers_and_streams_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/add/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "instance_id": "I-1",
                "connection_id": "C-1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/remove/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;
        let body = "data: {\"instances\":[{\"id\":\"I-1\",\"data\":{\"sys\":[{\"type\":\"topics\",\"list\":[\"news\"]}]}}]}\n\n";
        Mock::given(method("GET"))
            .and(path("/event"))
            .and(query_param("instance_id", "I-1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.bus.kind = BusKind::Memory;
        config.server.base_url = server.uri();

        let pubsub = PubSub::from_config(&config, ()).await.unwrap();
        pubsub.open().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let topics = pubsub.topics().await.unwrap();
            if topics.iter().any(|t| t.id == TopicId::from("news")) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "topic never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pubsub.status().instance_id, Some(InstanceId::from("I-1")));
        pubsub.close().await.unwrap();
    }
}
