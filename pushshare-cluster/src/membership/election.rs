use std::collections::HashSet;

use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use pushshare_core::metrics;
use pushshare_core::models::{BusMessage, ConnectionId, InstanceId, PeerIdentity, ProcessId};

use super::view::MembershipView;

/// Role transition produced by an election round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Promoted,
    Demoted,
}

/// Side effects requested by a membership handler
///
/// Handlers never perform I/O themselves; the caller publishes `outbound`,
/// reacts to `role_change` and hands `collect` to `remove_instance`.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    pub outbound: Vec<BusMessage>,
    pub role_change: Option<RoleChange>,
    pub collect: Vec<InstanceId>,
}

impl Outcome {
    fn merge(&mut self, other: Self) {
        self.outbound.extend(other.outbound);
        self.collect.extend(other.collect);
        // Successive transitions inside one handler collapse to the last one
        if other.role_change.is_some() {
            self.role_change = match (self.role_change, other.role_change) {
                (Some(RoleChange::Promoted), Some(RoleChange::Demoted))
                | (Some(RoleChange::Demoted), Some(RoleChange::Promoted)) => None,
                (_, change) => change,
            };
        }
    }
}

/// Leader election over the lowest-id rule
///
/// Pure state machine: every method takes the current instant and returns an
/// [`Outcome`] instead of touching the bus.
#[derive(Debug, Clone)]
pub struct Membership {
    view: MembershipView,
    leader: Option<ProcessId>,
    is_leader: bool,
    liveness_timeout: Duration,
}

impl Membership {
    #[must_use]
    pub fn new(me: ProcessId, liveness_timeout: Duration, now: Instant) -> Self {
        Self {
            view: MembershipView::new(me, now),
            leader: None,
            is_leader: false,
            liveness_timeout,
        }
    }

    #[must_use]
    pub const fn me(&self) -> ProcessId {
        self.view.me()
    }

    #[must_use]
    pub const fn view(&self) -> &MembershipView {
        &self.view
    }

    #[must_use]
    pub const fn leader(&self) -> Option<ProcessId> {
        self.leader
    }

    #[must_use]
    pub const fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Identity this process reports in `ack`, `ping` and `master`
    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        self.view
            .own()
            .map_or_else(|| PeerIdentity::bare(self.me()), super::view::Peer::identity)
    }

    /// Connection group the current leader streams for
    #[must_use]
    pub fn leader_connection_id(&self) -> Option<ConnectionId> {
        self.leader
            .and_then(|leader| self.view.get(&leader))
            .and_then(|peer| peer.connection_id.clone())
    }

    #[must_use]
    pub fn own_connection_id(&self) -> Option<ConnectionId> {
        self.view.own().and_then(|peer| peer.connection_id.clone())
    }

    #[must_use]
    pub fn own_instance_id(&self) -> Option<InstanceId> {
        self.view.own().and_then(|peer| peer.instance_id.clone())
    }

    #[must_use]
    pub fn known_instance_ids(&self) -> HashSet<InstanceId> {
        self.view.instance_ids()
    }

    pub fn set_registration(&mut self, instance_id: InstanceId, connection_id: ConnectionId) {
        self.view.set_own_registration(Some(instance_id), Some(connection_id));
    }

    pub fn clear_registration(&mut self) {
        self.view.set_own_registration(None, None);
    }

    #[must_use]
    pub fn announce(&self) -> BusMessage {
        BusMessage::New(self.me())
    }

    #[must_use]
    pub fn heartbeat(&self) -> BusMessage {
        BusMessage::Ping(self.identity())
    }

    /// Apply a membership message received from `from`
    ///
    /// `data` and relay lifecycle messages refresh nothing and produce no
    /// outcome; they are the relay's business.
    pub fn handle(&mut self, from: ProcessId, message: &BusMessage, now: Instant) -> Outcome {
        if from == self.me() {
            return Outcome::default();
        }

        match message {
            BusMessage::New(_) => {
                self.view.touch(from, now);
                let mut outcome = Outcome {
                    outbound: vec![BusMessage::Ack(self.identity())],
                    ..Outcome::default()
                };
                outcome.merge(self.elect_leader(now));
                outcome
            }
            BusMessage::Ack(identity) | BusMessage::Ping(identity) => {
                if self.view.record(from, identity, now) {
                    debug!(process_id = %self.me(), peer = %from, "Discovered peer");
                }
                Outcome::default()
            }
            BusMessage::Master(identity) => {
                self.view.record(from, identity, now);
                self.on_master_claim(from, now)
            }
            BusMessage::Data(_) | BusMessage::EventOpen | BusMessage::EventError | BusMessage::EventClose => {
                Outcome::default()
            }
        }
    }

    /// React to a leadership claim from `claimant`
    pub fn on_master_claim(&mut self, claimant: ProcessId, now: Instant) -> Outcome {
        if claimant == self.me() {
            return Outcome::default();
        }
        if self.is_leader {
            // A lower claimant makes us step down, a higher one makes us re-assert
            return self.elect_leader(now);
        }
        if self.leader != Some(claimant) {
            debug!(process_id = %self.me(), leader = %claimant, "Adopted leadership claim");
        }
        self.leader = Some(claimant);
        Outcome::default()
    }

    /// Drop peers past the liveness timeout and re-elect
    pub fn check_liveness(&mut self, now: Instant) -> Outcome {
        let previous_leader = self.leader;
        let leader_connection = self.leader_connection_id();
        let own_connection = self.own_connection_id();

        let removed = self.view.remove_expired(now, self.liveness_timeout);
        let mut outcome = Outcome::default();

        for peer in &removed {
            info!(
                process_id = %self.me(),
                peer = %peer.id,
                instance_id = ?peer.instance_id,
                "Peer timed out, removed from membership"
            );

            let on_leader_connection = Some(peer.id) == previous_leader
                || (peer.connection_id.is_some() && peer.connection_id == leader_connection);
            let shares_connection = self.is_leader
                || (own_connection.is_some() && own_connection == peer.connection_id);

            if on_leader_connection && shares_connection {
                if let Some(instance_id) = &peer.instance_id {
                    outcome.collect.push(instance_id.clone());
                }
            }
        }

        if !removed.is_empty() || self.leader != Some(self.view.lowest()) {
            outcome.merge(self.elect_leader(now));
        }
        metrics::MEMBERSHIP_SIZE
            .with_label_values(&[self.me().to_string()])
            .set(i64::try_from(self.view.len()).unwrap_or(i64::MAX));
        outcome
    }

    /// Adopt the lowest live id as leader, claiming leadership if it is ours
    pub fn elect_leader(&mut self, now: Instant) -> Outcome {
        self.view.touch(self.me(), now);

        let was_leader = self.is_leader;
        let lowest = self.view.lowest();
        let mut outcome = Outcome::default();

        if lowest == self.me() {
            self.is_leader = true;
            self.leader = Some(lowest);
            outcome.outbound.push(BusMessage::Master(self.identity()));
            metrics::ELECTIONS_TOTAL.with_label_values(&["leader"]).inc();
        } else {
            self.is_leader = false;
            self.leader = Some(lowest);
            metrics::ELECTIONS_TOTAL.with_label_values(&["follower"]).inc();
        }

        outcome.role_change = match (was_leader, self.is_leader) {
            (false, true) => Some(RoleChange::Promoted),
            (true, false) => Some(RoleChange::Demoted),
            _ => None,
        };
        if let Some(change) = outcome.role_change {
            info!(
                process_id = %self.me(),
                leader = %lowest,
                members = self.view.len(),
                change = ?change,
                "Leadership changed"
            );
            metrics::IS_LEADER
                .with_label_values(&[self.me().to_string()])
                .set(i64::from(self.is_leader));
        }
        outcome
    }
}
