use std::collections::{BTreeMap, HashSet};

use tokio::time::{Duration, Instant};

use pushshare_core::models::{ConnectionId, InstanceId, PeerIdentity, ProcessId};

/// A process as seen by the local membership view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: ProcessId,
    pub last_seen: Instant,
    pub instance_id: Option<InstanceId>,
    pub connection_id: Option<ConnectionId>,
}

impl Peer {
    fn new(id: ProcessId, now: Instant) -> Self {
        Self {
            id,
            last_seen: now,
            instance_id: None,
            connection_id: None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            process_id: self.id,
            instance_id: self.instance_id.clone(),
            connection_id: self.connection_id.clone(),
        }
    }
}

/// Live processes keyed by id, always containing the local process
///
/// Keys are ordered so the election candidate is simply the first entry.
#[derive(Debug, Clone)]
pub struct MembershipView {
    me: ProcessId,
    peers: BTreeMap<ProcessId, Peer>,
}

impl MembershipView {
    #[must_use]
    pub fn new(me: ProcessId, now: Instant) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(me, Peer::new(me, now));
        Self { me, peers }
    }

    #[must_use]
    pub const fn me(&self) -> ProcessId {
        self.me
    }

    /// Refresh `last_seen` for `id`, creating the entry on first sighting.
    /// Returns true when the process was not known before.
    pub fn touch(&mut self, id: ProcessId, now: Instant) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.last_seen = now;
                false
            }
            None => {
                self.peers.insert(id, Peer::new(id, now));
                true
            }
        }
    }

    /// Refresh a peer and replace its reported registration identity
    pub fn record(&mut self, from: ProcessId, identity: &PeerIdentity, now: Instant) -> bool {
        let created = self.touch(from, now);
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.instance_id.clone_from(&identity.instance_id);
            peer.connection_id.clone_from(&identity.connection_id);
        }
        created
    }

    /// Set the local process's own registration identity
    pub fn set_own_registration(&mut self, instance_id: Option<InstanceId>, connection_id: Option<ConnectionId>) {
        let me = self.me;
        let peer = self.peers.entry(me).or_insert_with(|| Peer::new(me, Instant::now()));
        peer.instance_id = instance_id;
        peer.connection_id = connection_id;
    }

    #[must_use]
    pub fn get(&self, id: &ProcessId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// The local process's own entry
    #[must_use]
    pub fn own(&self) -> Option<&Peer> {
        self.peers.get(&self.me)
    }

    /// Remove every peer other than self whose last message is older than
    /// `timeout`, returning the removed entries
    pub fn remove_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let me = self.me;
        let expired: Vec<ProcessId> = self
            .peers
            .values()
            .filter(|peer| peer.id != me && now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|peer| peer.id)
            .collect();

        expired.iter().filter_map(|id| self.peers.remove(id)).collect()
    }

    /// Lowest id in the view; self is always present so this always exists
    #[must_use]
    pub fn lowest(&self) -> ProcessId {
        self.peers.keys().next().copied().unwrap_or(self.me)
    }

    /// Every registered instance id among live members, self included
    #[must_use]
    pub fn instance_ids(&self) -> HashSet<InstanceId> {
        self.peers
            .values()
            .filter_map(|peer| peer.instance_id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(ms: i64) -> ProcessId {
        ProcessId::from_parts(ms, 0)
    }

    #[test]
    fn test_self_is_always_present() {
        let now = Instant::now();
        let mut view = MembershipView::new(pid(5), now);
        assert_eq!(view.len(), 1);

        let removed = view.remove_expired(now + Duration::from_secs(60), Duration::from_secs(3));
        assert!(removed.is_empty());
        assert!(view.own().is_some());
    }

    #[test]
    fn test_lowest_wins_with_salt_tiebreak() {
        let now = Instant::now();
        let mut view = MembershipView::new(ProcessId::from_parts(10, 9), now);
        view.touch(ProcessId::from_parts(10, 3), now);
        view.touch(pid(11), now);
        assert_eq!(view.lowest(), ProcessId::from_parts(10, 3));
    }

    #[test]
    fn test_expiry_is_strictly_greater_than_timeout() {
        let now = Instant::now();
        let mut view = MembershipView::new(pid(1), now);
        view.touch(pid(2), now);

        let timeout = Duration::from_millis(3000);
        assert!(view.remove_expired(now + timeout, timeout).is_empty());

        let removed = view.remove_expired(now + timeout + Duration::from_millis(1), timeout);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, pid(2));
    }

    #[test]
    fn test_record_replaces_identity_but_touch_keeps_it() {
        let now = Instant::now();
        let mut view = MembershipView::new(pid(1), now);
        let identity = PeerIdentity {
            process_id: pid(2),
            instance_id: Some(InstanceId::from("I-2")),
            connection_id: Some(ConnectionId::from("C-1")),
        };
        assert!(view.record(pid(2), &identity, now));
        assert!(!view.touch(pid(2), now));

        let peer = view.get(&pid(2)).unwrap();
        assert_eq!(peer.instance_id.as_ref().map(InstanceId::as_str), Some("I-2"));

        view.record(pid(2), &PeerIdentity::bare(pid(2)), now);
        assert!(view.get(&pid(2)).unwrap().instance_id.is_none());
    }

    #[test]
    fn test_instance_ids_include_self() {
        let now = Instant::now();
        let mut view = MembershipView::new(pid(1), now);
        view.set_own_registration(Some(InstanceId::from("I-1")), Some(ConnectionId::from("C-1")));
        view.record(
            pid(2),
            &PeerIdentity {
                process_id: pid(2),
                instance_id: Some(InstanceId::from("I-2")),
                connection_id: Some(ConnectionId::from("C-1")),
            },
            now,
        );
        view.touch(pid(3), now);

        let ids = view.instance_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&InstanceId::from("I-1")));
        assert!(ids.contains(&InstanceId::from("I-2")));
    }
}
