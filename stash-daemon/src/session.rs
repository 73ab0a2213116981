//! Peer Session: one peer's descriptor, its Availability Snapshot, and the transfer
//! operations aimed at it.
//!
//! Every operation is a future resolving to exactly one `Result`. The snapshot is only
//! updated after a response is back, and never from a response that came from a device
//! other than the one this session talks to.

use std::net::SocketAddr;
use std::time::Duration;

use stash_core::transfer::PushAck;
use stash_core::{Availability, Change, DeviceId, IdentityMismatch, Item, PeerDescriptor};
use uuid::Uuid;

use crate::client::{ClientError, PullResponse, Pulled, StashClient};
use crate::discovery::{DiscoveryError, RegistryHandle};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {0:?} has no resolved host yet")]
    PeerNotReady(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    IdentityMismatch(#[from] IdentityMismatch),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

pub struct PeerSession {
    descriptor: PeerDescriptor,
    availability: Availability,
    /// Count and instance of the last item actually received; sent with conditional pulls.
    held: Option<(u64, Uuid)>,
    timeout: Duration,
    client: Option<StashClient>,
}

impl PeerSession {
    pub fn new(descriptor: PeerDescriptor, timeout: Duration) -> Self {
        Self {
            availability: Availability::new(descriptor.identity),
            descriptor,
            held: None,
            timeout,
            client: None,
        }
    }

    /// Enter `host` in the registry as a manual peer, select it, and ask it for status.
    /// The identity it reports confirms the registry entry.
    pub async fn open_manual(
        registry: &RegistryHandle,
        name: Option<String>,
        host: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let key = registry.add_manual(name, host).await?;
        let descriptor = registry
            .select(key.clone())
            .await?
            .ok_or_else(|| SessionError::PeerNotReady(key.to_string()))?;
        let mut session = Self::new(descriptor, timeout);
        session.refresh_status().await?;
        if let Some(identity) = session.identity() {
            registry.confirm(key, identity)?;
            match registry.selected().await? {
                Some(confirmed) => session.update_descriptor(confirmed),
                None => tracing::warn!(%host, "manual peer is this device"),
            }
        }
        Ok(session)
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// Identity from the descriptor, or learned from the first response.
    pub fn identity(&self) -> Option<DeviceId> {
        self.availability.identity()
    }

    /// Follow a registry update (e.g. re-resolution to a new host). A different
    /// identity starts over with an empty snapshot.
    pub fn update_descriptor(&mut self, descriptor: PeerDescriptor) {
        let reset = match (descriptor.identity, self.availability.identity()) {
            (Some(new), Some(old)) => new != old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if reset {
            self.availability = Availability::new(descriptor.identity);
            self.held = None;
        }
        if descriptor.host != self.descriptor.host {
            self.client = None;
        }
        self.descriptor = descriptor;
    }

    fn client(&mut self) -> Result<StashClient, SessionError> {
        let host = self
            .descriptor
            .host
            .ok_or_else(|| SessionError::PeerNotReady(self.descriptor.name.clone()))?;
        if let Some(c) = &self.client {
            return Ok(c.clone());
        }
        let c = StashClient::new(host, self.timeout)?;
        self.client = Some(c.clone());
        Ok(c)
    }

    fn verify(&self, got: Option<DeviceId>) -> Result<(), IdentityMismatch> {
        match (self.availability.identity(), got) {
            (Some(expected), Some(got)) if expected != got => Err(IdentityMismatch { expected, got }),
            _ => Ok(()),
        }
    }

    /// Make `item` the peer's current item.
    pub async fn push(&mut self, item: &Item) -> Result<PushAck, SessionError> {
        let resp = self.client()?.push(item).await?;
        self.verify(resp.identity)?;
        Ok(resp.ack)
    }

    /// Push bytes as-is; the peer validates the content type.
    pub async fn push_raw(
        &mut self,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<PushAck, SessionError> {
        let resp = self.client()?.push_raw(body, content_type).await?;
        self.verify(resp.identity)?;
        Ok(resp.ack)
    }

    /// Fetch the peer's item unless the one last received is still current.
    pub async fn pull(&mut self) -> Result<Pulled, SessionError> {
        let resp = self.client()?.pull(self.held).await?;
        self.absorb(resp)
    }

    /// Fetch the peer's item unconditionally.
    pub async fn last(&mut self) -> Result<Pulled, SessionError> {
        let resp = self.client()?.last().await?;
        self.absorb(resp)
    }

    pub async fn refresh_status(&mut self) -> Result<Change, SessionError> {
        let report = self.client()?.status().await?;
        Ok(self.availability.observe(report)?)
    }

    /// Ask for status, and pull only when the peer holds something not yet received.
    pub async fn pull_if_changed(&mut self) -> Result<Pulled, SessionError> {
        self.refresh_status().await?;
        if self.held.is_some() && self.availability.since() == self.held {
            return Ok(Pulled::Unchanged);
        }
        self.pull().await
    }

    fn absorb(&mut self, resp: PullResponse) -> Result<Pulled, SessionError> {
        if matches!(resp.outcome, Pulled::Unchanged) {
            self.verify(resp.report.identity)?;
            return Ok(Pulled::Unchanged);
        }
        let held = resp.report.instance.map(|i| (resp.report.items_count, i));
        self.availability.observe(resp.report)?;
        self.held = held;
        Ok(resp.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{spawn_registry, RegistryConfig};
    use crate::server::{spawn_test_server, spawn_test_server_as};
    use stash_core::protocol::UUID_PROPERTY;
    use stash_core::{DiscoveryEvent, DiscoverySet, PeerKey, PeerNotification};
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn descriptor(host: Option<SocketAddr>, identity: Option<DeviceId>) -> PeerDescriptor {
        PeerDescriptor {
            name: "peer".into(),
            host,
            identity,
            temporary: false,
            manual: false,
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn unresolved_peer_is_not_ready() {
        let mut s = PeerSession::new(descriptor(None, None), TIMEOUT);
        assert!(matches!(
            s.push(&Item::text("x")).await,
            Err(SessionError::PeerNotReady(_))
        ));
        assert!(matches!(s.pull().await, Err(SessionError::PeerNotReady(_))));
        assert!(matches!(
            s.refresh_status().await,
            Err(SessionError::PeerNotReady(_))
        ));
        assert_eq!(s.availability().items_count(), None);
    }

    #[tokio::test]
    async fn status_counter_is_monotonic_across_pushes() {
        let (addr, state) = spawn_test_server().await;
        let mut s = PeerSession::new(descriptor(Some(addr), Some(state.identity())), TIMEOUT);
        assert_eq!(s.refresh_status().await.unwrap(), Change::Unknown);
        let mut last = s.availability().items_count().unwrap();
        for i in 0..5 {
            s.push(&Item::text(format!("v{}", i))).await.unwrap();
            assert_eq!(s.refresh_status().await.unwrap(), Change::Advanced);
            let now = s.availability().items_count().unwrap();
            assert!(now > last);
            last = now;
        }
        assert_eq!(s.refresh_status().await.unwrap(), Change::Unchanged);
        assert_eq!(
            s.availability().content_type(),
            Some(stash_core::mime::TEXT_PLAIN_UTF8)
        );
    }

    #[tokio::test]
    async fn pull_if_changed_fetches_once() {
        let (addr, state) = spawn_test_server().await;
        state.store(Item::text("first")).await;
        let mut s = PeerSession::new(descriptor(Some(addr), None), TIMEOUT);
        assert_eq!(
            s.pull_if_changed().await.unwrap(),
            Pulled::Item(Item::text("first"))
        );
        assert_eq!(s.identity(), Some(state.identity()));
        assert_eq!(s.pull_if_changed().await.unwrap(), Pulled::Unchanged);
        assert_eq!(s.pull().await.unwrap(), Pulled::Unchanged);

        state.store(Item::text("second")).await;
        assert_eq!(
            s.pull_if_changed().await.unwrap(),
            Pulled::Item(Item::text("second"))
        );
        assert_eq!(s.last().await.unwrap(), Pulled::Item(Item::text("second")));
    }

    #[tokio::test]
    async fn response_from_another_device_is_rejected() {
        let (addr, _state) = spawn_test_server().await;
        let expected = DeviceId::generate();
        let mut s = PeerSession::new(descriptor(Some(addr), Some(expected)), TIMEOUT);
        assert!(matches!(
            s.refresh_status().await,
            Err(SessionError::IdentityMismatch(_))
        ));
        assert!(matches!(
            s.last().await,
            Err(SessionError::IdentityMismatch(_))
        ));
        assert_eq!(s.availability().items_count(), None);
        assert_eq!(s.identity(), Some(expected));
    }

    #[tokio::test]
    async fn server_restart_reads_as_changed() {
        let id = DeviceId::generate();
        let (addr, state) = spawn_test_server_as(id).await;
        state.store(Item::text("a")).await;
        let mut s = PeerSession::new(descriptor(Some(addr), Some(id)), TIMEOUT);
        assert_eq!(s.pull_if_changed().await.unwrap(), Pulled::Item(Item::text("a")));

        // Same device restarted on a new port: equal count, new instance.
        let (addr2, state2) = spawn_test_server_as(id).await;
        state2.store(Item::text("b")).await;
        s.update_descriptor(descriptor(Some(addr2), Some(id)));
        assert_eq!(s.refresh_status().await.unwrap(), Change::Reset);
        assert_eq!(s.availability().instance(), Some(state2.instance()));
        assert_eq!(s.pull_if_changed().await.unwrap(), Pulled::Item(Item::text("b")));
    }

    #[tokio::test]
    async fn manual_host_confirmed_through_registry() {
        let (addr, state) = spawn_test_server().await;
        state.store(Item::text("on the desk")).await;
        let (registry, _notes) = spawn_registry(RegistryConfig {
            own_identity: None,
            query_target: SocketAddr::from(([127, 0, 0, 1], 9)),
            resolve_timeout: Duration::from_millis(300),
            query_interval: Duration::from_millis(100),
            peer_ttl: Duration::from_secs(60),
        });

        let mut s = PeerSession::open_manual(&registry, Some("desk".into()), addr, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(s.identity(), Some(state.identity()));
        assert!(s.descriptor().is_ready());
        assert!(!s.descriptor().temporary);

        let selected = registry.selected().await.unwrap().unwrap();
        assert_eq!(selected.key(), PeerKey::Identity(state.identity()));
        assert!(selected.manual);
        assert_eq!(selected.host, Some(addr));
        assert_eq!(s.pull().await.unwrap(), Pulled::Item(Item::text("on the desk")));
    }

    #[tokio::test]
    async fn unreachable_manual_host_stays_temporary() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);
        let (registry, _notes) = spawn_registry(RegistryConfig {
            own_identity: None,
            query_target: SocketAddr::from(([127, 0, 0, 1], 9)),
            resolve_timeout: Duration::from_millis(300),
            query_interval: Duration::from_millis(100),
            peer_ttl: Duration::from_secs(60),
        });
        let r = PeerSession::open_manual(&registry, None, addr, TIMEOUT).await;
        assert!(matches!(r, Err(SessionError::Client(ClientError::Transport(_)))));
        let selected = registry.selected().await.unwrap().unwrap();
        assert!(selected.manual && selected.temporary);
    }

    /// A pushes to B; C sees the new item in B's status and pulls it.
    #[tokio::test]
    async fn third_device_sees_pushed_item() {
        let (addr_b, state_b) = spawn_test_server().await;
        let b = descriptor(Some(addr_b), Some(state_b.identity()));
        let mut a_to_b = PeerSession::new(b.clone(), TIMEOUT);
        let mut c_to_b = PeerSession::new(b, TIMEOUT);
        assert_eq!(c_to_b.refresh_status().await.unwrap(), Change::Unknown);
        assert_eq!(c_to_b.availability().items_count(), Some(0));

        a_to_b.push(&Item::text("hello")).await.unwrap();

        assert_eq!(c_to_b.refresh_status().await.unwrap(), Change::Advanced);
        assert_eq!(c_to_b.availability().items_count(), Some(1));
        assert_eq!(
            c_to_b.availability().content_type(),
            Some(stash_core::mime::TEXT_PLAIN_UTF8)
        );
        assert_eq!(c_to_b.pull().await.unwrap(), Pulled::Item(Item::text("hello")));
    }

    fn resolved(name: &str, host: SocketAddr, id: DeviceId) -> DiscoveryEvent {
        DiscoveryEvent::Resolved {
            name: name.into(),
            host,
            properties: BTreeMap::from([(UUID_PROPERTY.to_string(), id.to_string())]),
        }
    }

    /// Devices A and B serve; C browses, selects A, pushes, and watches A leave.
    #[tokio::test]
    async fn three_devices_end_to_end() {
        let (addr_a, state_a) = spawn_test_server().await;
        let (addr_b, state_b) = spawn_test_server().await;
        let (ua, ub) = (state_a.identity(), state_b.identity());
        let c_identity = DeviceId::generate();

        let mut set = DiscoverySet::new(Some(c_identity));
        let now = Instant::now();
        for (name, addr, id) in [("A", addr_a, ua), ("B", addr_b, ub)] {
            set.apply(DiscoveryEvent::Found { name: name.into() }, now);
            set.apply(resolved(name, addr, id), now);
        }
        // C's own advertisement never shows up.
        set.apply(DiscoveryEvent::Found { name: "C".into() }, now);
        set.apply(resolved("C", addr_b, c_identity), now);
        assert_eq!(set.len(), 2);

        let peer_a = set.select(&PeerKey::Identity(ua)).unwrap().clone();
        let peer_b = set.get(&PeerKey::Identity(ub)).unwrap().clone();
        let mut to_a = PeerSession::new(peer_a, TIMEOUT);
        let mut to_b = PeerSession::new(peer_b, TIMEOUT);
        to_b.refresh_status().await.unwrap();

        let ack = to_a.push(&Item::text("hello")).await.unwrap();
        assert_eq!(ack.items_count, 1);
        assert_eq!(
            state_a.current().await.unwrap().as_text(),
            Some("hello")
        );
        assert_eq!(to_b.refresh_status().await.unwrap(), Change::Unchanged);
        assert_eq!(to_b.availability().items_count(), Some(0));

        // A re-advertises: still one entry for it.
        assert!(set.apply(DiscoveryEvent::Found { name: "A".into() }, now).is_empty());
        set.apply(resolved("A", addr_a, ua), now);
        assert_eq!(set.len(), 2);

        let notes = set.apply(DiscoveryEvent::Removed { name: "A".into() }, now);
        assert!(notes.contains(&PeerNotification::SelectionCleared));
        assert!(set.selected().is_none());
        assert_eq!(set.len(), 1);
    }
}
