//! Discovery Set: folds asynchronous found/resolved/removed events into a de-duplicated,
//! identity-keyed set of peers. Host-driven: no I/O; host passes events, receives notifications.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::identity::DeviceId;
use crate::protocol::UUID_PROPERTY;

/// Discovery Set key: identity once known, advertised name before that. Unconfirmed
/// manual peers live under their own name space so browsing never lands on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    Identity(DeviceId),
    Name(String),
    Manual(String),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Identity(id) => write!(f, "{}", id),
            PeerKey::Name(name) => write!(f, "{:?}", name),
            PeerKey::Manual(name) => write!(f, "manual {:?}", name),
        }
    }
}

/// A discovered (or manually entered) endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub name: String,
    pub host: Option<SocketAddr>,
    pub identity: Option<DeviceId>,
    /// Advertised but not resolved yet, or manual and not confirmed reachable.
    pub temporary: bool,
    /// Entered by the user rather than found by browsing.
    pub manual: bool,
    pub properties: BTreeMap<String, String>,
}

impl PeerDescriptor {
    fn candidate(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            identity: None,
            temporary: true,
            manual: false,
            properties: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> PeerKey {
        match (self.identity, self.manual) {
            (Some(id), _) => PeerKey::Identity(id),
            (None, true) => PeerKey::Manual(self.name.clone()),
            (None, false) => PeerKey::Name(self.name.clone()),
        }
    }

    /// Host and identity are both known.
    pub fn is_ready(&self) -> bool {
        self.host.is_some() && self.identity.is_some()
    }
}

/// Browsing events, in the order the browser emits them for one advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        name: String,
    },
    Resolved {
        name: String,
        host: SocketAddr,
        properties: BTreeMap<String, String>,
    },
    ResolutionTimedOut {
        name: String,
    },
    Removed {
        name: String,
    },
}

/// Change to the Discovery Set, delivered to consumers in fold order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotification {
    Added(PeerDescriptor),
    /// `previous` differs from `peer.key()` when a name-keyed entry was promoted to its identity.
    Updated {
        previous: PeerKey,
        peer: PeerDescriptor,
    },
    Removed(PeerDescriptor),
    /// The selected peer went away; the application must choose again.
    SelectionCleared,
}

impl PeerNotification {
    /// Name to resolve when this notification introduced a browse candidate.
    pub fn needs_resolution(&self) -> Option<&str> {
        match self {
            PeerNotification::Added(p) if p.temporary && !p.manual && p.host.is_none() => {
                Some(&p.name)
            }
            _ => None,
        }
    }
}

/// Decides whether a candidate may enter the set (e.g. reject our own advertisement).
pub type PeerFilter = Box<dyn Fn(&PeerDescriptor) -> bool + Send>;

struct Entry {
    descriptor: PeerDescriptor,
    /// Advertised names currently mapping to this entry.
    names: BTreeSet<String>,
    last_seen: Instant,
}

/// At most one entry per identity; names are only keys until resolution.
pub struct DiscoverySet {
    entries: BTreeMap<PeerKey, Entry>,
    selected: Option<PeerKey>,
    filter: PeerFilter,
    /// Names the filter turned down once resolved, with when they were last announced.
    /// Re-announcements of these are ignored until a goodbye or expiry.
    rejected: BTreeMap<String, Instant>,
}

impl DiscoverySet {
    /// Set that rejects peers advertising `own` as their identity.
    pub fn new(own: Option<DeviceId>) -> Self {
        Self::with_filter(Box::new(move |p: &PeerDescriptor| {
            own.is_none() || p.identity != own
        }))
    }

    pub fn with_filter(filter: PeerFilter) -> Self {
        Self {
            entries: BTreeMap::new(),
            selected: None,
            filter,
            rejected: BTreeMap::new(),
        }
    }

    /// Fold one browsing event.
    pub fn apply(&mut self, event: DiscoveryEvent, now: Instant) -> Vec<PeerNotification> {
        match event {
            DiscoveryEvent::Found { name } => self.on_found(name, now),
            DiscoveryEvent::Resolved {
                name,
                host,
                properties,
            } => self.on_resolved(name, host, properties, now),
            DiscoveryEvent::ResolutionTimedOut { name } => self.drop_candidate(&name),
            DiscoveryEvent::Removed { name } => self.on_removed(&name),
        }
    }

    fn on_found(&mut self, name: String, now: Instant) -> Vec<PeerNotification> {
        if let Some(seen) = self.rejected.get_mut(&name) {
            *seen = now;
            return Vec::new();
        }
        if let Some(key) = self.browsed_key_for_name(&name) {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.last_seen = now;
            }
            return Vec::new();
        }
        let candidate = PeerDescriptor::candidate(&name);
        if !(self.filter)(&candidate) {
            return Vec::new();
        }
        self.entries.insert(
            PeerKey::Name(name.clone()),
            Entry {
                descriptor: candidate.clone(),
                names: BTreeSet::from([name]),
                last_seen: now,
            },
        );
        vec![PeerNotification::Added(candidate)]
    }

    fn on_resolved(
        &mut self,
        name: String,
        host: SocketAddr,
        properties: BTreeMap<String, String>,
        now: Instant,
    ) -> Vec<PeerNotification> {
        let identity = properties
            .get(UUID_PROPERTY)
            .and_then(|s| s.parse::<DeviceId>().ok());
        let Some(identity) = identity else {
            // Unusable record: without an identity the peer can never be ready.
            return self.drop_candidate(&name);
        };
        let resolved = PeerDescriptor {
            name: name.clone(),
            host: Some(host),
            identity: Some(identity),
            temporary: false,
            manual: false,
            properties,
        };
        if !(self.filter)(&resolved) {
            self.rejected.insert(name.clone(), now);
            return self.drop_candidate(&name);
        }
        self.rejected.remove(&name);

        let mut out = self.release_name_from_others(&name, identity);
        let name_key = PeerKey::Name(name.clone());
        let transient = self.entries.remove(&name_key);
        let id_key = PeerKey::Identity(identity);

        if let Some(existing) = self.entries.get_mut(&id_key) {
            // Duplicate advertisement or re-resolution: merge into the identity entry.
            existing.descriptor = resolved.clone();
            existing.names.insert(name);
            existing.last_seen = now;
            if let Some(t) = transient {
                out.push(PeerNotification::Removed(t.descriptor));
            }
            self.promote_selection(&name_key, &id_key);
            out.push(PeerNotification::Updated {
                previous: id_key,
                peer: resolved,
            });
            return out;
        }

        let names = match &transient {
            Some(t) => {
                let mut names = t.names.clone();
                names.insert(name.clone());
                names
            }
            None => BTreeSet::from([name.clone()]),
        };
        self.entries.insert(
            id_key.clone(),
            Entry {
                descriptor: resolved.clone(),
                names,
                last_seen: now,
            },
        );
        if transient.is_some() {
            self.promote_selection(&name_key, &id_key);
            out.push(PeerNotification::Updated {
                previous: name_key,
                peer: resolved,
            });
        } else {
            out.push(PeerNotification::Added(resolved));
        }
        out
    }

    fn on_removed(&mut self, name: &str) -> Vec<PeerNotification> {
        self.rejected.remove(name);
        let Some(key) = self.browsed_key_for_name(name) else {
            return Vec::new();
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        entry.names.remove(name);
        if let Some(remaining) = entry.names.iter().next() {
            // Still advertised under another name.
            if entry.descriptor.name == name {
                entry.descriptor.name = remaining.clone();
                return vec![PeerNotification::Updated {
                    previous: key,
                    peer: entry.descriptor.clone(),
                }];
            }
            return Vec::new();
        }
        self.remove_key(&key)
    }

    /// Drop a browse candidate that never resolved.
    fn drop_candidate(&mut self, name: &str) -> Vec<PeerNotification> {
        let key = PeerKey::Name(name.to_string());
        let pending = self
            .entries
            .get(&key)
            .map_or(false, |e| e.descriptor.temporary);
        if pending {
            self.remove_key(&key)
        } else {
            Vec::new()
        }
    }

    /// A name now resolves to `identity`: detach it from any other identity entry.
    fn release_name_from_others(
        &mut self,
        name: &str,
        identity: DeviceId,
    ) -> Vec<PeerNotification> {
        let stale: Vec<PeerKey> = self
            .entries
            .iter()
            .filter(|(k, e)| {
                matches!(k, PeerKey::Identity(id) if *id != identity) && e.names.contains(name)
            })
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::new();
        for key in stale {
            let empty = match self.entries.get_mut(&key) {
                Some(e) => {
                    e.names.remove(name);
                    e.names.is_empty() && !e.descriptor.manual
                }
                None => false,
            };
            if empty {
                out.extend(self.remove_key(&key));
            }
        }
        out
    }

    fn remove_key(&mut self, key: &PeerKey) -> Vec<PeerNotification> {
        let Some(entry) = self.entries.remove(key) else {
            return Vec::new();
        };
        let mut out = vec![PeerNotification::Removed(entry.descriptor)];
        if self.selected.as_ref() == Some(key) {
            self.selected = None;
            out.push(PeerNotification::SelectionCleared);
        }
        out
    }

    fn promote_selection(&mut self, from: &PeerKey, to: &PeerKey) {
        if self.selected.as_ref() == Some(from) {
            self.selected = Some(to.clone());
        }
    }

    /// Key of the browsed (non-manual) entry that `name` maps to.
    fn browsed_key_for_name(&self, name: &str) -> Option<PeerKey> {
        let by_name = PeerKey::Name(name.to_string());
        if self.entries.contains_key(&by_name) {
            return Some(by_name);
        }
        self.entries
            .iter()
            .find(|(k, e)| {
                matches!(k, PeerKey::Identity(_)) && !e.descriptor.manual && e.names.contains(name)
            })
            .map(|(k, _)| k.clone())
    }

    /// Remove browsed entries not re-announced within `ttl`. Manual peers never expire.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<PeerNotification> {
        self.rejected
            .retain(|_, seen| now.saturating_duration_since(*seen) < ttl);
        let stale: Vec<PeerKey> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.descriptor.manual && now.saturating_duration_since(e.last_seen) >= ttl
            })
            .map(|(k, _)| k.clone())
            .collect();
        stale.iter().flat_map(|k| self.remove_key(k)).collect()
    }

    /// Add a user-entered peer. It stays temporary until [`confirm`](Self::confirm)ed.
    pub fn add_manual(
        &mut self,
        name: Option<String>,
        host: SocketAddr,
        now: Instant,
    ) -> (PeerKey, Vec<PeerNotification>) {
        let name = name.unwrap_or_else(|| host.to_string());
        let descriptor = PeerDescriptor {
            name: name.clone(),
            host: Some(host),
            identity: None,
            temporary: true,
            manual: true,
            properties: BTreeMap::new(),
        };
        let key = PeerKey::Manual(name.clone());
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                descriptor: descriptor.clone(),
                names: BTreeSet::from([name]),
                last_seen: now,
            },
        );
        let note = match previous {
            Some(_) => PeerNotification::Updated {
                previous: key.clone(),
                peer: descriptor,
            },
            None => PeerNotification::Added(descriptor),
        };
        (key, vec![note])
    }

    /// A manual peer answered and told us its identity: it is no longer temporary.
    /// If that identity is already known from browsing, the manual entry folds into it.
    pub fn confirm(&mut self, key: &PeerKey, identity: DeviceId) -> Vec<PeerNotification> {
        let Some(entry) = self.entries.get(key) else {
            return Vec::new();
        };
        if !entry.descriptor.manual || entry.descriptor.identity.is_some() {
            return Vec::new();
        }
        let mut confirmed = entry.descriptor.clone();
        confirmed.identity = Some(identity);
        confirmed.temporary = false;
        if !(self.filter)(&confirmed) {
            return self.remove_key(key);
        }
        let Some(entry) = self.entries.remove(key) else {
            return Vec::new();
        };
        let id_key = PeerKey::Identity(identity);
        self.promote_selection(key, &id_key);
        if let Some(existing) = self.entries.get(&id_key) {
            return vec![
                PeerNotification::Removed(entry.descriptor),
                PeerNotification::Updated {
                    previous: id_key,
                    peer: existing.descriptor.clone(),
                },
            ];
        }
        self.entries.insert(
            id_key,
            Entry {
                descriptor: confirmed.clone(),
                names: entry.names,
                last_seen: entry.last_seen,
            },
        );
        vec![PeerNotification::Updated {
            previous: key.clone(),
            peer: confirmed,
        }]
    }

    /// Choose the current peer. Returns `None` if the key is unknown.
    pub fn select(&mut self, key: &PeerKey) -> Option<&PeerDescriptor> {
        let entry = self.entries.get(key)?;
        self.selected = Some(key.clone());
        Some(&entry.descriptor)
    }

    pub fn selected(&self) -> Option<&PeerDescriptor> {
        self.selected
            .as_ref()
            .and_then(|k| self.entries.get(k))
            .map(|e| &e.descriptor)
    }

    pub fn get(&self, key: &PeerKey) -> Option<&PeerDescriptor> {
        self.entries.get(key).map(|e| &e.descriptor)
    }

    /// Read-only copy of every peer, ordered by key.
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DiscoverySet {
    fn default() -> Self {
        Self::new(None)
    }
}
