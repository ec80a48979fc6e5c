//! Storage collaborators for both sides of the protocol.
//!
//! The server consults a [`UserStore`] for accounts, contacts and login
//! history; a peer keeps its own message history, contact list and known
//! users in a [`PeerStore`]. Both traits take `&self` so one store can be
//! shared between the code driving the protocol and whoever inspects it.
//! The in-memory implementations guard their state with a single `Mutex`.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Server-side persistence contract.
pub trait UserStore: Send + Sync {
    /// Records a successful handshake. Fails with
    /// [`StoreError::NotRegistered`] for identities the store refuses.
    fn login(&self, identity: &str, addr: SocketAddr) -> Result<(), StoreError>;
    fn logout(&self, identity: &str);
    fn contacts(&self, identity: &str) -> Result<BTreeSet<String>, StoreError>;
    fn add_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError>;
    fn remove_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError>;
    /// Every registered identity, ordered by name.
    fn known_users(&self) -> Result<Vec<KnownUser>, StoreError>;
    /// Bumps the sent/accepted counters for a routed message.
    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownUser {
    pub identity: String,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLogin {
    pub identity: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub identity: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub identity: String,
    pub last_login: Option<DateTime<Utc>>,
    pub sent: u64,
    pub accepted: u64,
}

/// Who may log in to a [`MemoryUserStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Unknown identities are registered on their first login.
    Open,
    /// Only identities added with [`MemoryUserStore::register`].
    Closed,
}

#[derive(Debug, Default)]
struct UserRecord {
    last_login: Option<DateTime<Utc>>,
    sent: u64,
    accepted: u64,
}

#[derive(Debug, Default)]
struct UserState {
    users: BTreeMap<String, UserRecord>,
    active: BTreeMap<String, ActiveLogin>,
    history: Vec<LoginRecord>,
    contacts: BTreeMap<String, BTreeSet<String>>,
}

impl UserState {
    fn require(&self, identity: &str) -> Result<(), StoreError> {
        if self.users.contains_key(identity) {
            Ok(())
        } else {
            Err(StoreError::NotRegistered(identity.to_string()))
        }
    }
}

/// Process-local [`UserStore`]; everything is lost when the server exits.
#[derive(Debug)]
pub struct MemoryUserStore {
    registration: Registration,
    state: Mutex<UserState>,
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new(Registration::Open)
    }
}

impl MemoryUserStore {
    pub fn new(registration: Registration) -> Self {
        Self {
            registration,
            state: Mutex::new(UserState::default()),
        }
    }

    /// A closed store that only admits `identities`.
    pub fn with_users<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new(Registration::Closed);
        for identity in identities {
            store.register(identity);
        }
        store
    }

    pub fn register(&self, identity: impl Into<String>) {
        self.lock().users.entry(identity.into()).or_default();
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.lock().users.contains_key(identity)
    }

    pub fn active_users(&self) -> Vec<ActiveLogin> {
        self.lock().active.values().cloned().collect()
    }

    /// Login history, optionally narrowed to one identity.
    pub fn login_history(&self, identity: Option<&str>) -> Vec<LoginRecord> {
        self.lock()
            .history
            .iter()
            .filter(|record| identity.is_none_or(|name| record.identity == name))
            .cloned()
            .collect()
    }

    pub fn message_stats(&self) -> Vec<MessageStats> {
        self.lock()
            .users
            .iter()
            .map(|(identity, record)| MessageStats {
                identity: identity.clone(),
                last_login: record.last_login,
                sent: record.sent,
                accepted: record.accepted,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, UserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for MemoryUserStore {
    fn login(&self, identity: &str, addr: SocketAddr) -> Result<(), StoreError> {
        let mut state = self.lock();
        if self.registration == Registration::Open {
            state.users.entry(identity.to_string()).or_default();
        }
        let now = Utc::now();
        let Some(user) = state.users.get_mut(identity) else {
            return Err(StoreError::NotRegistered(identity.to_string()));
        };
        user.last_login = Some(now);

        state.active.insert(
            identity.to_string(),
            ActiveLogin {
                identity: identity.to_string(),
                addr,
                login_time: now,
            },
        );
        state.history.push(LoginRecord {
            identity: identity.to_string(),
            addr,
            login_time: now,
        });
        Ok(())
    }

    fn logout(&self, identity: &str) {
        self.lock().active.remove(identity);
    }

    fn contacts(&self, identity: &str) -> Result<BTreeSet<String>, StoreError> {
        let state = self.lock();
        state.require(identity)?;
        Ok(state.contacts.get(identity).cloned().unwrap_or_default())
    }

    fn add_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.require(owner)?;
        // Contacts must be real users; unknown names are ignored.
        if state.users.contains_key(contact) {
            state
                .contacts
                .entry(owner.to_string())
                .or_default()
                .insert(contact.to_string());
        }
        Ok(())
    }

    fn remove_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.require(owner)?;
        if let Some(contacts) = state.contacts.get_mut(owner) {
            contacts.remove(contact);
        }
        Ok(())
    }

    fn known_users(&self) -> Result<Vec<KnownUser>, StoreError> {
        Ok(self
            .lock()
            .users
            .iter()
            .map(|(identity, record)| KnownUser {
                identity: identity.clone(),
                last_login: record.last_login,
            })
            .collect())
    }

    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(record) = state.users.get_mut(sender) {
            record.sent += 1;
        }
        if let Some(record) = state.users.get_mut(recipient) {
            record.accepted += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub contact: String,
    pub direction: Direction,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Peer-side persistence used by [`crate::transport::PeerTransport`].
pub trait PeerStore: Send + Sync {
    fn save_message(&self, contact: &str, direction: Direction, text: &str);
    fn history(&self, contact: &str) -> Vec<HistoryEntry>;
    fn replace_contacts(&self, contacts: Vec<String>);
    fn add_contact(&self, contact: &str);
    fn remove_contact(&self, contact: &str);
    fn contacts(&self) -> Vec<String>;
    fn replace_known_users(&self, users: Vec<String>);
    fn known_users(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct PeerState {
    history: Vec<HistoryEntry>,
    contacts: BTreeSet<String>,
    known_users: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    state: Mutex<PeerState>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerStore for MemoryPeerStore {
    fn save_message(&self, contact: &str, direction: Direction, text: &str) {
        self.lock().history.push(HistoryEntry {
            contact: contact.to_string(),
            direction,
            text: text.to_string(),
            at: Utc::now(),
        });
    }

    fn history(&self, contact: &str) -> Vec<HistoryEntry> {
        self.lock()
            .history
            .iter()
            .filter(|entry| entry.contact == contact)
            .cloned()
            .collect()
    }

    fn replace_contacts(&self, contacts: Vec<String>) {
        self.lock().contacts = contacts.into_iter().collect();
    }

    fn add_contact(&self, contact: &str) {
        self.lock().contacts.insert(contact.to_string());
    }

    fn remove_contact(&self, contact: &str) {
        self.lock().contacts.remove(contact);
    }

    fn contacts(&self) -> Vec<String> {
        self.lock().contacts.iter().cloned().collect()
    }

    fn replace_known_users(&self, users: Vec<String>) {
        self.lock().known_users = users.into_iter().collect();
    }

    fn known_users(&self) -> Vec<String> {
        self.lock().known_users.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[test]
    fn open_store_registers_on_login() {
        let store = MemoryUserStore::default();
        store.login("alice", addr()).expect("open registration");
        assert!(store.is_registered("alice"));
        assert_eq!(store.active_users().len(), 1);

        store.logout("alice");
        assert!(store.active_users().is_empty());
        assert_eq!(store.login_history(Some("alice")).len(), 1);
    }

    #[test]
    fn closed_store_rejects_strangers() {
        let store = MemoryUserStore::with_users(["alice"]);
        assert_eq!(
            store.login("mallory", addr()),
            Err(StoreError::NotRegistered("mallory".into()))
        );
        store.login("alice", addr()).expect("registered user");
    }

    #[test]
    fn contacts_ignore_unknown_users_and_duplicates() {
        let store = MemoryUserStore::with_users(["alice", "bob"]);
        store.add_contact("alice", "bob").unwrap();
        store.add_contact("alice", "bob").unwrap();
        store.add_contact("alice", "ghost").unwrap();
        assert_eq!(
            store.contacts("alice").unwrap().into_iter().collect::<Vec<_>>(),
            vec!["bob".to_string()]
        );

        store.remove_contact("alice", "bob").unwrap();
        assert!(store.contacts("alice").unwrap().is_empty());
        assert!(store.contacts("ghost").is_err());
    }

    #[test]
    fn known_users_are_ordered_with_last_login() {
        let store = MemoryUserStore::with_users(["carol", "alice", "bob"]);
        store.login("bob", addr()).unwrap();
        let users = store.known_users().unwrap();
        let names: Vec<_> = users.iter().map(|user| user.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert!(users[1].last_login.is_some());
        assert!(users[0].last_login.is_none());
    }

    #[test]
    fn message_counters() {
        let store = MemoryUserStore::with_users(["alice", "bob"]);
        store.record_message("alice", "bob").unwrap();
        store.record_message("alice", "nobody").unwrap();
        let stats = store.message_stats();
        assert_eq!((stats[0].sent, stats[0].accepted), (2, 0));
        assert_eq!((stats[1].sent, stats[1].accepted), (0, 1));
    }

    #[test]
    fn peer_store_keeps_history_per_contact() {
        let store = MemoryPeerStore::new();
        store.save_message("bob", Direction::Outgoing, "hi");
        store.save_message("carol", Direction::Incoming, "yo");
        store.save_message("bob", Direction::Incoming, "hello");

        let history = store.history("bob");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].direction, Direction::Incoming);

        store.replace_contacts(vec!["bob".into(), "carol".into()]);
        store.remove_contact("carol");
        store.add_contact("dave");
        assert_eq!(store.contacts(), ["bob", "dave"]);
    }
}
