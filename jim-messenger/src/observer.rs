//! Server-side activity log fed by [`ServerEvent`]s.
//!
//! Every session change is reported together with the store's view of the
//! affected user: how many times it logged in, its message counters and who
//! is online right now.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::{server::ServerEvent, store::MemoryUserStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub identity: String,
    pub online: bool,
    pub logins: usize,
    pub sent: u64,
    pub accepted: u64,
    /// Identities with an open session, ordered by name.
    pub active: Vec<String>,
}

/// Snapshot of the store after `event`. Connections without a session yet
/// produce nothing.
pub fn activity(store: &MemoryUserStore, event: &ServerEvent) -> Option<Activity> {
    let (identity, online) = match event {
        ServerEvent::Connected { .. } => return None,
        ServerEvent::SessionOpened { identity } => (identity, true),
        ServerEvent::SessionClosed { identity } => (identity, false),
    };

    let stats = store
        .message_stats()
        .into_iter()
        .find(|stats| &stats.identity == identity);
    let mut active: Vec<String> = store
        .active_users()
        .into_iter()
        .map(|login| login.identity)
        .collect();
    active.sort();

    Some(Activity {
        identity: identity.clone(),
        online,
        logins: store.login_history(Some(identity)).len(),
        sent: stats.as_ref().map_or(0, |stats| stats.sent),
        accepted: stats.as_ref().map_or(0, |stats| stats.accepted),
        active,
    })
}

/// Logs every session change until the server drops its event sender.
pub async fn observe(store: Arc<MemoryUserStore>, mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(activity) = activity(&store, &event) else {
                    continue;
                };
                info!(
                    identity = %activity.identity,
                    online = activity.online,
                    logins = activity.logins,
                    sent = activity.sent,
                    accepted = activity.accepted,
                    count = activity.active.len(),
                    users = ?activity.active,
                    "active users changed"
                );
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "observer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::store::UserStore;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    #[test]
    fn connections_without_a_session_are_not_reported() {
        let store = MemoryUserStore::default();
        let event = ServerEvent::Connected { peer: peer() };
        assert_eq!(activity(&store, &event), None);
    }

    #[test]
    fn session_changes_carry_login_and_message_counters() {
        let store = MemoryUserStore::default();
        store.login("bob", peer()).unwrap();
        store.login("alice", peer()).unwrap();
        store.logout("alice");
        store.login("alice", peer()).unwrap();
        store.record_message("alice", "bob").unwrap();
        store.record_message("bob", "alice").unwrap();
        store.record_message("bob", "alice").unwrap();

        let opened = ServerEvent::SessionOpened {
            identity: "alice".into(),
        };
        assert_eq!(
            activity(&store, &opened),
            Some(Activity {
                identity: "alice".into(),
                online: true,
                logins: 2,
                sent: 1,
                accepted: 2,
                active: vec!["alice".into(), "bob".into()],
            })
        );

        store.logout("alice");
        let closed = ServerEvent::SessionClosed {
            identity: "alice".into(),
        };
        let report = activity(&store, &closed).unwrap();
        assert!(!report.online);
        assert_eq!(report.active, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn observer_stops_when_the_sender_is_dropped() {
        let store = Arc::new(MemoryUserStore::default());
        let (events, receiver) = broadcast::channel(4);
        let task = tokio::spawn(observe(store, receiver));
        events
            .send(ServerEvent::SessionOpened {
                identity: "alice".into(),
            })
            .unwrap();
        drop(events);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
