//! Identity-to-connection bindings for the server.

use std::{collections::HashMap, net::SocketAddr};

use crate::error::RequestError;

/// Server-side handle for one accepted connection.
pub type ConnId = u64;

/// Lifecycle of a connection as seen by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no identity claimed yet.
    Connecting,
    /// Bound to an identity in the registry.
    Authenticated,
    /// Marked for removal; only its final response is still being flushed.
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    pub conn: ConnId,
    pub peer: SocketAddr,
}

/// At most one live session per identity and per connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_identity: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `identity` for `conn`. An identity that is already bound is
    /// refused and the existing binding is left as it was.
    pub fn bind(
        &mut self,
        identity: &str,
        conn: ConnId,
        peer: SocketAddr,
    ) -> Result<&Session, RequestError> {
        if self.by_identity.contains_key(identity) {
            return Err(RequestError::IdentityConflict(identity.to_string()));
        }
        if let Some(existing) = self.by_conn.get(&conn) {
            return Err(RequestError::BadRequest(format!(
                "connection already bound to '{}'",
                existing.identity
            )));
        }

        self.by_identity.insert(identity.to_string(), conn);
        let session = self.by_conn.entry(conn).or_insert(Session {
            identity: identity.to_string(),
            conn,
            peer,
        });
        Ok(session)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.by_identity.contains_key(identity)
    }

    pub fn conn_of(&self, identity: &str) -> Option<ConnId> {
        self.by_identity.get(identity).copied()
    }

    pub fn session_for(&self, conn: ConnId) -> Option<&Session> {
        self.by_conn.get(&conn)
    }

    /// True when `conn` is the connection currently bound to `identity`.
    pub fn is_bound_to(&self, identity: &str, conn: ConnId) -> bool {
        self.conn_of(identity) == Some(conn)
    }

    /// Drops whatever session `conn` holds.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<Session> {
        let session = self.by_conn.remove(&conn)?;
        self.by_identity.remove(&session.identity);
        Some(session)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.by_identity.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}
