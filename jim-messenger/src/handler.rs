//! Request dispatch: maps one decoded request plus the current session
//! bindings to a response and at most one side effect.
//!
//! The handler never touches sockets. It updates the [`SessionRegistry`] on
//! a successful presence, consults the [`UserStore`], and reports what the
//! multiplexer has to do next through [`Outcome`].

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::{
    error::{ProtocolError, RequestError, StoreError},
    message::{Request, Response},
    registry::{ConnId, SessionRegistry},
    router::PendingMessage,
    store::UserStore,
};

#[derive(Debug, PartialEq)]
pub enum Effect {
    None,
    /// The connection now owns this identity.
    SessionOpened(String),
    /// Queue a chat message for the router.
    Route(PendingMessage),
    /// Deregister the connection's session and close it once `response`
    /// (if any) has been written.
    Close,
}

#[derive(Debug, PartialEq)]
pub struct Outcome {
    pub response: Option<Response>,
    pub effect: Effect,
}

impl Outcome {
    fn reply(response: Response) -> Self {
        Self {
            response: Some(response),
            effect: Effect::None,
        }
    }

    fn effect(effect: Effect) -> Self {
        Self {
            response: None,
            effect,
        }
    }

    /// The 400 answer for a refused request. Failed handshakes also close
    /// the connection that attempted them.
    pub fn rejected(err: &RequestError) -> Self {
        let effect = match err {
            RequestError::IdentityConflict(_) | RequestError::NotRegistered(_) => Effect::Close,
            _ => Effect::None,
        };
        Self {
            response: Some(Response::error(err.reply_text())),
            effect,
        }
    }

    /// The 400 answer for a frame whose content could not be parsed.
    pub fn malformed(err: &ProtocolError) -> Self {
        Self::rejected(&RequestError::BadRequest(err.to_string()))
    }
}

pub struct ProtocolHandler<'a> {
    registry: &'a mut SessionRegistry,
    store: &'a dyn UserStore,
}

impl<'a> ProtocolHandler<'a> {
    pub fn new(registry: &'a mut SessionRegistry, store: &'a dyn UserStore) -> Self {
        Self { registry, store }
    }

    pub fn handle(&mut self, conn: ConnId, peer: SocketAddr, request: Request) -> Outcome {
        debug!(conn, action = request.action(), "handling request");
        let action = request.action();
        match self.dispatch(conn, peer, request) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(conn, %peer, action, error = %err, "request refused");
                Outcome::rejected(&err)
            }
        }
    }

    fn dispatch(
        &mut self,
        conn: ConnId,
        peer: SocketAddr,
        request: Request,
    ) -> Result<Outcome, RequestError> {
        match request {
            Request::Presence { user, .. } => self.presence(conn, peer, user.account_name),
            Request::Message {
                sender,
                destination,
                time,
                text,
            } => Ok(self.message(sender, destination, time, text)),
            Request::Exit { account_name, .. } => {
                self.authorize("exit", &account_name, conn)?;
                info!(conn, identity = %account_name, "client is leaving");
                Ok(Outcome::effect(Effect::Close))
            }
            Request::GetContacts { user, .. } => {
                self.authorize("get_contacts", &user, conn)?;
                let contacts = self.store.contacts(&user)?;
                Ok(Outcome::reply(Response::Accepted(
                    contacts.into_iter().collect(),
                )))
            }
            Request::AddContact {
                user, account_name, ..
            } => {
                self.authorize("add", &user, conn)?;
                self.store.add_contact(&user, &account_name)?;
                debug!(owner = %user, contact = %account_name, "contact added");
                Ok(Outcome::reply(Response::Ok))
            }
            Request::RemoveContact {
                user, account_name, ..
            } => {
                self.authorize("remove", &user, conn)?;
                self.store.remove_contact(&user, &account_name)?;
                debug!(owner = %user, contact = %account_name, "contact removed");
                Ok(Outcome::reply(Response::Ok))
            }
            Request::GetUsers { account_name, .. } => {
                self.authorize("get_users", &account_name, conn)?;
                let users = self
                    .store
                    .known_users()?
                    .into_iter()
                    .map(|user| user.identity)
                    .collect();
                Ok(Outcome::reply(Response::Accepted(users)))
            }
        }
    }

    fn presence(
        &mut self,
        conn: ConnId,
        peer: SocketAddr,
        name: String,
    ) -> Result<Outcome, RequestError> {
        // A bound connection keeps its session, even when it repeats its own name.
        if let Some(session) = self.registry.session_for(conn) {
            return Err(RequestError::BadRequest(format!(
                "connection already bound to '{}'",
                session.identity
            )));
        }
        if self.registry.contains(&name) {
            return Err(RequestError::IdentityConflict(name));
        }

        self.store.login(&name, peer).map_err(|err| match err {
            StoreError::NotRegistered(name) => RequestError::NotRegistered(name),
            other => RequestError::Store(other),
        })?;
        self.registry.bind(&name, conn, peer)?;

        info!(conn, %peer, identity = %name, "session opened");
        Ok(Outcome {
            response: Some(Response::Ok),
            effect: Effect::SessionOpened(name),
        })
    }

    fn message(&mut self, sender: String, destination: String, time: f64, text: String) -> Outcome {
        if let Err(error) = self.store.record_message(&sender, &destination) {
            warn!(%sender, %destination, %error, "failed to record message statistics");
        }
        debug!(%sender, %destination, "message queued");
        Outcome::effect(Effect::Route(PendingMessage {
            sender,
            destination,
            text,
            time,
        }))
    }

    fn authorize(
        &self,
        action: &'static str,
        identity: &str,
        conn: ConnId,
    ) -> Result<(), RequestError> {
        if self.registry.is_bound_to(identity, conn) {
            Ok(())
        } else {
            Err(RequestError::Unauthorized {
                action,
                identity: identity.to_string(),
            })
        }
    }
}
