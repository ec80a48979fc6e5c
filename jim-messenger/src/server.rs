//! The coordinator: one task multiplexing every peer connection.
//!
//! [`Server::tick`] is one reactor iteration:
//!
//! 1. wait (bounded) for a new connection or for inbound bytes,
//! 2. take a non-blocking readiness snapshot of every connection,
//! 3. decode at most one frame per readable connection and hand it to the
//!    [`ProtocolHandler`],
//! 4. flush the [`Router`] queue to connections that are writable,
//! 5. retry unflushed output and reap connections marked for closing.
//!
//! A failing connection only ever takes down its own session.

use std::{
    collections::{HashMap, HashSet},
    future::{Future, pending},
    io,
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use futures::{FutureExt, future::select_all};
use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerSettings,
    error::{ProtocolError, RequestError},
    handler::{Effect, Outcome, ProtocolHandler},
    message::{Frame, MAX_PACKAGE_LENGTH, Response, decode_from, encode, frame_complete},
    registry::{ConnId, SessionRegistry, SessionState},
    router::{FlushReport, Outbox, Router},
    store::UserStore,
};

/// Lifecycle notifications for observers of a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { peer: SocketAddr },
    SessionOpened { identity: String },
    SessionClosed { identity: String },
}

/// What one [`Server::tick`] did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub accepted: bool,
    pub frames: usize,
    pub flush: FlushReport,
}

pub struct Server {
    listener: TcpListener,
    store: Arc<dyn UserStore>,
    settings: ServerSettings,
    connections: HashMap<ConnId, Connection>,
    registry: SessionRegistry,
    router: Router,
    next_id: ConnId,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    pub fn new(listener: TcpListener, store: Arc<dyn UserStore>) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            listener,
            store,
            settings: ServerSettings::default(),
            connections: HashMap::new(),
            registry: SessionRegistry::new(),
            router: Router::new(),
            next_id: 1,
            events,
        }
    }

    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            let stop = select! {
                biased;
                _ = &mut shutdown => true,
                _ = self.tick() => false,
            };
            if stop {
                break;
            }
        }

        self.close_all();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs one reactor iteration. The only await point is the initial
    /// bounded wait, so dropping the future never loses a decoded frame.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if let Some((stream, peer)) = self.wait_for_activity().await {
            self.admit(stream, peer);
            report.accepted = true;
        }

        let (readable, writable) = self.poll_readiness();

        let inbound = self.read_inbound(&readable);
        report.frames = inbound.len();
        for (id, event) in inbound {
            self.dispatch(id, event);
        }

        report.flush = self.flush_router(&writable);
        self.flush_outbound();
        report
    }

    async fn wait_for_activity(&mut self) -> Option<(TcpStream, SocketAddr)> {
        let wait = if self.has_backlog() {
            self.settings.backlog_interval
        } else {
            self.settings.accept_timeout
        };
        let listener = &self.listener;
        let connections = &self.connections;

        let activity = async {
            select! {
                accepted = listener.accept() => Some(accepted),
                _ = any_readable(connections) => None,
            }
        };

        match timeout(wait, activity).await {
            Ok(Some(Ok(accepted))) => Some(accepted),
            Ok(Some(Err(err))) => {
                warn!(error = ?err, "failed to accept connection");
                None
            }
            Ok(None) | Err(_) => None,
        }
    }

    fn has_backlog(&self) -> bool {
        !self.router.is_empty()
            || self.connections.values().any(|conn| {
                conn.state == SessionState::Closing
                    || !conn.outbound.is_empty()
                    || frame_complete(&conn.inbound)
            })
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = ?err, "failed to disable nagle");
        }
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(id, Connection::new(stream, peer));
        info!(conn = id, %peer, "connection accepted");
        self.emit(ServerEvent::Connected { peer });
    }

    fn poll_readiness(&self) -> (HashSet<ConnId>, HashSet<ConnId>) {
        let mut readable = HashSet::new();
        let mut writable = HashSet::new();

        for (&id, conn) in &self.connections {
            let interest = Interest::READABLE | Interest::WRITABLE;
            match conn.stream.ready(interest).now_or_never() {
                Some(Ok(ready)) => {
                    if ready.is_readable() || ready.is_read_closed() {
                        readable.insert(id);
                    }
                    if ready.is_writable() {
                        writable.insert(id);
                    }
                }
                // Let the read surface the error.
                Some(Err(_)) => {
                    readable.insert(id);
                }
                None => {}
            }
            if frame_complete(&conn.inbound) {
                readable.insert(id);
            }
        }

        (readable, writable)
    }

    fn read_inbound(&mut self, readable: &HashSet<ConnId>) -> Vec<(ConnId, Inbound)> {
        let mut inbound = Vec::new();
        for &id in readable {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if conn.state == SessionState::Closing {
                continue;
            }
            if let Some(event) = conn.receive() {
                inbound.push((id, event));
            }
        }
        inbound
    }

    fn dispatch(&mut self, id: ConnId, inbound: Inbound) {
        // An earlier frame this tick may already have closed the connection.
        let Some(peer) = self.connections.get(&id).map(|conn| conn.peer) else {
            return;
        };

        let outcome = match inbound {
            Inbound::Frame(Frame::Request(request)) => {
                ProtocolHandler::new(&mut self.registry, self.store.as_ref())
                    .handle(id, peer, request)
            }
            Inbound::Frame(Frame::Response(response)) => {
                warn!(conn = id, %peer, code = response.code(), "client sent a response frame");
                Outcome::rejected(&RequestError::BadRequest(
                    "unexpected response frame".to_string(),
                ))
            }
            Inbound::Invalid(err) if err.is_recoverable() => {
                warn!(conn = id, %peer, error = %err, "malformed request");
                Outcome::malformed(&err)
            }
            Inbound::Invalid(err) => {
                warn!(conn = id, %peer, error = %err, "undecodable frame, dropping connection");
                self.close_connection(id, "undecodable frame");
                return;
            }
            Inbound::Closed => {
                self.close_connection(id, "closed by peer");
                return;
            }
            Inbound::Failed(err) => {
                warn!(conn = id, %peer, error = ?err, "read failed");
                self.close_connection(id, "read failure");
                return;
            }
        };

        self.apply(id, outcome);
    }

    fn apply(&mut self, id: ConnId, outcome: Outcome) {
        if let Some(response) = outcome.response {
            if let Err(err) = self.respond(id, response) {
                warn!(conn = id, error = ?err, "failed to write response");
                self.close_connection(id, "write failure");
                return;
            }
        }

        match outcome.effect {
            Effect::None => {}
            Effect::SessionOpened(identity) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = SessionState::Authenticated;
                }
                self.emit(ServerEvent::SessionOpened { identity });
            }
            Effect::Route(message) => self.router.enqueue(message),
            Effect::Close => self.begin_close(id),
        }
    }

    fn respond(&mut self, id: ConnId, response: Response) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let encoded = match encode(&response.into()) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(conn = id, error = %err, "response does not fit in one frame");
                encode(&Response::error("response too large").into()).map_err(invalid_data)?
            }
        };
        conn.outbound.extend_from_slice(&encoded);
        conn.flush()
    }

    fn flush_router(&mut self, writable: &HashSet<ConnId>) -> FlushReport {
        let mut outbox = Deliveries {
            connections: &mut self.connections,
            writable,
        };
        let report = self.router.flush(&self.registry, &mut outbox);
        for &id in &report.failed {
            self.close_connection(id, "delivery failure");
        }
        if report != FlushReport::default() {
            debug!(?report, "router flushed");
        }
        report
    }

    fn flush_outbound(&mut self) {
        let mut broken = Vec::new();
        let mut closing = Vec::new();
        for (&id, conn) in self.connections.iter_mut() {
            if let Err(err) = conn.flush() {
                debug!(conn = id, error = ?err, "flush failed");
                broken.push(id);
            } else if conn.state == SessionState::Closing {
                closing.push(id);
            }
        }
        for id in broken {
            self.close_connection(id, "write failure");
        }
        for id in closing {
            self.close_connection(id, "rejected");
        }
    }

    /// Sessions close at once; a connection without one first gets the rest
    /// of this tick to flush its final response.
    fn begin_close(&mut self, id: ConnId) {
        if self.registry.session_for(id).is_some() {
            self.close_connection(id, "exit");
        } else if let Some(conn) = self.connections.get_mut(&id) {
            conn.state = SessionState::Closing;
        }
    }

    /// Removes the connection and its session together; dropping the stream
    /// closes the socket.
    fn close_connection(&mut self, id: ConnId, reason: &str) {
        let connection = self.connections.remove(&id);
        match self.registry.remove_conn(id) {
            Some(session) => {
                self.store.logout(&session.identity);
                info!(conn = id, peer = %session.peer, identity = %session.identity, reason, "session closed");
                self.emit(ServerEvent::SessionClosed {
                    identity: session.identity,
                });
            }
            None => {
                if let Some(conn) = connection {
                    info!(conn = id, peer = %conn.peer, reason, "connection closed");
                }
            }
        }
    }

    fn close_all(&mut self) {
        info!(sessions = self.registry.len(), "server shutting down");
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, "server shutdown");
        }
    }

    fn emit(&self, event: ServerEvent) {
        // Having no subscribers is normal.
        let _ = self.events.send(event);
    }
}

async fn any_readable(connections: &HashMap<ConnId, Connection>) {
    if connections.is_empty() {
        return pending().await;
    }
    let waits = connections
        .values()
        .map(|conn| Box::pin(conn.stream.readable()));
    let _ = select_all(waits).await;
}

enum Inbound {
    Frame(Frame),
    Invalid(ProtocolError),
    Closed,
    Failed(io::Error),
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: SessionState,
    inbound: BytesMut,
    outbound: BytesMut,
    eof: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: SessionState::Connecting,
            inbound: BytesMut::with_capacity(MAX_PACKAGE_LENGTH),
            outbound: BytesMut::new(),
            eof: false,
        }
    }

    /// Decodes the next frame, reading from the socket only when the buffer
    /// does not already hold one.
    fn receive(&mut self) -> Option<Inbound> {
        if !frame_complete(&self.inbound) && !self.eof {
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => self.eof = true,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Some(Inbound::Failed(err)),
            }
        }

        match decode_from(&mut self.inbound) {
            Ok(Some(frame)) => Some(Inbound::Frame(frame)),
            Ok(None) if self.eof => Some(Inbound::Closed),
            Ok(None) => None,
            Err(err) => Some(Inbound::Invalid(err)),
        }
    }

    /// Writes as much buffered output as the socket takes without blocking.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.outbound.advance(written),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Router-facing view of the connection table for one flush.
struct Deliveries<'a> {
    connections: &'a mut HashMap<ConnId, Connection>,
    writable: &'a HashSet<ConnId>,
}

impl Outbox for Deliveries<'_> {
    fn is_writable(&self, conn: ConnId) -> bool {
        self.writable.contains(&conn)
            && self.connections.get(&conn).is_some_and(|connection| {
                connection.state == SessionState::Authenticated && connection.outbound.is_empty()
            })
    }

    fn deliver(&mut self, conn: ConnId, frame: &Frame) -> io::Result<()> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(io::ErrorKind::NotConnected)?;
        match encode(frame) {
            Ok(encoded) => connection.outbound.extend_from_slice(&encoded),
            Err(err) => {
                warn!(conn, error = %err, "routed message does not fit in one frame, dropping it");
                return Ok(());
            }
        }
        connection.flush()
    }
}

fn invalid_data(err: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
