//! Client side of the protocol: one socket shared by a background watcher
//! and foreground request/response calls.
//!
//! The watcher wakes every [`TransportConfig::watch_interval`], takes the
//! socket lock and reads at most one frame under a short timeout, so a
//! foreground call never waits long for the lock. Inbound chat messages are
//! saved in the [`PeerStore`] and surfaced as [`TransportEvent`]s.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Instant, sleep, timeout, timeout_at},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::TransportConfig,
    error::TransportError,
    message::{Frame, FrameStream, Request, Response, encode},
    store::{Direction, PeerStore},
};

/// Notifications for the user-facing side of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { from: String, text: String },
    ConnectionLost,
}

struct Shared {
    identity: String,
    stream: Mutex<FrameStream<TcpStream>>,
    running: AtomicBool,
    store: Arc<dyn PeerStore>,
    events: mpsc::UnboundedSender<TransportEvent>,
    config: TransportConfig,
}

impl Shared {
    /// Sends `request` and waits for its response. Chat messages that
    /// arrive first are handled exactly as the watcher would.
    async fn round_trip(
        &self,
        stream: &mut FrameStream<TcpStream>,
        request: Request,
    ) -> Result<Response, TransportError> {
        let action = request.action();
        stream.write_frame(&request.into()).await?;

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let frame = timeout_at(deadline, stream.read_frame())
                .await
                .map_err(|_| TransportError::Timeout)??;
            match frame {
                Frame::Response(response) => {
                    debug!(action, code = response.code(), "response received");
                    return Ok(response);
                }
                Frame::Request(Request::Message {
                    sender,
                    destination,
                    text,
                    ..
                }) => self.receive(sender, destination, text),
                Frame::Request(other) => {
                    return Err(TransportError::UnexpectedFrame(other.action().to_string()));
                }
            }
        }
    }

    fn receive(&self, sender: String, destination: String, text: String) {
        if destination != self.identity {
            warn!(%sender, %destination, "message addressed to someone else, ignoring");
            return;
        }
        debug!(%sender, "message received");
        self.store.save_message(&sender, Direction::Incoming, &text);
        let _ = self
            .events
            .send(TransportEvent::Message { from: sender, text });
    }

    /// Stops the transport after a fatal error. Only the first failure is
    /// reported.
    fn fail(&self, err: &TransportError) {
        if self.running.swap(false, Ordering::SeqCst) {
            error!(identity = %self.identity, error = %err, "lost connection to server");
            let _ = self.events.send(TransportEvent::ConnectionLost);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct PeerTransport {
    shared: Arc<Shared>,
    watcher: Option<JoinHandle<()>>,
}

impl PeerTransport {
    /// Connects, performs the presence handshake and the initial sync, then
    /// starts the watcher. Events arrive on the returned receiver.
    pub async fn connect(
        host: &str,
        port: u16,
        identity: impl Into<String>,
        store: Arc<dyn PeerStore>,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let identity = identity.into();
        let socket = connect_with_retry(host, port, &config).await?;
        let mut stream = FrameStream::new(socket);
        handshake(&mut stream, &identity, &config).await?;
        info!(%identity, "handshake complete");

        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            stream: Mutex::new(stream),
            running: AtomicBool::new(true),
            store,
            events,
            config,
        });
        let mut transport = Self {
            shared,
            watcher: None,
        };

        transport.known_users().await?;
        transport.contacts().await?;

        transport.watcher = Some(tokio::spawn(watch(Arc::clone(&transport.shared))));
        Ok((transport, receiver))
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Fire-and-forget: the server never answers a chat message.
    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        let frame = Frame::from(Request::message(&self.shared.identity, to, text));
        // Reject oversized text before it can poison the shared socket.
        encode(&frame)?;

        let written = {
            let mut stream = self.shared.stream.lock().await;
            stream.write_frame(&frame).await
        };
        if let Err(err) = written {
            self.shared.fail(&err);
            return Err(err);
        }

        self.shared.store.save_message(to, Direction::Outgoing, text);
        debug!(%to, "message sent");
        Ok(())
    }

    pub async fn add_contact(&self, contact: &str) -> Result<(), TransportError> {
        let response = self
            .exchange(Request::add_contact(&self.shared.identity, contact))
            .await?;
        expect_ok(response)?;
        self.shared.store.add_contact(contact);
        Ok(())
    }

    pub async fn remove_contact(&self, contact: &str) -> Result<(), TransportError> {
        let response = self
            .exchange(Request::remove_contact(&self.shared.identity, contact))
            .await?;
        expect_ok(response)?;
        self.shared.store.remove_contact(contact);
        Ok(())
    }

    /// Fetches the contact list and mirrors it into the peer store.
    pub async fn contacts(&self) -> Result<Vec<String>, TransportError> {
        let response = self
            .exchange(Request::get_contacts(&self.shared.identity))
            .await?;
        let contacts = expect_list(response)?;
        self.shared.store.replace_contacts(contacts.clone());
        Ok(contacts)
    }

    /// Fetches every user the server knows and mirrors them into the peer
    /// store.
    pub async fn known_users(&self) -> Result<Vec<String>, TransportError> {
        let response = self
            .exchange(Request::get_users(&self.shared.identity))
            .await?;
        let users = expect_list(response)?;
        self.shared.store.replace_known_users(users.clone());
        Ok(users)
    }

    /// Announces the exit and releases the socket. Safe to call after the
    /// connection was already lost.
    pub async fn shutdown(mut self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            let exit = Frame::from(Request::exit(&self.shared.identity));
            let mut stream = self.shared.stream.lock().await;
            if let Err(err) = stream.write_frame(&exit).await {
                debug!(error = %err, "failed to announce exit");
            }
        }

        sleep(self.shared.config.shutdown_grace).await;

        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
            let _ = watcher.await;
        }
        info!(identity = %self.shared.identity, "transport shut down");
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        self.ensure_running()?;
        let result = {
            let mut stream = self.shared.stream.lock().await;
            self.shared.round_trip(&mut stream, request).await
        };

        match result {
            Ok(Response::Error(text)) => Err(TransportError::Rejected(text)),
            Ok(response) => Ok(response),
            Err(err) => {
                self.shared.fail(&err);
                Err(err)
            }
        }
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(TransportError::Stopped)
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

async fn connect_with_retry(
    host: &str,
    port: u16,
    config: &TransportConfig,
) -> Result<TcpStream, TransportError> {
    let addr = format!("{host}:{port}");
    for attempt in 1..=config.connect_attempts {
        match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => {
                if let Err(err) = socket.set_nodelay(true) {
                    debug!(error = ?err, "failed to disable nagle");
                }
                info!(%addr, attempt, "connected");
                return Ok(socket);
            }
            Ok(Err(err)) => warn!(%addr, attempt, error = %err, "connection attempt failed"),
            Err(_) => warn!(%addr, attempt, "connection attempt timed out"),
        }
        if attempt < config.connect_attempts {
            sleep(config.retry_delay).await;
        }
    }

    Err(TransportError::Connect {
        addr,
        attempts: config.connect_attempts,
    })
}

async fn handshake(
    stream: &mut FrameStream<TcpStream>,
    identity: &str,
    config: &TransportConfig,
) -> Result<(), TransportError> {
    stream
        .write_frame(&Request::presence(identity).into())
        .await?;
    let frame = timeout(config.response_timeout, stream.read_frame())
        .await
        .map_err(|_| TransportError::Timeout)??;

    match frame {
        Frame::Response(Response::Ok) => Ok(()),
        Frame::Response(Response::Error(text)) => Err(TransportError::Rejected(text)),
        Frame::Response(other) => Err(TransportError::UnexpectedFrame(format!(
            "response {} to presence",
            other.code()
        ))),
        Frame::Request(request) => Err(TransportError::UnexpectedFrame(
            request.action().to_string(),
        )),
    }
}

async fn watch(shared: Arc<Shared>) {
    while shared.is_running() {
        sleep(shared.config.watch_interval).await;
        if !shared.is_running() {
            break;
        }

        let read = {
            let mut stream = shared.stream.lock().await;
            timeout(shared.config.read_timeout, stream.read_frame()).await
        };

        match read {
            Err(_) => {}
            Ok(Ok(Frame::Request(Request::Message {
                sender,
                destination,
                text,
                ..
            }))) => shared.receive(sender, destination, text),
            Ok(Ok(other)) => warn!(frame = ?other, "unexpected frame outside a request, ignoring"),
            Ok(Err(err)) => {
                shared.fail(&err);
                break;
            }
        }
    }
    debug!(identity = %shared.identity, "watcher stopped");
}

fn expect_ok(response: Response) -> Result<(), TransportError> {
    match response {
        Response::Ok => Ok(()),
        other => Err(TransportError::UnexpectedFrame(format!(
            "response {}, expected 200",
            other.code()
        ))),
    }
}

fn expect_list(response: Response) -> Result<Vec<String>, TransportError> {
    match response {
        Response::Accepted(list) => Ok(list),
        other => Err(TransportError::UnexpectedFrame(format!(
            "response {}, expected 202",
            other.code()
        ))),
    }
}
