//! Best-effort routing of chat messages to live sessions.
//!
//! Messages wait in a FIFO queue until their destination's connection is
//! writable. Delivery is at-most-once: a message is discarded after one
//! send attempt, and messages for identities without a session are dropped.

use std::{
    collections::{HashSet, VecDeque},
    io,
};

use tracing::{debug, info, warn};

use crate::{
    message::{Frame, Request},
    registry::{ConnId, SessionRegistry},
};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub sender: String,
    pub destination: String,
    pub text: String,
    pub time: f64,
}

impl PendingMessage {
    pub fn to_frame(&self) -> Frame {
        Frame::Request(Request::Message {
            sender: self.sender.clone(),
            destination: self.destination.clone(),
            time: self.time,
            text: self.text.clone(),
        })
    }
}

/// The write side of the connections the router delivers to.
pub trait Outbox {
    /// Whether `conn` can take a frame right now without blocking.
    fn is_writable(&self, conn: ConnId) -> bool;
    fn deliver(&mut self, conn: ConnId, frame: &Frame) -> io::Result<()>;
}

/// What one [`Router::flush`] did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub dropped: usize,
    pub deferred: usize,
    /// Connections whose write failed; the caller must deregister them.
    pub failed: Vec<ConnId>,
}

#[derive(Debug, Default)]
pub struct Router {
    queue: VecDeque<PendingMessage>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: PendingMessage) {
        self.queue.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Attempts every queued message once, keeping only those whose
    /// destination is live but not currently writable.
    pub fn flush<O: Outbox>(&mut self, registry: &SessionRegistry, outbox: &mut O) -> FlushReport {
        let mut report = FlushReport::default();
        let mut failed = HashSet::new();
        let mut deferred = VecDeque::new();

        while let Some(message) = self.queue.pop_front() {
            let Some(conn) = registry
                .conn_of(&message.destination)
                .filter(|conn| !failed.contains(conn))
            else {
                warn!(
                    from = %message.sender,
                    to = %message.destination,
                    "destination has no live session, dropping message"
                );
                report.dropped += 1;
                continue;
            };

            if !outbox.is_writable(conn) {
                debug!(to = %message.destination, "destination not writable, deferring");
                deferred.push_back(message);
                continue;
            }

            match outbox.deliver(conn, &message.to_frame()) {
                Ok(()) => {
                    info!(from = %message.sender, to = %message.destination, "message delivered");
                    report.delivered += 1;
                }
                Err(error) => {
                    warn!(
                        to = %message.destination,
                        ?error,
                        "delivery failed, dropping message and session"
                    );
                    failed.insert(conn);
                    report.failed.push(conn);
                    report.dropped += 1;
                }
            }
        }

        report.deferred = deferred.len();
        self.queue = deferred;
        report
    }
}
