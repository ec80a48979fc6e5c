//! Coordinator-routed text messaging over the JIM JSON protocol.
//!
//! One server process accepts TCP connections, authenticates each one with
//! a `presence` handshake and relays chat messages between live sessions.
//! Each module focuses on a concrete responsibility:
//!
//! - [`message`] defines the frames and the length-prefixed JSON codec.
//! - [`server`] multiplexes every connection from a single task.
//! - [`handler`] turns one request into a response and a side effect.
//! - [`registry`] binds identities to connections.
//! - [`observer`] logs session changes with the store's counters.
//! - [`router`] delivers queued chat messages to writable sessions.
//! - [`store`] holds accounts and contacts on the server and message
//!   history on the client.
//! - [`transport`] is the client side of the connection.
//! - [`cli`], [`config`], [`console`] and [`client`] make up the binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod handler;
pub mod message;
pub mod observer;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod transport;
