//! Multi-client line relay over TCP.
//!
//! Clients send newline-delimited text and the server writes every received
//! line back to all connected clients, the sender included. Each module
//! focuses on a concrete responsibility:
//!
//! - [`listener`] binds the server socket, accepts connections, and spawns one
//!   task per client. It also drives graceful shutdown.
//! - [`registry`] is the shared membership of live sessions. One lock guards
//!   it and is held for the whole fan-out of a broadcast, so every client sees
//!   broadcasts in the same order.
//! - [`session`] runs a client's read loop and removes the client from the
//!   registry when its stream ends.
//! - [`line`] frames and unframes lines without interpreting their bytes.
//! - [`client`] connects to a server, hands received lines to a callback, and
//!   implements the terminal chat front end.
//! - [`cli`] parses the command-line interface for server and client modes.

pub mod cli;
pub mod client;
pub mod line;
pub mod listener;
pub mod registry;
pub mod session;
