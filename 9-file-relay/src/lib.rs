//! WebSocket relay that passes files between two online users.
//!
//! Clients connect to `/ws`, claim a username and receive the list of other
//! online users whenever it changes. A sender announces a file with a
//! `file-start` control message, streams it as binary frames and finishes with
//! `file-end`; the relay forwards each piece to the named recipient without
//! storing anything.
//!
//! - [`registry`] maps usernames to live connections.
//! - [`peer`] is the write side of a connection: a queue drained by one writer
//!   task, so concurrent relays never interleave frames.
//! - [`broadcast`] pushes the online roster to every connection.
//! - [`session`] admits a connection, runs its read loop and cleans up.
//! - [`router`] forwards control messages and file chunks between sessions.
//! - [`message`] holds the JSON wire types.
//! - [`server`] is the axum listener; [`cli`] and [`config`] configure it.
//! - [`client`] implements the `send` and `receive` commands.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod message;
pub mod peer;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
