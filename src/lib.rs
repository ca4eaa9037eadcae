//! # weft
//!
//! A readiness-multiplexed TCP command/relay server core built on [`mio`],
//! with no async runtime: one control thread blocks in the OS poller and
//! services every connection as sockets become readable or writable.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌───────────────┐    ┌──────────────────┐
//! │ Server run │───▶│    Poller     │───▶│ accept / client  │
//! │   loop     │    │ (mio::Poll)   │    │ readiness events │
//! └────────────┘    └───────────────┘    └────────┬─────────┘
//!                                                 ▼
//!                   ┌───────────────┐    ┌──────────────────┐
//!                   │ CommandTable  │◀───│  codec (lines,   │
//!                   │  + handlers   │    │  JSON envelopes) │
//!                   └──────┬────────┘    └──────────────────┘
//!                          ▼
//!                   ┌───────────────┐
//!                   │ ConnectionReg │  outbound queues gate the
//!                   │ istry + queues│  read / read+write interest
//!                   └───────────────┘
//! ```
//!
//! Handlers run on the loop thread and communicate only by queueing frames
//! onto connections' outbound queues; a connection's interest mask is
//! read+write exactly while its queue is non-empty, so idle connections
//! never cause write-ready wakeups.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::prelude::*;
//! use serde_json::{json, Value};
//!
//! fn main() -> weft::error::Result<()> {
//!     let config = ServerConfig::builder()
//!         .name("relay")
//!         .address("127.0.0.1:8000".parse().unwrap())
//!         .max_connections(64)
//!         .build();
//!
//!     let mut server = Server::new(config, (), NoOpHooks)?;
//!     server.register_command("ping", |ctx, _payload: Value| {
//!         ctx.reply(Response::new("pong", json!(null)));
//!     })?;
//!     server.run() // blocks until shutdown
//! }
//! ```
//!
//! The wire protocol is newline-framed UTF-8: clients send `!command=payload`
//! lines (payload is JSON), servers answer with `{"method": ..., "params": ...}`
//! envelopes. Raw text lines hit the configurable default policy (echo by
//! default). See [`codec`] for the details.

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod poll;
pub mod server;

pub use client::{Client, ClientEvent};
pub use codec::{Request, Response};
pub use command::{CommandCtx, DefaultPolicy};
pub use config::ServerConfig;
pub use connection::{ConnectionId, Peer};
pub use error::{NetError, Result};
pub use server::{DisconnectReason, NoOpHooks, Server, ServerHooks, ShutdownHandle};

/// Re-exports of the types most programs need.
pub mod prelude {
    pub use crate::codec::{Request, Response};
    pub use crate::command::{CommandCtx, DefaultPolicy};
    pub use crate::config::ServerConfig;
    pub use crate::connection::{ConnectionId, Peer};
    pub use crate::server::{DisconnectReason, NoOpHooks, Server, ServerHooks};
}
