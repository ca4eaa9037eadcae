//! Server loop and connection lifecycle management.
//!
//! One control thread drives everything: it blocks in the multiplexer's
//! poll, then routes each readiness event to the accept path (listener
//! token), the read path, or the write path. Command handlers, queue
//! mutation, and shared-state mutation all happen on this thread, so
//! server-owned state needs no locks.
//!
//! ```text
//! poll -> { listener ready -> accept_pending
//!         , client ready   -> read -> codec -> dispatch -> outbox
//!                          -> write -> drain queue -> interest gate }
//! ```
//!
//! Every eviction path (explicit `!dc=`, zero-byte read, I/O error, queue
//! or frame overflow) converges on [`Server::disconnect`], which is
//! idempotent. Nothing a single connection does can take the loop down;
//! only a shutdown request stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Token, Waker};
use serde_json::Value;

use crate::codec::{self, Response};
use crate::command::{Action, CommandCtx, CommandFn, CommandTable, DefaultPolicy, Outbox};
use crate::config::ServerConfig;
use crate::connection::{ConnectionRegistry, Enqueue, Peer, ReadEvent, WriteEvent};
use crate::error::{NetError, Result};
use crate::poll::{Poller, Readiness, LISTENER, WAKER};

const EVENTS_CAPACITY: usize = 1024;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Graceful close requested through the protocol or a handler.
    Requested,
    /// Zero-byte read: the peer closed its end.
    PeerClosed,
    /// A fatal socket error.
    IoError,
    /// The bounded outbound queue overflowed.
    QueueOverflow,
    /// Undelimited inbound data exceeded the frame limit.
    FrameOverflow,
    /// Server shutdown teardown.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::IoError => "io error",
            DisconnectReason::QueueOverflow => "outbound queue overflow",
            DisconnectReason::FrameOverflow => "frame overflow",
            DisconnectReason::Shutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Application hooks the loop calls at lifecycle points.
///
/// Implemented by the application layer and composed into the server at
/// construction; the core never asks to be subclassed. Both hooks default
/// to no-ops.
pub trait ServerHooks<S>: Send {
    fn on_connect(&mut self, state: &mut S, peer: &Peer) {
        let _ = (state, peer);
    }

    fn on_disconnect(&mut self, state: &mut S, peer: &Peer, reason: DisconnectReason) {
        let _ = (state, peer, reason);
    }
}

/// Hook implementation that does nothing.
#[derive(Default, Clone)]
pub struct NoOpHooks;

impl<S> ServerHooks<S> for NoOpHooks {}

/// Thread-safe handle that stops a running server loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Clear the running flag and interrupt the in-flight poll.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::warn!("shutdown wake failed: {e}");
        }
    }
}

/// Readiness-multiplexed TCP command server.
///
/// Generic over the shared state `S` handed to command handlers and hooks.
pub struct Server<S> {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
    poller: Poller,
    registry: ConnectionRegistry,
    commands: CommandTable<S>,
    hooks: Box<dyn ServerHooks<S>>,
    state: S,
    running: Arc<AtomicBool>,
    scratch: Vec<u8>,
}

impl<S: 'static> Server<S> {
    /// Bind the listener and set up the watch set and built-in commands.
    ///
    /// The listener is bound with the platform's reuse-address option (set
    /// by mio before bind), so a restarted server can rebind immediately.
    pub fn new<H>(config: ServerConfig, state: S, hooks: H) -> Result<Self>
    where
        H: ServerHooks<S> + 'static,
    {
        let mut listener = TcpListener::bind(config.address)?;
        let local_addr = listener.local_addr()?;
        let poller = Poller::new(EVENTS_CAPACITY)?;
        poller.register(&mut listener, LISTENER, mio::Interest::READABLE)?;

        let registry = ConnectionRegistry::new(config.queue_capacity, config.max_frame_size);
        let mut commands = CommandTable::new(config.max_commands);
        register_builtins(&mut commands)?;

        let scratch = vec![0; config.buffer_size];
        Ok(Self {
            config,
            listener,
            local_addr,
            poller,
            registry,
            commands,
            hooks: Box::new(hooks),
            state,
            running: Arc::new(AtomicBool::new(true)),
            scratch,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Register an application command. Last registration under a name
    /// wins; fails once the table is at capacity.
    pub fn register_command<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: FnMut(&mut CommandCtx<'_, S>, Value) + Send + 'static,
    {
        self.commands.register(name, Box::new(handler))
    }

    /// Handle for stopping the loop from another thread or a signal
    /// handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: self.poller.waker(),
        }
    }

    /// Run the server loop until shutdown.
    ///
    /// Blocks the calling thread. On exit every connection is disconnected
    /// and the listener leaves the watch set.
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "{}: listening on {}",
            self.config.name,
            self.local_addr
        );

        while self.running.load(Ordering::SeqCst) {
            let events = self.poller.poll(self.config.poll_timeout)?;
            for event in events {
                match event.token {
                    WAKER => {} // shutdown wake, loop condition re-checked
                    LISTENER => {
                        if event.readable {
                            self.accept_pending();
                        }
                    }
                    token => self.service_connection(token, event),
                }
            }
        }

        self.teardown();
        log::info!("{}: stopped", self.config.name);
        Ok(())
    }

    /// Accept every pending connection, refusing those over the limit.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.registry.len() >= self.config.max_connections {
                        // refused at the boundary: close immediately, keep serving
                        log::warn!("{}: {}", self.config.name, NetError::ConnectionLimit(addr));
                        drop(stream);
                        continue;
                    }
                    match self.registry.admit(stream, addr, &self.poller) {
                        Ok(peer) => {
                            log::info!(
                                "{}: connection from {} (id {})",
                                self.config.name,
                                peer.addr,
                                peer.id.as_u64()
                            );
                            self.hooks.on_connect(&mut self.state, &peer);
                        }
                        Err(e) => {
                            log::error!("{}: failed to admit {addr}: {e}", self.config.name)
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("{}: accept error: {e}", self.config.name);
                    break;
                }
            }
        }
    }

    fn service_connection(&mut self, token: Token, event: Readiness) {
        if event.readable {
            self.handle_readable(token);
        }
        // the read path may have evicted the connection; write_ready on a
        // missing token is a no-op
        if event.writable {
            self.handle_writable(token);
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let mut scratch = std::mem::take(&mut self.scratch);
        let outcome = self.registry.read_ready(token, &mut scratch);
        self.scratch = scratch;

        match outcome {
            None => {}
            Some(ReadEvent::Lines(lines)) => {
                for line in lines {
                    self.handle_line(token, &line);
                    if !self.registry.contains(token) {
                        break;
                    }
                }
            }
            Some(ReadEvent::PeerClosed) => self.disconnect(token, DisconnectReason::PeerClosed),
            Some(ReadEvent::FrameOverflow) => {
                log::warn!(
                    "{}: frame limit exceeded, evicting {:?}",
                    self.config.name,
                    token
                );
                self.disconnect(token, DisconnectReason::FrameOverflow);
            }
            Some(ReadEvent::Fatal(e)) => {
                log::error!("{}: read error on {token:?}: {e}", self.config.name);
                self.disconnect(token, DisconnectReason::IoError);
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        match self.registry.write_ready(token, &self.poller) {
            None | Some(WriteEvent::Drained) | Some(WriteEvent::Pending) => {}
            Some(WriteEvent::FlushedAndClosing) => {
                self.disconnect(token, DisconnectReason::Requested)
            }
            Some(WriteEvent::Fatal(e)) => {
                log::error!("{}: write error on {token:?}: {e}", self.config.name);
                self.disconnect(token, DisconnectReason::IoError);
            }
        }
    }

    /// Route one decoded line: command dispatch or the default policy.
    fn handle_line(&mut self, token: Token, line: &str) {
        let Some(sender) = self.registry.peer(token) else {
            return;
        };

        match codec::parse_request(line) {
            Some(request) => {
                log::debug!(
                    "{}: `{}` from {}",
                    self.config.name,
                    request.command,
                    sender.addr
                );
                self.dispatch(sender, request.command, request.payload, line);
            }
            None => self.default_action(token, line),
        }
    }

    fn dispatch(&mut self, sender: Peer, command: String, payload: Value, raw: &str) {
        let token = sender.id.token();
        let mut outbox = Outbox::default();
        match self.commands.get_mut(&command) {
            Some(handler) => {
                let peers = self.registry.peers();
                let mut ctx = CommandCtx::new(&mut self.state, sender, &peers, &mut outbox);
                handler(&mut ctx, payload);
            }
            None => {
                // unknown command falls through to the default policy
                self.default_action(token, raw);
                return;
            }
        }
        self.apply_outbox(outbox);
    }

    fn default_action(&mut self, token: Token, line: &str) {
        match self.config.default_policy {
            DefaultPolicy::Echo => self.deliver(token, codec::encode_echo(line)),
            DefaultPolicy::Ignore => {
                log::debug!("{}: ignoring unhandled line from {token:?}", self.config.name)
            }
        }
    }

    /// Apply a handler's deferred replies and control actions.
    fn apply_outbox(&mut self, outbox: Outbox) {
        for (id, response) in outbox.replies {
            match codec::encode_response(&response) {
                Ok(frame) => self.deliver(id.token(), frame),
                // local protocol error: drop the reply, keep the connection
                Err(e) => log::error!("{}: dropping unencodable reply: {e}", self.config.name),
            }
        }
        for action in outbox.actions {
            match action {
                Action::Disconnect(id) => {
                    let token = id.token();
                    if self.registry.close_after_flush(token) {
                        self.disconnect(token, DisconnectReason::Requested);
                    }
                }
                Action::Shutdown => {
                    log::info!("{}: shutdown requested by handler", self.config.name);
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Enqueue an encoded frame, evicting on overflow or interest failure.
    fn deliver(&mut self, token: Token, frame: Vec<u8>) {
        match self.registry.enqueue(token, frame, &self.poller) {
            Ok(Enqueue::Queued) | Ok(Enqueue::Dropped) => {}
            Ok(Enqueue::Overflow) => {
                log::warn!(
                    "{}: outbound queue full, evicting {token:?}",
                    self.config.name
                );
                self.disconnect(token, DisconnectReason::QueueOverflow);
            }
            Err(e) => {
                log::error!("{}: interest update failed on {token:?}: {e}", self.config.name);
                self.disconnect(token, DisconnectReason::IoError);
            }
        }
    }

    /// Tear a connection down: hook, watch set, registry, socket.
    ///
    /// Idempotent; a token that already left the registry is a no-op.
    fn disconnect(&mut self, token: Token, reason: DisconnectReason) {
        let Some(conn) = self.registry.remove(token, &self.poller) else {
            return;
        };
        let peer = conn.peer();
        self.hooks.on_disconnect(&mut self.state, &peer, reason);
        log::info!(
            "{}: disconnected {} (id {}): {reason}",
            self.config.name,
            peer.addr,
            peer.id.as_u64()
        );
        // socket closes when `conn` drops
    }

    fn teardown(&mut self) {
        for token in self.registry.tokens() {
            self.disconnect(token, DisconnectReason::Shutdown);
        }
        if let Err(e) = self.poller.deregister(&mut self.listener) {
            log::warn!("{}: listener deregister failed: {e}", self.config.name);
        }
    }
}

fn register_builtins<S: 'static>(commands: &mut CommandTable<S>) -> Result<()> {
    commands.register("list", Box::new(builtin_list::<S>) as CommandFn<S>)?;
    commands.register("disconnect", Box::new(builtin_disconnect::<S>) as CommandFn<S>)?;
    commands.register("dc", Box::new(builtin_disconnect::<S>) as CommandFn<S>)?;
    Ok(())
}

/// `!list=` replies with every connected peer address.
fn builtin_list<S>(ctx: &mut CommandCtx<'_, S>, _payload: Value) {
    let peers: Vec<Value> = ctx
        .peers()
        .iter()
        .map(|p| Value::String(p.addr.to_string()))
        .collect();
    ctx.reply(Response::new("list", Value::Array(peers)));
}

/// `!dc=` / `!disconnect=` acknowledges, then closes once the ack flushes.
fn builtin_disconnect<S>(ctx: &mut CommandCtx<'_, S>, _payload: Value) {
    let sender = ctx.sender.id;
    ctx.reply(Response::new("disconnect", Value::Null));
    ctx.disconnect(sender);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn server_binds_ephemeral_port() {
        let config = ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .build();
        let server: Server<()> = Server::new(config, (), NoOpHooks).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn owned_state_types_are_accepted() {
        struct Stats {
            lines: usize,
        }
        let config = ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .build();
        let mut server = Server::new(config, Stats { lines: 0 }, NoOpHooks).unwrap();
        server
            .register_command("tally", |ctx, _| ctx.state.lines += 1)
            .unwrap();
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn builtins_fill_the_table() {
        let config = ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .max_commands(3)
            .build();
        let mut server: Server<()> = Server::new(config, (), NoOpHooks).unwrap();
        // table already holds list/disconnect/dc
        assert!(matches!(
            server.register_command("extra", |_, _| {}),
            Err(NetError::CommandTableFull(_))
        ));
    }
}
