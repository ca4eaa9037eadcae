//! Command dispatch: name -> handler table plus the context handlers run in.
//!
//! Handlers execute on the server loop thread and never touch sockets.
//! Anything a handler wants delivered goes through the [`CommandCtx`] into
//! an outbox of replies and control actions, which the loop applies after
//! the handler returns. That keeps exactly one writer per socket and makes
//! disconnect/shutdown from inside a handler safe (deferred).
//!
//! Registration is last-write-wins: registering a name twice silently
//! replaces the first handler. Names are matched case-insensitively by
//! normalizing to ASCII lowercase on both sides.

use std::collections::HashMap;

use serde_json::Value;

use crate::codec::Response;
use crate::connection::{ConnectionId, Peer};
use crate::error::{NetError, Result};

/// What to do with raw text lines and unrecognized commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    /// Reply `echo: <line>` to the sender.
    Echo,
    /// Drop the line, log at debug.
    Ignore,
}

/// A registered command handler.
///
/// `Send` so a server can be moved onto its own thread.
pub type CommandFn<S> = Box<dyn FnMut(&mut CommandCtx<'_, S>, Value) + Send>;

/// Deferred effects collected while a handler runs.
#[derive(Default)]
pub(crate) struct Outbox {
    pub(crate) replies: Vec<(ConnectionId, Response)>,
    pub(crate) actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Action {
    Disconnect(ConnectionId),
    Shutdown,
}

/// Everything a command handler may see and do.
pub struct CommandCtx<'a, S> {
    /// Shared server state, mutated only from the loop thread.
    pub state: &'a mut S,
    /// The connection that issued the command.
    pub sender: Peer,
    peers: &'a [Peer],
    outbox: &'a mut Outbox,
}

impl<'a, S> CommandCtx<'a, S> {
    pub(crate) fn new(
        state: &'a mut S,
        sender: Peer,
        peers: &'a [Peer],
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            state,
            sender,
            peers,
            outbox,
        }
    }

    /// Every currently connected peer, the sender included.
    pub fn peers(&self) -> &[Peer] {
        self.peers
    }

    /// Queue a response to the sender.
    pub fn reply(&mut self, response: Response) {
        let id = self.sender.id;
        self.outbox.replies.push((id, response));
    }

    /// Queue a response to a specific connection.
    pub fn send_to(&mut self, id: ConnectionId, response: Response) {
        self.outbox.replies.push((id, response));
    }

    /// Queue a response to every peer except the sender (relay pattern).
    pub fn broadcast(&mut self, response: Response) {
        let sender = self.sender.id;
        for peer in self.peers.iter().filter(|p| p.id != sender) {
            self.outbox.replies.push((peer.id, response.clone()));
        }
    }

    /// Gracefully disconnect a connection once its queued replies flush.
    pub fn disconnect(&mut self, id: ConnectionId) {
        self.outbox.actions.push(Action::Disconnect(id));
    }

    /// Request a cooperative server shutdown after this poll cycle.
    pub fn shutdown(&mut self) {
        self.outbox.actions.push(Action::Shutdown);
    }
}

/// Capacity-bounded mapping from command name to handler.
pub struct CommandTable<S> {
    handlers: HashMap<String, CommandFn<S>>,
    capacity: usize,
}

impl<S> CommandTable<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register a handler under a (lowercased) name.
    ///
    /// Replacing an existing name does not count against capacity; a new
    /// name is refused once the table is full.
    pub fn register(&mut self, name: &str, handler: CommandFn<S>) -> Result<()> {
        let name = name.to_ascii_lowercase();
        if !self.handlers.contains_key(&name) && self.handlers.len() >= self.capacity {
            return Err(NetError::CommandTableFull(name));
        }
        if self.handlers.insert(name.clone(), handler).is_some() {
            log::debug!("command `{name}` re-registered, previous handler replaced");
        }
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CommandFn<S>> {
        self.handlers.get_mut(&name.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use serde_json::json;
    use std::net::SocketAddr;

    fn peer(id: u64) -> Peer {
        let addr: SocketAddr = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
        Peer {
            id: ConnectionId::new(id),
            addr,
        }
    }

    fn run_handler(table: &mut CommandTable<u32>, name: &str, payload: Value) -> (u32, Outbox) {
        let mut state = 0u32;
        let mut outbox = Outbox::default();
        let peers = [peer(2), peer(3)];
        let handler = table.get_mut(name).expect("handler registered");
        let mut ctx = CommandCtx::new(&mut state, peers[0].clone(), &peers, &mut outbox);
        handler(&mut ctx, payload);
        (state, outbox)
    }

    #[test]
    fn last_registration_wins() {
        let mut table: CommandTable<u32> = CommandTable::new(8);
        table
            .register("ping", Box::new(|ctx, _| *ctx.state = 1))
            .unwrap();
        table
            .register("ping", Box::new(|ctx, _| *ctx.state = 2))
            .unwrap();
        assert_eq!(table.len(), 1);

        let (state, _) = run_handler(&mut table, "ping", Value::Null);
        assert_eq!(state, 2);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut table: CommandTable<u32> = CommandTable::new(8);
        table
            .register("Move", Box::new(|ctx, _| *ctx.state = 7))
            .unwrap();
        let (state, _) = run_handler(&mut table, "MOVE", Value::Null);
        assert_eq!(state, 7);
    }

    #[test]
    fn full_table_refuses_new_names_but_allows_replacement() {
        let mut table: CommandTable<u32> = CommandTable::new(1);
        table.register("a", Box::new(|_, _| {})).unwrap();
        assert!(matches!(
            table.register("b", Box::new(|_, _| {})),
            Err(NetError::CommandTableFull(_))
        ));
        // replacing the existing name still works
        table.register("a", Box::new(|_, _| {})).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn broadcast_skips_the_sender() {
        let mut table: CommandTable<u32> = CommandTable::new(8);
        table
            .register(
                "relay",
                Box::new(|ctx, payload| {
                    ctx.broadcast(Response::new("relay", payload));
                }),
            )
            .unwrap();

        let (_, outbox) = run_handler(&mut table, "relay", json!([1, 2]));
        assert_eq!(outbox.replies.len(), 1);
        assert_eq!(outbox.replies[0].0, ConnectionId::new(3));
    }

    #[test]
    fn reply_targets_the_sender() {
        let mut table: CommandTable<u32> = CommandTable::new(8);
        table
            .register(
                "ping",
                Box::new(|ctx, _| ctx.reply(Response::new("pong", Value::Null))),
            )
            .unwrap();
        let (_, outbox) = run_handler(&mut table, "ping", Value::Null);
        assert_eq!(outbox.replies.len(), 1);
        assert_eq!(outbox.replies[0].0, ConnectionId::new(2));
        assert_eq!(outbox.replies[0].1.method, "pong");
    }
}
