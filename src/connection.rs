//! Connection registry and per-connection outbound queue gating.
//!
//! Each accepted socket becomes a [`Connection`]: a unique id, the
//! non-blocking stream, a reassembly buffer for partial reads, and a FIFO
//! queue of encoded outbound frames. The registry owns every connection
//! exclusively; queues are mutated only through [`ConnectionRegistry::enqueue`]
//! and the drain in [`ConnectionRegistry::write_ready`].
//!
//! Interest gating is the core resource mechanism: a connection is
//! registered read+write exactly while its queue is non-empty. The first
//! enqueue escalates the interest mask; draining the last byte de-escalates
//! it back to read-only, so an idle connection never produces write-ready
//! wakeups.
//!
//! Lifecycle per connection: `Accepted -> ReadOnly <-> ReadWrite -> Closed`.
//! `Closed` is terminal; a reconnecting peer gets a fresh id.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::codec::RecvBuffer;
use crate::error::Result;
use crate::poll::{Poller, FIRST_CONNECTION};

/// Unique identifier for a connection, never reused within a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }
}

/// Identity of a connected peer as seen by handlers and hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: ConnectionId,
    pub addr: SocketAddr,
}

/// Outcome of feeding a readable event into a connection.
#[derive(Debug)]
pub enum ReadEvent {
    /// Complete frames decoded from this wake, possibly none.
    Lines(Vec<String>),
    /// Zero-byte read: normal disconnect path.
    PeerClosed,
    /// Undelimited input exceeded the frame limit.
    FrameOverflow,
    /// The socket is beyond recovery.
    Fatal(io::Error),
}

/// Outcome of draining a connection's outbound queue.
#[derive(Debug)]
pub enum WriteEvent {
    /// Queue emptied; interest dropped back to read-only.
    Drained,
    /// Socket filled up mid-queue; write interest stays on.
    Pending,
    /// Queue emptied and the connection was marked for close.
    FlushedAndClosing,
    /// A send failed mid-message.
    Fatal(io::Error),
}

/// Outcome of appending a frame to a connection's queue.
#[derive(Debug)]
pub enum Enqueue {
    Queued,
    /// The connection is gone or already closing; the frame was dropped.
    Dropped,
    /// The bounded queue is full: the peer is not keeping up.
    Overflow,
}

pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    interest: Interest,
    recv: RecvBuffer,
    outbound: VecDeque<Vec<u8>>,
    write_cursor: usize,
    closing: bool,
}

impl Connection {
    fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr, max_frame: usize) -> Self {
        Self {
            id,
            stream,
            peer_addr,
            interest: Interest::READABLE,
            recv: RecvBuffer::new(max_frame),
            outbound: VecDeque::new(),
            write_cursor: 0,
            closing: false,
        }
    }

    pub fn peer(&self) -> Peer {
        Peer {
            id: self.id,
            addr: self.peer_addr,
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn queue_len(&self) -> usize {
        self.outbound.len()
    }

    fn fill(&mut self, scratch: &mut [u8]) -> ReadEvent {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return ReadEvent::PeerClosed,
                Ok(n) => {
                    if !self.recv.push(&scratch[..n]) {
                        return ReadEvent::FrameOverflow;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadEvent::Fatal(e),
            }
        }
        ReadEvent::Lines(self.recv.drain_lines())
    }

    /// Write queued frames until the queue drains or the socket blocks.
    ///
    /// A frame may need several sends; `write_cursor` tracks how much of the
    /// head frame is already on the wire so a WouldBlock mid-message resumes
    /// where it left off. A failed send mid-message is fatal for the
    /// connection.
    fn flush(&mut self) -> WriteEvent {
        loop {
            let head_len = match self.outbound.front() {
                Some(frame) => frame.len(),
                None => break,
            };
            let written = {
                let frame = &self.outbound[0];
                match self.stream.write(&frame[self.write_cursor..]) {
                    Ok(0) => {
                        return WriteEvent::Fatal(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "peer stopped accepting bytes mid-message",
                        ))
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return WriteEvent::Pending
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return WriteEvent::Fatal(e),
                }
            };
            self.write_cursor += written;
            if self.write_cursor == head_len {
                self.outbound.pop_front();
                self.write_cursor = 0;
            }
        }

        if self.closing {
            WriteEvent::FlushedAndClosing
        } else {
            WriteEvent::Drained
        }
    }
}

/// Exclusive owner of all live connections, keyed by poll token.
pub struct ConnectionRegistry {
    connections: HashMap<Token, Connection>,
    next_id: u64,
    queue_capacity: usize,
    max_frame: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, max_frame: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            queue_capacity,
            max_frame,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains_key(&token)
    }

    pub fn peer(&self, token: Token) -> Option<Peer> {
        self.connections.get(&token).map(Connection::peer)
    }

    /// Snapshot of every connected peer, for `list`-style commands.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.connections.values().map(Connection::peer).collect();
        peers.sort_by_key(|p| p.id.as_u64());
        peers
    }

    #[cfg(test)]
    pub(crate) fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(&token)
    }

    /// Admit an accepted stream: allocate an identity and register it with
    /// the multiplexer for read-only interest.
    pub fn admit(&mut self, stream: TcpStream, addr: SocketAddr, poller: &Poller) -> Result<Peer> {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;

        let mut conn = Connection::new(id, stream, addr, self.max_frame);
        poller.register(&mut conn.stream, id.token(), conn.interest)?;
        let peer = conn.peer();
        self.connections.insert(id.token(), conn);
        Ok(peer)
    }

    /// Remove a connection from the registry and the watch set.
    ///
    /// Idempotent: a token that is already gone yields `None`. The socket
    /// closes when the returned `Connection` drops.
    pub fn remove(&mut self, token: Token, poller: &Poller) -> Option<Connection> {
        let mut conn = self.connections.remove(&token)?;
        let _ = poller.deregister(&mut conn.stream);
        Some(conn)
    }

    /// Append an encoded frame to a connection's outbound queue.
    ///
    /// The first frame on an empty queue escalates interest to read+write.
    pub fn enqueue(&mut self, token: Token, frame: Vec<u8>, poller: &Poller) -> Result<Enqueue> {
        let conn = match self.connections.get_mut(&token) {
            Some(conn) => conn,
            None => return Ok(Enqueue::Dropped),
        };
        if conn.closing {
            return Ok(Enqueue::Dropped);
        }
        if conn.outbound.len() >= self.queue_capacity {
            return Ok(Enqueue::Overflow);
        }

        let was_empty = conn.outbound.is_empty();
        conn.outbound.push_back(frame);
        if was_empty {
            conn.interest = Interest::READABLE | Interest::WRITABLE;
            poller.reregister(&mut conn.stream, token, conn.interest)?;
        }
        Ok(Enqueue::Queued)
    }

    /// Drive a readable event: read until WouldBlock and decode frames.
    pub fn read_ready(&mut self, token: Token, scratch: &mut [u8]) -> Option<ReadEvent> {
        let conn = self.connections.get_mut(&token)?;
        Some(conn.fill(scratch))
    }

    /// Drive a writable event: drain the queue, de-escalating interest to
    /// read-only once it empties.
    pub fn write_ready(&mut self, token: Token, poller: &Poller) -> Option<WriteEvent> {
        let conn = self.connections.get_mut(&token)?;
        let event = conn.flush();
        if matches!(event, WriteEvent::Drained | WriteEvent::FlushedAndClosing) {
            conn.interest = Interest::READABLE;
            if let Err(e) = poller.reregister(&mut conn.stream, token, conn.interest) {
                return Some(WriteEvent::Fatal(io::Error::other(e.to_string())));
            }
        }
        Some(event)
    }

    /// Mark a connection to close once its queue drains.
    ///
    /// Returns `true` when the queue is already empty and the caller should
    /// disconnect immediately.
    pub fn close_after_flush(&mut self, token: Token) -> bool {
        match self.connections.get_mut(&token) {
            Some(conn) => {
                conn.closing = true;
                conn.outbound.is_empty()
            }
            None => false,
        }
    }

    /// Drain every token, for shutdown teardown.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::time::Duration;

    // Build a registered connection backed by a real loopback socket pair.
    fn socket_pair(
        registry: &mut ConnectionRegistry,
        poller: &Poller,
    ) -> (Token, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        let admitted = registry.admit(stream, addr, poller).unwrap();
        (admitted.id.token(), peer)
    }

    #[test]
    fn interest_is_read_write_iff_queue_nonempty() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (token, peer) = socket_pair(&mut registry, &poller);

        assert!(!registry.get(token).unwrap().interest().is_writable());

        registry
            .enqueue(token, b"one\n".to_vec(), &poller)
            .unwrap();
        registry
            .enqueue(token, b"two\n".to_vec(), &poller)
            .unwrap();
        let conn = registry.get(token).unwrap();
        assert!(conn.interest().is_writable());
        assert_eq!(conn.queue_len(), 2);

        match registry.write_ready(token, &poller).unwrap() {
            WriteEvent::Drained => {}
            other => panic!("expected Drained, got {other:?}"),
        }
        let conn = registry.get(token).unwrap();
        assert!(!conn.interest().is_writable());
        assert_eq!(conn.queue_len(), 0);
        drop(peer);
    }

    #[test]
    fn frames_drain_in_fifo_order() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (token, mut peer) = socket_pair(&mut registry, &poller);

        for frame in [b"first\n".to_vec(), b"second\n".to_vec(), b"third\n".to_vec()] {
            registry.enqueue(token, frame, &poller).unwrap();
        }
        assert!(matches!(
            registry.write_ready(token, &poller).unwrap(),
            WriteEvent::Drained
        ));

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = String::new();
        let mut buf = [0u8; 64];
        while received.len() < "first\nsecond\nthird\n".len() {
            let n = peer.read(&mut buf).unwrap();
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(received, "first\nsecond\nthird\n");
    }

    #[test]
    fn bounded_queue_reports_overflow() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(1, 1024);
        let (token, _peer) = socket_pair(&mut registry, &poller);

        assert!(matches!(
            registry.enqueue(token, b"a\n".to_vec(), &poller).unwrap(),
            Enqueue::Queued
        ));
        assert!(matches!(
            registry.enqueue(token, b"b\n".to_vec(), &poller).unwrap(),
            Enqueue::Overflow
        ));
    }

    #[test]
    fn close_after_flush_is_immediate_on_empty_queue() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (token, _peer) = socket_pair(&mut registry, &poller);

        assert!(registry.close_after_flush(token));
        assert!(registry.remove(token, &poller).is_some());
        // removing again is a no-op
        assert!(registry.remove(token, &poller).is_none());
    }

    #[test]
    fn close_after_flush_waits_for_drain() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (token, _peer) = socket_pair(&mut registry, &poller);

        registry
            .enqueue(token, b"bye\n".to_vec(), &poller)
            .unwrap();
        assert!(!registry.close_after_flush(token));
        assert!(matches!(
            registry.write_ready(token, &poller).unwrap(),
            WriteEvent::FlushedAndClosing
        ));
    }

    #[test]
    fn enqueue_after_closing_is_dropped() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (token, _peer) = socket_pair(&mut registry, &poller);

        registry
            .enqueue(token, b"bye\n".to_vec(), &poller)
            .unwrap();
        registry.close_after_flush(token);
        assert!(matches!(
            registry.enqueue(token, b"late\n".to_vec(), &poller).unwrap(),
            Enqueue::Dropped
        ));
    }

    #[test]
    fn peers_snapshot_tracks_registry() {
        let poller = Poller::new(64).unwrap();
        let mut registry = ConnectionRegistry::new(16, 1024);
        let (a, _pa) = socket_pair(&mut registry, &poller);
        let (_b, _pb) = socket_pair(&mut registry, &poller);

        assert_eq!(registry.peers().len(), 2);
        registry.remove(a, &poller);
        assert_eq!(registry.peers().len(), 1);
    }
}
