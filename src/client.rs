//! Blocking client counterpart to the server's line protocol.
//!
//! Writes happen on the caller's thread; a single dedicated reader thread
//! blocks on the socket, decodes frames, and hands them over an mpsc
//! channel. The reader shares nothing with the writer except a `connected`
//! boolean behind a mutex, flipped once when the stream ends. This is the
//! one place in the crate a second thread and a lock are warranted.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;

use crate::codec::{self, Response};
use crate::error::Result;

/// Something the reader thread pulled off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A structured server response.
    Message(Response),
    /// A plain text line (e.g. a default-policy echo).
    Text(String),
    /// The server closed the connection; no further events follow.
    Closed,
}

pub struct Client {
    stream: TcpStream,
    connected: Arc<Mutex<bool>>,
    reader: Option<JoinHandle<()>>,
    events: Receiver<ClientEvent>,
}

impl Client {
    /// Connect and spawn the reader thread.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let connected = Arc::new(Mutex::new(true));
        let (tx, rx) = channel();

        let reader_stream = stream.try_clone()?;
        let flag = Arc::clone(&connected);
        let reader = thread::Builder::new()
            .name("weft-client-reader".into())
            .spawn(move || read_loop(reader_stream, tx, flag))?;

        Ok(Self {
            stream,
            connected,
            reader: Some(reader),
            events: rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.lock().map(|guard| *guard).unwrap_or(false)
    }

    /// Send a framed command line.
    pub fn send_request(&mut self, command: &str, payload: &Value) -> Result<()> {
        let frame = codec::encode_request(command, payload)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Send a raw text line (exercises the server's default policy).
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.stream.write_all(text.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    /// Wait up to `timeout` for the next event from the reader thread.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Close the socket and join the reader thread. Idempotent.
    pub fn disconnect(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(stream: TcpStream, tx: Sender<ClientEvent>, connected: Arc<Mutex<bool>>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = line.trim_end_matches(|c| c == '\r' || c == '\n');
                let event = match serde_json::from_str::<Response>(text) {
                    Ok(response) => ClientEvent::Message(response),
                    Err(_) => ClientEvent::Text(text.to_string()),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    }
    if let Ok(mut guard) = connected.lock() {
        *guard = false;
    }
    let _ = tx.send(ClientEvent::Closed);
}
