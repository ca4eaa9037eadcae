use std::net::SocketAddr;
use std::time::Duration;

use crate::command::DefaultPolicy;

/// Configuration for a [`Server`](crate::server::Server).
///
/// Every knob the loop consults lives here, owned per instance; nothing is
/// shared at the type level. Use `ServerConfig::builder()` for ergonomic
/// construction.
///
/// ## Resource limits
///
/// - `max_connections`: accepts past this are refused and closed.
/// - `max_commands`: registrations past this are rejected.
/// - `queue_capacity`: per-connection bound on queued outbound frames; a
///   peer that falls this far behind is evicted.
/// - `max_frame_size`: bound on undelimited inbound bytes before eviction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in log lines, handy when several servers share a process.
    pub name: String,
    /// Address to bind to.
    pub address: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum registered commands.
    pub max_commands: usize,
    /// Size of the scratch read buffer.
    pub buffer_size: usize,
    /// Per-connection outbound queue bound, in frames.
    pub queue_capacity: usize,
    /// Largest tolerated frame, in bytes.
    pub max_frame_size: usize,
    /// Poll timeout; also bounds shutdown latency when no waker fires.
    pub poll_timeout: Option<Duration>,
    /// Policy for raw text lines and unknown commands.
    pub default_policy: DefaultPolicy,
}

impl ServerConfig {
    /// Create a new builder for `ServerConfig`.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "weft".to_string(),
            address: "127.0.0.1:8000".parse().expect("static default address"),
            max_connections: 1024,
            max_commands: 255,
            buffer_size: 1024,
            queue_capacity: 256,
            max_frame_size: 64 * 1024,
            poll_timeout: Some(Duration::from_millis(150)),
            default_policy: DefaultPolicy::Echo,
        }
    }
}

/// Builder for [`ServerConfig`]. Unset fields fall back to the defaults
/// from `ServerConfig::default()`.
#[derive(Default)]
pub struct ServerConfigBuilder {
    name: Option<String>,
    address: Option<SocketAddr>,
    max_connections: Option<usize>,
    max_commands: Option<usize>,
    buffer_size: Option<usize>,
    queue_capacity: Option<usize>,
    max_frame_size: Option<usize>,
    poll_timeout: Option<Option<Duration>>,
    default_policy: Option<DefaultPolicy>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn max_commands(mut self, max: usize) -> Self {
        self.max_commands = Some(max);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn queue_capacity(mut self, frames: usize) -> Self {
        self.queue_capacity = Some(frames);
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = Some(bytes);
        self
    }

    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn default_policy(mut self, policy: DefaultPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            name: self.name.unwrap_or(default.name),
            address: self.address.unwrap_or(default.address),
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            max_commands: self.max_commands.unwrap_or(default.max_commands),
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size),
            queue_capacity: self.queue_capacity.unwrap_or(default.queue_capacity),
            max_frame_size: self.max_frame_size.unwrap_or(default.max_frame_size),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            default_policy: self.default_policy.unwrap_or(default.default_policy),
        }
    }
}
