//! Thin launcher: bind the configured address and run until killed.

use std::net::SocketAddr;

use weft::{NetError, NoOpHooks, Server, ServerConfig};

fn main() -> weft::Result<()> {
    env_logger::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string())
        .parse()
        .map_err(|e| NetError::Config(format!("bad listen address: {e}")))?;

    let config = ServerConfig::builder().address(addr).build();
    let mut server: Server<()> = Server::new(config, (), NoOpHooks)?;
    server.run()
}
