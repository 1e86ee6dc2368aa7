//! TCP transport adapters: the bundled server and client.

pub mod client;
pub mod server;

pub use client::{connect, connect_with_auth, handshake_over, Credentials};
pub use server::{JstpServer, ServerConfig, ServerEvent, ServerHandle};
