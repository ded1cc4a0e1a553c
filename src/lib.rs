//! wstunnel
//!
//! Tunnels TCP connections over WebSocket. A client endpoint listens on local
//! ports and forwards every accepted connection to a WebSocket URL; a server
//! endpoint accepts WebSockets and forwards each one to the TCP service mapped
//! on its request path. Data can be inspected or rewritten on the way by
//! filters installed per mapping.

pub mod address;
pub mod bridge;
pub mod client;
pub mod config;
pub mod dump;
pub mod error;
pub mod factory;
pub mod filter;
pub mod listener;
pub mod security;
pub mod server;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use address::{Address, join_url, parse_ws_url};
pub use bridge::{BUFFER_SIZE, BridgeEvent, BridgeReport, BridgeRole, BridgeState, EventSink};
pub use client::{ClientBridge, ClientProxy, ClientRegistry, WsOptions};
pub use config::{Config, EndpointKind, load_config};
pub use dump::{DumpFilter, hex_dump};
pub use error::{FailureKind, Result, TunnelError};
pub use factory::{Endpoint, FilterFactory, create_endpoint};
pub use filter::{Filter, FilterChain, FilterError, FilterSnapshot};
pub use security::{PeerAllowlist, forwarded_client_ip};
pub use server::{ServerBridge, ServerProxy, ServerRegistry};
