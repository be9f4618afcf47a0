//! Local MCP session gateway.
//!
//! Clients connect over loopback TCP and speak newline-delimited JSON-RPC.
//! For every session the gateway spawns a dedicated tool-server subprocess,
//! injects credentials from the encrypted keystore into its environment,
//! gates requests behind the MCP initialize handshake, and enforces a
//! layered authorization model (disabled tools, per-user allowlists,
//! permission categories) before forwarding `tools/call` requests.

pub mod config;
pub mod error;
pub mod gateway;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod supervisor;

mod proc;

pub use error::{GatewayError, Result};
