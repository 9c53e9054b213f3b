//! Relay transport for browser-driven agents.
//!
//! Provides:
//! - Wire protocol shared by browsers, the relay and handlers
//! - Relay server (feature: server)
//! - Relay client and relay-backed agent provider (feature: client)

pub mod config;
pub mod error;
pub mod protocol;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod provider;

#[cfg(feature = "client")]
pub use client::{RelayClient, SessionEvent, SessionSubscription};
pub use config::{RelayClientConfig, RelayServerConfig};
pub use error::RelayError;
pub use protocol::{BrowserMessage, HandlerCommand, HandlerMessage, HandlerMethod, RelayMessage};
#[cfg(feature = "client")]
pub use provider::RelayAgentProvider;
#[cfg(feature = "server")]
pub use server::{AgentHandler, HandlerEvent, HandlerEventStream, RelayServer};
