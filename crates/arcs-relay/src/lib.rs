//! arcs-relay: the relay server for ARCS remote control sessions.
//!
//! The relay authenticates devices, brokers sessions, fans encoded video
//! frames out to controllers, routes control commands back to devices, and
//! records an audit trail. It never decodes video and never inspects
//! payload bytes.

pub mod command;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod server;
pub mod stream;

pub use config::RelayConfig;
pub use server::{RelayServer, RelayState};
pub use stream::StreamRouter;
