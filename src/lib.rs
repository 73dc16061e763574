//! ctrlplane library
//!
//! Runtime for a long-lived, bidirectional control channel between agents
//! and a controller:
//! - Length-prefixed JSON framing and the message catalogue ([`transport`])
//! - Request/response correlation over one stream ([`channel`])
//! - Concurrent task execution with timeouts and limits ([`runner`])
//! - Controller-side sessions, one per agent identity ([`registry`])
//! - Agent-side reconnecting client ([`client`])

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod runner;
pub mod server;
pub(crate) mod sync;
pub mod transport;
