#![forbid(unsafe_code)]

//! Proxy link between two pciemu device instances.
//!
//! A link owns one TCP connection and alternates between answering requests the peer sends
//! ("handle") and sending the requests its device queued ("issue"). See [`Session`] for the
//! per-request exchanges and [`serve`] for the connection loop.

mod config;
mod error;
mod link;
mod spawn;

pub use config::{LinkConfig, LinkRole, DEFAULT_HOST, DEFAULT_POLL_INTERVAL, DEFAULT_PORT};
pub use error::{ConfigError, ProxyError};
pub use link::{serve, Flow, LinkContext, LinkHooks, LinkOutcome, Session};
pub use spawn::{spawn, spawn_client, spawn_server, LinkHandle};
