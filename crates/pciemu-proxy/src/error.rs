use std::io;

use pciemu_dma::GateError;
use pciemu_proxy_protocol::{DecodeError, ProxyRequest};
use thiserror::Error;

/// Link failures. Every variant ends the connection it occurred on.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("expected {expected:?} from peer, got {got:?}")]
    UnexpectedReply {
        expected: ProxyRequest,
        got: ProxyRequest,
    },

    #[error("peer announced a {len} byte payload; the device window holds {max}")]
    PayloadTooLarge { len: u64, max: u64 },

    #[error("failed to allocate a {len} byte staging buffer")]
    Allocation { len: usize },

    #[error("sync gate rejected payload: {0}")]
    Gate(#[from] GateError),

    #[error("link thread panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
}
