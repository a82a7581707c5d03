use pciemu_proxy::{ConfigError, ProxyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device was unrealized")]
    Retired,

    #[error("a proxy link is already attached")]
    AlreadyAttached,

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
