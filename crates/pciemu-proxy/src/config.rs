use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8987;
/// How long an idle link waits on its request queue before polling the socket again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const ENV_ROLE: &str = "PCIEMU_PROXY_ROLE";
const ENV_HOST: &str = "PCIEMU_PROXY_HOST";
const ENV_PORT: &str = "PCIEMU_PROXY_PORT";
const ENV_POLL_MS: &str = "PCIEMU_PROXY_POLL_MS";

/// Which end of the connection this link is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Bind and accept.
    Server,
    /// Connect to a listening peer.
    Client,
}

impl FromStr for LinkRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" | "listen" => Ok(Self::Server),
            "client" | "connect" => Ok(Self::Client),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub role: LinkRole,
    /// Bind address for a server, peer address for a client.
    pub host: String,
    /// Port `0` lets a server pick an ephemeral port; see `LinkHandle::local_addr`.
    pub port: u16,
    pub poll_interval: Duration,
}

impl LinkConfig {
    pub fn server(host: impl Into<String>, port: u16) -> Self {
        Self {
            role: LinkRole::Server,
            host: host.into(),
            port,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            role: LinkRole::Client,
            ..Self::server(host, port)
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// `host:port`, as accepted by `ToSocketAddrs`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`LinkConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let invalid = |var: &'static str, value: String| ConfigError::InvalidEnv { var, value };

        let role = match lookup(ENV_ROLE) {
            Some(raw) => raw.parse().map_err(|()| invalid(ENV_ROLE, raw))?,
            None => LinkRole::Server,
        };
        let host = lookup(ENV_HOST)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup(ENV_PORT) {
            Some(raw) => raw.trim().parse().map_err(|_| invalid(ENV_PORT, raw))?,
            None => DEFAULT_PORT,
        };
        let poll_interval = match lookup(ENV_POLL_MS) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis)
                .ok_or_else(|| invalid(ENV_POLL_MS, raw))?,
            None => DEFAULT_POLL_INTERVAL,
        };

        Ok(Self {
            role,
            host,
            port,
            poll_interval,
        })
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::server(DEFAULT_HOST, DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = LinkConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, LinkConfig::default());
        assert_eq!(cfg.endpoint(), "127.0.0.1:8987");
    }

    #[test]
    fn env_overrides_every_field() {
        let cfg = LinkConfig::from_lookup(lookup(&[
            ("PCIEMU_PROXY_ROLE", "Client"),
            ("PCIEMU_PROXY_HOST", " peer.local "),
            ("PCIEMU_PROXY_PORT", "4000"),
            ("PCIEMU_PROXY_POLL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.role, LinkRole::Client);
        assert_eq!(cfg.host, "peer.local");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn bad_values_name_their_variable() {
        let err = LinkConfig::from_lookup(lookup(&[("PCIEMU_PROXY_PORT", "99999")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { var: "PCIEMU_PROXY_PORT", .. }
        ));

        let err = LinkConfig::from_lookup(lookup(&[("PCIEMU_PROXY_ROLE", "both")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { var: "PCIEMU_PROXY_ROLE", .. }
        ));

        let err = LinkConfig::from_lookup(lookup(&[("PCIEMU_PROXY_POLL_MS", "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { var: "PCIEMU_PROXY_POLL_MS", .. }
        ));
    }
}
