//! Validated startup configuration and runtime tuning knobs.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

/// A TCP port outside the privileged range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPort(u16);

impl ListenPort {
    pub fn new(port: u32) -> Result<Self, ConfigError> {
        if 1023 < port && port < 65536 {
            Ok(Self(port as u16))
        } else {
            Err(ConfigError::PortOutOfRange(port))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for ListenPort {
    fn default() -> Self {
        Self(DEFAULT_PORT)
    }
}

impl FromStr for ListenPort {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let port = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::PortNotNumeric(raw.to_string()))?;
        Self::new(port)
    }
}

impl fmt::Display for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: IpAddr,
    pub port: ListenPort,
}

impl ServerConfig {
    /// An empty address listens on every interface.
    pub fn new(addr: &str, port: ListenPort) -> Result<Self, ConfigError> {
        let addr = match addr.trim() {
            "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            other => other
                .parse()
                .map_err(|_| ConfigError::Address(other.to_string()))?,
        };
        Ok(Self { addr, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port.get())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: ListenPort,
    pub name: Option<String>,
}

impl ClientConfig {
    pub fn new(host: &str, port: ListenPort, name: Option<&str>) -> Result<Self, ConfigError> {
        let host = match host.trim() {
            "" => DEFAULT_CLIENT_HOST.to_string(),
            other => other.to_string(),
        };
        let name = match name.map(str::trim) {
            Some("") => return Err(ConfigError::EmptyName),
            other => other.map(str::to_string),
        };
        Ok(Self { host, port, name })
    }
}

/// Timing of the server reactor.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Longest a tick waits for a new connection or inbound bytes.
    pub accept_timeout: Duration,
    /// Wait used instead while frames, deliveries or output are pending.
    pub backlog_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_millis(500),
            backlog_interval: Duration::from_millis(10),
        }
    }
}

/// Timing of a [`crate::transport::PeerTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    /// Pause between two watcher reads, leaving the lock to foreground calls.
    pub watch_interval: Duration,
    /// How long one watcher read may hold the lock.
    pub read_timeout: Duration,
    /// How long a foreground call waits for its response.
    pub response_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            watch_interval: Duration::from_millis(200),
            read_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1024", Ok(1024))]
    #[case("7777", Ok(7777))]
    #[case("65535", Ok(65535))]
    #[case("1023", Err(ConfigError::PortOutOfRange(1023)))]
    #[case("0", Err(ConfigError::PortOutOfRange(0)))]
    #[case("65536", Err(ConfigError::PortOutOfRange(65536)))]
    #[case("seven", Err(ConfigError::PortNotNumeric("seven".into())))]
    fn port_range(#[case] raw: &str, #[case] expected: Result<u16, ConfigError>) {
        assert_eq!(raw.parse::<ListenPort>().map(ListenPort::get), expected);
    }

    #[test]
    fn empty_server_address_listens_everywhere() {
        let config = ServerConfig::new("", ListenPort::default()).expect("valid config");
        assert_eq!(config.socket_addr(), "0.0.0.0:7777".parse().unwrap());
        assert_eq!(
            ServerConfig::new("not-an-ip", ListenPort::default()),
            Err(ConfigError::Address("not-an-ip".into()))
        );
    }

    #[test]
    fn client_name_must_not_be_blank() {
        assert_eq!(
            ClientConfig::new("localhost", ListenPort::default(), Some("  ")),
            Err(ConfigError::EmptyName)
        );
        let config = ClientConfig::new("", ListenPort::default(), None).expect("valid config");
        assert_eq!(config.host, DEFAULT_CLIENT_HOST);
        assert_eq!(config.name, None);
    }
}
