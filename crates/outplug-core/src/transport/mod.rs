//! Subprocess RPC transport.
//!
//! The host starts the plugin with the magic cookie and the accepted
//! versions and transports in its environment. The plugin answers with a
//! single handshake line on stdout:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|TRANSPORT
//! 1|1|tcp|127.0.0.1:40123|jsonrpc
//! 1|1|stdio|-|stdio
//! ```
//!
//! After that, both sides exchange newline-delimited JSON-RPC 2.0 messages
//! either over the announced socket (`jsonrpc`) or over the child's
//! stdin/stdout (`stdio`).

pub mod rpc;
pub mod serve;

use std::fmt;
use std::str::FromStr;

pub use rpc::{NegotiateError, RpcClient, RpcOutput};
pub use serve::{PluginLogger, ServeError, ServeOptions, serve};

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Environment variable listing the application protocol versions the
/// host accepts, comma separated.
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Environment variable listing the transports the host accepts.
pub const ENV_TRANSPORTS: &str = "PLUGIN_TRANSPORTS";

/// Identity shared by host and plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Application protocol version.
    pub protocol_version: u32,
    pub magic_cookie_key: &'static str,
    pub magic_cookie_value: &'static str,
}

/// Handshake identity of output plugins.
pub const HANDSHAKE: HandshakeConfig = HandshakeConfig {
    protocol_version: 1,
    magic_cookie_key: "XK6_OUTPUT_PLUGIN_MAGIC_COOKIE",
    magic_cookie_value: "0b0e7b5c8c3a4b4f9f1f0d6f2e5a7c31",
};

/// How RPC messages travel after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// JSON-RPC over the tcp or unix socket named in the handshake.
    JsonRpc,
    /// JSON-RPC over the child's stdin/stdout.
    Stdio,
}

/// Transports the host accepts.
pub const ALLOWED_TRANSPORTS: [Transport; 2] = [Transport::JsonRpc, Transport::Stdio];

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JsonRpc => "jsonrpc",
            Self::Stdio => "stdio",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jsonrpc" => Ok(Self::JsonRpc),
            "stdio" => Ok(Self::Stdio),
            other => Err(HandshakeError::UnknownTransport(other.to_string())),
        }
    }
}

/// Where the plugin listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
    Stdio,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Stdio => "stdio",
        }
    }
}

impl FromStr for Network {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            "stdio" => Ok(Self::Stdio),
            other => Err(HandshakeError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed handshake line {0:?} (expected CORE|APP|NETWORK|ADDRESS|TRANSPORT)")]
    Malformed(String),

    #[error("unsupported core protocol version {got} (expected {CORE_PROTOCOL_VERSION})")]
    CoreVersion { got: String },

    #[error("plugin speaks protocol version {got}, host expects {expected}")]
    AppVersion { got: String, expected: u32 },

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    #[error("transport {0} is not allowed")]
    TransportNotAllowed(Transport),

    #[error("transport {transport} cannot run over network {network}")]
    NetworkMismatch {
        transport: Transport,
        network: &'static str,
    },

    #[error("plugin exited before completing the handshake ({status})")]
    Exited { status: String },

    #[error("failed reading handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed and validated handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub app_version: u32,
    pub network: Network,
    pub address: String,
    pub transport: Transport,
}

impl HandshakeLine {
    /// Parse `line` and check it against `config` and the `allowed`
    /// transports.
    pub fn parse(
        line: &str,
        config: &HandshakeConfig,
        allowed: &[Transport],
    ) -> Result<Self, HandshakeError> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, address, transport] = parts.as_slice() else {
            return Err(HandshakeError::Malformed(line.to_string()));
        };

        if core.parse::<u32>().ok() != Some(CORE_PROTOCOL_VERSION) {
            return Err(HandshakeError::CoreVersion {
                got: (*core).to_string(),
            });
        }

        let app_version = app
            .parse::<u32>()
            .ok()
            .filter(|v| *v == config.protocol_version)
            .ok_or_else(|| HandshakeError::AppVersion {
                got: (*app).to_string(),
                expected: config.protocol_version,
            })?;

        let network: Network = network.parse()?;
        let transport: Transport = transport.parse()?;
        if !allowed.contains(&transport) {
            return Err(HandshakeError::TransportNotAllowed(transport));
        }

        let compatible = match transport {
            Transport::Stdio => network == Network::Stdio,
            Transport::JsonRpc => matches!(network, Network::Tcp | Network::Unix),
        };
        if !compatible {
            return Err(HandshakeError::NetworkMismatch {
                transport,
                network: network.as_str(),
            });
        }

        Ok(Self {
            app_version,
            network,
            address: (*address).to_string(),
            transport,
        })
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CORE_PROTOCOL_VERSION}|{}|{}|{}|{}",
            self.app_version,
            self.network.as_str(),
            self.address,
            self.transport
        )
    }
}

/// Comma-separated list of transports for [`ENV_TRANSPORTS`].
pub fn transports_env_value(allowed: &[Transport]) -> String {
    allowed
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<HandshakeLine, HandshakeError> {
        HandshakeLine::parse(line, &HANDSHAKE, &ALLOWED_TRANSPORTS)
    }

    #[test]
    fn parse_tcp_jsonrpc() {
        let hs = parse("1|1|tcp|127.0.0.1:40123|jsonrpc\n").unwrap();
        assert_eq!(hs.network, Network::Tcp);
        assert_eq!(hs.address, "127.0.0.1:40123");
        assert_eq!(hs.transport, Transport::JsonRpc);
    }

    #[test]
    fn parse_unix_jsonrpc() {
        let hs = parse("1|1|unix|/tmp/plugin.sock|jsonrpc").unwrap();
        assert_eq!(hs.network, Network::Unix);
        assert_eq!(hs.address, "/tmp/plugin.sock");
    }

    #[test]
    fn parse_stdio() {
        let hs = parse("1|1|stdio|-|stdio").unwrap();
        assert_eq!(hs.transport, Transport::Stdio);
    }

    #[test]
    fn display_roundtrips() {
        let line = "1|1|tcp|127.0.0.1:9|jsonrpc";
        assert_eq!(parse(line).unwrap().to_string(), line);
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(parse("1|1|tcp|127.0.0.1:1"), Err(HandshakeError::Malformed(_))));
        assert!(matches!(parse("hello world"), Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn rejects_core_version() {
        assert!(matches!(
            parse("2|1|tcp|127.0.0.1:1|jsonrpc"),
            Err(HandshakeError::CoreVersion { .. })
        ));
    }

    #[test]
    fn rejects_app_version() {
        let err = parse("1|7|tcp|127.0.0.1:1|jsonrpc").unwrap_err();
        assert!(matches!(err, HandshakeError::AppVersion { expected: 1, .. }), "{err}");
    }

    #[test]
    fn rejects_unknown_transport() {
        assert!(matches!(
            parse("1|1|tcp|127.0.0.1:1|grpc"),
            Err(HandshakeError::UnknownTransport(t)) if t == "grpc"
        ));
    }

    #[test]
    fn rejects_transport_outside_allow_list() {
        let err = HandshakeLine::parse("1|1|stdio|-|stdio", &HANDSHAKE, &[Transport::JsonRpc])
            .unwrap_err();
        assert!(matches!(err, HandshakeError::TransportNotAllowed(Transport::Stdio)));
    }

    #[test]
    fn rejects_mismatched_network() {
        assert!(matches!(
            parse("1|1|tcp|127.0.0.1:1|stdio"),
            Err(HandshakeError::NetworkMismatch { .. })
        ));
        assert!(matches!(
            parse("1|1|stdio|-|jsonrpc"),
            Err(HandshakeError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn transports_env_lists_allow_list() {
        assert_eq!(transports_env_value(&ALLOWED_TRANSPORTS), "jsonrpc,stdio");
    }
}
