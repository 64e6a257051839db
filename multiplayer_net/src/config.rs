// Configuration for the socket transport and the relay binary.
//
// Plain structs with defaults; the binary fills `RelayConfig` from command
// line flags (see `main.rs`). Port 0 asks the OS for a free port, which is
// what the tests use.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 7878;

/// How long either side waits for the other to complete the
/// `Connect`/`Welcome` exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a single frame write may block before the peer is dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a socket server listens, and how patient it is with its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Connections that have not sent `Connect` within this window are closed.
    pub handshake_timeout: Duration,
    /// A peer that does not drain its socket for this long is disconnected.
    pub write_timeout: Duration,
}

impl SocketServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Loopback with an OS-assigned port.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }
}

impl Default for SocketServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// How a socket client connects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketClientConfig {
    pub connect_timeout: Duration,
    /// Give up on a server that accepted the connection but never welcomed us.
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for SocketClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Settings for the standalone `relay` binary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayConfig {
    pub server: SocketServerConfig,
    /// Log at debug level unless `RUST_LOG` says otherwise.
    pub debug: bool,
}

/// Outcome of parsing the relay's command line.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayArgs {
    Run(RelayConfig),
    Help,
}

/// Parse `relay` arguments (without the program name). Uses simple matching,
/// no clap dependency.
pub fn parse_relay_args<I, S>(args: I) -> Result<RelayArgs, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut config = RelayConfig::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_ref() {
            "--bind" => {
                config.server.bind_address = args
                    .next()
                    .and_then(|s| s.as_ref().parse().ok())
                    .ok_or("--bind requires an IP address")?;
            }
            "--port" => {
                config.server.port = args
                    .next()
                    .and_then(|s| s.as_ref().parse().ok())
                    .ok_or("--port requires a valid port number")?;
            }
            "--handshake-timeout" => {
                config.server.handshake_timeout = args
                    .next()
                    .and_then(|s| s.as_ref().parse().ok())
                    .map(Duration::from_secs)
                    .ok_or("--handshake-timeout requires a number of seconds")?;
            }
            "--debug" => config.debug = true,
            "--help" | "-h" => return Ok(RelayArgs::Help),
            other => return Err(format!("Unknown argument: {other}")),
        }
    }

    Ok(RelayArgs::Run(config))
}

pub const RELAY_USAGE: &str = "\
Usage: relay [OPTIONS]

Options:
  --bind <ADDR>    Listen address (default: 127.0.0.1)
  --port <PORT>    Listen port (default: 7878)
  --handshake-timeout <SECS>
                   Drop connections that do not say hello in time (default: 5)
  --debug          Log at debug level (RUST_LOG overrides)
  --help, -h       Show this help";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_args_gives_defaults() {
        let parsed = parse_relay_args(Vec::<String>::new()).unwrap();
        assert_eq!(parsed, RelayArgs::Run(RelayConfig::default()));
        assert_eq!(
            SocketServerConfig::default().socket_addr().to_string(),
            "127.0.0.1:7878"
        );
    }

    #[test]
    fn flags_override_defaults() {
        let parsed = parse_relay_args(["--bind", "0.0.0.0", "--port", "9000", "--debug"]).unwrap();
        let RelayArgs::Run(config) = parsed else {
            panic!("expected Run");
        };
        assert_eq!(config.server.socket_addr().to_string(), "0.0.0.0:9000");
        assert!(config.debug);
    }

    #[test]
    fn handshake_timeout_is_in_seconds() {
        let parsed = parse_relay_args(["--handshake-timeout", "12"]).unwrap();
        let RelayArgs::Run(config) = parsed else {
            panic!("expected Run");
        };
        assert_eq!(config.server.handshake_timeout, Duration::from_secs(12));
        assert!(parse_relay_args(["--handshake-timeout", "soon"]).is_err());
    }

    #[test]
    fn help_wins() {
        assert_eq!(parse_relay_args(["--port", "1", "-h"]).unwrap(), RelayArgs::Help);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(parse_relay_args(["--port"]).is_err());
        assert!(parse_relay_args(["--port", "99999"]).is_err());
        assert!(parse_relay_args(["--bind", "not-an-ip"]).is_err());
        assert!(parse_relay_args(["--frobnicate"]).is_err());
    }
}
