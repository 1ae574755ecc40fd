//! Endpoint addressing for overlay (ROUTER/DEALER) and local-connector
//! sockets.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Transport for a ZeroMQ endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix-domain socket under the broker's `rundir`. Used for the local
    /// connector and, on a single-host session, for overlay sockets.
    Ipc(String),

    /// TCP transport for a distributed overlay.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(path: impl Into<String>) -> Self {
        Self::Ipc(path.into())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// The ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(path) => format!("ipc://{path}"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Ensure the parent directory of an IPC socket path exists; no-op for
    /// TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a stale socket file left behind by an unclean prior exit;
    /// no-op for TCP.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Parse an endpoint string like `"ipc:///run/broker/0.sock"` or
/// `"tcp://host:port"` back into a [`Transport`].
pub fn parse_endpoint(endpoint: &str) -> Result<Transport, BrokerError> {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        Ok(Transport::ipc(path))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| BrokerError::Config(format!("invalid tcp endpoint '{endpoint}'")))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| BrokerError::Config(format!("invalid tcp port in '{endpoint}'")))?;
        Ok(Transport::tcp(host, port))
    } else {
        Err(BrokerError::Config(format!(
            "unrecognized endpoint scheme in '{endpoint}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        let t = Transport::ipc("/run/broker/0/rpc.sock");
        assert_eq!(t.endpoint(), "ipc:///run/broker/0/rpc.sock");
    }

    #[test]
    fn tcp_endpoint() {
        let t = Transport::tcp("127.0.0.1", 5555);
        assert_eq!(t.endpoint(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn parse_roundtrips() {
        let t = Transport::tcp("node3", 8020);
        assert_eq!(parse_endpoint(&t.endpoint()).unwrap(), t);

        let t = Transport::ipc("/run/broker/1/rpc.sock");
        assert_eq!(parse_endpoint(&t.endpoint()).unwrap(), t);
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(parse_endpoint("udp://host:1").is_err());
    }
}
