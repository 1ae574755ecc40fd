use thiserror::Error;

/// Errors surfaced by the broker core.
///
/// Variants mirror the error kinds a router decision can produce, plus the
/// ambient wrapping variants for serialization, transport, and config
/// failures encountered while getting a message to the point a routing
/// decision can even be made.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no service registered for '{0}' and no parent to forward to")]
    NoService(String),

    #[error("no host: UPSTREAM requested at rank 0")]
    NoHost,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("permission denied: rolemask lacks required role for '{0}'")]
    PermissionDenied(String),

    #[error("'{0}' already exists")]
    Exists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("attribute '{0}' is immutable")]
    Immutable(String),

    #[error("module '{0}' failed to load: {1}")]
    ModuleLoadFailed(String, i32),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// An error RESPONSE that arrived from elsewhere in the tree, surfaced
    /// to a local `Router::call()` caller. `kind` is the remote's
    /// machine-readable kind string; the local variants above are for
    /// errors raised directly by this rank.
    #[error("remote error ({kind}): {reason}")]
    Remote { kind: String, reason: String },
}

impl BrokerError {
    /// Short machine-readable kind string, used in built-in service error
    /// responses (`attr.*`, `service.*`, module management) so remote
    /// callers can match on the error kind rather than parsing prose.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::NoService(_) => "no_service",
            BrokerError::NoHost => "no_host",
            BrokerError::Malformed(_) => "malformed",
            BrokerError::PermissionDenied(_) => "permission_denied",
            BrokerError::Exists(_) => "exists",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Immutable(_) => "immutable",
            BrokerError::ModuleLoadFailed(_, _) => "module_load_failed",
            BrokerError::Transport(_) => "transport",
            BrokerError::NotImplemented(_) => "not_implemented",
            BrokerError::Serialization(_) | BrokerError::Deserialization(_) => "malformed",
            BrokerError::Zmq(_) => "transport",
            BrokerError::Config(_) | BrokerError::ConfigParse(_) | BrokerError::ConfigIo(_) => {
                "config"
            }
            BrokerError::Remote { .. } => "remote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(BrokerError::NoHost.kind(), "no_host");
        assert_eq!(BrokerError::Exists("foo".into()).kind(), "exists");
        assert_eq!(
            BrokerError::ModuleLoadFailed("m".into(), 1).kind(),
            "module_load_failed"
        );
    }
}
