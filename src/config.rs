//! Broker configuration: parsed from TOML with environment variable
//! overrides and validated before the reactor starts, the same
//! load → override → validate pipeline the teacher's config module uses.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::runlevel::RunlevelConfig;
use crate::transport::{self, Transport};

/// Full broker configuration for one rank in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub session: SessionConfig,
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub runlevel: RunlevelSection,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// This rank's position in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub rank: u32,
    pub size: u32,
    #[serde(default = "default_k")]
    pub k: u32,
    #[serde(default = "default_rundir")]
    pub rundir: String,
}

fn default_k() -> u32 {
    2
}

fn default_rundir() -> String {
    "/tmp/tbon-broker".into()
}

/// Endpoints for this rank's overlay sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Endpoint to connect to for this rank's parent. `None` at rank 0.
    pub parent_endpoint: Option<String>,
    /// Endpoint this rank binds to accept children. `None` at a leaf.
    pub child_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunlevelSection {
    pub rc1: Option<Vec<String>>,
    pub rc2: Option<Vec<String>>,
    pub rc3: Option<Vec<String>>,
}

impl From<RunlevelSection> for RunlevelConfig {
    fn from(s: RunlevelSection) -> Self {
        RunlevelConfig {
            rc1: s.rc1,
            rc2: s.rc2,
            rc3: s.rc3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_grace_secs() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

impl BrokerConfig {
    /// A single-node session: rank 0 of size 1, no parent, no children.
    pub fn standalone() -> Self {
        Self {
            session: SessionConfig {
                rank: 0,
                size: 1,
                k: default_k(),
                rundir: default_rundir(),
            },
            overlay: OverlayConfig {
                parent_endpoint: None,
                child_bind: None,
            },
            runlevel: RunlevelSection::default(),
            heartbeat: HeartbeatConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, BrokerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// `BROKER_<SECTION>_<KEY>` overrides `section.key`, e.g.
    /// `BROKER_SESSION_RANK` overrides `session.rank`.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BROKER_SESSION_RANK") {
            if let Ok(rank) = v.parse() {
                self.session.rank = rank;
            }
        }
        if let Ok(v) = std::env::var("BROKER_SESSION_SIZE") {
            if let Ok(size) = v.parse() {
                self.session.size = size;
            }
        }
        if let Ok(v) = std::env::var("BROKER_SESSION_K") {
            if let Ok(k) = v.parse() {
                self.session.k = k;
            }
        }
        if let Ok(v) = std::env::var("BROKER_SESSION_RUNDIR") {
            self.session.rundir = v;
        }
        if let Ok(v) = std::env::var("BROKER_OVERLAY_PARENT_ENDPOINT") {
            self.overlay.parent_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_OVERLAY_CHILD_BIND") {
            self.overlay.child_bind = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.heartbeat.interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BROKER_SHUTDOWN_GRACE_SECS") {
            if let Ok(secs) = v.parse() {
                self.shutdown.grace_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.session.size == 0 {
            return Err(BrokerError::Config("session.size must be at least 1".into()));
        }
        if self.session.rank >= self.session.size {
            return Err(BrokerError::Config(format!(
                "session.rank {} out of range for session.size {}",
                self.session.rank, self.session.size
            )));
        }
        if self.session.k == 0 {
            return Err(BrokerError::Config("session.k must be at least 1".into()));
        }
        let has_parent = crate::topology::parent_of(self.session.rank, self.session.k).is_some();
        if has_parent && self.overlay.parent_endpoint.is_none() {
            return Err(BrokerError::Config(format!(
                "rank {} has a parent in the topology but overlay.parent_endpoint is not set",
                self.session.rank
            )));
        }
        if !has_parent && self.overlay.parent_endpoint.is_some() {
            return Err(BrokerError::Config("rank 0 must not set overlay.parent_endpoint".into()));
        }
        let has_children =
            !crate::topology::children_of(self.session.rank, self.session.k, self.session.size).is_empty();
        if has_children && self.overlay.child_bind.is_none() {
            return Err(BrokerError::Config(format!(
                "rank {} has children in the topology but overlay.child_bind is not set",
                self.session.rank
            )));
        }
        Ok(())
    }

    pub fn parent_transport(&self) -> Result<Option<Transport>, BrokerError> {
        self.overlay
            .parent_endpoint
            .as_deref()
            .map(transport::parse_endpoint)
            .transpose()
    }

    pub fn child_bind_transport(&self) -> Result<Option<Transport>, BrokerError> {
        self.overlay
            .child_bind
            .as_deref()
            .map(transport::parse_endpoint)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_validates() {
        BrokerConfig::standalone().validate().unwrap();
    }

    #[test]
    fn rank_out_of_range_fails_validation() {
        let mut cfg = BrokerConfig::standalone();
        cfg.session.rank = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_parent_endpoint_fails_when_topology_requires_one() {
        let mut cfg = BrokerConfig::standalone();
        cfg.session.size = 4;
        cfg.session.rank = 1;
        // rank 1 of size 4, k=2 has a parent (rank 0) but none configured.
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_toml_parses_minimal_config() {
        let toml_str = r#"
            [session]
            rank = 0
            size = 1

            [overlay]
        "#;
        let cfg = BrokerConfig::from_toml(toml_str).unwrap();
        assert_eq!(cfg.session.rank, 0);
        assert_eq!(cfg.session.k, 2);
    }
}
