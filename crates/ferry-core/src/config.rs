//! Configuration system for ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub node: NodeConfig,
    pub forwarding: ForwardingConfig,
    pub schemes: Vec<SchemeConfig>,
    pub plans: Vec<PlanConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// CBHE node number of this node.
    pub node_number: u64,
    /// Service number of the endpoint that takes custody and receives
    /// administrative records.
    pub custodian_service: u64,
    /// Acquisitions larger than this spill from heap to file.
    pub max_acq_in_heap: u64,
    /// ZCO heap occupancy ceiling in bytes.
    pub heap_limit: u64,
    /// ZCO file occupancy ceiling in bytes.
    pub file_limit: u64,
    /// Where file-resident acquisition buffers are written.
    pub work_dir: PathBuf,
}

/// Which formula computes the backlog ahead of a newly queued bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorClaims {
    /// Strict priority: every standard byte is ahead of every bulk byte.
    Standard,
    /// Bulk is guaranteed a share of the non-urgent bandwidth.
    #[default]
    BandwidthReserved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub prior_claims: PriorClaims,
    /// Re-forward a custodial bundle if no custody signal arrives in this
    /// many seconds. 0 = never.
    pub custody_timeout_secs: u64,
    /// Re-forward a dequeued bundle whose transmission is not confirmed in
    /// this many seconds. 0 = never.
    pub xmit_overdue_secs: u64,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Treat `imc` destinations as multicast groups.
    pub multicast: bool,
    /// Report snubs to the contact graph.
    pub contact_graph: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemeConfig {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl SchemeConfig {
    pub fn endpoint_eid(&self, endpoint: &EndpointConfig) -> String {
        format!("{}:{}", self.name, endpoint.nss)
    }
}

/// What happens to a bundle for an endpoint no application has open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecvRule {
    #[default]
    Enqueue,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub nss: String,
    #[serde(default)]
    pub recv_rule: RecvRule,
    /// Shell command run when a bundle arrives for the endpoint while it
    /// is closed.
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Neighbor EID. A trailing `*` or `~` makes this a wildcard plan.
    pub neighbor: String,
    /// Bytes per second. 0 = unthrottled.
    #[serde(default)]
    pub nominal_rate: u64,
    /// Largest payload an outduct carries without fragmenting. 0 = no limit.
    #[serde(default)]
    pub max_payload_len: u64,
    #[serde(default)]
    pub outducts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination EID or wildcard pattern.
    pub destination: String,
    /// Neighbor EID of the plan to use.
    pub via: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_number: 1,
            custodian_service: 0,
            max_acq_in_heap: 65_536,
            heap_limit: 64 * 1024 * 1024,
            file_limit: 1_073_741_824, // 1 GB
            work_dir: data_dir().join("acq"),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            prior_claims: PriorClaims::default(),
            custody_timeout_secs: 0,
            xmit_overdue_secs: 0,
            hooks: HooksConfig::default(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The node's own administrative EID, `ipn:N.0`.
    pub fn node_eid(&self) -> String {
        format!("ipn:{}.0", self.node.node_number)
    }

    /// The EID that takes custody on this node.
    pub fn custodian_eid(&self) -> String {
        format!("ipn:{}.{}", self.node.node_number, self.node.custodian_service)
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("FERRY_NODE__NODE_NUMBER") {
            self.node.node_number = n;
        }
        if let Some(n) = env_parse("FERRY_NODE__HEAP_LIMIT") {
            self.node.heap_limit = n;
        }
        if let Some(n) = env_parse("FERRY_NODE__FILE_LIMIT") {
            self.node.file_limit = n;
        }
        if let Ok(v) = std::env::var("FERRY_NODE__WORK_DIR") {
            self.node.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FERRY_FORWARDING__PRIOR_CLAIMS") {
            match v.as_str() {
                "standard" => self.forwarding.prior_claims = PriorClaims::Standard,
                "bandwidth_reserved" => {
                    self.forwarding.prior_claims = PriorClaims::BandwidthReserved
                }
                _ => {}
            }
        }
        if let Some(n) = env_parse("FERRY_FORWARDING__CUSTODY_TIMEOUT_SECS") {
            self.forwarding.custody_timeout_secs = n;
        }
        if let Ok(v) = std::env::var("FERRY_FORWARDING__HOOKS__MULTICAST") {
            self.forwarding.hooks.multicast = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("FERRY_FORWARDING__HOOKS__CONTACT_GRAPH") {
            self.forwarding.hooks.contact_graph = v == "true" || v == "1";
        }
    }
}

fn env_parse(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
