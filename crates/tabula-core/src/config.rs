//! executor.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

/// Which replicas of a contract count as wanted secondaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicyKind {
    /// Every server in the contract's replica set.
    #[default]
    Replicas,
    /// Only voters (including temporary voters).
    Voters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// This server's identity. Contracts name servers by this id.
    pub server_id: ServerId,
    /// Address advertised in execution and query cards.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,
    #[serde(default)]
    pub replica_policy: ReplicaPolicyKind,
    /// Keys removed per step by an erase execution.
    #[serde(default = "default_erase_chunk_size")]
    pub erase_chunk_size: usize,
    /// Directory holding the table's redb file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_advertise_addr() -> String {
    "127.0.0.1:29015".to_string()
}

fn default_erase_chunk_size() -> usize {
    256
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tabula")
}

impl ExecutorConfig {
    /// Defaults for everything but the server id.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            advertise_addr: default_advertise_addr(),
            replica_policy: ReplicaPolicyKind::default(),
            erase_chunk_size: default_erase_chunk_size(),
            data_dir: default_data_dir(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ExecutorConfig = toml::from_str(content)?;
        if config.erase_chunk_size == 0 {
            anyhow::bail!("erase_chunk_size must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
