//! TOML config file loading for the demo binary only. The library itself
//! takes a [`crate::node::NodeConfig`] in memory and never reads from disk.
//!
//! Generates a default template on first run and errors asking the caller
//! to rerun, rather than silently defaulting.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeConfig;

fn default_discovery_port() -> u16 {
    NodeConfig::DEFAULT_DISCOVERY_PORT
}

fn default_transport_port() -> u16 {
    NodeConfig::DEFAULT_TRANSPORT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Generated on first run and then kept stable across restarts.
    pub uid: String,
    pub addr: String,
    pub broadcast_addr: String,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
}

impl FileConfig {
    pub fn into_node_config(self) -> NodeConfig {
        NodeConfig::new(self.uid, self.addr, self.broadcast_addr)
            .with_discovery_port(self.discovery_port)
            .with_transport_port(self.transport_port)
    }
}

const TEMPLATE: &str = "# lan-node-core configuration\n\
uid = \"__GENERATED__\"\n\
addr = \"0.0.0.0\"\n\
broadcast_addr = \"255.255.255.255\"\n\
# discovery_port = 50000\n\
# transport_port = 50001\n";

/// Loads `config.toml` from `dir`, generating a default template (with a
/// freshly generated uid) on first run: a missing file is an error asking
/// the caller to rerun, not a silent default.
pub fn load(dir: &Path) -> Result<FileConfig> {
    let path = config_path(dir);
    if !path.exists() {
        let template = TEMPLATE.replace("__GENERATED__", &Uuid::new_v4().to_string());
        fs::write(&path, template).with_context(|| format!("failed to write default config to {path:?}"))?;
        return Err(anyhow!("default config created at {path:?}; edit it and rerun"));
    }

    let content = fs::read_to_string(&path).with_context(|| format!("failed to read {path:?}"))?;
    let config: FileConfig = toml::from_str(&content).with_context(|| format!("failed to parse {path:?}"))?;
    Ok(config)
}

fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.toml")
}
