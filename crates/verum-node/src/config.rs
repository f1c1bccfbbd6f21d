use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use verum_protocol::{ComputeConfig, RelayConfig, RequesterConfig};

/// Everything a `verum` process reads from its TOML file. Missing sections
/// fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub requester: RequesterConfig,
    pub compute: ComputeConfig,
    pub relay: RelayConfig,
    pub devstack: DevstackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    InProcess,
    Relay,
}

/// How a faulty devstack participant misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Proposes a digest honest participants will not match
    #[default]
    WrongResult,
    /// Fails every execution
    Crash,
    /// Proposes correctly but cannot publish
    PublishFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevstackConfig {
    pub compute_nodes: usize,
    /// The last `faulty_nodes` participants misbehave
    pub faulty_nodes: usize,
    pub fault: FaultKind,
    pub transport: TransportKind,
    pub shards: u32,
    pub concurrency: usize,
    pub confidence: usize,
    pub min_bids: usize,
    pub payload: String,
    /// Simulated execution time per shard
    pub execution_delay_ms: u64,
    /// How long to wait for the job before giving up
    pub wait_timeout_ms: u64,
}

impl Default for DevstackConfig {
    fn default() -> Self {
        Self {
            compute_nodes: 3,
            faulty_nodes: 0,
            fault: FaultKind::default(),
            transport: TransportKind::default(),
            shards: 2,
            concurrency: 3,
            confidence: 2,
            min_bids: 0,
            payload: "hello verum".to_string(),
            execution_delay_ms: 50,
            wait_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
    pub module_filters: BTreeMap<String, String>,
    pub file_output: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            module_filters: BTreeMap::new(),
            file_output: None,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }

    /// Apply `VERUM_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("VERUM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("VERUM_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(nodes) = env::var("VERUM_COMPUTE_NODES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.devstack.compute_nodes = nodes;
        }
        if let Some(window) = env::var("VERUM_BID_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.requester.bid_window_ms = window;
        }
    }

    /// Reject combinations the devstack cannot run
    pub fn validate(&self) -> Result<()> {
        let devstack = &self.devstack;
        if devstack.faulty_nodes > devstack.compute_nodes {
            anyhow::bail!(
                "faulty_nodes ({}) exceeds compute_nodes ({})",
                devstack.faulty_nodes,
                devstack.compute_nodes
            );
        }
        if devstack.shards == 0 {
            anyhow::bail!("shards must be at least 1");
        }
        verum_types::Deal::new(devstack.concurrency, devstack.confidence, devstack.min_bids)
            .context("invalid devstack deal")?;
        Ok(())
    }
}
