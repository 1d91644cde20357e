use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bots::BotKind;
use crate::consensus::ConsensusConfig;
use crate::rewards::RewardConfig;
use crate::store::PostgrestConfig;
use crate::telemetry::TelemetryConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    Memory,
    Postgrest,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgrest => "postgrest",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse { format: ConfigFormat, details: String },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SimConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub rewards: RewardConfig,
    #[serde(default)]
    pub mining: MiningSection,
    #[serde(default)]
    pub bots: BotsSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    /// Fixed node address; a synthetic `node_<ts>_<token>` one is generated when unset.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_min_peers")]
    pub min_peers: u64,
    #[serde(default = "default_max_peers")]
    pub max_peers: u64,
    /// Address burns are sent to.
    #[serde(default = "default_burn_address")]
    pub burn_address: String,
}

const fn default_min_peers() -> u64 {
    8
}

const fn default_max_peers() -> u64 {
    64
}

fn default_burn_address() -> String {
    "0x000000000000000000000000000000000000dead".into()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            address: None,
            min_peers: default_min_peers(),
            max_peers: default_max_peers(),
            burn_address: default_burn_address(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MiningSection {
    /// Leading zero hex characters a block hash needs.
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_max_block_txs")]
    pub max_block_txs: usize,
    /// Hashing iterations between cooperative yields.
    #[serde(default = "default_yield_every")]
    pub yield_every: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long the driver waits on an empty mempool before re-checking.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Coinbase amount credited to the node for every mined block.
    #[serde(default = "default_block_reward")]
    pub block_reward: f64,
    #[serde(default)]
    pub auto_start: bool,
}

const fn default_difficulty() -> u32 {
    4
}

const fn default_max_block_txs() -> usize {
    100
}

const fn default_yield_every() -> u64 {
    1_000
}

const fn default_channel_capacity() -> usize {
    16
}

const fn default_idle_poll_ms() -> u64 {
    1_000
}

const fn default_block_reward() -> f64 {
    2.5
}

impl Default for MiningSection {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            max_block_txs: default_max_block_txs(),
            yield_every: default_yield_every(),
            channel_capacity: default_channel_capacity(),
            idle_poll_ms: default_idle_poll_ms(),
            block_reward: default_block_reward(),
            auto_start: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BotsSection {
    /// Bots started together with the session.
    #[serde(default)]
    pub autostart: Vec<BotKind>,
    /// Period overrides in seconds, keyed by bot kind name.
    #[serde(default)]
    pub intervals: BTreeMap<String, u64>,
}

impl BotsSection {
    pub fn interval_secs(&self, kind: BotKind) -> u64 {
        self.intervals
            .get(kind.as_str())
            .copied()
            .unwrap_or_else(|| kind.default_interval_secs())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SyncSection {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound on every store round trip issued by the sync loop.
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_sync_enabled() -> bool {
    true
}

const fn default_sync_interval_ms() -> u64 {
    5_000
}

const fn default_sync_timeout_ms() -> u64 {
    10_000
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            interval_ms: default_sync_interval_ms(),
            timeout_ms: default_sync_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default)]
    pub postgrest: Option<PostgrestConfig>,
    /// Forward every action record to the `action_records` table.
    #[serde(default)]
    pub audit_actions: bool,
}

const fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            postgrest: None,
            audit_actions: false,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mining.difficulty > 16 {
            return Err(ConfigError::Validation(
                "mining difficulty cannot exceed the 16 hex characters of a block hash".into(),
            ));
        }
        if self.mining.max_block_txs == 0 {
            return Err(ConfigError::Validation(
                "max block transactions must be greater than zero".into(),
            ));
        }
        if self.mining.channel_capacity == 0 || self.mining.yield_every == 0 {
            return Err(ConfigError::Validation(
                "worker channel capacity and yield batch must be greater than zero".into(),
            ));
        }
        if self.mining.block_reward < 0.0 {
            return Err(ConfigError::Validation("block reward cannot be negative".into()));
        }
        if self.node.min_peers > self.node.max_peers {
            return Err(ConfigError::Validation("min peers cannot exceed max peers".into()));
        }
        if self.consensus.window_size == 0 {
            return Err(ConfigError::Validation("behavior window must hold at least one action".into()));
        }
        if !(0.0..=1.0).contains(&self.consensus.min_behavior_score) {
            return Err(ConfigError::Validation("min behavior score must be within [0, 1]".into()));
        }
        if self.rewards.business_hours_start > self.rewards.business_hours_end
            || self.rewards.business_hours_end > 24
        {
            return Err(ConfigError::Validation("business hours must satisfy start <= end <= 24".into()));
        }
        if self.sync.interval_ms == 0 || self.sync.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sync interval and timeout must be greater than zero".into(),
            ));
        }
        for (name, secs) in &self.bots.intervals {
            if BotKind::parse(name).is_none() {
                return Err(ConfigError::Validation(format!("unknown bot kind `{name}`")));
            }
            if *secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "bot interval for {name} must be greater than zero"
                )));
            }
        }
        if self.store.backend == StoreBackend::Postgrest {
            match &self.store.postgrest {
                Some(pg) if !pg.url.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::Validation(
                        "postgrest backend requires store.postgrest.url".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            node: NodeSection {
                address: Some("node_demo".into()),
                ..NodeSection::default()
            },
            consensus: ConsensusConfig::default(),
            rewards: RewardConfig::default(),
            mining: MiningSection {
                difficulty: 3,
                auto_start: true,
                ..MiningSection::default()
            },
            bots: BotsSection {
                autostart: vec![BotKind::Mining, BotKind::Engagement, BotKind::Trading],
                intervals: BTreeMap::new(),
            },
            sync: SyncSection::default(),
            store: StoreSection::default(),
            telemetry: TelemetryConfig::sample("bitnun-node"),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<SimConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, resolve_format(path, format))
}

/// Parses and validates config text; `Auto` is treated as TOML.
pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<SimConfig, ConfigError> {
    let config: SimConfig = match format {
        ConfigFormat::Toml | ConfigFormat::Auto => toml::from_str(contents).map_err(|err| ConfigError::Parse {
            format: ConfigFormat::Toml,
            details: err.to_string(),
        }),
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
    }?;
    config.validate()?;
    Ok(config)
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
