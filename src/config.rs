//! Configuration management for the HTLC relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,

    /// Ingestor polling interval, seconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Maximum block span per event query (W)
    #[serde(default = "default_max_blocks_per_query")]
    pub max_blocks_per_query: u64,

    /// Window before the source timelock in which a never-matched order
    /// is given up on, seconds
    #[serde(default = "default_order_timeout_buffer")]
    pub order_timeout_buffer_secs: u64,

    #[serde(default = "default_max_pending_orders")]
    pub max_pending_orders: usize,

    /// Enforced bounds on order timelocks, seconds from now at creation
    #[serde(default = "default_min_timelock")]
    pub min_timelock_secs: u64,
    #[serde(default = "default_max_timelock")]
    pub max_timelock_secs: u64,
    #[serde(default = "default_default_timelock")]
    pub default_timelock_secs: u64,

    /// Required gap between target and source timelocks (the skew Δ)
    #[serde(default = "default_timelock_safety_margin")]
    pub timelock_safety_margin_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Action worker count; 0 means 2 x available cores
    #[serde(default)]
    pub worker_threads: usize,

    /// Concurrent submission cap per chain
    #[serde(default = "default_max_inflight_submissions")]
    pub max_inflight_submissions: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_fee_refresh_interval")]
    pub fee_refresh_interval_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// How long terminal orders are retained before garbage collection
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Deadline for adapter queries and view calls, seconds
    #[serde(default = "default_query_deadline")]
    pub query_deadline_secs: u64,
    /// Deadline for receipt polling, seconds
    #[serde(default = "default_receipt_deadline")]
    pub receipt_deadline_secs: u64,

    /// How long shutdown waits for in-flight submissions, seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl RelayerConfig {
    /// Effective worker count (2 x cores when unset)
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Address of the HTLC contract
    pub htlc_address: String,
    /// Address of the bridge contract
    pub bridge_address: String,
    /// Confirmation depth K
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Environment variable holding the submission key
    pub submission_key_env: String,
    #[serde(default = "default_min_gas_limit")]
    pub min_gas_limit: u64,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    /// Whether the bridge on this chain accepts processIncomingOrder.
    /// When false, swaps targeting this chain advance purely on HTLC
    /// observation.
    #[serde(default = "default_true")]
    pub supports_incoming_orders: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

fn default_polling_interval() -> u64 {
    5
}
fn default_max_blocks_per_query() -> u64 {
    100
}
fn default_order_timeout_buffer() -> u64 {
    3600
}
fn default_max_pending_orders() -> usize {
    1000
}
fn default_min_timelock() -> u64 {
    3600
}
fn default_max_timelock() -> u64 {
    7 * 86400
}
fn default_default_timelock() -> u64 {
    86400
}
fn default_timelock_safety_margin() -> u64 {
    1800
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    5
}
fn default_max_inflight_submissions() -> usize {
    16
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_reconcile_interval() -> u64 {
    300
}
fn default_fee_refresh_interval() -> u64 {
    300
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_retention() -> u64 {
    86400
}
fn default_query_deadline() -> u64 {
    30
}
fn default_receipt_deadline() -> u64 {
    120
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_confirmation_depth() -> u64 {
    3
}
fn default_min_gas_limit() -> u64 {
    100_000
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration. Failures here are fatal: the process
    /// aborts before handling any events.
    pub fn validate(&self) -> Result<()> {
        let enabled = self.enabled_chains();
        if enabled.len() != 2 {
            anyhow::bail!(
                "Exactly two chains must be enabled, found {}",
                enabled.len()
            );
        }
        if enabled[0].1.chain_id == enabled[1].1.chain_id {
            anyhow::bail!("Enabled chains must have distinct chain ids");
        }

        for (name, chain) in &enabled {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.htlc_address.is_empty() || chain.bridge_address.is_empty() {
                anyhow::bail!("Chain {} is missing contract addresses", name);
            }
            if env::var(&chain.submission_key_env).is_err() {
                anyhow::bail!(
                    "Chain {}: submission key env var {} is not set",
                    name,
                    chain.submission_key_env
                );
            }
        }

        let r = &self.relayer;
        if r.min_timelock_secs >= r.max_timelock_secs {
            anyhow::bail!("min_timelock must be below max_timelock");
        }
        if r.default_timelock_secs < r.min_timelock_secs
            || r.default_timelock_secs > r.max_timelock_secs
        {
            anyhow::bail!("default_timelock must lie within [min, max]");
        }
        if r.timelock_safety_margin_secs == 0 {
            anyhow::bail!("timelock_safety_margin must be non-zero");
        }
        if r.max_blocks_per_query == 0 {
            anyhow::bail!("max_blocks_per_query must be non-zero");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
