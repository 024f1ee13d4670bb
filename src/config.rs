use anyhow::{bail, Context, Result};
use url::Url;

use crate::cadence::is_flow_address;
use crate::events::{Contract, EventSource};
use crate::logging::{info, obj, v_num, v_str, v_u64, warn, Domain};
use crate::monitor::MonitorConfig;
use crate::orchestrator::policy::PolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Emulator,
    Testnet,
    Mainnet,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "emulator" | "local" => Some(Network::Emulator),
            "testnet" => Some(Network::Testnet),
            "mainnet" => Some(Network::Mainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Emulator => "emulator",
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    pub fn default_access_node(&self) -> &'static str {
        match self {
            Network::Emulator => "http://localhost:8888",
            Network::Testnet => "https://rest-testnet.onflow.org",
            Network::Mainnet => "https://rest-mainnet.onflow.org",
        }
    }

    pub fn fungible_token_address(&self) -> &'static str {
        match self {
            Network::Emulator => "0xee82856bf20e2aa6",
            Network::Testnet => "0x9a0766d93b6608b7",
            Network::Mainnet => "0xf233dcee88fe0abe",
        }
    }

    pub fn flow_token_address(&self) -> &'static str {
        match self {
            Network::Emulator => "0x0ae53cb6e3f42a79",
            Network::Testnet => "0x7e60df042a9c0868",
            Network::Mainnet => "0x1654653399040a61",
        }
    }
}

/// Emulator service account; every contract lives there in local setups.
pub const EMULATOR_SERVICE_ADDRESS: &str = "0xf8d6e0586b0a20c7";

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub access_node: String,
    pub vault_address: String,
    pub registry_address: String,
    pub executor_address: String,
    pub authz_relay_url: Option<String>,
    pub authz_relay_secret: Option<String>,
    pub auto_execute: bool,
    pub min_confidence: f64,
    pub rebalance_percentage: f64,
    pub use_scheduled_tx: bool,
    pub execution_delay_secs: u64,
    pub poll_interval_ms: u64,
    pub start_block_height: Option<u64>,
    pub analytics_webhook: Option<String>,
    pub max_gas_limit: u64,
    pub emergency_pause_threshold: u32,
    pub finality_timeout_secs: u64,
    pub finality_poll_ms: u64,
    pub templates_dir: String,
    pub sqlite_path: Option<String>,
    pub cleanup_interval_secs: u64,
    pub schedule_retention_secs: u64,
    pub dry_run: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let network = std::env::var("FLOW_NETWORK")
            .ok()
            .and_then(|v| Network::parse(&v))
            .unwrap_or(Network::Emulator);
        Self {
            network,
            access_node: env_opt("FLOW_ACCESS_NODE")
                .unwrap_or_else(|| network.default_access_node().to_string()),
            vault_address: env_opt("AION_VAULT_ADDRESS")
                .unwrap_or_else(|| EMULATOR_SERVICE_ADDRESS.to_string()),
            registry_address: env_opt("ACTION_REGISTRY_ADDRESS")
                .unwrap_or_else(|| EMULATOR_SERVICE_ADDRESS.to_string()),
            executor_address: env_opt("EXECUTOR_ADDRESS")
                .unwrap_or_else(|| EMULATOR_SERVICE_ADDRESS.to_string()),
            authz_relay_url: env_opt("AUTHZ_RELAY_URL"),
            authz_relay_secret: env_opt("AUTHZ_RELAY_SECRET"),
            auto_execute: env_flag("AUTO_EXECUTE_RECOMMENDATIONS"),
            min_confidence: env_parse("MIN_CONFIDENCE", 80.0),
            rebalance_percentage: env_parse("REBALANCE_PERCENTAGE", 50.0),
            use_scheduled_tx: env_flag("USE_SCHEDULED_TX"),
            execution_delay_secs: env_parse("EXECUTION_DELAY", 300),
            poll_interval_ms: env_parse("POLL_INTERVAL", 5000),
            start_block_height: std::env::var("START_BLOCK_HEIGHT").ok().and_then(|v| v.trim().parse().ok()),
            analytics_webhook: env_opt("ANALYTICS_WEBHOOK"),
            max_gas_limit: env_parse("MAX_GAS_LIMIT", 9999),
            emergency_pause_threshold: env_parse("EMERGENCY_PAUSE_THRESHOLD", 10),
            finality_timeout_secs: env_parse("FINALITY_TIMEOUT_SECS", 120),
            finality_poll_ms: env_parse("FINALITY_POLL_MS", 1000),
            templates_dir: env_opt("TEMPLATES_DIR").unwrap_or_else(|| "./templates".to_string()),
            sqlite_path: env_opt("SQLITE_PATH"),
            cleanup_interval_secs: env_parse("CLEANUP_INTERVAL_SECS", 3600),
            schedule_retention_secs: env_parse("SCHEDULE_RETENTION_SECS", 24 * 60 * 60),
            dry_run: env_flag("DRY_RUN"),
        }
    }

    /// Rejects settings the executor cannot run with. Missing deployment
    /// values outside the emulator are only warned about.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.access_node)
            .with_context(|| format!("FLOW_ACCESS_NODE is not a valid url: {}", self.access_node))?;
        if let Some(relay) = &self.authz_relay_url {
            Url::parse(relay).with_context(|| format!("AUTHZ_RELAY_URL is not a valid url: {}", relay))?;
        }
        if let Some(hook) = &self.analytics_webhook {
            Url::parse(hook).with_context(|| format!("ANALYTICS_WEBHOOK is not a valid url: {}", hook))?;
        }
        for (key, addr) in [
            ("AION_VAULT_ADDRESS", &self.vault_address),
            ("ACTION_REGISTRY_ADDRESS", &self.registry_address),
            ("EXECUTOR_ADDRESS", &self.executor_address),
        ] {
            if !is_flow_address(addr) {
                bail!("{} is not a Flow address: {}", key, addr);
            }
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            bail!("MIN_CONFIDENCE must be within 0..=100, got {}", self.min_confidence);
        }
        if !(0.0..=100.0).contains(&self.rebalance_percentage) {
            bail!("REBALANCE_PERCENTAGE must be within 0..=100, got {}", self.rebalance_percentage);
        }
        if self.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL must be positive");
        }

        if self.network != Network::Emulator {
            let mut missing = Vec::new();
            if std::env::var("AION_VAULT_ADDRESS").is_err() {
                missing.push("AION_VAULT_ADDRESS");
            }
            if std::env::var("ACTION_REGISTRY_ADDRESS").is_err() {
                missing.push("ACTION_REGISTRY_ADDRESS");
            }
            if self.authz_relay_url.is_none() && !self.dry_run {
                missing.push("AUTHZ_RELAY_URL");
            }
            if !missing.is_empty() {
                warn(
                    Domain::System,
                    "config_missing_deployment_vars",
                    obj(&[("missing", v_str(&missing.join(",")))]),
                );
            }
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info(
            Domain::System,
            "config",
            obj(&[
                ("network", v_str(self.network.as_str())),
                ("access_node", v_str(&self.access_node)),
                ("vault_address", v_str(&self.vault_address)),
                ("registry_address", v_str(&self.registry_address)),
                ("auto_execute", serde_json::Value::Bool(self.auto_execute)),
                ("min_confidence", v_num(self.min_confidence)),
                ("use_scheduled_tx", serde_json::Value::Bool(self.use_scheduled_tx)),
                ("execution_delay_secs", v_u64(self.execution_delay_secs)),
                ("poll_interval_ms", v_u64(self.poll_interval_ms)),
                ("dry_run", serde_json::Value::Bool(self.dry_run)),
            ]),
        );
    }

    /// Contracts the monitor tracks, in polling order.
    pub fn sources(&self) -> Vec<EventSource> {
        vec![
            EventSource::new(Contract::AionVault, &self.vault_address),
            EventSource::new(Contract::ActionRegistry, &self.registry_address),
        ]
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: self.poll_interval_ms,
            start_height: self.start_block_height,
            sources: self.sources(),
        }
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            auto_execute: self.auto_execute,
            min_confidence: self.min_confidence,
            rebalance_percentage: self.rebalance_percentage,
            use_scheduled_tx: self.use_scheduled_tx,
            execution_delay_secs: self.execution_delay_secs,
            emergency_pause_threshold: self.emergency_pause_threshold,
        }
    }
}
