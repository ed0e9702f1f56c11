//! Agent configuration

use agent_lib::models::CloudProvider;
use agent_lib::sync::{ClientConfig, ExportConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Control plane base URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    #[serde(default)]
    pub api_key: String,

    /// Registered cluster id; the agent registers when empty
    #[serde(default)]
    pub cluster_id: String,

    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub account_id: String,

    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    #[serde(default = "default_full_snapshot_every")]
    pub full_snapshot_every: u32,

    /// Upload workload rollups without names or namespaces
    #[serde(default)]
    pub disable_workload_uploading: bool,

    #[serde(default)]
    pub cloud_provider: CloudProvider,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_api_endpoint() -> String {
    "https://control-plane:8443".to_string()
}

fn default_export_interval() -> u64 {
    60
}

fn default_full_snapshot_every() -> u32 {
    10
}

fn default_api_port() -> u16 {
    8080
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AGENT"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: AgentConfig = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
            .context("Invalid agent configuration")?;

        if config.api_key.is_empty() {
            anyhow::bail!("AGENT_API_KEY is required");
        }
        Ok(config)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.api_endpoint.clone(),
            api_key: self.api_key.clone(),
            cluster_id: self.cluster_id.clone(),
            retry_max_attempts: self.retry_max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..Default::default()
        }
    }

    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            interval: Duration::from_secs(self.export_interval_secs),
            full_snapshot_every: self.full_snapshot_every,
            anonymize: self.disable_workload_uploading,
        }
    }
}
