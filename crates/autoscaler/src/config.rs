//! Daemon configuration

use anyhow::{Context, Result};
use autoscaler_lib::ScalerConfig;
use serde::Deserialize;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "FAS_CONFIG_FILE";

/// Daemon configuration: the scaling engine settings plus the adapters and
/// API server around it
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub scaler: ScalerConfig,

    /// API server port for health, metrics and status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Base URL of the provisioning API
    #[serde(default = "default_provisioner_endpoint")]
    pub provisioner_endpoint: String,

    /// ConfigMap the status summary is written to
    #[serde(default = "default_status_configmap")]
    pub status_configmap: String,

    #[serde(default = "default_status_namespace")]
    pub status_namespace: String,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_verbosity")]
    pub verbosity: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_provisioner_endpoint() -> String {
    "http://fleet-provisioner:9090".to_string()
}

fn default_status_configmap() -> String {
    "fleet-autoscaler-status".to_string()
}

fn default_status_namespace() -> String {
    "kube-system".to_string()
}

fn default_verbosity() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from the optional file named by `FAS_CONFIG_FILE`,
    /// then `FAS_*` environment variables, and validate it
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var(CONFIG_FILE_ENV).ok().as_deref())
    }

    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("FAS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("failed to parse configuration")?;
        app.scaler.validate().context("invalid configuration")?;
        url::Url::parse(&app.provisioner_endpoint)
            .with_context(|| format!("invalid provisioner_endpoint {}", app.provisioner_endpoint))?;
        Ok(app)
    }
}
