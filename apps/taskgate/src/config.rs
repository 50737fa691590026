use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use taskgate_core::QuotaRates;
use taskgate_provider_core::{ChannelContext, ChannelType, DEFAULT_TIMEOUT};

pub const ENV_PREFIX: &str = "TASKGATE";

/// Everything the gateway reads from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub quota: QuotaRates,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_quota: i64,
    #[serde(default)]
    pub model_quota: HashMap<String, i64>,
    #[serde(default)]
    pub settings: JsonValue,
}

impl From<ChannelConfig> for ChannelContext {
    fn from(channel: ChannelConfig) -> Self {
        let mut context = ChannelContext::new(
            channel.id,
            channel.channel_type,
            channel.base_url,
            channel.api_key,
        );
        if let Some(name) = channel.name.filter(|name| !name.trim().is_empty()) {
            context.name = name;
        }
        context.timeout = channel
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        context.default_quota = channel.default_quota;
        context.model_quota = channel.model_quota;
        context.settings = channel.settings;
        context
    }
}

/// Read `path` (optional) and layer `TASKGATE__*` environment overrides on top.
pub fn load(path: &Path) -> Result<GatewayConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

impl GatewayConfig {
    pub fn channel_contexts(&self) -> Vec<ChannelContext> {
        self.channels.iter().cloned().map(ChannelContext::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_quota_and_channels() {
        let file = write_config(
            r#"
[quota]
units_per_dollar = 1000

[[channels]]
id = 5
type = "doubao"
api_key = "ark-key"
timeout_secs = 45
default_quota = 100

[channels.model_quota]
"doubao-seaweed" = 250

[channels.settings]
protocol = "envelope"
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.quota.units_per_dollar, 1000);
        assert_eq!(config.quota.yuan_per_dollar, QuotaRates::default().yuan_per_dollar);

        let contexts = config.channel_contexts();
        assert_eq!(contexts.len(), 1);
        let channel = &contexts[0];
        assert_eq!(channel.channel_id, 5);
        assert_eq!(channel.name, "doubao");
        assert_eq!(channel.timeout, Duration::from_secs(45));
        assert_eq!(channel.quota_for("doubao-seaweed"), 250);
        assert_eq!(channel.quota_for("other"), 100);
        assert_eq!(channel.setting_str("protocol"), Some("envelope"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.channels.is_empty());
        assert_eq!(config.quota, QuotaRates::default());
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let file = write_config(
            r#"
[[channels]]
id = 1
type = "doubao"
timeout_secs = 0
"#,
        );
        let config = load(file.path()).unwrap();
        let contexts = config.channel_contexts();
        assert_eq!(contexts[0].timeout, DEFAULT_TIMEOUT);
        assert!(contexts[0].base_url.is_empty());
    }
}
