use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::adaptor::TaskAdaptor;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Doubao,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Doubao => "doubao",
        }
    }
}

/// One configured upstream connection. Loaded once and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelContext {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub default_quota: i64,
    pub model_quota: HashMap<String, i64>,
    /// Provider specific knobs, e.g. `{"protocol": "envelope"}`.
    pub settings: JsonValue,
}

impl ChannelContext {
    pub fn new(
        channel_id: i64,
        channel_type: ChannelType,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            channel_id,
            channel_type,
            name: channel_type.as_str().to_string(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
            default_quota: 0,
            model_quota: HashMap::new(),
            settings: JsonValue::Null,
        }
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|value| value.as_str())
    }

    /// Units charged for one successful task of `model`.
    pub fn quota_for(&self, model: &str) -> i64 {
        self.model_quota
            .get(model)
            .copied()
            .unwrap_or(self.default_quota)
    }
}

/// A channel resolved from the registry: its context plus the bound adaptor.
#[derive(Clone)]
pub struct RegisteredChannel {
    pub context: Arc<ChannelContext>,
    pub adaptor: Arc<dyn TaskAdaptor>,
}

impl std::fmt::Debug for RegisteredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredChannel")
            .field("channel_id", &self.context.channel_id)
            .field("adaptor", &self.adaptor.channel_name())
            .finish()
    }
}
