// Config loading: base YAML, override merge, and env placeholder expansion.
use crate::channels::types::ConnectionStatus;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/relay.yaml";
pub const DEFAULT_OVERRIDE_PATH: &str = "data/config/relay.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub tenants: TenantsConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub app_secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub retention_s: u64,
    pub sweep_interval_s: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_s: 3600,
            sweep_interval_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBindingConfig {
    pub channel_id: String,
    pub credential: String,
    #[serde(default)]
    pub display_name: String,
    pub tenant_id: String,
    #[serde(default)]
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub cache_ttl_s: u64,
    #[serde(default)]
    pub bindings: Vec<ChannelBindingConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_s: 300,
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicyConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub automation_enabled: bool,
    #[serde(default)]
    pub batch_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantsConfig {
    pub cache_ttl_s: u64,
    #[serde(default)]
    pub policies: Vec<TenantPolicyConfig>,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_s: 60,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_wait_ms: u64,
    pub overload_depth: usize,
    pub overload_age_ms: i64,
    pub hard_timeout_s: u64,
    #[serde(default)]
    pub eager_first_message: bool,
    pub history_limit: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_wait_ms: 1000,
            overload_depth: 5,
            overload_age_ms: 10_000,
            hard_timeout_s: 300,
            eager_first_message: false,
            history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub exact_window_ms: i64,
    pub fuzzy_window_ms: i64,
    pub generation_ttl_ms: i64,
    pub fuzzy_min_len: usize,
    #[serde(default)]
    pub strict_matching: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            exact_window_ms: 10_000,
            fuzzy_window_ms: 60_000,
            generation_ttl_ms: 600_000,
            fuzzy_min_len: 4,
            strict_matching: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    pub interval_s: u64,
    pub queue_idle_s: u64,
    pub lock_ceiling_s: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_s: 60,
            queue_idle_s: 300,
            lock_ceiling_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout_s: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v20.0".to_string(),
            timeout_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_s: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_s: 120,
        }
    }
}

impl Config {
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup.retention_s.max(1))
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dedup.sweep_interval_s.max(1))
    }

    pub fn find_binding(&self, channel_id: &str) -> Option<&ChannelBindingConfig> {
        let cleaned = channel_id.trim();
        self.channels
            .bindings
            .iter()
            .find(|binding| binding.channel_id.trim() == cleaned)
    }

    pub fn find_policy(&self, tenant_id: &str) -> Option<&TenantPolicyConfig> {
        let cleaned = tenant_id.trim();
        self.tenants
            .policies
            .iter()
            .find(|policy| policy.tenant_id.trim() == cleaned)
    }
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl Visitor<'_> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 number or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("empty port"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn config_path() -> String {
    env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

pub fn override_path() -> String {
    env::var("RELAY_CONFIG_OVERRIDE_PATH").unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string())
}

pub fn load_config() -> Config {
    load_config_from(&config_path(), &override_path())
}

pub fn load_config_from(base_path: &str, override_path: &str) -> Config {
    // Defaults underneath, so a partial section keeps the remaining fields.
    let mut merged = serde_yaml::to_value(Config::default()).unwrap_or(Value::Null);
    merge_yaml(&mut merged, read_yaml(base_path));
    if Path::new(override_path).exists() {
        let override_value = read_yaml(override_path);
        // Only non-null override fields win, so a partial override never blanks the base.
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, falling back to defaults: {err}");
        Config::default()
    })
}

pub fn load_base_config_value(base_path: &str) -> Value {
    let mut base = read_yaml(base_path);
    expand_yaml_env(&mut base);
    base
}

fn read_yaml(path: &str) -> Value {
    // A missing config file is fine on first boot.
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("read config failed: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("parse yaml failed: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}
