// Config loading: YAML base file, optional override file, ${VAR:-default} expansion, env overrides.
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/aigentic.yaml";
pub const DEFAULT_OVERRIDE_PATH: &str = "data/config/aigentic.override.yaml";
const DEV_SECRET_KEY: &str = "aigentic-dev-secret-change-me";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            cors: CorsConfig::default(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            worker: WorkerConfig::default(),
            subscription: SubscriptionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    pub fn is_development(&self) -> bool {
        matches!(
            self.environment.trim().to_ascii_lowercase().as_str(),
            "development" | "dev" | "local"
        )
    }
}

fn default_environment() -> String {
    "development".to_string()
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
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key: String,
    pub algorithm: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
    /// Seeds `admin` / `admin123` on startup in development.
    pub seed_default_admin: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: DEV_SECRET_KEY.to_string(),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 1440,
            refresh_token_expire_days: 7,
            seed_default_admin: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub db_path: String,
    /// `postgres://…` selects Postgres, `sqlite://path` overrides `db_path`.
    pub database_url: String,
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: "./data/aigentic.db".to_string(),
            database_url: String::new(),
            postgres: PostgresConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub dsn: String,
    pub connect_timeout_s: u64,
    pub pool_size: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            connect_timeout_s: 5,
            pool_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_output: Option<u32>,
    pub timeout_s: u64,
    /// Answer with a canned completion when no API key is configured.
    pub mock_if_unconfigured: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_output: Some(2000),
            timeout_s: 120,
            mock_if_unconfigured: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub task_timeout_s: u64,
    pub task_retention_days: i64,
    pub cleanup_interval_s: u64,
    pub analytics_interval_s: u64,
    pub memory_retention_days: i64,
    /// Old memories below this relevance are deleted by the cleanup job.
    pub memory_min_relevance: f64,
    pub memory_decay_window_days: i64,
    pub memory_decay_per_day: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 256,
            task_timeout_s: 1800,
            task_retention_days: 30,
            cleanup_interval_s: 24 * 3600,
            analytics_interval_s: 3600,
            memory_retention_days: 90,
            memory_min_relevance: 0.3,
            memory_decay_window_days: 30,
            memory_decay_per_day: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub free_monthly_tasks: i64,
    pub basic_monthly_tasks: i64,
    pub pro_monthly_tasks: i64,
    /// Negative means unlimited.
    pub enterprise_monthly_tasks: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            free_monthly_tasks: 10,
            basic_monthly_tasks: 100,
            pro_monthly_tasks: 500,
            enterprise_monthly_tasks: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_file: Option<String>,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            json_logs: false,
        }
    }
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom("port out of range"))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom("port out of range"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u16, E> {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| E::custom("invalid port"))
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn load_config() -> Config {
    let base_path =
        env::var("AIGENTIC_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let override_path = env::var("AIGENTIC_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string());

    let mut merged = read_yaml(&base_path);
    if Path::new(&override_path).exists() {
        let override_value = read_yaml(&override_path);
        merge_yaml(&mut merged, override_value);
    }
    expand_yaml_env(&mut merged);

    let mut config = if merged.is_null() {
        Config::default()
    } else {
        serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
            warn!("config parse failed, falling back to defaults: {err}");
            Config::default()
        })
    };
    apply_env_overrides(&mut config, |name| env::var(name).ok());
    config
}

/// Well-known deployment variables win over the YAML file.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

    if let Some(value) = get("ENVIRONMENT") {
        config.environment = value;
    }
    if let Some(value) = get("API_HOST") {
        config.server.host = value;
    }
    if let Some(port) = get("API_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.server.port = port;
    }
    if let Some(value) = get("ALLOWED_ORIGINS") {
        let origins = value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if !origins.is_empty() {
            config.cors.allow_origins = Some(origins);
        }
    }
    if let Some(value) = get("SECRET_KEY") {
        config.security.secret_key = value;
    }
    if let Some(value) = get("ALGORITHM") {
        config.security.algorithm = value;
    }
    if let Some(minutes) = get("ACCESS_TOKEN_EXPIRE_MINUTES").and_then(|value| value.parse().ok()) {
        config.security.access_token_expire_minutes = minutes;
    }
    if let Some(days) = get("REFRESH_TOKEN_EXPIRE_DAYS").and_then(|value| value.parse().ok()) {
        config.security.refresh_token_expire_days = days;
    }
    if let Some(value) = get("DATABASE_URL") {
        config.storage.database_url = value;
    }
    if let Some(value) = get("LLM_PROVIDER") {
        config.llm.provider = value;
    }
    if let Some(value) = get("OPENAI_API_KEY") {
        config.llm.api_key = Some(value);
    }
    if let Some(value) = get("OPENAI_API_BASE") {
        config.llm.base_url = Some(value);
    }
    if let Some(value) = get("OPENAI_MODEL") {
        config.llm.model = value;
    }
    if let Some(value) = get("FREE_TIER_MONTHLY_TASKS").and_then(|value| value.parse().ok()) {
        config.subscription.free_monthly_tasks = value;
    }
    if let Some(value) = get("BASIC_TIER_MONTHLY_TASKS").and_then(|value| value.parse().ok()) {
        config.subscription.basic_monthly_tasks = value;
    }
    if let Some(value) = get("PRO_TIER_MONTHLY_TASKS").and_then(|value| value.parse().ok()) {
        config.subscription.pro_monthly_tasks = value;
    }
    if let Some(value) = get("LOG_LEVEL") {
        config.observability.log_level = value;
    }
    if let Some(value) = get("LOG_FILE") {
        config.observability.log_file = Some(value);
    }
}

fn read_yaml(path: &str) -> Value {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("config file unreadable: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("config yaml invalid: {path}, {err}");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("AIGENTIC_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${AIGENTIC_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        assert_eq!(
            expand_env_placeholders("sqlite://${AIGENTIC_TEST_PLACEHOLDER:-./data/app.db}"),
            "sqlite://./data/app.db"
        );

        std::env::set_var("AIGENTIC_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${AIGENTIC_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("AIGENTIC_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${AIGENTIC_TEST_PLACEHOLDER}"), "");
    }

    #[test]
    fn env_overrides_replace_yaml_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://app:pw@db/aigentic"),
            ("SECRET_KEY", "prod-secret"),
            ("API_PORT", "9100"),
            ("ALLOWED_ORIGINS", "http://localhost:3000, https://app.example.com"),
            ("ENVIRONMENT", "production"),
            ("FREE_TIER_MONTHLY_TASKS", "25"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|value| value.to_string()));

        assert_eq!(config.storage.database_url, "postgres://app:pw@db/aigentic");
        assert_eq!(config.security.secret_key, "prod-secret");
        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.cors.allow_origins,
            Some(vec![
                "http://localhost:3000".to_string(),
                "https://app.example.com".to_string()
            ])
        );
        assert!(!config.is_development());
        assert_eq!(config.subscription.free_monthly_tasks, 25);
    }

    #[test]
    fn yaml_sections_fill_missing_fields_with_defaults() {
        let yaml = "server:\n  host: 127.0.0.1\n  port: \"8080\"\nworker:\n  concurrency: 2\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.task_timeout_s, 1800);
        assert_eq!(config.security.access_token_expire_minutes, 1440);
        assert_eq!(config.subscription.enterprise_monthly_tasks, -1);
    }
}
