use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `VARIANT_EXPRESS__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Public paths the collaborator mounts the service under.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_site_path")]
    pub site_path: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: usize,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Embed raw per-variant counters in site responses.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_directory")]
    pub directory: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Attribute string appended to the session cookie.
    #[serde(default = "default_cookie_settings")]
    pub cookie_settings: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationConfig {
    /// Empty or containing `*` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub require_session: bool,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_site_path() -> String {
    "/site".to_string()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_redis_enabled() -> bool {
    true
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_retry_count() -> u32 {
    5
}
fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_session_ttl_secs() -> u64 {
    60 * 60 * 24 * 30
}
fn default_max_payload_length() -> usize {
    1024
}
fn default_max_key_length() -> usize {
    crate::key::DEFAULT_MAX_KEY_LENGTH
}
fn default_epsilon() -> f64 {
    0.2
}
fn default_models_directory() -> String {
    "./sites".to_string()
}
fn default_refresh_interval_secs() -> u64 {
    60
}
fn default_cookie_name() -> String {
    "variant_session".to_string()
}
fn default_cookie_settings() -> String {
    "Path=/; HttpOnly; SameSite=Lax; Max-Age=2592000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            site_path: default_site_path(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            urls: default_redis_urls(),
            retry_count: default_retry_count(),
            retry_interval_ms: default_retry_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_payload_length: default_max_payload_length(),
            max_key_length: default_max_key_length(),
            epsilon: default_epsilon(),
            debug: false,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: default_models_directory(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            cookie_settings: default_cookie_settings(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            models: ModelsConfig::default(),
            sessions: SessionsConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("VARIANT_EXPRESS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls")
                .with_list_parse_key("validation.allowed_origins"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
