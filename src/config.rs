use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::gateway::{GatewaySettings, WebhookAuth};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STORAGE_BACKEND: &str = "database";
const DEFAULT_GATEWAY_URL: &str = "https://api-preprod.phonepe.com/apis/pg-sandbox";

/// Payment gateway connection and webhook authentication
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[validate(url)]
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Per-request timeout for every gateway call
    #[validate(range(min = 1, max = 120))]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries for idempotent status lookups only
    #[validate(range(max = 10))]
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Vendor credential scheme: `Authorization` = sha256(username:password)
    #[serde(default)]
    pub webhook_username: Option<String>,
    #[serde(default)]
    pub webhook_password: Option<String>,

    /// HMAC scheme; takes precedence over the credential scheme when set
    #[serde(default)]
    pub webhook_hmac_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            client_id: String::new(),
            client_secret: String::new(),
            client_version: default_client_version(),
            request_timeout_secs: default_request_timeout_secs(),
            max_read_retries: default_max_read_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            webhook_username: None,
            webhook_password: None,
            webhook_hmac_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn webhook_auth(&self) -> WebhookAuth {
        if let Some(secret) = self.webhook_hmac_secret.as_ref().filter(|s| !s.is_empty()) {
            return WebhookAuth::Hmac {
                secret: secret.clone(),
                tolerance_secs: self.webhook_tolerance_secs,
            };
        }
        match (&self.webhook_username, &self.webhook_password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                WebhookAuth::Credentials {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            _ => WebhookAuth::Disabled,
        }
    }

    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            base_url: self.base_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            client_version: self.client_version.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_read_retries: self.max_read_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            webhook_auth: self.webhook_auth(),
        }
    }
}

/// Order creation and transition tuning
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrdersConfig {
    /// Lifetime of the checkout session handed to the gateway
    #[validate(range(min = 60, max = 86400))]
    #[serde(default = "default_order_ttl_secs")]
    pub order_ttl_secs: u64,

    #[validate(url)]
    #[serde(default = "default_redirect_url")]
    pub default_redirect_url: String,

    /// Compare-and-swap attempts before a transition gives up
    #[validate(range(min = 1, max = 20))]
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            order_ttl_secs: default_order_ttl_secs(),
            default_redirect_url: default_redirect_url(),
            max_commit_attempts: default_max_commit_attempts(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    #[serde(default = "default_true_bool")]
    pub enabled: bool,

    #[validate(range(min = 1))]
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Open orders untouched for this long are polled
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Provisioning left pending longer than this is retried by the sweep
    #[serde(default = "default_provisioning_grace_secs")]
    pub provisioning_grace_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            batch_size: default_batch_size(),
            provisioning_grace_secs: default_provisioning_grace_secs(),
        }
    }
}

/// Downstream case service. Without a URL cases are provisioned in memory.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    #[validate(url)]
    #[serde(default)]
    pub case_service_url: Option<String>,

    #[serde(default)]
    pub case_service_token: Option<String>,

    #[serde(default = "default_provisioning_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            case_service_url: None,
            case_service_token: None,
            timeout_secs: default_provisioning_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// "database" or "in-memory"
    #[validate(custom = "validate_storage_backend")]
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Database connection URL
    pub database_url: String,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// CORS: comma-separated list of allowed origins; permissive when unset in development
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[validate]
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[validate]
    #[serde(default)]
    pub orders: OrdersConfig,

    #[validate]
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[validate]
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// JSON file seeding the in-memory price catalog
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment: DEFAULT_ENV.to_string(),
            log_level: default_log_level(),
            log_json: false,
            storage_backend: default_storage_backend(),
            database_url: "sqlite://payment_orders.db?mode=rwc".to_string(),
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            cors_allowed_origins: None,
            gateway: GatewayConfig::default(),
            orders: OrdersConfig::default(),
            reconciler: ReconcilerConfig::default(),
            provisioning: ProvisioningConfig::default(),
            catalog_path: None,
        }
    }
}

impl AppConfig {
    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn uses_in_memory_storage(&self) -> bool {
        self.storage_backend.eq_ignore_ascii_case("in-memory")
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() {
            if matches!(self.gateway.webhook_auth(), WebhookAuth::Disabled) {
                let mut err = ValidationError::new("webhook_auth_required");
                err.message = Some(
                    "Set APP__GATEWAY__WEBHOOK_USERNAME/APP__GATEWAY__WEBHOOK_PASSWORD or APP__GATEWAY__WEBHOOK_HMAC_SECRET in production".into(),
                );
                errors.add("gateway", err);
            }

            if self.gateway.client_secret.trim().is_empty() {
                let mut err = ValidationError::new("gateway_client_secret_required");
                err.message = Some("Set APP__GATEWAY__CLIENT_SECRET in production".into());
                errors.add("gateway", err);
            }

            if !self.gateway.base_url.starts_with("https://") {
                let mut err = ValidationError::new("gateway_base_url_https");
                err.message = Some("The gateway base URL must use https in production".into());
                errors.add("gateway", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runs derived and cross-field validation.
    pub fn validate_all(&self) -> Result<(), AppConfigError> {
        self.validate()?;
        self.validate_additional_constraints()?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_storage_backend() -> String {
    DEFAULT_STORAGE_BACKEND.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_true_bool() -> bool {
    true
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}
fn default_client_version() -> String {
    "1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_read_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_order_ttl_secs() -> u64 {
    1200 // 20 minutes, matches the gateway's checkout session default
}
fn default_redirect_url() -> String {
    "http://localhost:3000/payment/status".to_string()
}
fn default_max_commit_attempts() -> u32 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_batch_size() -> u64 {
    100
}
fn default_provisioning_grace_secs() -> u64 {
    120
}

fn default_provisioning_timeout_secs() -> u64 {
    10
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_storage_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "database" | "in-memory" => Ok(()),
        _ => {
            let mut err = ValidationError::new("storage_backend");
            err.message = Some("Must be one of: database, in-memory".into());
            Err(err)
        }
    }
}

pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("payment_orders={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::new(filter_directive);

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://payment_orders.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("storage_backend", DEFAULT_STORAGE_BACKEND)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production_config() -> AppConfig {
        AppConfig {
            environment: "production".into(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid_in_development() {
        let config = AppConfig::default();
        assert!(config.validate_all().is_ok());
        assert_eq!(config.orders.order_ttl_secs, 1200);
        assert_eq!(config.gateway.request_timeout_secs, 10);
        assert_eq!(config.orders.max_commit_attempts, 5);
    }

    #[test]
    fn production_requires_webhook_auth_and_client_secret() {
        let err = production_config()
            .validate_additional_constraints()
            .unwrap_err();
        assert!(err.errors().contains_key("gateway"));
    }

    #[test]
    fn production_accepts_fully_configured_gateway() {
        let mut config = production_config();
        config.gateway.client_secret = "live-secret".into();
        config.gateway.webhook_username = Some("merchant".into());
        config.gateway.webhook_password = Some("hook-pass".into());
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn production_rejects_plain_http_gateway() {
        let mut config = production_config();
        config.gateway.client_secret = "live-secret".into();
        config.gateway.webhook_hmac_secret = Some("whsec".into());
        config.gateway.base_url = "http://gateway.internal".into();
        assert!(config.validate_additional_constraints().is_err());
    }

    #[test]
    fn hmac_secret_takes_precedence() {
        let gateway = GatewayConfig {
            webhook_username: Some("merchant".into()),
            webhook_password: Some("pass".into()),
            webhook_hmac_secret: Some("whsec".into()),
            ..GatewayConfig::default()
        };
        assert!(matches!(gateway.webhook_auth(), WebhookAuth::Hmac { .. }));
    }

    #[test]
    fn unknown_storage_backend_is_rejected() {
        let config = AppConfig {
            storage_backend: "redis".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_commit_attempts_are_rejected() {
        let mut config = AppConfig::default();
        config.orders.max_commit_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = AppConfig {
            cors_allowed_origins: Some("https://a.example, ,https://b.example".into()),
            ..AppConfig::default()
        };
        assert_eq!(
            config.cors_origins(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
