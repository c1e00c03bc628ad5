use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

const CONFIG_DIR: &str = "config";
const FALLBACK_ENV: &str = "development";
const FALLBACK_DATABASE_URL: &str = "sqlite://tradebook.db?mode=rwc";

/// Runtime settings, sourced from `config/*.toml` and `APP__*` environment
/// variables. Field names double as the environment variable names after the
/// `APP__` prefix.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub database_url: String,

    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// `development` / `test` / `production`; anything but development
    /// tightens the CORS rules.
    pub environment: String,

    #[serde(default = "defaults::log_level")]
    #[validate(custom = "validators::log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the human format.
    #[serde(default)]
    pub log_json: bool,

    /// Run the embedded migrations before serving.
    #[serde(default)]
    pub auto_migrate: bool,

    /// Comma-separated origin allowlist. Mandatory outside development unless
    /// `cors_allow_any_origin` opts out.
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default)]
    pub cors_allow_credentials: bool,

    // Connection pool tuning, passed straight into sea-orm's ConnectOptions.
    #[serde(default = "defaults::db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "defaults::db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "defaults::db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "defaults::db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "defaults::db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
    /// Statement timeout in seconds; unset or 0 disables it.
    #[serde(default)]
    pub db_statement_timeout_secs: Option<u64>,

    /// Tax rate applied when a document does not state its own, as a fraction
    /// (0.08 = 8%).
    #[serde(default)]
    #[validate(custom = "validators::tax_rate")]
    pub default_tax_rate: f64,

    /// Currency code stamped on accounting entries.
    #[serde(default = "defaults::currency")]
    pub default_currency: String,

    /// Bound of the in-process event channel.
    #[serde(default = "defaults::event_channel_capacity")]
    #[validate(range(min = 1, message = "event_channel_capacity must be at least 1"))]
    pub event_channel_capacity: usize,

    /// Page size used when a list request names none.
    #[serde(default = "defaults::api_default_page_size")]
    pub api_default_page_size: u32,

    /// Hard ceiling for `per_page` on list requests.
    #[serde(default = "defaults::api_max_page_size")]
    pub api_max_page_size: u32,
}

mod defaults {
    pub fn port() -> u16 {
        8080
    }
    pub fn log_level() -> String {
        "info".into()
    }
    pub fn db_max_connections() -> u32 {
        16
    }
    pub fn db_min_connections() -> u32 {
        2
    }
    pub fn db_connect_timeout_secs() -> u64 {
        30
    }
    pub fn db_idle_timeout_secs() -> u64 {
        600
    }
    pub fn db_acquire_timeout_secs() -> u64 {
        8
    }
    pub fn currency() -> String {
        "USD".into()
    }
    pub fn event_channel_capacity() -> usize {
        1024
    }
    pub fn api_default_page_size() -> u32 {
        20
    }
    pub fn api_max_page_size() -> u32 {
        100
    }
}

mod validators {
    use super::ValidationError;

    pub fn log_level(level: &str) -> Result<(), ValidationError> {
        match level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => {
                let mut err = ValidationError::new("log_level");
                err.message = Some("Must be one of: trace, debug, info, warn, error".into());
                Err(err)
            }
        }
    }

    pub fn tax_rate(rate: f64) -> Result<(), ValidationError> {
        if rate.is_finite() && (0.0..=1.0).contains(&rate) {
            Ok(())
        } else {
            let mut err = ValidationError::new("default_tax_rate");
            err.message =
                Some("default_tax_rate must be a finite fraction between 0.0 and 1.0".into());
            Err(err)
        }
    }
}

impl AppConfig {
    /// Builds a config from the four essentials, everything else defaulted.
    /// The test harness uses this and then tweaks individual fields.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: defaults::log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            cors_allow_credentials: false,
            db_max_connections: defaults::db_max_connections(),
            db_min_connections: defaults::db_min_connections(),
            db_connect_timeout_secs: defaults::db_connect_timeout_secs(),
            db_idle_timeout_secs: defaults::db_idle_timeout_secs(),
            db_acquire_timeout_secs: defaults::db_acquire_timeout_secs(),
            db_statement_timeout_secs: None,
            default_tax_rate: 0.0,
            default_currency: defaults::currency(),
            event_channel_capacity: defaults::event_channel_capacity(),
            api_default_page_size: defaults::api_default_page_size(),
            api_max_page_size: defaults::api_max_page_size(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// True when at least one non-blank origin is configured.
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Cross-field rules the derive cannot express.
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS, or opt in to permissive CORS with APP__CORS_ALLOW_ANY_ORIGIN=true"
                    .into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let directive = env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("tradebook_api={},tower_http=debug", level));

    if json {
        let _ = fmt().with_env_filter(directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(directive).try_init();
    }
}

/// Loads and validates the application configuration.
///
/// Sources, later ones overriding earlier ones:
/// 1. built-in defaults
/// 2. `config/default.toml`
/// 3. `config/{RUN_ENV}.toml` (`APP_ENV` also selects the profile)
/// 4. `config/docker.toml` when the `DOCKER` variable is present
/// 5. `APP__*` environment variables
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let profile = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| FALLBACK_ENV.to_string());
    info!("Reading configuration, profile: {}", profile);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", FALLBACK_DATABASE_URL)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(defaults::port()))?
        .set_default("environment", FALLBACK_ENV)?
        .set_default("log_level", defaults::log_level())?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, profile)).required(false));

    if env::var("DOCKER").is_ok() {
        info!("DOCKER is set; layering config/docker.toml");
        builder =
            builder.add_source(File::with_name(&format!("{}/docker", CONFIG_DIR)).required(false));
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = settings.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;
    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration ready");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production_config() -> AppConfig {
        AppConfig::new(
            "sqlite://tradebook.db?mode=memory".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn production_without_origins_is_rejected() {
        let cfg = production_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn any_origin_flag_satisfies_production() {
        let mut cfg = production_config();
        cfg.cors_allow_any_origin = true;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn explicit_origin_list_satisfies_production() {
        let mut cfg = production_config();
        cfg.cors_allowed_origins = Some("https://example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_needs_no_cors_settings() {
        let mut cfg = production_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn blank_origin_list_does_not_count() {
        let mut cfg = production_config();
        cfg.cors_allowed_origins = Some(" , ,".into());
        assert!(!cfg.has_cors_allowed_origins());
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn tax_rate_must_be_a_fraction() {
        let mut cfg = production_config();
        cfg.cors_allow_any_origin = true;
        cfg.default_tax_rate = 1.5;
        assert!(cfg.validate().is_err());
        cfg.default_tax_rate = 0.08;
        assert!(cfg.validate().is_ok());
    }
}
