use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_GUEST_CART_COOKIE: &str = "guest_cart";
const DEFAULT_GUEST_CART_MAX_AGE_DAYS: i64 = 30;
const DEFAULT_INVOICE_DUE_DAYS: i64 = 14;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: u64 = 60;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_PAYMOB_TOKEN_TTL_SECS: u64 = 3000;

/// PayPal REST credentials
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_paypal_api_base")]
    pub api_base: String,
    /// Overrides `payments.currency` for PayPal orders
    #[serde(default)]
    pub currency: Option<String>,
}

/// Paymob Accept credentials
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymobConfig {
    pub api_key: String,
    #[serde(default = "default_paymob_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub currency: Option<String>,
    /// Integration ids enabled for hosted checkout
    #[serde(default)]
    pub integrations: Vec<i64>,
    /// Paymob does not report token lifetime; tokens are reused for this long
    #[serde(default = "default_paymob_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// Stripe Checkout credentials
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Endpoint secret (`whsec_...`) used to verify `Stripe-Signature`
    pub webhook_secret: String,
    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
}

/// Settings shared by every payment gateway. A gateway without a section is not offered.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentsConfig {
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency")]
    pub currency: String,

    /// Storefront base URL used to build Stripe success/cancel pages
    #[serde(default = "default_frontend_url")]
    #[validate(url)]
    pub frontend_url: String,

    /// Where PayPal sends the shopper after approval
    #[serde(default = "default_return_url")]
    #[validate(url)]
    pub return_url: String,

    #[serde(default = "default_cancel_url")]
    #[validate(url)]
    pub cancel_url: String,

    /// Upper bound for any single outbound gateway call
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,

    /// Access tokens are refreshed when fewer than this many seconds remain
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,

    #[serde(default)]
    pub paypal: Option<PaypalConfig>,

    #[serde(default)]
    pub paymob: Option<PaymobConfig>,

    #[serde(default)]
    pub stripe: Option<StripeConfig>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            frontend_url: default_frontend_url(),
            return_url: default_return_url(),
            cancel_url: default_cancel_url(),
            request_timeout_secs: default_gateway_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            paypal: None,
            paymob: None,
            stripe: None,
        }
    }
}

impl PaymentsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 secret shared with the identity service that issues bearer tokens
    #[validate(custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

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

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Name of the cookie carrying the anonymous cart token
    #[serde(default = "default_guest_cart_cookie")]
    pub guest_cart_cookie: String,

    #[serde(default = "default_guest_cart_max_age_days")]
    #[validate(range(min = 1, max = 365))]
    pub guest_cart_max_age_days: i64,

    /// Mark the guest cart cookie `Secure`
    #[serde(default)]
    pub cookie_secure: bool,

    /// Net payment terms printed on invoices
    #[serde(default = "default_invoice_due_days")]
    #[validate(range(min = 0, max = 365))]
    pub invoice_due_days: i64,

    #[serde(default)]
    #[validate]
    pub payments: PaymentsConfig,
}

impl AppConfig {
    /// Creates a new configuration
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            guest_cart_cookie: default_guest_cart_cookie(),
            guest_cart_max_age_days: default_guest_cart_max_age_days(),
            cookie_secure: false,
            invoice_due_days: default_invoice_due_days(),
            payments: PaymentsConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn guest_cart_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.guest_cart_max_age_days)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if let Some(paypal) = &self.payments.paypal {
            if paypal.client_id.trim().is_empty() || paypal.client_secret.trim().is_empty() {
                let mut err = ValidationError::new("paypal_credentials");
                err.message = Some("payments.paypal requires client_id and client_secret".into());
                errors.add("payments", err);
            }
        }

        if let Some(paymob) = &self.payments.paymob {
            if paymob.api_key.trim().is_empty() {
                let mut err = ValidationError::new("paymob_credentials");
                err.message = Some("payments.paymob requires api_key".into());
                errors.add("payments", err);
            }
            if paymob.integrations.is_empty() {
                let mut err = ValidationError::new("paymob_integrations");
                err.message = Some("payments.paymob requires at least one integration id".into());
                errors.add("payments", err);
            }
        }

        if let Some(stripe) = &self.payments.stripe {
            if stripe.secret_key.trim().is_empty() || stripe.webhook_secret.trim().is_empty() {
                let mut err = ValidationError::new("stripe_credentials");
                err.message = Some("payments.stripe requires secret_key and webhook_secret".into());
                errors.add("payments", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
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

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_guest_cart_cookie() -> String {
    DEFAULT_GUEST_CART_COOKIE.to_string()
}

fn default_guest_cart_max_age_days() -> i64 {
    DEFAULT_GUEST_CART_MAX_AGE_DAYS
}

fn default_invoice_due_days() -> i64 {
    DEFAULT_INVOICE_DUE_DAYS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_return_url() -> String {
    "http://localhost:3000/payment/return".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/payment/cancel".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_token_refresh_margin_secs() -> u64 {
    DEFAULT_TOKEN_REFRESH_MARGIN_SECS
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_paymob_token_ttl_secs() -> u64 {
    DEFAULT_PAYMOB_TOKEN_TTL_SECS
}

fn default_paypal_api_base() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}

fn default_paymob_api_base() -> String {
    "https://accept.paymob.com".to_string()
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

/// Validates log level values
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

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a three-letter ISO 4217 code such as USD".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.len() < 32 {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be at least 32 characters".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("JWT secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("marketplace_api={},tower_http=debug", level);
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

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (`APP__*`, nested with `__`)
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

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET.
    let config = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("payments.paymob.integrations"),
        )
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity service signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        paypal = app_config.payments.paypal.is_some(),
        paymob = app_config.payments.paymob.is_some(),
        stripe = app_config.payments.stripe.is_some(),
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://marketplace.db?mode=memory".into(),
            "super_secure_jwt_secret_that_is_long_enough_123".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_allows_permissive_by_default() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn paymob_without_integrations_is_rejected() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        cfg.payments.paymob = Some(PaymobConfig {
            api_key: "key".into(),
            api_base: default_paymob_api_base(),
            currency: Some("EGP".into()),
            integrations: vec![],
            token_ttl_secs: default_paymob_token_ttl_secs(),
        });
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("payments"));
    }

    #[test]
    fn defaults_pass_field_validation() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn lowercase_currency_is_rejected() {
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("USD").is_ok());
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_secret = "short".into();
        assert!(cfg.validate().is_err());
    }
}
