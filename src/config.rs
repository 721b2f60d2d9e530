use crate::models::DiscountTier;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
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
const DEFAULT_DATABASE_URL: &str = "sqlite://enrollment.db?mode=rwc";
const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.stripe.com";
const DEFAULT_BASE_PRICE_CENTS: i64 = 33_300;

/// Payment provider settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Provider backend: "stripe" or "in-memory"
    #[serde(default = "default_payment_backend")]
    #[validate(custom = "validate_payment_backend")]
    pub backend: String,

    /// Provider REST API base URL
    #[serde(default = "default_provider_base_url")]
    #[validate(url)]
    pub api_base_url: String,

    /// Provider secret API key
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Price reference of the single course product
    #[serde(default = "default_price_id")]
    #[validate(length(min = 1))]
    pub price_id: String,

    /// Where the hosted page sends the visitor after paying
    #[serde(default = "default_success_url")]
    pub success_url: String,

    /// Where the hosted page sends the visitor when they back out
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,

    /// Timeout for every provider call (seconds)
    #[serde(default = "default_provider_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub request_timeout_secs: u64,

    /// Attempts for checkout session creation, including the first
    #[serde(default = "default_session_create_attempts")]
    #[validate(range(min = 1, max = 2))]
    pub session_create_attempts: u32,

    /// Delay before retrying session creation (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            backend: default_payment_backend(),
            api_base_url: default_provider_base_url(),
            secret_key: None,
            price_id: default_price_id(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
            request_timeout_secs: default_provider_timeout_secs(),
            session_create_attempts: default_session_create_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl PaymentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn uses_stripe(&self) -> bool {
        self.backend.eq_ignore_ascii_case("stripe")
    }
}

/// Course price and the discount tiers advertised on the site
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// The single system-wide base price (cents)
    #[serde(default = "default_base_price_cents")]
    pub base_price_cents: i64,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "default_tiers")]
    pub tiers: Vec<DiscountTier>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_price_cents: default_base_price_cents(),
            currency: default_currency(),
            tiers: default_tiers(),
        }
    }
}

impl PricingConfig {
    /// Tier advertised under `code`, matched case-insensitively.
    pub fn tier_for_code(&self, code: &str) -> Option<&DiscountTier> {
        let wanted = crate::models::canonical_code(code);
        self.tiers
            .iter()
            .find(|tier| crate::models::canonical_code(&tier.code) == wanted)
    }

    fn check(&self, errors: &mut ValidationErrors) {
        if self.base_price_cents <= 0 {
            let mut err = ValidationError::new("base_price_cents");
            err.message = Some("base price must be positive".into());
            errors.add("pricing", err);
        }

        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if tier.amount_off_cents <= 0 || tier.amount_off_cents > self.base_price_cents {
                let mut err = ValidationError::new("tier_amount_off");
                err.message = Some(
                    format!(
                        "tier {} discount must be positive and not exceed the base price",
                        tier.code
                    )
                    .into(),
                );
                errors.add("pricing", err);
            }
            if tier.max_redemptions == 0 {
                let mut err = ValidationError::new("tier_max_redemptions");
                err.message =
                    Some(format!("tier {} needs a redemption ceiling", tier.code).into());
                errors.add("pricing", err);
            }
            if !seen.insert(crate::models::canonical_code(&tier.code)) {
                let mut err = ValidationError::new("tier_duplicate_code");
                err.message = Some(format!("tier code {} is configured twice", tier.code).into());
                errors.add("pricing", err);
            }
        }
    }
}

/// Spreadsheet relay webhook
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Unset disables the relay
    #[serde(default)]
    #[validate(url)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_relay_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub timeout_secs: u64,

    #[serde(default = "default_relay_attempts")]
    #[validate(range(min = 1, max = 5))]
    pub max_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_relay_timeout_secs(),
            max_attempts: default_relay_attempts(),
        }
    }
}

/// Payment status polling cadence
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 100))]
    pub interval_ms: u64,

    #[serde(default = "default_poll_ceiling_secs")]
    #[validate(range(min = 1))]
    pub ceiling_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            ceiling_secs: default_poll_ceiling_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }
}

/// Rule deciding whether obviously-test email addresses may sign up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TestEmailRule {
    /// Every syntactically valid address is accepted
    #[default]
    Allow,
    /// Addresses whose domain is exactly one of `domains` are rejected
    RejectDomains { domains: Vec<String> },
}

/// Lead intake policy
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeadPolicyConfig {
    #[serde(default)]
    pub test_email_rule: TestEmailRule,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
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

    /// Upper bound for handling one HTTP request (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

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

    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    #[validate]
    pub relay: RelayConfig,

    #[serde(default)]
    #[validate]
    pub polling: PollingConfig,

    #[serde(default)]
    pub leads: LeadPolicyConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            request_timeout_secs: default_request_timeout_secs(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            payment: PaymentConfig::default(),
            pricing: PricingConfig::default(),
            relay: RelayConfig::default(),
            polling: PollingConfig::default(),
            leads: LeadPolicyConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
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

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        let has_secret = self
            .payment
            .secret_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false);
        if self.payment.uses_stripe() && !has_secret {
            let mut err = ValidationError::new("payment_secret_key_required");
            err.message = Some(
                "The stripe backend needs APP__PAYMENT__SECRET_KEY to be set".into(),
            );
            errors.add("payment", err);
        }

        if !self.is_development() && !self.payment.uses_stripe() {
            let mut err = ValidationError::new("payment_backend_in_memory");
            err.message = Some(
                "The in-memory payment backend is only available in development".into(),
            );
            errors.add("payment", err);
        }

        self.pricing.check(&mut errors);

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runs derive-based and cross-field validation.
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.validate_additional_constraints()
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

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_secs() -> u64 {
    45
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
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

fn default_payment_backend() -> String {
    "in-memory".to_string()
}
fn default_provider_base_url() -> String {
    DEFAULT_PROVIDER_BASE_URL.to_string()
}
fn default_price_id() -> String {
    "price_course_enrollment".to_string()
}
fn default_success_url() -> String {
    "http://localhost:3000/payment/success?session_id={CHECKOUT_SESSION_ID}".to_string()
}
fn default_cancel_url() -> String {
    "http://localhost:3000/course".to_string()
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_session_create_attempts() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_base_price_cents() -> i64 {
    DEFAULT_BASE_PRICE_CENTS
}
fn default_currency() -> String {
    "usd".to_string()
}
fn default_tiers() -> Vec<DiscountTier> {
    vec![
        DiscountTier {
            code: "EARLY36".to_string(),
            coupon_id: "coupon_early36".to_string(),
            amount_off_cents: 29_700,
            max_redemptions: 100,
        },
        DiscountTier {
            code: "SAVE70".to_string(),
            coupon_id: "coupon_save70".to_string(),
            amount_off_cents: 26_300,
            max_redemptions: 400,
        },
    ]
}

fn default_relay_timeout_secs() -> u64 {
    10
}
fn default_relay_attempts() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_poll_ceiling_secs() -> u64 {
    300
}

fn validate_payment_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "stripe" | "in-memory" => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_backend");
            err.message = Some("Must be one of: stripe, in-memory".into());
            Err(err)
        }
    }
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

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("enrollment_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    fn production_ready() -> AppConfig {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://course.example.com".into());
        cfg.payment.backend = "stripe".into();
        cfg.payment.secret_key = Some("sk_live_abc".into());
        cfg
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let mut cfg = production_ready();
        cfg.cors_allowed_origins = None;
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.cors_allow_any_origin = true;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn stripe_backend_requires_secret_key() {
        let mut cfg = production_ready();
        cfg.payment.secret_key = Some("   ".into());
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.errors().contains_key("payment"));
    }

    #[test]
    fn in_memory_backend_is_development_only() {
        let mut cfg = production_ready();
        cfg.payment.backend = "in-memory".into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn discount_may_not_exceed_base_price() {
        let mut cfg = production_ready();
        cfg.pricing.tiers[0].amount_off_cents = cfg.pricing.base_price_cents + 1;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn duplicate_tier_codes_are_rejected() {
        let mut cfg = production_ready();
        cfg.pricing.tiers[1].code = "early36".into();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn session_creation_retries_at_most_once() {
        let mut cfg = production_ready();
        cfg.payment.session_create_attempts = 2;
        assert!(cfg.validate_all().is_ok());

        cfg.payment.session_create_attempts = 3;
        let errors = cfg.validate_all().unwrap_err();
        assert!(errors.errors().contains_key("payment"));
    }

    #[test]
    fn default_tiers_match_advertised_prices() {
        let pricing = PricingConfig::default();
        let early = pricing.tier_for_code("early36").unwrap();
        let regular = pricing.tier_for_code("SAVE70").unwrap();
        assert_eq!(early.final_charge_cents(pricing.base_price_cents), 3_600);
        assert_eq!(early.max_redemptions, 100);
        assert_eq!(regular.final_charge_cents(pricing.base_price_cents), 7_000);
        assert_eq!(regular.max_redemptions, 400);
    }

    #[test]
    fn loads_layered_toml() {
        let dir = TempDir::new().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
            database_url = "sqlite::memory:"
            port = 9090

            [payment]
            price_id = "price_test_123"

            [polling]
            interval_ms = 1000

            [leads.test_email_rule]
            mode = "reject_domains"
            domains = ["example.com"]
            "#
        )
        .unwrap();

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.payment.price_id, "price_test_123");
        assert_eq!(cfg.polling.interval(), Duration::from_secs(1));
        assert_eq!(cfg.polling.ceiling(), Duration::from_secs(300));
        assert_eq!(
            cfg.leads.test_email_rule,
            TestEmailRule::RejectDomains {
                domains: vec!["example.com".into()]
            }
        );
    }
}
