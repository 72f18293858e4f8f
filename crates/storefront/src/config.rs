//! Storefront configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string (fallback `DATABASE_URL`)
//! - `STOREFRONT_BASE_URL` - Public URL for the storefront
//! - `EP_API_BASE_URL` - Commerce platform API root
//! - `EP_CLIENT_ID` - Commerce platform client-credentials ID
//! - `EP_CLIENT_SECRET` - Commerce platform client-credentials secret
//! - `STRIPE_SECRET_KEY` - Payment processor secret key
//!
//! ## Optional
//! - `STOREFRONT_HOST` - Bind address (default: 127.0.0.1)
//! - `STOREFRONT_PORT` - Listen port (default: 3000)
//! - `STOREFRONT_CURRENCY` - Default currency for delivery prices (default: USD)
//! - `STRIPE_API_BASE_URL` - Processor API root (default: <https://api.stripe.com>)
//! - `SHIPPING_RATES_URL` - Delivery rate endpoint; a static table is used when unset
//! - `CHECKOUT_DEFAULT_GATEWAY` - Card gateway (default: `elastic_path_payments_stripe`)
//! - `CHECKOUT_STANDARD_SHIPPING` - Free delivery token (default: standard)
//! - `CHECKOUT_CONTINUE_ON_PROCESSOR_ERROR` - Continue past processor errors (default: false)
//! - `CHECKOUT_RETURN_URL` - Post-authentication return URL
//!   (default: `<base_url>/checkout/confirmation`)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name
//! - `SENTRY_SAMPLE_RATE` - Error event sample rate (default: 1.0)
//! - `SENTRY_TRACES_SAMPLE_RATE` - Transaction sample rate (default: 0.0)

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use composable_core::CurrencyCode;

use crate::checkout::CheckoutSettings;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

const DEFAULT_GATEWAY: &str = "elastic_path_payments_stripe";
const DEFAULT_STANDARD_SHIPPING: &str = "standard";
const DEFAULT_STRIPE_API_BASE_URL: &str = "https://api.stripe.com";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Storefront application configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL for the storefront
    pub base_url: String,
    /// Currency used when a delivery rate carries none
    pub currency: CurrencyCode,
    /// Commerce platform API configuration
    pub commerce: CommerceConfig,
    /// Payment processor API configuration
    pub payments: PaymentsConfig,
    /// Delivery rate endpoint
    pub shipping_rates_url: Option<String>,
    /// Checkout behaviour
    pub checkout: CheckoutSettings,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    pub sentry_environment: Option<String>,
    pub sentry_sample_rate: f32,
    pub sentry_traces_sample_rate: f32,
}

/// Commerce platform API configuration.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct CommerceConfig {
    /// API root, e.g. `https://useast.api.elasticpath.com`
    pub api_base_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

impl std::fmt::Debug for CommerceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommerceConfig")
            .field("api_base_url", &self.api_base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Payment processor API configuration.
///
/// Implements `Debug` manually to redact secret fields.
#[derive(Clone)]
pub struct PaymentsConfig {
    pub api_base_url: String,
    pub secret_key: SecretString,
}

impl std::fmt::Debug for PaymentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentsConfig")
            .field("api_base_url", &self.api_base_url)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl StorefrontConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("STOREFRONT_DATABASE_URL")?;
        let host = get_parsed_or_default::<IpAddr>("STOREFRONT_HOST", "127.0.0.1")?;
        let port = get_parsed_or_default::<u16>("STOREFRONT_PORT", "3000")?;
        let base_url = get_required_env("STOREFRONT_BASE_URL")?;
        let base_url = validate_url("STOREFRONT_BASE_URL", base_url)?
            .trim_end_matches('/')
            .to_string();
        let currency = CurrencyCode::parse(&get_env_or_default("STOREFRONT_CURRENCY", "USD"))
            .map_err(|e| {
                ConfigError::InvalidEnvVar("STOREFRONT_CURRENCY".to_string(), e.to_string())
            })?;

        let commerce = CommerceConfig::from_env()?;
        let payments = PaymentsConfig::from_env()?;
        let shipping_rates_url = get_optional_env("SHIPPING_RATES_URL")
            .map(|url| validate_url("SHIPPING_RATES_URL", url))
            .transpose()?;
        let checkout = checkout_settings_from_env(&base_url)?;

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            currency,
            commerce,
            payments,
            shipping_rates_url,
            checkout,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
            sentry_sample_rate: get_parsed_or_default("SENTRY_SAMPLE_RATE", "1.0")?,
            sentry_traces_sample_rate: get_parsed_or_default("SENTRY_TRACES_SAMPLE_RATE", "0.0")?,
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether cookies should carry the `Secure` attribute.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

impl CommerceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: validate_url("EP_API_BASE_URL", get_required_env("EP_API_BASE_URL")?)?,
            client_id: get_required_env("EP_CLIENT_ID")?,
            client_secret: get_validated_secret("EP_CLIENT_SECRET")?,
        })
    }
}

impl PaymentsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: validate_url(
                "STRIPE_API_BASE_URL",
                get_env_or_default("STRIPE_API_BASE_URL", DEFAULT_STRIPE_API_BASE_URL),
            )?,
            secret_key: get_validated_secret("STRIPE_SECRET_KEY")?,
        })
    }
}

fn checkout_settings_from_env(base_url: &str) -> Result<CheckoutSettings, ConfigError> {
    const CONTINUE_KEY: &str = "CHECKOUT_CONTINUE_ON_PROCESSOR_ERROR";
    let continue_on_processor_error = parse_flag(CONTINUE_KEY, get_optional_env(CONTINUE_KEY))?;

    Ok(CheckoutSettings {
        default_gateway: get_env_or_default("CHECKOUT_DEFAULT_GATEWAY", DEFAULT_GATEWAY),
        standard_shipping: get_env_or_default(
            "CHECKOUT_STANDARD_SHIPPING",
            DEFAULT_STANDARD_SHIPPING,
        ),
        continue_on_processor_error,
        return_url: get_optional_env("CHECKOUT_RETURN_URL")
            .map(|url| validate_url("CHECKOUT_RETURN_URL", url))
            .transpose()?
            .unwrap_or_else(|| format!("{base_url}/checkout/confirmation")),
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get database URL with fallback to generic `DATABASE_URL` (used by Fly.io postgres attach).
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional environment variable. Empty values count as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset.
fn get_parsed_or_default<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Reject values that are not absolute `http(s)` URLs.
fn validate_url(key: &str, value: String) -> Result<String, ConfigError> {
    let parsed = Url::parse(&value)
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            format!("unsupported scheme {}", parsed.scheme()),
        ));
    }
    Ok(value)
}

/// Parse a boolean flag. Unset means false.
fn parse_flag(key: &str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            format!("expected a boolean, got '{other}'"),
        )),
    }
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use the credential issued by the provider."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> StorefrontConfig {
        StorefrontConfig {
            database_url: SecretString::from("postgres://localhost/test"),
            host: "127.0.0.1".parse().unwrap(),
            port: 3000,
            base_url: base_url.to_string(),
            currency: CurrencyCode::usd(),
            commerce: CommerceConfig {
                api_base_url: "https://api.test".to_string(),
                client_id: "client_id_value".to_string(),
                client_secret: SecretString::from("super_secret_client_secret"),
            },
            payments: PaymentsConfig {
                api_base_url: DEFAULT_STRIPE_API_BASE_URL.to_string(),
                secret_key: SecretString::from("sk_test_super_secret_key"),
            },
            shipping_rates_url: None,
            checkout: CheckoutSettings {
                default_gateway: DEFAULT_GATEWAY.to_string(),
                standard_shipping: DEFAULT_STANDARD_SHIPPING.to_string(),
                continue_on_processor_error: false,
                return_url: format!("{base_url}/checkout/confirmation"),
            },
            sentry_dsn: None,
            sentry_environment: None,
            sentry_sample_rate: 1.0,
            sentry_traces_sample_rate: 0.0,
        }
    }

    #[test]
    fn test_shannon_entropy_empty() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_single_char() {
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_two_chars() {
        let entropy = shannon_entropy("ab");
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_validate_secret_strength_placeholder() {
        let result = validate_secret_strength("your-client-secret-here", "EP_CLIENT_SECRET");
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_validate_secret_strength_low_entropy() {
        let result = validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "STRIPE_SECRET_KEY");
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_validate_secret_strength_valid() {
        let result = validate_secret_strength("sk_test_aB3xY9mK2nL5pQ7rT0uW4zC6", "STRIPE_SECRET_KEY");
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_flag() {
        assert!(!parse_flag("FLAG", None).unwrap());
        assert!(parse_flag("FLAG", Some("TRUE".into())).unwrap());
        assert!(parse_flag("FLAG", Some("1".into())).unwrap());
        assert!(!parse_flag("FLAG", Some("off".into())).unwrap());
        assert!(matches!(
            parse_flag("FLAG", Some("maybe".into())),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("URL", "https://api.test/v2".into()).is_ok());
        assert!(matches!(
            validate_url("URL", "api.test".into()),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
        assert!(matches!(
            validate_url("URL", "ftp://api.test".into()),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
    }

    #[test]
    fn test_socket_addr() {
        let addr = config("http://localhost:3000").socket_addr();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 3000);
    }

    #[test]
    fn test_secure_cookies_follow_base_url() {
        assert!(!config("http://localhost:3000").is_secure());
        assert!(config("https://shop.test").is_secure());
    }

    #[test]
    fn test_config_debug_redacts_secrets() {
        let debug_output = format!("{:?}", config("http://localhost:3000"));

        assert!(debug_output.contains("client_id_value"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_client_secret"));
        assert!(!debug_output.contains("sk_test_super_secret_key"));
    }
}
