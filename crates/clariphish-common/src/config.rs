//! Configuration for ClariPhish

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Minimum accepted length for the admin credential
pub const MIN_ADMIN_TOKEN_LEN: usize = 32;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "CLARIPHISH_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Admin API configuration
    pub api: ApiConfig,

    /// Public tracking surface configuration
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Email dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Tracking write outbox configuration
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL used when a campaign does not set its own
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            public_url: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Admin API configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bearer credential for the admin API. Must be supplied externally.
    pub admin_token: String,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("admin_token", &"<redacted>")
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

/// Public tracking surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Where invalid click links are redirected
    #[serde(default = "default_fallback_redirect")]
    pub fallback_redirect: String,

    /// Heading of the page shown after a recipient reports the email
    #[serde(default = "default_report_title")]
    pub report_title: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            fallback_redirect: default_fallback_redirect(),
            report_title: default_report_title(),
        }
    }
}

fn default_fallback_redirect() -> String {
    "/".to_string()
}

fn default_report_title() -> String {
    "Thank You!".to_string()
}

/// Email dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pause between two sends of the same campaign
    #[serde(default = "default_inter_send_delay")]
    pub inter_send_delay_ms: u64,

    /// Upper bound for a single SMTP send
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inter_send_delay_ms: default_inter_send_delay(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

fn default_inter_send_delay() -> u64 {
    100
}

fn default_send_timeout() -> u64 {
    30
}

/// Outbox for tracking writes that hit a storage fault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// In-memory queue capacity
    #[serde(default = "default_outbox_capacity")]
    pub capacity: usize,

    /// Attempts before a write is spooled to disk
    #[serde(default = "default_outbox_attempts")]
    pub max_attempts: u32,

    /// First retry delay, doubled on every attempt
    #[serde(default = "default_outbox_backoff")]
    pub base_backoff_ms: u64,

    /// JSON-lines spool replayed at startup
    #[serde(default = "default_spool_path")]
    pub spool_path: PathBuf,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_outbox_capacity(),
            max_attempts: default_outbox_attempts(),
            base_backoff_ms: default_outbox_backoff(),
            spool_path: default_spool_path(),
        }
    }
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_outbox_attempts() -> u32 {
    5
}

fn default_outbox_backoff() -> u64 {
    200
}

fn default_spool_path() -> PathBuf {
    PathBuf::from("/var/lib/clariphish/outbox.jsonl")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file and `CLARIPHISH__SECTION__KEY` environment overrides
    pub fn load() -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();

        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => {
                builder = builder.add_source(::config::File::from(PathBuf::from(path)));
            }
            None => {
                let paths = [
                    PathBuf::from("./config.toml"),
                    PathBuf::from("/etc/clariphish/config.toml"),
                ];
                if let Some(path) = paths.into_iter().find(|p| p.exists()) {
                    builder = builder.add_source(::config::File::from(path));
                }
            }
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("CLARIPHISH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup-time checks that serde defaults cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let token = self.api.admin_token.trim();
        if token.len() < MIN_ADMIN_TOKEN_LEN {
            return Err(crate::Error::Config(format!(
                "api.admin_token must be supplied and at least {} characters long",
                MIN_ADMIN_TOKEN_LEN
            )));
        }

        if self.database.url.is_empty() {
            return Err(crate::Error::Config("database.url is required".to_string()));
        }

        if self.outbox.max_attempts == 0 {
            return Err(crate::Error::Config(
                "outbox.max_attempts must be at least 1".to_string(),
            ));
        }

        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "Unsupported log format: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_default_config() {
        let server = ServerConfig::default();
        assert_eq!(server.bind_address, "0.0.0.0");
        assert_eq!(server.port, 3333);

        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.inter_send_delay_ms, 100);
        assert_eq!(dispatch.send_timeout_secs, 30);
    }

    #[test]
    fn test_parse_config() {
        let toml = format!(
            r#"
[server]
port = 8080

[database]
url = "postgres://localhost/clariphish"

[api]
admin_token = "{TOKEN}"

[tracking]
fallback_redirect = "https://intranet.example.com/"

[logging]
format = "text"
"#
        );

        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(
            config.tracking.fallback_redirect,
            "https://intranet.example.com/"
        );
        assert_eq!(config.outbox.max_attempts, 5);
    }

    #[test]
    fn test_admin_token_is_required() {
        let toml = r#"
[database]
url = "postgres://localhost/clariphish"
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_short_admin_token_rejected() {
        let toml = r#"
[database]
url = "postgres://localhost/clariphish"

[api]
admin_token = "changeme"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("admin_token"));
    }

    #[test]
    fn test_admin_token_redacted_in_debug() {
        let api = ApiConfig {
            admin_token: TOKEN.to_string(),
            cors_origins: vec![],
        };
        let rendered = format!("{:?}", api);
        assert!(!rendered.contains(TOKEN));
        assert!(rendered.contains("<redacted>"));
    }
}
