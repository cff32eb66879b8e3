//! Configuration management for the termhost daemon.
//!
//! Configuration is read once at startup from up to three layers, later layers
//! winning:
//!
//! 1. built-in defaults,
//! 2. the base TOML file (`~/.config/termhost/config.toml` by default),
//! 3. an optional `config.local.toml` next to the base file, merged table by
//!    table,
//!
//! and finally `TERMHOST_*` environment variables. Nothing watches for changes
//! afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the local override layer, resolved next to the base file.
pub const LOCAL_CONFIG_FILE: &str = "config.local.toml";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("output_queue must be greater than 0")]
    InvalidOutputQueue,

    #[error("send_timeout_secs must be greater than 0")]
    InvalidSendTimeout,

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("authentication is enabled but no password is configured")]
    MissingPassword,

    #[error("session_timeout_secs must be greater than 0")]
    InvalidSessionTimeout,

    #[error("max_login_attempts and login_window_secs must be greater than 0")]
    InvalidRateLimit,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// Shell and PTY settings applied to every channel.
    pub terminal: TerminalConfig,

    /// Authentication and session settings.
    pub auth: AuthConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,

    /// Port to bind.
    pub port: u16,
}

/// Shell and PTY settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell command spawned for each channel.
    pub shell: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Working directory for spawned shells. `None` inherits the daemon's.
    pub cwd: Option<PathBuf>,

    /// Value exported as `TERM` to the shell.
    pub term: String,

    /// Number of output chunks buffered per channel before the PTY reader
    /// stops pulling from the process.
    pub output_queue: usize,

    /// Seconds a single send to the client may take before the channel is
    /// treated as stalled and closed.
    pub send_timeout_secs: u64,
}

/// Authentication and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether login is required. When false every caller is `anonymous`.
    pub enabled: bool,

    /// Configured username.
    pub username: String,

    /// Configured password.
    pub password: String,

    /// Idle lifetime of a session token, in seconds.
    pub session_timeout_secs: u64,

    /// Login attempts allowed per source address within the window.
    pub max_login_attempts: u32,

    /// Rolling window for login attempts, in seconds.
    pub login_window_secs: u64,

    /// If set, open channels re-validate their session at this interval and
    /// close once it has expired. Unset means sessions are only checked when
    /// a channel is established.
    pub recheck_interval_secs: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cols: 80,
            rows: 24,
            cwd: dirs::home_dir(),
            term: "xterm-256color".to_string(),
            output_queue: 256,
            send_timeout_secs: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "admin".to_string(),
            password: String::new(),
            session_timeout_secs: 30 * 60,
            max_login_attempts: 5,
            login_window_secs: 15 * 60,
            recheck_interval_secs: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TerminalConfig {
    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl AuthConfig {
    /// Session lifetime as a [`Duration`].
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Login window as a [`Duration`].
    pub fn login_window(&self) -> Duration {
        Duration::from_secs(self.login_window_secs)
    }

    /// Re-check interval, if enabled.
    pub fn recheck_interval(&self) -> Option<Duration> {
        self.recheck_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhost")
        .join("config.toml")
}

/// Returns the local override path for a base configuration file.
pub fn local_config_path(base: &Path) -> PathBuf {
    base.with_file_name(LOCAL_CONFIG_FILE)
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Reads a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Reads and parses a numeric environment variable, warning on bad input.
fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_value(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHOST_HOST, TERMHOST_PORT: listener address
    /// - TERMHOST_SHELL, TERMHOST_COLS, TERMHOST_ROWS, TERMHOST_CWD: terminal
    /// - TERMHOST_AUTH_ENABLED (`true` enables, anything else disables)
    /// - TERMHOST_AUTH_USERNAME, TERMHOST_AUTH_PASSWORD: credentials
    /// - TERMHOST_LOG_LEVEL: log level
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = env_value("TERMHOST_HOST") {
            tracing::info!("Overriding server host from environment: {}", host);
            self.server.host = host;
        }
        if let Some(port) = env_number("TERMHOST_PORT") {
            self.server.port = port;
        }

        if let Some(shell) = env_value("TERMHOST_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.terminal.shell = shell;
        }
        if let Some(cols) = env_number("TERMHOST_COLS") {
            self.terminal.cols = cols;
        }
        if let Some(rows) = env_number("TERMHOST_ROWS") {
            self.terminal.rows = rows;
        }
        if let Some(cwd) = env_value("TERMHOST_CWD") {
            self.terminal.cwd = Some(PathBuf::from(cwd));
        }

        if let Some(enabled) = env_value("TERMHOST_AUTH_ENABLED") {
            self.auth.enabled = enabled == "true";
        }
        if let Some(username) = env_value("TERMHOST_AUTH_USERNAME") {
            self.auth.username = username;
        }
        if let Some(password) = env_value("TERMHOST_AUTH_PASSWORD") {
            self.auth.password = password;
        }

        if let Some(level) = env_value("TERMHOST_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.log.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.terminal.cols,
                rows: self.terminal.rows,
            });
        }

        if self.terminal.output_queue == 0 {
            return Err(ConfigError::InvalidOutputQueue);
        }

        if self.terminal.send_timeout_secs == 0 {
            return Err(ConfigError::InvalidSendTimeout);
        }

        let shell_path = Path::new(&self.terminal.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.terminal.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.terminal.shell.clone()));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        if self.auth.enabled && self.auth.password.is_empty() {
            return Err(ConfigError::MissingPassword);
        }

        if self.auth.session_timeout_secs == 0 {
            return Err(ConfigError::InvalidSessionTimeout);
        }

        if self.auth.max_login_attempts == 0 || self.auth.login_window_secs == 0 {
            return Err(ConfigError::InvalidRateLimit);
        }

        Ok(())
    }

    /// Load configuration from a base file plus its local override.
    ///
    /// Missing files are skipped; if neither exists the defaults are returned.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut merged = toml::Table::new();

        for layer in [path.to_path_buf(), local_config_path(path)] {
            if let Some(table) = read_table(&layer)? {
                tracing::debug!("Loaded configuration layer {:?}", layer);
                merge_tables(&mut merged, table);
            }
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| {
                anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e))
            })
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Copy of the configuration safe to print: the password is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.password.is_empty() {
            copy.auth.password = "********".to_string();
        }
        copy
    }
}

/// Reads one configuration layer, returning `None` if the file is absent.
fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let table = toml::from_str::<toml::Table>(&contents)
        .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(Some(table))
}

/// Deep-merges `overlay` into `base`. Nested tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "TERMHOST_HOST",
        "TERMHOST_PORT",
        "TERMHOST_SHELL",
        "TERMHOST_COLS",
        "TERMHOST_ROWS",
        "TERMHOST_CWD",
        "TERMHOST_AUTH_ENABLED",
        "TERMHOST_AUTH_USERNAME",
        "TERMHOST_AUTH_PASSWORD",
        "TERMHOST_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.terminal.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.terminal.cols, 80);
        assert_eq!(config.terminal.rows, 24);
        assert!(!config.auth.enabled);
        assert_eq!(config.auth.session_timeout_secs, 1800);
        assert_eq!(config.auth.max_login_attempts, 5);
        assert_eq!(config.auth.login_window_secs, 900);
        assert_eq!(config.auth.recheck_interval(), None);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[terminal]
cols = 132

[auth]
enabled = true
password = "hunter2"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.terminal.cols, 132);
        assert_eq!(config.terminal.rows, 24);
        assert!(config.auth.enabled);
        assert_eq!(config.auth.username, "admin");
        assert_eq!(config.auth.password, "hunter2");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nport = 1");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        assert!(Config::from_toml("[server]\nport = \"http\"").is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = valid_config();
        original.server.port = 8080;
        original.auth.recheck_interval_secs = Some(60);

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_merges_local_override() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("config.toml");

        fs::write(
            &base,
            r#"
[server]
host = "0.0.0.0"
port = 4000

[auth]
enabled = true
username = "ops"
password = "base-secret"
"#,
        )
        .unwrap();
        fs::write(
            local_config_path(&base),
            r#"
[server]
port = 5000

[auth]
password = "local-secret"
"#,
        )
        .unwrap();

        let config = Config::load(&base).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert!(config.auth.enabled);
        assert_eq!(config.auth.username, "ops");
        assert_eq!(config.auth.password, "local-secret");
    }

    #[test]
    fn test_load_local_only() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("config.toml");
        fs::write(local_config_path(&base), "[terminal]\nrows = 50\n").unwrap();

        let config = Config::load(&base).unwrap();
        assert_eq!(config.terminal.rows, 50);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_merge_tables_replaces_scalars_and_merges_tables() {
        let mut base: toml::Table = toml::from_str("a = 1\n[t]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Table = toml::from_str("a = 2\n[t]\ny = 3\nz = 4\n").unwrap();
        merge_tables(&mut base, overlay);

        assert_eq!(base["a"].as_integer(), Some(2));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(3));
        assert_eq!(base["t"]["z"].as_integer(), Some(4));
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut config = Config::default();
        config.auth.password = "secret".to_string();
        let toml = config.redacted().to_toml().unwrap();
        assert!(!toml.contains("secret"));
        assert!(toml.contains("********"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termhost"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("TERMHOST_PORT", "9000");
        std::env::set_var("TERMHOST_COLS", "100");
        std::env::set_var("TERMHOST_AUTH_ENABLED", "true");
        std::env::set_var("TERMHOST_AUTH_PASSWORD", "pw");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.terminal.cols, 100);
        assert!(config.auth.enabled);
        assert_eq!(config.auth.password, "pw");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_auth_enabled_only_true_enables() {
        clear_env();
        std::env::set_var("TERMHOST_AUTH_ENABLED", "yes");

        let mut config = Config::default();
        config.auth.enabled = true;
        config.apply_env_overrides();
        assert!(!config.auth.enabled);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_empty_and_unparsable_are_ignored() {
        clear_env();
        std::env::set_var("TERMHOST_HOST", "");
        std::env::set_var("TERMHOST_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);

        clear_env();
    }

    #[test]
    fn test_validate_default_shell_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = valid_config();
        config.server.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = valid_config();
        config.terminal.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_shell_not_found() {
        let mut config = valid_config();
        config.terminal.shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );

        config.terminal.shell = "nonexistent_shell_xyz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_in_path() {
        let mut config = valid_config();
        config.terminal.shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.log.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.log.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_auth_requires_password() {
        let mut config = valid_config();
        config.auth.enabled = true;
        assert_eq!(config.validate(), Err(ConfigError::MissingPassword));

        config.auth.password = "pw".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rate_limit_and_timeout() {
        let mut config = valid_config();
        config.auth.max_login_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRateLimit));

        let mut config = valid_config();
        config.auth.session_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSessionTimeout));
    }

    #[test]
    fn test_recheck_interval_zero_is_disabled() {
        let mut config = AuthConfig::default();
        config.recheck_interval_secs = Some(0);
        assert_eq!(config.recheck_interval(), None);
        config.recheck_interval_secs = Some(30);
        assert_eq!(config.recheck_interval(), Some(Duration::from_secs(30)));
    }
}
