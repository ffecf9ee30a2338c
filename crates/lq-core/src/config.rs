use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.lyquor-dev/config.toml`.
///
/// Every section falls back to its defaults, so an empty (or missing) file
/// yields a working local setup on port 9527.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub devnet: DevnetConfig,
}

impl Config {
    /// Load config from `~/.lyquor-dev/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.http_grace_ms == 0 {
            return Err(ConfigError::Validation(
                "dispatch.http_grace_ms must be greater than zero".into(),
            ));
        }
        if self.client.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "client.request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.terminal.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "terminal.max_sessions must be greater than zero".into(),
            ));
        }
        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::Validation(
                "terminal.cols and terminal.rows must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment overrides on top of file/default values.
    ///
    /// - `WORKSPACES_ROOT` replaces `editor.workspaces_root`
    /// - `LYQUOR_DEV_PORT` replaces `server.port` (ignored when unparseable)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("WORKSPACES_ROOT") {
            if !root.trim().is_empty() {
                self.editor.workspaces_root = root;
            }
        }
        if let Ok(port) = std::env::var("LYQUOR_DEV_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid LYQUOR_DEV_PORT"),
            }
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lyquor-dev")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// `host:port`, suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9527
}

/// Settings for interactive shell sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Shell binary. Empty means `$SHELL`, then `bash`.
    #[serde(default)]
    pub shell: String,
    /// Working directory for new shells. Empty means the daemon's cwd.
    #[serde(default)]
    pub cwd: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_term_name")]
    pub term_name: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            cwd: String::new(),
            cols: default_cols(),
            rows: default_rows(),
            term_name: default_term_name(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl TerminalConfig {
    /// The shell to spawn: configured value, else `$SHELL`, else `bash`.
    pub fn resolved_shell(&self) -> String {
        if !self.shell.trim().is_empty() {
            return self.shell.clone();
        }
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "bash".to_string())
    }

    /// The working directory for new shells, if one is configured.
    pub fn resolved_cwd(&self) -> Option<PathBuf> {
        if self.cwd.trim().is_empty() {
            None
        } else {
            Some(expand_home(&self.cwd))
        }
    }
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    30
}
fn default_term_name() -> String {
    "xterm-color".into()
}
fn default_max_sessions() -> usize {
    32
}

/// One-shot (HTTP) dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long the HTTP transport waits for more events before answering
    /// with the last one observed.
    #[serde(default = "default_http_grace_ms")]
    pub http_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            http_grace_ms: default_http_grace_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn http_grace(&self) -> Duration {
        Duration::from_millis(self.http_grace_ms)
    }
}

fn default_http_grace_ms() -> u64 {
    100
}

/// Client-side request correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Namespaced editor workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_workspaces_root")]
    pub workspaces_root: String,
    /// Directory copied into a namespace the first time its tree is requested.
    #[serde(default)]
    pub template_dir: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            workspaces_root: default_workspaces_root(),
            template_dir: String::new(),
        }
    }
}

impl EditorConfig {
    pub fn root(&self) -> PathBuf {
        expand_home(&self.workspaces_root)
    }

    pub fn template(&self) -> Option<PathBuf> {
        if self.template_dir.trim().is_empty() {
            None
        } else {
            Some(expand_home(&self.template_dir))
        }
    }
}

fn default_workspaces_root() -> String {
    "../../lyquid-editor-workspace".into()
}

/// The local devnet process started by `start-devnet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevnetConfig {
    #[serde(default = "default_devnet_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            command: default_devnet_command(),
            args: Vec::new(),
        }
    }
}

impl DevnetConfig {
    pub fn program(&self) -> PathBuf {
        expand_home(&self.command)
    }
}

fn default_devnet_command() -> String {
    "~/.shakenup/bin/start-devnet".into()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 9527);
        assert_eq!(cfg.dispatch.http_grace(), Duration::from_millis(100));
        assert_eq!(cfg.client.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.terminal.cols, 80);
        assert_eq!(cfg.terminal.rows, 30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.server.bind_addr(), "127.0.0.1:9527");
        assert_eq!(cfg.terminal.term_name, "xterm-color");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg = Config::from_toml("[terminal]\nshell = \"/bin/sh\"\n").unwrap();
        assert_eq!(cfg.terminal.resolved_shell(), "/bin/sh");
        assert_eq!(cfg.terminal.max_sessions, 32);
    }

    #[test]
    fn zero_grace_is_rejected() {
        let err = Config::from_toml("[dispatch]\nhttp_grace_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Config::from_toml("[terminal]\nmax_sessions = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[server\nport = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/opt/devnet"), PathBuf::from("/opt/devnet"));
        assert_eq!(expand_home("relative/dir"), PathBuf::from("relative/dir"));
    }

    #[test]
    fn empty_cwd_is_none() {
        let cfg = TerminalConfig::default();
        assert!(cfg.resolved_cwd().is_none());
    }
}
