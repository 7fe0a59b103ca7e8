use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::alert::AlertConfig;
use crate::headers::HeaderConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Selects the CSP directive set and HSTS preload behavior.
    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub headers: HeaderConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub blocklist: BlocklistConfig,

    #[serde(default)]
    pub uploads: UploadConfig,

    #[serde(default)]
    pub waf: WafConfig,

    #[serde(default)]
    pub sweep: SweepConfig,
}

impl SecurityConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: SecurityConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/shopwarden/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("shopwarden/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the daemon listens on
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the daily security log files
    #[serde(default = "default_log_dir")]
    pub dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Window for counting authentication failures (seconds)
    #[serde(default = "default_brute_force_window")]
    pub brute_force_window_secs: u64,

    /// Failures within the window before a brute_force event fires
    #[serde(default = "default_brute_force_max")]
    pub brute_force_max_failures: usize,

    /// Window for counting requests per source (seconds)
    #[serde(default = "default_ddos_window")]
    pub ddos_window_secs: u64,

    /// Requests within the window before a ddos event fires
    #[serde(default = "default_ddos_max")]
    pub ddos_max_requests: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            brute_force_window_secs: default_brute_force_window(),
            brute_force_max_failures: default_brute_force_max(),
            ddos_window_secs: default_ddos_window(),
            ddos_max_requests: default_ddos_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlocklistConfig {
    /// Sources rejected outright
    #[serde(default)]
    pub blocked_ips: Vec<IpAddr>,

    /// Sources exempt from every check
    #[serde(default)]
    pub allowed_ips: Vec<IpAddr>,

    /// User-agent regexes rejected as attack tooling
    #[serde(default = "default_blocked_user_agents")]
    pub blocked_user_agents: Vec<String>,

    /// User-agent regexes exempt from the block above (legitimate crawlers)
    #[serde(default = "default_allowed_bots")]
    pub allowed_bots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Acceptable MIME types for uploaded files
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,

    /// Acceptable file extensions (lowercase, without dot)
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Upper bound on upload request bodies (bytes)
    #[serde(default = "default_max_upload_bytes")]
    pub max_size_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            allowed_mime_types: default_allowed_mime_types(),
            allowed_extensions: default_allowed_extensions(),
            max_size_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    /// Reject requests on signature match. When false the guard observes and
    /// records but lets the request through (report-only firewall).
    #[serde(default = "default_true")]
    pub enforce: bool,

    /// Upper bound on any request body (bytes); larger bodies are rejected
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    /// How much of the body is scanned for signatures (bytes)
    #[serde(default = "default_inspect_bytes")]
    pub inspect_body_bytes: usize,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            max_body_bytes: default_max_body(),
            inspect_body_bytes: default_inspect_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Sources with no activity for this long are evicted (seconds)
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// How often the sweep task runs (seconds)
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// In-memory attack events older than this are dropped; the log files
    /// keep the full history (seconds)
    #[serde(default = "default_event_retention")]
    pub event_retention_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            interval_secs: default_sweep_interval(),
            event_retention_secs: default_event_retention(),
        }
    }
}

// Default value functions
fn default_bind() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_log_dir() -> String {
    "/var/log/shopwarden".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_brute_force_window() -> u64 {
    300
}

fn default_brute_force_max() -> usize {
    20
}

fn default_ddos_window() -> u64 {
    60
}

fn default_ddos_max() -> usize {
    1000
}

fn default_blocked_user_agents() -> Vec<String> {
    vec![
        r"(?i)sqlmap|nikto|nessus|openvas|masscan".to_string(),
        r"(?i)dirbuster|gobuster|wfuzz|ffuf".to_string(),
        r"(?i)hydra|medusa|burp\s*suite|owasp\s*zap".to_string(),
    ]
}

fn default_allowed_bots() -> Vec<String> {
    vec![r"(?i)googlebot|bingbot|duckduckbot".to_string()]
}

fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/gif".to_string(),
        "image/webp".to_string(),
        "application/pdf".to_string(),
    ]
}

fn default_allowed_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "pdf".to_string(),
    ]
}

fn default_max_upload_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_inspect_bytes() -> usize {
    64 * 1024
}

fn default_idle_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_event_retention() -> u64 {
    86_400
}
