use crate::lifecycle::backoff::BackoffPolicy;
use crate::lifecycle::LifecycleConfig;
use crate::transport::TransportOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_KEY: &str = "change-me";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where the config was loaded from, if anywhere. Not serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port (default: 10000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Shared secret expected in the `x-api-key` header.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Max request body size in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    10000
}

fn default_api_key() -> String {
    DEFAULT_API_KEY.into()
}

fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_key: default_api_key(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Persistent auth data. Unset means `./data/wwebjs`, or
    /// `/var/data/wwebjs` when `RENDER` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
    /// Web-version cache. Unset resolves like `data_path` with a `-cache` suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_destroy_timeout_secs")]
    pub destroy_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    /// Entries returned by `/debug`.
    #[serde(default = "default_debug_event_limit")]
    pub debug_event_limit: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_init_timeout_secs() -> u64 {
    180
}

fn default_destroy_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_event_log_capacity() -> usize {
    200
}

fn default_debug_event_limit() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            cache_path: None,
            init_timeout_secs: default_init_timeout_secs(),
            destroy_timeout_secs: default_destroy_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            event_log_capacity: default_event_log_capacity(),
            debug_event_limit: default_debug_event_limit(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Restart delay is `base_ms + min(cap_ms, attempts * step_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_backoff_step_ms() -> u64 {
    5_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            step_ms: default_backoff_step_ms(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Helper executable speaking the JSON-lines transport protocol.
    #[serde(default = "default_transport_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_protocol_timeout_secs")]
    pub protocol_timeout_secs: u64,
    #[serde(default = "default_browser_args")]
    pub browser_args: Vec<String>,
    #[serde(default = "default_true")]
    pub takeover_on_conflict: bool,
    #[serde(default)]
    pub takeover_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub restart_on_auth_fail: bool,
    #[serde(default = "default_qr_max_retries")]
    pub qr_max_retries: u32,
}

fn default_transport_command() -> String {
    "wa-relay-transport".into()
}

fn default_true() -> bool {
    true
}

fn default_protocol_timeout_secs() -> u64 {
    180
}

fn default_browser_args() -> Vec<String> {
    [
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--no-zygote",
        "--disable-gpu",
        "--disable-features=site-per-process",
        "--no-first-run",
        "--no-default-browser-check",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_qr_max_retries() -> u32 {
    8
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: default_transport_command(),
            args: Vec::new(),
            headless: true,
            protocol_timeout_secs: default_protocol_timeout_secs(),
            browser_args: default_browser_args(),
            takeover_on_conflict: true,
            takeover_timeout_ms: 0,
            restart_on_auth_fail: true,
            qr_max_retries: default_qr_max_retries(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Defaults, then the TOML file at `path` (which must exist if given),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let mut config: Config =
                    toml::from_str(&contents).context("Failed to parse config file")?;
                config.config_path = Some(path.to_path_buf());
                config
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    /// Empty values are treated as unset.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name).filter(|value| !value.is_empty()))
        };

        // Gateway port: WA_RELAY_PORT or PORT
        if let Some(port_str) = var(&["WA_RELAY_PORT", "PORT"]) {
            match port_str.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port_str, "Ignoring invalid PORT"),
            }
        }

        // Gateway host: WA_RELAY_HOST or HOST
        if let Some(host) = var(&["WA_RELAY_HOST", "HOST"]) {
            self.gateway.host = host;
        }

        // API key: WA_RELAY_API_KEY or API_KEY
        if let Some(key) = var(&["WA_RELAY_API_KEY", "API_KEY"]) {
            self.gateway.api_key = key;
        }

        if let Some(command) = var(&["WA_RELAY_TRANSPORT_CMD"]) {
            self.transport.command = command;
        }

        // Storage: explicit paths win, otherwise RENDER picks the base dir.
        let base = if var(&["RENDER"]).is_some() {
            Path::new("/var/data")
        } else {
            Path::new("./data")
        };
        if let Some(path) = var(&["WWEBJS_DATA"]) {
            self.session.data_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var(&["WWEBJS_CACHE"]) {
            self.session.cache_path = Some(PathBuf::from(path));
        }
        self.session
            .data_path
            .get_or_insert_with(|| base.join("wwebjs"));
        self.session
            .cache_path
            .get_or_insert_with(|| base.join("wwebjs-cache"));
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.gateway.api_key == DEFAULT_API_KEY
    }

    pub fn data_path(&self) -> PathBuf {
        self.session
            .data_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data/wwebjs"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.session
            .cache_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data/wwebjs-cache"))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let backoff = &self.session.backoff;
        BackoffPolicy {
            base: Duration::from_millis(backoff.base_ms),
            step: Duration::from_millis(backoff.step_ms),
            cap: Duration::from_millis(backoff.cap_ms),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        let transport = &self.transport;
        TransportOptions {
            data_path: self.data_path(),
            cache_path: self.cache_path(),
            headless: transport.headless,
            protocol_timeout: Duration::from_secs(transport.protocol_timeout_secs),
            browser_args: transport.browser_args.clone(),
            takeover_on_conflict: transport.takeover_on_conflict,
            takeover_timeout_ms: transport.takeover_timeout_ms,
            restart_on_auth_fail: transport.restart_on_auth_fail,
            qr_max_retries: transport.qr_max_retries,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            transport: self.transport_options(),
            init_timeout: Duration::from_secs(self.session.init_timeout_secs),
            destroy_timeout: Duration::from_secs(self.session.destroy_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs.max(1)),
            backoff: self.backoff_policy(),
            event_log_capacity: self.session.event_log_capacity,
        }
    }

    /// Effective config as TOML, with the API key masked.
    pub fn to_masked_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        masked.gateway.api_key = mask_secret(&masked.gateway.api_key);
        toml::to_string_pretty(&masked).context("Failed to serialize config")
    }
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(2).collect();
    if secret.chars().count() <= 4 {
        "****".into()
    } else {
        format!("{visible}****")
    }
}
