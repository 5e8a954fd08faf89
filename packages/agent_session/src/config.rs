use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / session.toml / env vars)
// =============================================================================
//
//   session.toml:    [requests]
//                    timeout_secs = 10
//
//   env var:         AGENT_SESSION_REQUESTS__TIMEOUT_SECS=10   (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "session.toml";
pub const ENV_PREFIX: &str = "AGENT_SESSION_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub requests: RequestFileConfig,
    #[serde(default)]
    pub events: EventFileConfig,
}

/// Transport tunables (lives under `[connection]` in session.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    /// Endpoint template; `{channel}` is replaced by the channel id.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Correlated request tunables (lives under `[requests]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFileConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_readiness_wait_secs")]
    pub readiness_wait_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RequestFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout_secs(),
            readiness_wait_secs: default_readiness_wait_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Event stream tunables (lives under `[events]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFileConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
    /// Also publish every metadata message as a generic METADATA system message.
    #[serde(default = "default_legacy_system_messages")]
    pub legacy_system_messages: bool,
}

impl Default for EventFileConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            legacy_system_messages: default_legacy_system_messages(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:8080/agents/{channel}".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_readiness_wait_secs() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_event_capacity() -> usize {
    256
}
fn default_legacy_system_messages() -> bool {
    true
}

/// Build a figment that layers: defaults → session.toml → AGENT_SESSION_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(SessionFileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Resolve the config directory, creating it if needed. Defaults to `~/.agent-session`.
pub fn resolve_config_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match custom_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not find home directory")?
            .join(".agent-session"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory: {:?}", dir))?;
    info!("config directory: {}", dir.display());
    Ok(dir)
}

// =============================================================================
// Runtime config structs (derived from SessionFileConfig)
// =============================================================================

/// Connection settings handed to `ConnectionManager::initialize` (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            endpoint: fc.endpoint.clone(),
            auth_token: fc.auth_token.clone().filter(|t| !t.is_empty()),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline for a correlated response once the request is sent.
    pub timeout: Duration,
    /// Maximum wait for a channel to reach `Connected` before sending.
    pub readiness_wait: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RequestOptions {
    pub fn from_file(fc: &RequestFileConfig) -> Self {
        Self {
            timeout: Duration::from_secs(fc.timeout_secs),
            readiness_wait: Duration::from_secs(fc.readiness_wait_secs),
            max_retries: fc.max_retries,
            retry_delay: Duration::from_millis(fc.retry_delay_ms),
        }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::from_file(&RequestFileConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventOptions {
    pub capacity: usize,
    pub legacy_system_messages: bool,
}

impl EventOptions {
    pub fn from_file(fc: &EventFileConfig) -> Self {
        Self {
            capacity: fc.capacity.max(1),
            legacy_system_messages: fc.legacy_system_messages,
        }
    }
}

impl Default for EventOptions {
    fn default() -> Self {
        Self::from_file(&EventFileConfig::default())
    }
}

/// Fully resolved session configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub connection: ConnectionSettings,
    pub requests: RequestOptions,
    pub events: EventOptions,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            connection: ConnectionSettings::from_file(&fc.connection),
            requests: RequestOptions::from_file(&fc.requests),
            events: EventOptions::from_file(&fc.events),
        }
    }

    /// Load from `config_dir/session.toml` and the environment.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let fc: SessionFileConfig = load_config(config_dir)
            .extract()
            .context("failed to load session configuration")?;
        Ok(Self::from_file(&fc))
    }
}
