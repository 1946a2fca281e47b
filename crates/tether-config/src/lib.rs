//! TOML and environment configuration for Tether.
//!
//! Reads configuration from multiple sources with precedence:
//! env vars > config file (`~/.tether/config.toml`) > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_link::discovery::{DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_MANIFEST_NAME};
use tether_link::{
    BackoffConfig, ChannelOptions, Discovery, LinkSettings, ManifestDiscovery, ServerConfig,
    StaticDiscovery,
};
use tether_types::ConfigError;

/// Registration key sent when none is configured.
pub const DEFAULT_TOOL_API_KEY: &str = "tether_demo_tool_auth_key_12345";

/// Callback identifier sent when none is configured.
pub const DEFAULT_CALLBACK_ENDPOINT: &str = "tether://demo-tool-callback";

/// Log level used when neither `RUST_LOG` nor the config file set one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolved configuration for a Tether process.
#[derive(Debug, Clone)]
pub struct TetherConfig {
    pub endpoint: EndpointSource,
    pub link: LinkSettings,
    pub tool: ToolSettings,
    pub log_level: String,
}

/// How the host endpoint is found on each connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointSource {
    /// Run the native-messaging shim named by a manifest.
    Manifest {
        /// Explicit manifest file; `None` searches the platform locations.
        path: Option<PathBuf>,
        name: String,
        timeout: Duration,
    },
    /// A fixed URL and credential.
    Static(ServerConfig),
}

impl EndpointSource {
    pub fn discovery(&self) -> Arc<dyn Discovery> {
        match self {
            Self::Manifest {
                path: Some(path),
                timeout,
                ..
            } => Arc::new(ManifestDiscovery::with_manifest(path.clone()).with_timeout(*timeout)),
            Self::Manifest {
                path: None,
                name,
                timeout,
            } => Arc::new(ManifestDiscovery::new(name).with_timeout(*timeout)),
            Self::Static(config) => Arc::new(StaticDiscovery::new(config.clone())),
        }
    }
}

/// Identity values sent with the registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub api_key: String,
    pub callback_endpoint: String,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub link: LinkFileSettings,
    #[serde(default)]
    pub tool: ToolFileSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    pub manifest_path: Option<PathBuf>,
    pub manifest_name: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// A fixed host endpoint, bypassing discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub url: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkFileSettings {
    pub request_timeout_ms: Option<u64>,
    pub tool_call_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub backoff_unit_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub accept_invalid_certs: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFileSettings {
    pub api_key: Option<String>,
    pub callback_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
}

impl TetherConfig {
    /// Load configuration from the environment and `~/.tether/config.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = load_settings_file(&config_dir().join("config.toml"))?;
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    /// Apply precedence rules to already-read sources.
    ///
    /// `env` looks up an environment variable; empty values count as unset.
    pub fn resolve(
        settings: SettingsFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let endpoint = resolve_endpoint(&settings, &env)?;

        let defaults = ChannelOptions::default();
        let link_file = &settings.link;
        let channel = ChannelOptions {
            connect_timeout: millis(
                "link.connect_timeout_ms",
                link_file.connect_timeout_ms,
                defaults.connect_timeout,
            )?,
            post_timeout: defaults.post_timeout,
            request_timeout: millis(
                "link.request_timeout_ms",
                link_file.request_timeout_ms,
                defaults.request_timeout,
            )?,
            tool_call_timeout: millis(
                "link.tool_call_timeout_ms",
                link_file.tool_call_timeout_ms,
                defaults.tool_call_timeout,
            )?,
            accept_invalid_certs: link_file
                .accept_invalid_certs
                .unwrap_or(defaults.accept_invalid_certs),
        };

        let backoff_defaults = BackoffConfig::default();
        let backoff = BackoffConfig {
            unit: millis(
                "link.backoff_unit_ms",
                link_file.backoff_unit_ms,
                backoff_defaults.unit,
            )?,
            max_delay: millis(
                "link.max_backoff_ms",
                link_file.max_backoff_ms,
                backoff_defaults.max_delay,
            )?,
        };

        let tool = ToolSettings {
            api_key: env("TETHER_TOOL_API_KEY")
                .or(settings.tool.api_key)
                .unwrap_or_else(|| DEFAULT_TOOL_API_KEY.to_string()),
            callback_endpoint: settings
                .tool
                .callback_endpoint
                .unwrap_or_else(|| DEFAULT_CALLBACK_ENDPOINT.to_string()),
        };

        let log_level = settings
            .logging
            .level
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(TetherConfig {
            endpoint,
            link: LinkSettings { channel, backoff },
            tool,
            log_level,
        })
    }
}

fn resolve_endpoint(
    settings: &SettingsFile,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<EndpointSource, ConfigError> {
    let url = env("TETHER_SERVER_URL").or_else(|| settings.server.url.clone());

    if let Some(url) = url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "server.url".into(),
                message: format!("expected an http(s) URL, got '{url}'"),
            });
        }
        let auth_credential = env("TETHER_AUTHORIZATION")
            .or_else(|| settings.server.authorization.clone())
            .ok_or_else(|| ConfigError::MissingKey {
                key: "server.authorization (set TETHER_AUTHORIZATION or add to ~/.tether/config.toml)"
                    .into(),
            })?;
        return Ok(EndpointSource::Static(ServerConfig {
            endpoint_url: url,
            auth_credential,
        }));
    }

    let discovery = &settings.discovery;
    Ok(EndpointSource::Manifest {
        path: env("TETHER_MANIFEST")
            .map(PathBuf::from)
            .or_else(|| discovery.manifest_path.clone()),
        name: discovery
            .manifest_name
            .clone()
            .unwrap_or_else(|| DEFAULT_MANIFEST_NAME.to_string()),
        timeout: millis(
            "discovery.timeout_ms",
            discovery.timeout_ms,
            DEFAULT_DISCOVERY_TIMEOUT,
        )?,
    })
}

/// A positive millisecond setting, or `default` when unset.
fn millis(key: &str, value: Option<u64>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "must be greater than zero".into(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Get the Tether config directory path (~/.tether/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TETHER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Load and parse a TOML settings file. A missing file means defaults.
pub fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SettingsFile::default()),
        Err(e) => {
            tracing::warn!("Failed to read {}: {e}; using defaults", path.display());
            Ok(SettingsFile::default())
        }
    }
}
