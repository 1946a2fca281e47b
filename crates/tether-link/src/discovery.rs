//! Host discovery via the native-messaging shim.
//!
//! The host installs a browser native-messaging manifest that names a small
//! shim executable. Run with piped stdio, the shim immediately writes one
//! length-prefixed JSON message (4-byte little-endian length, then the body)
//! describing the host's SSE endpoint and credentials, then waits on stdin.
//! We read that single message and kill the shim.

use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tether_types::DiscoveryError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// File name of the host's native-messaging manifest.
pub const DEFAULT_MANIFEST_NAME: &str = "com.aurafriday.shim.json";

/// Upper bound on the handshake body; larger prefixes are treated as corrupt.
pub const MAX_HANDSHAKE_LEN: u32 = 10_000_000;

/// Wall-clock budget for running the shim and reading its message.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the host lives and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Full URL of the host's SSE endpoint.
    pub endpoint_url: String,
    /// Value for the `Authorization` header.
    pub auth_credential: String,
}

/// The subset of a native-messaging manifest we use.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub path: PathBuf,
}

/// A source of [`ServerConfig`]s, consulted on every connection attempt.
///
/// Dyn-compatible so the controller can hold an `Arc<dyn Discovery>`.
pub trait Discovery: Send + Sync {
    fn discover(&self)
    -> Pin<Box<dyn Future<Output = Result<ServerConfig, DiscoveryError>> + Send + '_>>;
}

/// Discovers the host by running the shim named in a manifest file.
#[derive(Debug, Clone)]
pub struct ManifestDiscovery {
    candidates: Vec<PathBuf>,
    timeout: Duration,
}

impl ManifestDiscovery {
    /// Search the platform's standard manifest locations for `manifest_name`.
    pub fn new(manifest_name: &str) -> Self {
        Self {
            candidates: candidate_paths(manifest_name),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Use one explicit manifest file instead of the platform search.
    pub fn with_manifest(path: impl Into<PathBuf>) -> Self {
        Self {
            candidates: vec![path.into()],
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self) -> Result<ServerConfig, DiscoveryError> {
        let manifest_path = find_manifest(&self.candidates)?;
        tracing::info!("Found discovery manifest: {}", manifest_path.display());

        let manifest = load_manifest(&manifest_path)?;
        if !manifest.path.exists() {
            return Err(DiscoveryError::ManifestInvalid {
                path: manifest_path,
                message: format!("shim binary not found: {}", manifest.path.display()),
            });
        }

        let document = run_handshake(&manifest.path, self.timeout).await?;
        let config = server_config_from_document(&document)?;
        tracing::debug!("Shim reported endpoint {}", config.endpoint_url);
        Ok(config)
    }
}

impl Discovery for ManifestDiscovery {
    fn discover(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ServerConfig, DiscoveryError>> + Send + '_>> {
        Box::pin(self.run())
    }
}

/// A fixed endpoint, used when the host location is configured directly.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    config: ServerConfig,
}

impl StaticDiscovery {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

impl Discovery for StaticDiscovery {
    fn discover(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ServerConfig, DiscoveryError>> + Send + '_>> {
        let config = self.config.clone();
        Box::pin(async move { Ok(config) })
    }
}

/// Platform-specific locations where the manifest may be installed.
pub fn candidate_paths(manifest_name: &str) -> Vec<PathBuf> {
    match dirs_next::home_dir() {
        Some(home) => platform_candidates(&home, manifest_name),
        None => Vec::new(),
    }
}

#[cfg(target_os = "windows")]
fn platform_candidates(home: &Path, manifest_name: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        paths.push(PathBuf::from(local).join("AuraFriday").join(manifest_name));
    }
    paths.push(
        home.join("AppData")
            .join("Local")
            .join("AuraFriday")
            .join(manifest_name),
    );
    paths
}

#[cfg(target_os = "macos")]
fn platform_candidates(home: &Path, manifest_name: &str) -> Vec<PathBuf> {
    let support = home.join("Library").join("Application Support");
    [
        "Google/Chrome",
        "Chromium",
        "Microsoft Edge",
        "BraveSoftware/Brave-Browser",
        "Vivaldi",
    ]
    .iter()
    .map(|browser| {
        support
            .join(browser)
            .join("NativeMessagingHosts")
            .join(manifest_name)
    })
    .collect()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn platform_candidates(home: &Path, manifest_name: &str) -> Vec<PathBuf> {
    [
        ".config/google-chrome",
        ".config/chromium",
        ".config/microsoft-edge",
        ".config/BraveSoftware/Brave-Browser",
        ".var/app/com.google.Chrome/config/google-chrome",
        ".var/app/org.chromium.Chromium/config/chromium",
    ]
    .iter()
    .map(|dir| home.join(dir).join("NativeMessagingHosts").join(manifest_name))
    .collect()
}

/// Return the first candidate that exists on disk.
pub fn find_manifest(candidates: &[PathBuf]) -> Result<PathBuf, DiscoveryError> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| DiscoveryError::ManifestNotFound {
            searched: candidates.to_vec(),
        })
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Manifest, DiscoveryError> {
    let invalid = |message: String| DiscoveryError::ManifestInvalid {
        path: path.to_path_buf(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))
}

/// Spawn the shim, read its single message, and kill it.
pub async fn run_handshake(
    executable: &Path,
    timeout: Duration,
) -> Result<serde_json::Value, DiscoveryError> {
    tracing::debug!("Running discovery shim: {}", executable.display());

    let mut child = Command::new(executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DiscoveryError::Spawn {
            path: executable.to_path_buf(),
            source: e,
        })?;

    let outcome = match child.stdout.take() {
        Some(mut stdout) => tokio::time::timeout(timeout, read_handshake(&mut stdout)).await,
        None => Ok(Err(DiscoveryError::Protocol(
            "shim stdout was not captured".to_string(),
        ))),
    };

    // The shim keeps waiting on stdin; it is never reused.
    if let Err(e) = child.kill().await {
        tracing::debug!("Discovery shim already gone: {e}");
    }

    outcome.map_err(|_| DiscoveryError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    })?
}

/// Read one length-prefixed JSON message.
///
/// Invalid lengths are rejected before any body bytes are read.
pub async fn read_handshake<R>(reader: &mut R) -> Result<serde_json::Value, DiscoveryError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| eof_as_protocol(e, "stream ended before the 4-byte length prefix"))?;

    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_HANDSHAKE_LEN {
        return Err(DiscoveryError::Protocol(format!(
            "invalid handshake length: {len}"
        )));
    }
    tracing::debug!("Discovery handshake length: {len} bytes");

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| eof_as_protocol(e, &format!("stream ended before {len} body bytes")))?;

    let text = match String::from_utf8(body) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };

    serde_json::from_str(&text)
        .map_err(|e| DiscoveryError::Protocol(format!("handshake is not valid JSON: {e}")))
}

fn eof_as_protocol(e: std::io::Error, what: &str) -> DiscoveryError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DiscoveryError::Protocol(what.to_string())
    } else {
        DiscoveryError::Io(e)
    }
}

/// Pick the first server descriptor carrying both a URL and an Authorization header.
///
/// Expected shape: `{"mcpServers": {"<name>": {"url": .., "headers": {"Authorization": ..}}}}`.
pub fn server_config_from_document(
    document: &serde_json::Value,
) -> Result<ServerConfig, DiscoveryError> {
    let servers = document
        .get("mcpServers")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| DiscoveryError::Protocol("handshake has no mcpServers map".to_string()))?;

    servers
        .values()
        .find_map(|entry| {
            let url = entry.get("url")?.as_str()?;
            let auth = entry.get("headers")?.get("Authorization")?.as_str()?;
            Some(ServerConfig {
                endpoint_url: url.to_string(),
                auth_credential: auth.to_string(),
            })
        })
        .ok_or_else(|| {
            DiscoveryError::Protocol(
                "no server descriptor has both a url and an Authorization header".to_string(),
            )
        })
}
