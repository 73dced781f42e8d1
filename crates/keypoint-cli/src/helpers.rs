//! Shared helpers for the `keypoint` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use keypoint_policy::AuthzConfig;
use keypoint_store::{FileKeypointStore, Keypoint};
use ring::rand::{SecureRandom, SystemRandom};
use tracing_subscriber::EnvFilter;

/// Length of generated secrets in bytes (before base64 encoding).
const SECRET_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Config and store
// ---------------------------------------------------------------------------

/// Load the config file, or fall back to defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<AuthzConfig> {
    match path {
        Some(path) => AuthzConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(AuthzConfig::default()),
    }
}

/// Resolve the store file: the CLI flag wins over the config.
pub fn store_path(config: &AuthzConfig, flag: Option<&Path>) -> Result<PathBuf> {
    match flag.map(Path::to_path_buf).or_else(|| config.store.path.clone()) {
        Some(path) => Ok(path),
        None => bail!("no keypoint store configured; pass --store or set [store] path"),
    }
}

pub async fn open_store(path: &Path) -> Result<FileKeypointStore> {
    FileKeypointStore::open(path)
        .await
        .with_context(|| format!("failed to open keypoint store {}", path.display()))
}

// ---------------------------------------------------------------------------
// Secrets and parsing
// ---------------------------------------------------------------------------

/// Generate a random URL-safe secret.
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_secret() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; SECRET_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("failed to generate secret: CSPRNG error"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Parse `name: value` or `name=value`.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let at = raw
        .find([':', '='])
        .with_context(|| format!("malformed header {raw:?}; expected `name: value`"))?;
    let name = raw[..at].trim();
    if name.is_empty() {
        bail!("malformed header {raw:?}; name is empty");
    }
    Ok((name.to_string(), raw[at + 1..].trim().to_string()))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Keypoint as JSON, with the secret masked unless `reveal` is set.
pub fn keypoint_json(keypoint: &Keypoint, reveal: bool) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(keypoint).context("failed to serialize keypoint")?;
    if !reveal {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("secret".into(), serde_json::Value::String("********".into()));
        }
    }
    Ok(value)
}

/// One line per keypoint for terminal output.
pub fn keypoint_row(keypoint: &Keypoint) -> String {
    let scopes: Vec<&str> = keypoint.scopes.iter().map(String::as_str).collect();
    let expires = keypoint
        .expires_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let status = if keypoint.is_expired() { "expired" } else { "active" };
    format!(
        "{:<24} {:<20} {:<8} {:<26} {}",
        keypoint.key_id,
        keypoint.name,
        status,
        expires,
        scopes.join(",")
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
