#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use marionette_util::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.marionette/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".marionette").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens. A random per-process
	/// secret is generated when unset, so tokens only outlive a restart
	/// when this is configured.
	pub auth_hmac_secret: Option<SecretString>,
	/// Lifetime of issued access tokens.
	pub token_ttl: Duration,
	/// When set, logins whose client version differs are rejected.
	pub required_client_version: Option<String>,
	/// Action rate limiting: per-identity burst size.
	pub action_rate_limit_burst: u32,
	/// Action rate limiting: per-identity requests per minute.
	pub action_rate_limit_per_minute: u32,
	/// Maximum distinct targets per action request.
	pub max_targets: usize,
	/// How long a possession begin waits for the target's answer.
	pub possession_confirm_timeout: Duration,
	/// Per-connection command queue depth before sends are dropped.
	pub command_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			token_ttl: Duration::from_secs(240 * 60),
			required_client_version: None,
			action_rate_limit_burst: 20,
			action_rate_limit_per_minute: 120,
			max_targets: 8,
			possession_confirm_timeout: Duration::from_secs(10),
			command_queue_capacity: 256,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQLite account/audit backend.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	token_ttl_minutes: Option<u64>,
	required_client_version: Option<String>,
	action_rate_limit_burst: Option<u32>,
	action_rate_limit_per_minute: Option<u32>,
	max_targets: Option<usize>,
	possession_confirm_timeout_secs: Option<u64>,
	command_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				token_ttl: file
					.server
					.token_ttl_minutes
					.filter(|v| *v > 0)
					.map(|v| Duration::from_secs(v * 60))
					.unwrap_or(defaults.token_ttl),
				required_client_version: file.server.required_client_version.filter(|s| !s.trim().is_empty()),
				action_rate_limit_burst: file.server.action_rate_limit_burst.unwrap_or(defaults.action_rate_limit_burst),
				action_rate_limit_per_minute: file
					.server
					.action_rate_limit_per_minute
					.unwrap_or(defaults.action_rate_limit_per_minute),
				max_targets: file.server.max_targets.filter(|v| *v > 0).unwrap_or(defaults.max_targets),
				possession_confirm_timeout: file
					.server
					.possession_confirm_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.possession_confirm_timeout),
				command_queue_capacity: file
					.server
					.command_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.command_queue_capacity),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("MARIONETTE_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_TOKEN_TTL_MINUTES")
		&& let Ok(minutes) = v.trim().parse::<u64>()
		&& minutes > 0
	{
		cfg.server.token_ttl = Duration::from_secs(minutes * 60);
		info!(minutes, "server auth: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_REQUIRED_CLIENT_VERSION") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.required_client_version = Some(v);
			info!("server config: required_client_version overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_ACTION_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.action_rate_limit_burst = burst;
		info!(burst, "server config: action_rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_ACTION_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.action_rate_limit_per_minute = rate;
		info!(rate, "server config: action_rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_MAX_TARGETS")
		&& let Ok(max_targets) = v.trim().parse::<usize>()
		&& max_targets > 0
	{
		cfg.server.max_targets = max_targets;
		info!(max_targets, "server config: max_targets overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_POSSESSION_CONFIRM_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.possession_confirm_timeout = Duration::from_secs(secs);
		info!(secs, "server config: possession_confirm_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_COMMAND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.command_queue_capacity = capacity;
		info!(capacity, "server config: command_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MARIONETTE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("MARIONETTE_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_file_applies_defaults_for_missing_keys() {
		let cfg = ServerConfig::from_file(toml::from_str("").expect("parse"));
		assert_eq!(cfg.server.token_ttl, Duration::from_secs(240 * 60));
		assert_eq!(cfg.server.max_targets, 8);
		assert_eq!(cfg.server.possession_confirm_timeout, Duration::from_secs(10));
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn from_file_reads_server_table() {
		let file = toml::from_str(
			r#"
			[server]
			token_ttl_minutes = 30
			max_targets = 3
			auth_hmac_secret = "hunter2"

			[persistence]
			enabled = true
			database_url = "sqlite::memory:"
			"#,
		)
		.expect("parse");
		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.token_ttl, Duration::from_secs(30 * 60));
		assert_eq!(cfg.server.max_targets, 3);
		assert!(cfg.server.auth_hmac_secret.is_some());
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
	}

	#[test]
	fn blank_strings_are_treated_as_unset() {
		let file = toml::from_str(
			r#"
			[server]
			tls_cert_path = "  "
			required_client_version = ""
			"#,
		)
		.expect("parse");
		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.tls_cert_path.is_none());
		assert!(cfg.server.required_client_version.is_none());
	}

	#[test]
	fn parses_env_bool_forms() {
		assert_eq!(parse_env_bool("TRUE"), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
