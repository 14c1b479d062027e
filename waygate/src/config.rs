//! Boot-time configuration (spec.md §6): `liuproxy.ini`'s static parameters,
//! `servers.json`'s profile list, and `settings.json`'s runtime settings
//! (auto-created with defaults if missing), plus the handful of environment
//! overrides spec.md §6 names.
//!
//! Mirrors the teacher's `parse::<T>(env) -> anyhow::Result<Option<T>>`
//! env-override helper (`crates/agentgateway/src/config.rs`), adapted to
//! `.ini`-sourced boot parameters instead of the teacher's YAML/xDS config.

use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ini::Ini;
use thiserror::Error;

use crate::model::{RuntimeSettings, ServerProfile, StickyMode};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {0}: {1}")]
	Read(PathBuf, std::io::Error),
	#[error("failed to parse ini {0}: {1}")]
	Ini(PathBuf, ini::Error),
	#[error("failed to parse json {0}: {1}")]
	Json(PathBuf, serde_json::Error),
	#[error("missing required ini key [{0}] {1}")]
	MissingKey(&'static str, &'static str),
	#[error("invalid value for [{0}] {1} = {2:?}: {3}")]
	InvalidValue(&'static str, &'static str, String, String),
	#[error("invalid env var {0}={1}: {2}")]
	InvalidEnv(&'static str, String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
	Fatal,
}

impl FromStr for LogLevel {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"debug" => Ok(LogLevel::Debug),
			"info" => Ok(LogLevel::Info),
			"warn" => Ok(LogLevel::Warn),
			"error" => Ok(LogLevel::Error),
			"fatal" => Ok(LogLevel::Fatal),
			other => Err(format!("unknown log level {other:?}")),
		}
	}
}

impl LogLevel {
	/// Maps to the `tracing`/`EnvFilter` level the fatal variant has no direct
	/// equivalent for, so it is treated as `error` for filtering purposes.
	pub fn as_tracing_level(&self) -> &'static str {
		match self {
			LogLevel::Debug => "debug",
			LogLevel::Info => "info",
			LogLevel::Warn => "warn",
			LogLevel::Error | LogLevel::Fatal => "error",
		}
	}
}

/// `liuproxy.ini`'s static boot parameters (spec.md §6).
#[derive(Debug, Clone)]
pub struct BootConfig {
	pub mode: String,
	pub max_connections: u32,
	pub buffer_size: u32,
	pub crypt: i64,
	pub unified_port: u16,
	pub tproxy_port: u16,
	pub web_port: u16,
	pub web_user: String,
	pub web_password: String,
	pub log_level: LogLevel,
	pub sticky_session_mode: StickyMode,
	pub sticky_session_ttl: i64,
}

fn get<'a>(ini: &'a Ini, section: &'static str, key: &'static str) -> Result<&'a str, ConfigError> {
	ini.section(Some(section))
		.and_then(|s| s.get(key))
		.ok_or(ConfigError::MissingKey(section, key))
}

fn get_opt<'a>(ini: &'a Ini, section: &'static str, key: &'static str) -> Option<&'a str> {
	ini.section(Some(section)).and_then(|s| s.get(key))
}

fn parse_val<T: FromStr>(section: &'static str, key: &'static str, raw: &str) -> Result<T, ConfigError>
where
	T::Err: std::fmt::Display,
{
	raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue(section, key, raw.to_string(), e.to_string()))
}

/// Reads an environment variable override, per the teacher's `parse::<T>(env)`
/// shape: `Ok(None)` if unset, `Err` if set but unparseable.
fn parse_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match env::var(name) {
		Ok(val) => val.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidEnv(name, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

pub fn load_boot_config(path: &Path) -> Result<BootConfig, ConfigError> {
	let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Ini(path.to_path_buf(), e))?;

	let mode = get(&ini, "common", "mode")?.to_string();
	let max_connections = parse_val("common", "maxConnections", get(&ini, "common", "maxConnections")?)?;
	let buffer_size = parse_val("common", "bufferSize", get(&ini, "common", "bufferSize")?)?;
	let mut crypt: i64 = parse_val("common", "crypt", get(&ini, "common", "crypt")?)?;
	if let Some(overridden) = parse_env::<i64>("CRYPT_KEY")? {
		crypt = overridden;
	}

	let unified_port = parse_val("local", "unified_port", get(&ini, "local", "unified_port")?)?;
	let mut tproxy_port = parse_val("local", "tproxy_port", get(&ini, "local", "tproxy_port")?)?;
	if let Some(overridden) = parse_env::<u16>("TPROXY_PORT")? {
		tproxy_port = overridden;
	}
	let web_port = parse_val("local", "web_port", get(&ini, "local", "web_port")?)?;
	let web_user = get(&ini, "local", "web_user")?.to_string();
	let web_password = get(&ini, "local", "web_password")?.to_string();

	let log_level = parse_val("log", "level", get(&ini, "log", "level")?)?;

	let sticky_session_mode = match get_opt(&ini, "Gateway", "sticky_session_mode") {
		Some(raw) => parse_sticky_mode("Gateway", "sticky_session_mode", raw)?,
		None => StickyMode::Disabled,
	};
	let sticky_session_ttl = match get_opt(&ini, "Gateway", "sticky_session_ttl") {
		Some(raw) => parse_val("Gateway", "sticky_session_ttl", raw)?,
		None => 300,
	};

	Ok(BootConfig {
		mode,
		max_connections,
		buffer_size,
		crypt,
		unified_port,
		tproxy_port,
		web_port,
		web_user,
		web_password,
		log_level,
		sticky_session_mode,
		sticky_session_ttl,
	})
}

fn parse_sticky_mode(section: &'static str, key: &'static str, raw: &str) -> Result<StickyMode, ConfigError> {
	match raw.to_ascii_lowercase().as_str() {
		"disabled" => Ok(StickyMode::Disabled),
		"global" => Ok(StickyMode::Global),
		"conditional" => Ok(StickyMode::Conditional),
		other => Err(ConfigError::InvalidValue(section, key, raw.to_string(), format!("unknown sticky mode {other:?}"))),
	}
}

/// The transparent-path knobs spec.md §6 says are "surfaced through the
/// system-env endpoint unchanged" — read verbatim, not otherwise validated or
/// enforced by the core (the admin HTTP surface that reports them is out of
/// scope here).
#[derive(Debug, Clone, Default)]
pub struct SystemEnvOverrides {
	pub transparent_tcp_enabled: bool,
	pub transparent_udp_enabled: bool,
	pub excluded_ips: Vec<IpAddr>,
}

impl SystemEnvOverrides {
	pub fn from_env() -> Self {
		let bool_env = |name: &str| env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
		let excluded_ips = env::var("EXCLUDED_IPS")
			.ok()
			.map(|raw| raw.split(',').filter_map(|s| s.trim().parse().ok()).collect())
			.unwrap_or_default();
		SystemEnvOverrides {
			transparent_tcp_enabled: bool_env("TRANSPARENT_PROXY_TCP_ENABLED"),
			transparent_udp_enabled: bool_env("TRANSPARENT_PROXY_UDP_ENABLED"),
			excluded_ips,
		}
	}
}

pub fn load_servers(path: &Path) -> Result<Vec<ServerProfile>, ConfigError> {
	let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
	serde_json::from_str(&contents).map_err(|e| ConfigError::Json(path.to_path_buf(), e))
}

/// Loads `settings.json`, writing the spec-default blob first if the file
/// doesn't exist yet (spec.md §6: "auto-created with defaults if missing").
pub fn load_or_init_settings(path: &Path) -> Result<RuntimeSettings, ConfigError> {
	if !path.exists() {
		let defaults = RuntimeSettings::default();
		let serialized = serde_json::to_string_pretty(&defaults).map_err(|e| ConfigError::Json(path.to_path_buf(), e))?;
		std::fs::write(path, serialized).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
		return Ok(defaults);
	}
	let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
	serde_json::from_str(&contents).map_err(|e| ConfigError::Json(path.to_path_buf(), e))
}

pub fn save_settings(path: &Path, settings: &RuntimeSettings) -> Result<(), ConfigError> {
	let serialized = serde_json::to_string_pretty(settings).map_err(|e| ConfigError::Json(path.to_path_buf(), e))?;
	std::fs::write(path, serialized).map_err(|e| ConfigError::Read(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
	use super::*;

	struct TempPath(PathBuf);

	impl Drop for TempPath {
		fn drop(&mut self) {
			let _ = std::fs::remove_file(&self.0);
		}
	}

	fn write_temp(name: &str, contents: &str) -> TempPath {
		let mut path = std::env::temp_dir();
		path.push(format!("waygate-test-{}-{name}", std::process::id()));
		std::fs::write(&path, contents).unwrap();
		TempPath(path)
	}

	#[test]
	fn parses_liuproxy_ini() {
		let ini = r#"
[common]
mode=pc
maxConnections=1024
bufferSize=32768
crypt=42

[local]
unified_port=1080
tproxy_port=1090
web_port=8080
web_user=admin
web_password=secret

[log]
level=info

[Gateway]
sticky_session_mode=global
sticky_session_ttl=120
"#;
		let file = write_temp("full.ini", ini);
		let cfg = load_boot_config(&file.0).unwrap();
		assert_eq!(cfg.mode, "pc");
		assert_eq!(cfg.max_connections, 1024);
		assert_eq!(cfg.crypt, 42);
		assert_eq!(cfg.unified_port, 1080);
		assert_eq!(cfg.log_level, LogLevel::Info);
		assert_eq!(cfg.sticky_session_mode, StickyMode::Global);
		assert_eq!(cfg.sticky_session_ttl, 120);
	}

	#[test]
	fn missing_section_defaults_sticky_to_disabled() {
		let ini = r#"
[common]
mode=pc
maxConnections=1024
bufferSize=32768
crypt=42

[local]
unified_port=1080
tproxy_port=1090
web_port=8080
web_user=admin
web_password=secret

[log]
level=warn
"#;
		let file = write_temp("no-gateway.ini", ini);
		let cfg = load_boot_config(&file.0).unwrap();
		assert_eq!(cfg.sticky_session_mode, StickyMode::Disabled);
		assert_eq!(cfg.sticky_session_ttl, 300);
	}

	#[test]
	fn auto_creates_settings_with_spec_defaults() {
		let mut path = std::env::temp_dir();
		path.push(format!("waygate-settings-test-{}.json", std::process::id()));
		let _ = std::fs::remove_file(&path);

		let settings = load_or_init_settings(&path).unwrap();
		assert_eq!(settings.gateway.sticky_session_mode, StickyMode::Disabled);
		assert_eq!(settings.gateway.sticky_session_ttl, 300);
		assert!(settings.routing.rules.is_empty());
		assert!(!settings.firewall.enabled);
		assert_eq!(settings.firewall.rules.len(), 1);
		assert_eq!(settings.firewall.rules[0].priority, 9999);

		assert!(path.exists());
		let _ = std::fs::remove_file(&path);
	}
}
