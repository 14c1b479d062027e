//! Process-wide logging setup.
//!
//! A single global `tracing` subscriber is installed at startup. The active
//! filter is held behind a [`reload::Handle`] so the settings manager can
//! change the log level at runtime (spec's `[log] level` setting) without a
//! restart.

use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, filter, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

type FilteredLayer = filter::Filtered<
	Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync + 'static>,
	filter::Targets,
	Registry,
>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid log filter: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("log handle not yet initialized")]
	Uninitialized,
	#[error("failed to apply filter reload: {0}")]
	Reload(#[from] reload::Error),
}

/// Installs the global subscriber. Must be called exactly once, as early in
/// `main` as possible, before anything else logs.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let format: Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync + 'static> =
		Box::new(tracing_subscriber::fmt::layer().with_target(true));
	let filter = default_filter();
	let (layer, reload) = reload::Layer::new(format.with_filter(filter));
	let _ = LOG_HANDLE.set(reload);
	tracing_subscriber::registry().with(layer).init();
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

/// Dynamically changes the active log level, as driven by the settings
/// manager's `[log] level` field. If `reset` is true, the rest of the
/// existing per-target overrides are discarded first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	handle.modify(|layer| {
		let new_filter = if reset {
			filter::Targets::from_str(level).unwrap_or_default()
		} else {
			let existing = format!("{:?}", layer.filter());
			filter::Targets::from_str(&format!("{existing},{level}")).unwrap_or_default()
		};
		*layer.filter_mut() = new_filter;
	})?;
	Ok(())
}

/// Returns whether `target` would currently emit at `level`, without
/// actually logging anything. Useful for expensive-to-construct log fields.
pub fn enabled(target: &str, level: tracing::Level) -> bool {
	let Some(handle) = LOG_HANDLE.get() else {
		return false;
	};
	handle
		.with_current(|f| f.filter().would_enable(target, &level))
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_filter_parses_env_or_falls_back_to_info() {
		let f = filter::Targets::from_str("info").unwrap();
		assert!(format!("{f:?}").contains("info"));
	}
}
