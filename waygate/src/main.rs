//! Bootstrap (spec.md §6): parses the CLI, loads `liuproxy.ini`/`servers.json`/
//! `settings.json`, wires the state manager, dispatcher, firewall, health
//! checker, and stats loop together, then serves the unified gateway (and,
//! on Linux, the transparent gateway) until shutdown.

mod config;
mod dispatcher;
mod dns;
mod events;
mod firewall;
mod gateway;
mod health;
mod lb;
mod metrics;
mod model;
mod settings;
mod sniffer;
mod socks5;
mod state;
mod stats;
mod sticky;
mod strategy;
mod ws;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::config::{BootConfig, ConfigError, SystemEnvOverrides};
use crate::dispatcher::Dispatcher;
use crate::dns::DnsResolver;
use crate::firewall::FirewallHandle;
use crate::health::HealthChecker;
use crate::model::RuntimeSettings;
use crate::settings::{ModuleKey, SettingsManager, SettingsSubscriber};
use crate::state::StateManager;
use crate::strategy::StrategyContext;

#[derive(Parser, Debug)]
#[command(name = "waygate", about = "Multi-protocol proxy gateway", long_about = None)]
struct Args {
	/// Directory containing liuproxy.ini, servers.json, and settings.json.
	#[arg(long, default_value = "configs")]
	configdir: PathBuf,
}

struct LoggingSubscriber;

impl SettingsSubscriber for LoggingSubscriber {
	fn on_settings_update(&self, _key: ModuleKey, new_value: &RuntimeSettings) {
		if let Some(level) = &new_value.logging.level {
			if let Err(e) = waygate_core::telemetry::set_level(true, level) {
				error!(err = %e, "failed to apply log level update");
			}
		}
	}
}

fn main() -> anyhow::Result<()> {
	waygate_core::telemetry::setup_logging();
	let args = Args::parse();

	tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	info!(version = env!("CARGO_PKG_VERSION"), "starting waygate");

	let ready = waygate_core::readiness::Ready::new();
	let bootstrap_task = ready.register_task("bootstrap");

	let ini_path = args.configdir.join("liuproxy.ini");
	let servers_path = args.configdir.join("servers.json");
	let settings_path = args.configdir.join("settings.json");

	let boot = match config::load_boot_config(&ini_path) {
		Ok(b) => b,
		Err(e) => {
			error!(err = %e, "failed to load boot config, exiting");
			std::process::exit(1);
		},
	};

	let settings_existed = settings_path.exists();
	let mut settings = match config::load_or_init_settings(&settings_path) {
		Ok(s) => s,
		Err(e) => {
			error!(err = %e, "failed to load settings, exiting");
			std::process::exit(1);
		},
	};
	if !settings_existed {
		// Seed the freshly-created settings.json from the boot ini's sticky
		// parameters rather than the flat defaults; once the file exists the
		// settings manager is the sole authority (spec.md §6/§4.8).
		settings.gateway.sticky_session_mode = boot.sticky_session_mode;
		settings.gateway.sticky_session_ttl = boot.sticky_session_ttl;
		if let Err(e) = config::save_settings(&settings_path, &settings) {
			error!(err = %e, "failed to persist seeded settings");
		}
	}

	let profiles = match config::load_servers(&servers_path) {
		Ok(p) => p,
		Err(e) if matches!(e, ConfigError::Read(..)) => {
			info!("no servers.json found, starting with an empty server list");
			Vec::new()
		},
		Err(e) => {
			error!(err = %e, "failed to load servers, exiting");
			std::process::exit(1);
		},
	};

	let system_env = SystemEnvOverrides::from_env();
	info!(
		tcp = system_env.transparent_tcp_enabled,
		udp = system_env.transparent_udp_enabled,
		excluded = system_env.excluded_ips.len(),
		"system-env overrides loaded"
	);

	let resolver = Arc::new(DnsResolver::new());
	let ctx = StrategyContext { resolver: resolver.clone() };
	let (events_tx, _events_rx) = events::channel();

	// Registered once at bootstrap; no admin/HTTP surface exposes the
	// `Registry` here (out of scope), but the `Metrics` handle it produced
	// stays load-bearing via the gateways and the stats loop below.
	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(metrics::Metrics::new(&mut registry));

	let state = Arc::new(StateManager::new(ctx, events_tx.clone()));
	for profile in profiles {
		// A bare profile without a crypt key falls back to the boot ini's
		// global `crypt` (spec.md §4.1 names it a single configured integer;
		// allowing a per-profile override is a harmless generalization — see
		// DESIGN.md).
		let profile = if profile.crypt == 0 { model::ServerProfile { crypt: boot.crypt, ..profile } } else { profile };
		state.upsert_profile(Arc::new(profile));
	}
	state.manage_instances().await;
	state.publish();

	let settings_manager = SettingsManager::new(settings.clone(), Some(settings_path));

	let dispatcher = Dispatcher::new(state.clone(), resolver.clone(), &settings);
	settings_manager.subscribe(ModuleKey::Gateway, dispatcher.clone());
	settings_manager.subscribe(ModuleKey::Routing, dispatcher.clone());

	let firewall = FirewallHandle::new(&settings.firewall);
	settings_manager.subscribe(ModuleKey::Firewall, firewall.clone());

	settings_manager.subscribe(ModuleKey::Logging, Arc::new(LoggingSubscriber));

	let health_checker = Arc::new(HealthChecker::new(state.clone(), events_tx.clone()));
	health_checker.run_once().await; // bootstrap cycle, before anything is marked ready
	tokio::spawn(health_checker.clone().run());
	tokio::spawn(stats::run(state.clone(), events_tx.clone(), metrics.clone()));

	drop(bootstrap_task);

	let (drain_trigger, drain_watcher) = waygate_core::drain::new();
	let unified_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), boot.unified_port);
	let unified = gateway::UnifiedGateway::new(dispatcher.clone(), resolver.clone(), events_tx.clone(), metrics.clone());
	let gateway_task = ready.register_task("unified-gateway");
	tokio::spawn({
		let unified = unified.clone();
		let watcher = drain_watcher.clone();
		async move {
			if let Err(e) = unified.run(unified_addr, watcher).await {
				error!(err = %e, "unified gateway exited");
			}
		}
	});
	drop(gateway_task);

	#[cfg(target_os = "linux")]
	{
		if system_env.transparent_tcp_enabled || system_env.transparent_udp_enabled {
			let transparent = gateway::TransparentGateway::new(dispatcher.clone(), firewall.clone(), events_tx.clone(), format!("transparent.virtual-target:{}", boot.tproxy_port));
			let tproxy_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), boot.tproxy_port);
			if system_env.transparent_tcp_enabled {
				let transparent = transparent.clone();
				let watcher = drain_watcher.clone();
				tokio::spawn(async move {
					if let Err(e) = transparent.run_tcp(tproxy_addr, watcher).await {
						error!(err = %e, "transparent TCP gateway exited");
					}
				});
			}
			if system_env.transparent_udp_enabled {
				let transparent = transparent.clone();
				let watcher = drain_watcher.clone();
				tokio::spawn(async move {
					if let Err(e) = transparent.run_udp(tproxy_addr, watcher).await {
						error!(err = %e, "transparent UDP gateway exited");
					}
				});
			}
		}
	}

	let shutdown = waygate_core::signal::Shutdown::new();
	shutdown.wait().await;
	info!("shutdown requested, draining in-flight connections");
	drop(drain_watcher);
	drain_trigger.start_drain_and_wait().await;
	info!("drained, exiting");
	Ok(())
}
