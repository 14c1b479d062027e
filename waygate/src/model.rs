//! Core data model shared by the dispatcher, state manager, and strategies.
//!
//! Types here are the in-memory shape of spec.md §3's data model:
//! `ServerProfile`, `ServerState`, `Rule`, `FirewallRule`, `StickyRecord`, and
//! the `RuntimeSettings` tree the settings manager publishes.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::DynStrategy;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
	CustomRemote,
	HttpUpstream,
	Socks5Upstream,
	Vless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkLayer {
	Tcp,
	Ws,
	Wss,
	Grpc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

/// Transport-specific knobs: WS path/host, multiplex toggle, CDN edge-ip
/// pinning, and the gRPC service/authority/mode triple VLESS uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportOptions {
	#[serde(default)]
	pub ws_path: Option<String>,
	#[serde(default)]
	pub ws_host: Option<String>,
	#[serde(default)]
	pub multiplex: bool,
	#[serde(default)]
	pub edge_ip: Option<String>,
	#[serde(default)]
	pub grpc_service: Option<String>,
	#[serde(default)]
	pub grpc_authority: Option<String>,
	#[serde(default)]
	pub grpc_mode: Option<String>,
}

/// VLESS-specific security parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityOptions {
	#[serde(default)]
	pub uuid: Option<String>,
	#[serde(default)]
	pub flow: Option<String>,
	#[serde(default)]
	pub sni: Option<String>,
	#[serde(default)]
	pub fingerprint: Option<String>,
	#[serde(default)]
	pub public_key: Option<String>,
	#[serde(default)]
	pub short_id: Option<String>,
}

/// Static description of one remote outbound. Created by admin input or the
/// mobile bootstrap path; mutated only from the staging (A) zone, never
/// after publication to the working (B) zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
	pub id: Uuid,
	pub remark: String,
	pub kind: ServerKind,
	pub network: NetworkLayer,
	pub address: String,
	pub port: u16,
	#[serde(default)]
	pub credentials: Option<Credentials>,
	#[serde(default)]
	pub transport: TransportOptions,
	#[serde(default)]
	pub security: SecurityOptions,
	#[serde(default)]
	pub crypt: i64,
	#[serde(default)]
	pub active: bool,
}

impl ServerProfile {
	pub fn addr_string(&self) -> String {
		format!("{}:{}", self.address, self.port)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Health {
	#[default]
	Unknown,
	Up,
	Down,
}

/// Live, atomically-mutated counters for one `ServerState`. `active_connections`
/// is written by the owning strategy on handshake start/end; `latency_ms` is
/// written only by the health checker.
#[derive(Debug, Default)]
pub struct Metrics {
	active_connections: AtomicI64,
	latency_ms: AtomicI64,
}

impl Metrics {
	pub fn active_connections(&self) -> i64 {
		self.active_connections.load(Ordering::Relaxed)
	}

	pub fn incr_active(&self) {
		self.active_connections.fetch_add(1, Ordering::Relaxed);
	}

	pub fn decr_active(&self) {
		self.active_connections.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn latency_ms(&self) -> i64 {
		self.latency_ms.load(Ordering::Relaxed)
	}

	pub fn set_latency_ms(&self, v: i64) {
		self.latency_ms.store(v, Ordering::Relaxed);
	}

	/// Snapshot clone used by the A→B publish step (spec: "cloning the
	/// metrics struct to avoid cross-zone races").
	pub fn snapshot(&self) -> Metrics {
		Metrics {
			active_connections: AtomicI64::new(self.active_connections()),
			latency_ms: AtomicI64::new(self.latency_ms()),
		}
	}
}

/// Runtime envelope around a `ServerProfile`. `strategy` is `Some` iff the
/// profile is active and instance creation/initialization succeeded.
#[derive(Clone)]
pub struct ServerState {
	pub profile: Arc<ServerProfile>,
	pub strategy: Option<DynStrategy>,
	pub health: Health,
	pub metrics: Arc<Metrics>,
	pub exit_ip: Option<String>,
}

impl ServerState {
	pub fn new(profile: Arc<ServerProfile>) -> Self {
		ServerState {
			profile,
			strategy: None,
			health: Health::Unknown,
			metrics: Arc::new(Metrics::default()),
			exit_ip: None,
		}
	}

	pub fn id(&self) -> Uuid {
		self.profile.id
	}

	pub fn is_usable(&self) -> bool {
		self.profile.active && self.strategy.is_some() && self.health == Health::Up
	}

	/// Deep-copy for the A→B publish: profile and strategy are shared by
	/// reference, metrics are cloned so the two zones never alias the same
	/// atomics (spec §4.6).
	pub fn publish_copy(&self) -> Self {
		ServerState {
			profile: self.profile.clone(),
			strategy: self.strategy.clone(),
			health: self.health,
			metrics: Arc::new(self.metrics.snapshot()),
			exit_ip: self.exit_ip.clone(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
	Domain,
	DestIp,
	SourceIp,
}

/// `{priority, kind, values, target}`. `target` is either a profile remark
/// or one of the reserved literals `DIRECT`/`REJECT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
	pub priority: i32,
	pub kind: RuleKind,
	pub values: Vec<String>,
	pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Tcp,
	Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
	Allow,
	Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
	pub priority: i32,
	#[serde(default)]
	pub protocol: Option<Protocol>,
	#[serde(default)]
	pub source_cidrs: Vec<String>,
	#[serde(default)]
	pub dest_cidrs: Vec<String>,
	/// Comma-separated `n` or `n-m` ranges, 1..=65535.
	#[serde(default)]
	pub dest_ports: String,
	pub action: FirewallAction,
}

/// `{server-id, expiry}`, keyed by `"client-ip:dest-host"`.
#[derive(Debug, Clone)]
pub struct StickyRecord {
	pub server_id: Uuid,
	pub expiry: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StickyMode {
	#[default]
	Disabled,
	Global,
	Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LbStrategy {
	#[default]
	LeastConnections,
	RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
	#[serde(default)]
	pub sticky_session_mode: StickyMode,
	#[serde(default = "default_ttl")]
	pub sticky_session_ttl: i64,
	#[serde(default)]
	pub sticky_patterns: Vec<String>,
	#[serde(default)]
	pub lb_strategy: LbStrategy,
}

fn default_ttl() -> i64 {
	300
}

impl Default for GatewaySettings {
	fn default() -> Self {
		GatewaySettings {
			sticky_session_mode: StickyMode::Disabled,
			sticky_session_ttl: default_ttl(),
			sticky_patterns: Vec::new(),
			lb_strategy: LbStrategy::LeastConnections,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSettings {
	#[serde(default)]
	pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSettings {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub rules: Vec<FirewallRule>,
}

impl Default for FirewallSettings {
	fn default() -> Self {
		FirewallSettings {
			enabled: false,
			rules: vec![FirewallRule {
				priority: 9999,
				protocol: None,
				source_cidrs: Vec::new(),
				dest_cidrs: Vec::new(),
				dest_ports: String::new(),
				action: FirewallAction::Allow,
			}],
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
	#[serde(default)]
	pub level: Option<String>,
}

/// Versioned, immutable settings blob. Held behind an `arc_swap::ArcSwap` by
/// the settings manager; one atomic pointer load gives a lock-free reader a
/// consistent snapshot of every module at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
	#[serde(default)]
	pub gateway: GatewaySettings,
	#[serde(default)]
	pub routing: RoutingSettings,
	#[serde(default)]
	pub firewall: FirewallSettings,
	#[serde(default)]
	pub logging: LoggingSettings,
}

/// Bounded, de-duplicated FIFO of recently dispatched targets (spec §4.3 step 1).
#[derive(Debug, Default)]
pub struct RecentTargets {
	inner: std::sync::Mutex<std::collections::VecDeque<String>>,
}

const RECENT_TARGETS_CAP: usize = 20;

impl RecentTargets {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, target: &str) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(pos) = inner.iter().position(|t| t == target) {
			inner.remove(pos);
		}
		inner.push_back(target.to_string());
		while inner.len() > RECENT_TARGETS_CAP {
			inner.pop_front();
		}
	}

	pub fn snapshot(&self) -> Vec<String> {
		self.inner.lock().unwrap().iter().cloned().collect()
	}
}

/// Per-client-ip last-seen tracker, used only for reporting (spec §4.3 step 2).
#[derive(Debug, Default)]
pub struct ClientActivity {
	inner: std::sync::Mutex<std::collections::HashMap<IpAddr, Instant>>,
}

impl ClientActivity {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn touch(&self, ip: IpAddr) {
		self.inner.lock().unwrap().insert(ip, Instant::now());
	}

	pub fn last_seen(&self, ip: &IpAddr) -> Option<Instant> {
		self.inner.lock().unwrap().get(ip).copied()
	}
}

pub type SharedCounter = Arc<AtomicU64>;
