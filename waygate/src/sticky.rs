//! Sticky Manager (spec.md §4.4): a TTL-bounded `(client-ip, dest-host) ->
//! server-id` map with optional per-rule applicability, plus a best-effort
//! background sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;
use uuid::Uuid;

use crate::model::{StickyMode, StickyRecord};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn session_key(client_ip: IpAddr, dest_host: &str) -> String {
	format!("{client_ip}:{dest_host}")
}

/// Compiles a sticky pattern into a matcher: `*`-containing patterns become a
/// case-insensitive regex (`.` literal, `*` → `.*`); everything else is a
/// literal case-insensitive equals (spec.md §4.4).
enum Pattern {
	Literal(String),
	Wildcard(Regex),
}

impl Pattern {
	fn compile(raw: &str) -> Pattern {
		if !raw.contains('*') {
			return Pattern::Literal(raw.to_ascii_lowercase());
		}
		let body: String = raw.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
		match Regex::new(&format!("(?i)^{body}$")) {
			Ok(re) => Pattern::Wildcard(re),
			Err(_) => Pattern::Literal(raw.to_ascii_lowercase()),
		}
	}

	fn matches(&self, host: &str) -> bool {
		match self {
			Pattern::Literal(lit) => lit.eq_ignore_ascii_case(host),
			Pattern::Wildcard(re) => re.is_match(host),
		}
	}
}

/// A server-health predicate injected by the dispatcher so the sticky
/// manager never needs to know about `ServerState`/zone internals directly.
pub trait ServerLookup: Send + Sync {
	fn is_active_and_up(&self, server_id: Uuid) -> bool;
}

pub struct StickyManager {
	mode: StickyMode,
	ttl: Duration,
	patterns: Vec<Pattern>,
	sessions: Mutex<HashMap<String, StickyRecord>>,
}

impl StickyManager {
	/// `ttl <= 0` disables the manager regardless of mode (spec.md §4.4).
	pub fn new(mode: StickyMode, ttl_secs: i64, raw_patterns: &[String]) -> Self {
		let effective_mode = if ttl_secs <= 0 { StickyMode::Disabled } else { mode };
		let patterns = raw_patterns.iter().map(|p| Pattern::compile(p)).collect();
		StickyManager {
			mode: effective_mode,
			ttl: Duration::from_secs(ttl_secs.max(0) as u64),
			patterns,
			sessions: Mutex::new(HashMap::new()),
		}
	}

	pub fn applies_to(&self, dest_host: &str) -> bool {
		match self.mode {
			StickyMode::Disabled => false,
			StickyMode::Global => true,
			StickyMode::Conditional => self.patterns.iter().any(|p| p.matches(dest_host)),
		}
	}

	/// Looks up and refreshes a sticky entry. Expired or no-longer-healthy
	/// entries are evicted on read (spec.md §9: "sticky eviction on read").
	pub fn lookup(&self, client_ip: IpAddr, dest_host: &str, healthy: &dyn ServerLookup) -> Option<Uuid> {
		if self.mode == StickyMode::Disabled {
			return None;
		}
		let key = session_key(client_ip, dest_host);
		let mut sessions = self.sessions.lock().unwrap();
		let record = sessions.get(&key)?;
		if record.expiry < Instant::now() || !healthy.is_active_and_up(record.server_id) {
			sessions.remove(&key);
			return None;
		}
		let server_id = record.server_id;
		sessions.insert(key, StickyRecord { server_id, expiry: Instant::now() + self.ttl });
		Some(server_id)
	}

	pub fn insert(&self, client_ip: IpAddr, dest_host: &str, server_id: Uuid) {
		if self.mode == StickyMode::Disabled {
			return;
		}
		let key = session_key(client_ip, dest_host);
		self.sessions.lock().unwrap().insert(key, StickyRecord { server_id, expiry: Instant::now() + self.ttl });
	}

	fn sweep(&self) {
		let now = Instant::now();
		let mut sessions = self.sessions.lock().unwrap();
		let before = sessions.len();
		sessions.retain(|_, record| record.expiry >= now);
		let removed = before - sessions.len();
		if removed > 0 {
			debug!(removed, "sticky sweep evicted expired entries");
		}
	}
}

/// Wraps a `StickyManager` in an `Arc` and spawns its background 60s sweep
/// tick, matching spec.md §4.4's "a background task ticks every 60 seconds".
/// Split from `StickyManager::new` because the sweep needs a strong
/// reference it can hold across awaits.
pub fn spawn(manager: std::sync::Arc<StickyManager>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = interval(CLEANUP_INTERVAL);
		loop {
			tick.tick().await;
			manager.sweep();
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	struct AlwaysUp;
	impl ServerLookup for AlwaysUp {
		fn is_active_and_up(&self, _server_id: Uuid) -> bool {
			true
		}
	}

	struct AlwaysDown;
	impl ServerLookup for AlwaysDown {
		fn is_active_and_up(&self, _server_id: Uuid) -> bool {
			false
		}
	}

	#[test]
	fn disabled_mode_never_applies() {
		let mgr = StickyManager::new(StickyMode::Disabled, 300, &[]);
		assert!(!mgr.applies_to("example.com"));
	}

	#[test]
	fn ttl_zero_forces_disabled() {
		let mgr = StickyManager::new(StickyMode::Global, 0, &[]);
		assert!(!mgr.applies_to("example.com"));
	}

	#[test]
	fn conditional_matches_wildcard_pattern() {
		let mgr = StickyManager::new(StickyMode::Conditional, 300, &["*.example.com".to_string()]);
		assert!(mgr.applies_to("www.example.com"));
		assert!(!mgr.applies_to("other.com"));
	}

	#[test]
	fn lookup_refreshes_expiry_and_evicts_unhealthy() {
		let mgr = StickyManager::new(StickyMode::Global, 300, &[]);
		let ip: IpAddr = "192.168.1.10".parse().unwrap();
		let id = Uuid::new_v4();
		mgr.insert(ip, "www.site.com", id);
		assert_eq!(mgr.lookup(ip, "www.site.com", &AlwaysUp), Some(id));
		assert_eq!(mgr.lookup(ip, "www.site.com", &AlwaysDown), None);
	}
}
