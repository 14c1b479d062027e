//! Dispatcher (spec.md §4.3): turns `(source, target host:port)` into a
//! routing decision by walking rules, falling back to sticky sessions, then
//! the load balancer.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::dns::DnsResolver;
use crate::lb::{self, Balancer, Candidate};
use crate::model::{ClientActivity, RecentTargets, Rule, RuleKind, RuntimeSettings};
use crate::settings::{ModuleKey, SettingsSubscriber};
use crate::state::StateManager;
use crate::sticky::{ServerLookup, StickyManager};
use crate::strategy::DynStrategy;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";

#[derive(Debug)]
pub enum DispatchError {
	NoHealthyBackend,
}

pub struct Decision {
	pub strategy: Option<DynStrategy>,
	pub server_id: String,
	/// `Some` iff `strategy` is `Some`; lets the caller bracket the flow with
	/// `Dispatcher::mark_active_start`/`mark_active_end` for the `least-connections`
	/// balancer's candidate counters (spec.md §3: "Metrics.active-connections is
	/// mutated live by the strategy").
	pub backend_id: Option<Uuid>,
}

impl Decision {
	fn reserved(literal: &'static str) -> Decision {
		Decision { strategy: None, server_id: literal.to_string(), backend_id: None }
	}

	fn backend(id: Uuid, strategy: DynStrategy) -> Decision {
		Decision { strategy: Some(strategy), server_id: id.to_string(), backend_id: Some(id) }
	}
}

fn host_port(target: &str) -> (&str, Option<u16>) {
	match target.rsplit_once(':') {
		Some((host, port)) => (host, port.parse().ok()),
		None => (target, None),
	}
}

fn domain_matches(pattern: &str, host: &str) -> bool {
	let pattern = pattern.to_ascii_lowercase();
	let host = host.to_ascii_lowercase();
	if let Some(suffix) = pattern.strip_prefix('.') {
		return host.len() > suffix.len() && host.ends_with(suffix) && host[..host.len() - suffix.len()].ends_with('.');
	}
	let suffix = pattern.strip_prefix("*.").unwrap_or(pattern.as_str());
	host == suffix || host.ends_with(&format!(".{suffix}"))
}

fn parse_cidr(raw: &str) -> Option<IpNet> {
	if let Ok(net) = raw.parse::<IpNet>() {
		return Some(net);
	}
	match raw.parse::<IpAddr>().ok()? {
		IpAddr::V4(ip) => Some(IpNet::V4(ip.into())),
		IpAddr::V6(ip) => Some(IpNet::V6(ip.into())),
	}
}

/// Looks a rule's target remark up among currently known servers at dispatch
/// time rather than maintaining a separately-cached resolved table; given
/// B-zone publication is atomic this is behaviorally equivalent and avoids a
/// second subscribe/rebuild channel (see DESIGN.md).
fn resolve_backend(state: &StateManager, target: &str) -> Option<(Uuid, DynStrategy)> {
	let zone = state.working_zone();
	zone.values().find(|s| s.profile.remark == target).and_then(|s| s.strategy.clone().map(|strat| (s.id(), strat)))
}

fn is_active_and_up(state: &StateManager, id: Uuid) -> bool {
	state.working_zone().get(&id).map(|s| s.is_usable()).unwrap_or(false)
}

struct HealthPredicate<'a>(&'a StateManager);
impl ServerLookup for HealthPredicate<'_> {
	fn is_active_and_up(&self, server_id: Uuid) -> bool {
		is_active_and_up(self.0, server_id)
	}
}

pub struct Dispatcher {
	state: Arc<StateManager>,
	resolver: Arc<DnsResolver>,
	rules: ArcSwap<Vec<Rule>>,
	sticky: ArcSwap<StickyManager>,
	sticky_sweeper: Mutex<Option<JoinHandle<()>>>,
	balancer: ArcSwap<Box<dyn Balancer>>,
	recent_targets: RecentTargets,
	client_activity: ClientActivity,
}

impl Dispatcher {
	pub fn new(state: Arc<StateManager>, resolver: Arc<DnsResolver>, settings: &RuntimeSettings) -> Arc<Self> {
		let sticky = Arc::new(StickyManager::new(
			settings.gateway.sticky_session_mode,
			settings.gateway.sticky_session_ttl,
			&settings.gateway.sticky_patterns,
		));
		let sweeper = crate::sticky::spawn(sticky.clone());
		let mut rules = settings.routing.rules.clone();
		rules.sort_by_key(|r| r.priority);

		Arc::new(Dispatcher {
			state,
			resolver,
			rules: ArcSwap::new(Arc::new(rules)),
			sticky: ArcSwap::new(sticky),
			sticky_sweeper: Mutex::new(Some(sweeper)),
			balancer: ArcSwap::new(Arc::new(lb::build(settings.gateway.lb_strategy))),
			recent_targets: RecentTargets::new(),
			client_activity: ClientActivity::new(),
		})
	}

	/// Walks rules, then sticky, then the load balancer, per spec.md §4.3's
	/// numbered decision order.
	pub async fn dispatch(&self, source: IpAddr, target: &str) -> Result<Decision, DispatchError> {
		self.recent_targets.record(target);
		self.client_activity.touch(source);

		let (host, _port) = host_port(target);

		for rule in self.rules.load().iter() {
			if !self.rule_matches(rule, source, host).await {
				continue;
			}
			if rule.target == DIRECT {
				return Ok(Decision::reserved(DIRECT));
			}
			if rule.target == REJECT {
				return Ok(Decision::reserved(REJECT));
			}
			match resolve_backend(&self.state, &rule.target) {
				Some((id, strategy)) if is_active_and_up(&self.state, id) => {
					return Ok(Decision::backend(id, strategy));
				},
				_ => continue, // matched rule but backend down: keep scanning (spec.md §4.3 step 3)
			}
		}

		let sticky = self.sticky.load();
		if sticky.applies_to(host) {
			let predicate = HealthPredicate(&self.state);
			if let Some(id) = sticky.lookup(source, host, &predicate) {
				if let Some((found_id, strategy)) = resolve_backend_by_id(&self.state, id) {
					debug_assert_eq!(found_id, id);
					return Ok(Decision::backend(id, strategy));
				}
			}
		}

		let zone = self.state.working_zone();
		let candidates: Vec<Candidate> =
			zone.values().filter(|s| s.is_usable()).map(|s| Candidate { id: s.id(), active_connections: s.metrics.active_connections() }).collect();
		let balancer = self.balancer.load();
		let selected = balancer.select(&candidates).ok_or(DispatchError::NoHealthyBackend)?;
		let strategy = zone.get(&selected).and_then(|s| s.strategy.clone()).ok_or(DispatchError::NoHealthyBackend)?;

		if sticky.applies_to(host) {
			sticky.insert(source, host, selected);
		}
		Ok(Decision::backend(selected, strategy))
	}

	async fn rule_matches(&self, rule: &Rule, source: IpAddr, host: &str) -> bool {
		match rule.kind {
			RuleKind::Domain => rule.values.iter().any(|p| domain_matches(p, host)),
			RuleKind::SourceIp => rule.values.iter().filter_map(|p| parse_cidr(p)).any(|net| net.contains(&source)),
			RuleKind::DestIp => {
				let dest_ip = match host.parse::<IpAddr>() {
					Ok(ip) => Some(ip),
					Err(_) => self.resolver.resolve_first(host).await.ok(),
				};
				match dest_ip {
					Some(ip) => rule.values.iter().filter_map(|p| parse_cidr(p)).any(|net| net.contains(&ip)),
					None => false,
				}
			},
		}
	}

	/// Swaps in the sticky manager for a new `gateway` settings snapshot,
	/// stopping the old one's cleaner task (spec.md §4.3).
	fn replace_sticky(&self, settings: &RuntimeSettings) {
		let new_sticky =
			Arc::new(StickyManager::new(settings.gateway.sticky_session_mode, settings.gateway.sticky_session_ttl, &settings.gateway.sticky_patterns));
		let new_sweeper = crate::sticky::spawn(new_sticky.clone());
		self.sticky.store(new_sticky);
		self.balancer.store(Arc::new(lb::build(settings.gateway.lb_strategy)));
		if let Some(old) = self.sticky_sweeper.lock().unwrap().replace(new_sweeper) {
			old.abort();
		}
	}

	fn rebuild_rules(&self, settings: &RuntimeSettings) {
		let mut rules = settings.routing.rules.clone();
		rules.sort_by_key(|r| r.priority);
		debug!(count = rules.len(), "routing rules rebuilt");
		self.rules.store(Arc::new(rules));
	}

	/// Bracket a relayed flow so `least-connections` reflects real concurrency
	/// at the next publish (spec.md §4.5.5, §9 "byte counting via a wrapping
	/// adapter" applied to connection counts instead of bytes).
	pub fn mark_active_start(&self, id: Uuid) {
		self.state.incr_active(id);
	}

	pub fn mark_active_end(&self, id: Uuid) {
		self.state.decr_active(id);
	}
}

fn resolve_backend_by_id(state: &StateManager, id: Uuid) -> Option<(Uuid, DynStrategy)> {
	let zone = state.working_zone();
	zone.get(&id).and_then(|s| s.strategy.clone()).map(|strat| (id, strat))
}

impl SettingsSubscriber for Dispatcher {
	fn on_settings_update(&self, key: ModuleKey, new_value: &RuntimeSettings) {
		match key {
			ModuleKey::Gateway => self.replace_sticky(new_value),
			ModuleKey::Routing => self.rebuild_rules(new_value),
			_ => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn domain_rule_matches_leading_dot_as_strict_subdomain() {
		assert!(domain_matches(".example.com", "www.example.com"));
		assert!(!domain_matches(".example.com", "example.com"));
	}

	#[test]
	fn domain_rule_matches_wildcard_suffix() {
		assert!(domain_matches("*.example.com", "example.com"));
		assert!(domain_matches("*.example.com", "www.example.com"));
		assert!(!domain_matches("*.example.com", "notexample.com"));
	}

	#[test]
	fn domain_rule_equals_is_case_insensitive() {
		assert!(domain_matches("Example.COM", "example.com"));
	}

	#[test]
	fn domain_rule_bare_pattern_matches_equals_or_subdomain() {
		assert!(domain_matches("example.com", "example.com"));
		assert!(domain_matches("example.com", "www.example.com"));
		assert!(!domain_matches("example.com", "notexample.com"));
	}

	#[test]
	fn host_port_splits_trailing_port() {
		assert_eq!(host_port("example.com:443"), ("example.com", Some(443)));
		assert_eq!(host_port("example.com"), ("example.com", None));
	}
}
