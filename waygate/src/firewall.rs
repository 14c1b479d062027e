//! Firewall Engine (spec.md §4.11): evaluates 5-tuple packet metadata
//! against a priority-sorted rule list on the transparent path, before the
//! dispatcher sees the flow.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tracing::debug;

use crate::model::{FirewallAction, FirewallRule, FirewallSettings, Protocol, RuntimeSettings};
use crate::settings::{ModuleKey, SettingsSubscriber};

/// Flow metadata the transparent gateway checks before dispatching.
#[derive(Debug, Clone, Copy)]
pub struct FlowMeta {
	pub protocol: Protocol,
	pub source: IpAddr,
	pub dest: IpAddr,
	pub dest_port: u16,
}

struct CompiledRule {
	priority: i32,
	protocol: Option<Protocol>,
	source_nets: Vec<IpNet>,
	dest_nets: Vec<IpNet>,
	port_ranges: Vec<(u16, u16)>,
	action: FirewallAction,
}

/// Parses each rule once into CIDR nets and port ranges, per spec.md §4.11's
/// "parses each rule once into (priority, ..., port-ranges, action)".
pub struct Firewall {
	enabled: bool,
	rules: Vec<CompiledRule>,
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

fn parse_port_ranges(raw: &str) -> Vec<(u16, u16)> {
	raw.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|part| match part.split_once('-') {
			Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
			None => {
				let p: u16 = part.parse().ok()?;
				Some((p, p))
			},
		})
		.collect()
}

impl Firewall {
	pub fn from_settings(settings: &FirewallSettings) -> Self {
		let mut rules: Vec<CompiledRule> = settings
			.rules
			.iter()
			.map(|r: &FirewallRule| CompiledRule {
				priority: r.priority,
				protocol: r.protocol,
				source_nets: r.source_cidrs.iter().filter_map(|s| parse_cidr(s)).collect(),
				dest_nets: r.dest_cidrs.iter().filter_map(|s| parse_cidr(s)).collect(),
				port_ranges: parse_port_ranges(&r.dest_ports),
				action: r.action,
			})
			.collect();
		rules.sort_by_key(|r| r.priority);
		Firewall { enabled: settings.enabled, rules }
	}

	/// `check(meta)` walks rules in priority order; the first whose non-empty
	/// fields all match returns its action. No rules or `enabled=false` →
	/// allow. Rules present, none matching → deny (spec.md §4.11).
	pub fn check(&self, meta: FlowMeta) -> FirewallAction {
		if !self.enabled || self.rules.is_empty() {
			return FirewallAction::Allow;
		}
		for rule in &self.rules {
			if Self::matches(rule, meta) {
				debug!(priority = rule.priority, action = ?rule.action, "firewall rule matched");
				return rule.action;
			}
		}
		FirewallAction::Deny
	}

	fn matches(rule: &CompiledRule, meta: FlowMeta) -> bool {
		if let Some(proto) = rule.protocol {
			if proto != meta.protocol {
				return false;
			}
		}
		if !rule.source_nets.is_empty() && !rule.source_nets.iter().any(|n| n.contains(&meta.source)) {
			return false;
		}
		if !rule.dest_nets.is_empty() && !rule.dest_nets.iter().any(|n| n.contains(&meta.dest)) {
			return false;
		}
		if !rule.port_ranges.is_empty() && !rule.port_ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&meta.dest_port)) {
			return false;
		}
		true
	}
}

/// Holds the live `Firewall` behind an atomic pointer and subscribes to the
/// settings manager's `firewall` module key, so the transparent gateway
/// always checks against the latest rule set without re-dialing anything
/// (spec.md §4.11: "the firewall engine subscribes to firewall").
pub struct FirewallHandle(ArcSwap<Firewall>);

impl FirewallHandle {
	pub fn new(settings: &FirewallSettings) -> Arc<Self> {
		Arc::new(FirewallHandle(ArcSwap::new(Arc::new(Firewall::from_settings(settings)))))
	}

	pub fn check(&self, meta: FlowMeta) -> FirewallAction {
		self.0.load().check(meta)
	}
}

impl SettingsSubscriber for FirewallHandle {
	fn on_settings_update(&self, _key: ModuleKey, new_value: &RuntimeSettings) {
		self.0.store(Arc::new(Firewall::from_settings(&new_value.firewall)));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::FirewallSettings;

	fn meta(proto: Protocol, dest: &str, port: u16) -> FlowMeta {
		FlowMeta {
			protocol: proto,
			source: "10.0.0.5".parse().unwrap(),
			dest: dest.parse().unwrap(),
			dest_port: port,
		}
	}

	#[test]
	fn disabled_always_allows() {
		let fw = Firewall::from_settings(&FirewallSettings { enabled: false, rules: vec![] });
		assert_eq!(fw.check(meta(Protocol::Tcp, "1.2.3.4", 80)), FirewallAction::Allow);
	}

	#[test]
	fn port_range_deny_and_default_deny() {
		let settings = FirewallSettings {
			enabled: true,
			rules: vec![FirewallRule {
				priority: 1,
				protocol: Some(Protocol::Udp),
				source_cidrs: vec![],
				dest_cidrs: vec![],
				dest_ports: "80,443,8000-8100".to_string(),
				action: FirewallAction::Deny,
			}],
		};
		let fw = Firewall::from_settings(&settings);
		assert_eq!(fw.check(meta(Protocol::Udp, "10.0.0.1", 8050)), FirewallAction::Deny);
		// TCP on port 22 doesn't match the only rule (protocol+port mismatch) -> default-deny.
		assert_eq!(fw.check(meta(Protocol::Tcp, "10.0.0.1", 22)), FirewallAction::Deny);
	}

	#[test]
	fn matching_allow_rule_wins_over_default_deny() {
		let settings = FirewallSettings {
			enabled: true,
			rules: vec![
				FirewallRule {
					priority: 1,
					protocol: None,
					source_cidrs: vec!["10.0.0.0/8".to_string()],
					dest_cidrs: vec![],
					dest_ports: String::new(),
					action: FirewallAction::Allow,
				},
				FirewallRule {
					priority: 9999,
					protocol: None,
					source_cidrs: vec![],
					dest_cidrs: vec![],
					dest_ports: String::new(),
					action: FirewallAction::Deny,
				},
			],
		};
		let fw = Firewall::from_settings(&settings);
		assert_eq!(fw.check(meta(Protocol::Tcp, "1.2.3.4", 443)), FirewallAction::Allow);
	}
}
