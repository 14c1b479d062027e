//! Health Checker (spec.md §4.7): periodically probes every active,
//! instantiated strategy and republishes the state snapshot whenever a
//! server's health or exit-ip changes.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::events::{Event, EventSender};
use crate::model::Health;
use crate::state::StateManager;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Walks the working zone, preferring each strategy's `check_health_advanced`
/// (latency + exit-ip) and falling back to the plain `check_health` probe.
pub struct HealthChecker {
	state: Arc<StateManager>,
	events: EventSender,
	interval: Duration,
}

impl HealthChecker {
	pub fn new(state: Arc<StateManager>, events: EventSender) -> Self {
		HealthChecker { state, events, interval: DEFAULT_INTERVAL }
	}

	/// Runs one cycle synchronously. Called once at bootstrap, before the
	/// gateway starts serving, so the first published snapshot never carries
	/// `Health::Unknown` for servers the probe can actually reach (spec.md
	/// §4.7: "the initial cycle runs synchronously before the process is
	/// marked ready").
	pub async fn run_once(&self) {
		self.cycle().await;
	}

	/// Ticks forever at the configured interval. Intended to be spawned after
	/// `run_once` has completed.
	pub async fn run(self: Arc<Self>) {
		let mut tick = tokio::time::interval(self.interval);
		tick.tick().await; // first tick fires immediately; cycle 0 already ran via run_once
		loop {
			tick.tick().await;
			self.cycle().await;
		}
	}

	async fn cycle(&self) {
		let zone = self.state.working_zone();
		let candidates: Vec<_> = zone
			.values()
			.filter(|s| s.profile.active && s.strategy.is_some())
			.map(|s| (s.id(), s.strategy.clone().unwrap(), s.health, s.exit_ip.clone()))
			.collect();
		if candidates.is_empty() {
			return;
		}

		let probes = futures::future::join_all(candidates.into_iter().map(|(id, strategy, prev_health, prev_exit_ip)| async move {
			let outcome = match strategy.check_health_advanced().await {
				Some(result) => result.map(|(latency_ms, exit_ip)| (latency_ms, Some(exit_ip))),
				None => strategy.check_health().await.map(|()| (0i64, None)),
			};
			(id, prev_health, prev_exit_ip, outcome)
		}))
		.await;

		let mut changed = false;
		for (id, prev_health, prev_exit_ip, outcome) in probes {
			match outcome {
				Ok((latency_ms, exit_ip)) => {
					if prev_health != Health::Up || prev_exit_ip != exit_ip {
						changed = true;
					}
					self.state.set_health(id, Health::Up, exit_ip, latency_ms);
				},
				Err(e) => {
					warn!(server = %id, err = %e, "health probe failed");
					if prev_health != Health::Down {
						changed = true;
					}
					self.state.set_health(id, Health::Down, None, 0);
				},
			}
		}

		if changed {
			self.state.publish();
			let _ = self.events.send(Event::StatusUpdate);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc as StdArc;

	use super::*;
	use crate::dns::DnsResolver;
	use crate::model::{Credentials, NetworkLayer, ServerKind, ServerProfile};
	use crate::strategy::StrategyContext;

	fn profile() -> StdArc<ServerProfile> {
		StdArc::new(ServerProfile {
			id: uuid::Uuid::new_v4(),
			remark: "test".to_string(),
			kind: ServerKind::HttpUpstream,
			network: NetworkLayer::Tcp,
			address: "127.0.0.1".to_string(),
			port: 1,
			credentials: None::<Credentials>,
			transport: Default::default(),
			security: Default::default(),
			crypt: 1,
			active: true,
		})
	}

	#[tokio::test]
	async fn failed_probe_marks_server_down_and_publishes() {
		let (tx, mut rx) = crate::events::channel();
		let ctx = StrategyContext { resolver: StdArc::new(DnsResolver::new()) };
		let state = StdArc::new(StateManager::new(ctx, tx.clone()));
		let p = profile();
		let id = p.id;
		state.upsert_profile(p);
		state.manage_instances().await;
		state.publish();

		let checker = HealthChecker::new(state.clone(), tx);
		checker.run_once().await;

		let zone = state.working_zone();
		assert_eq!(zone.get(&id).unwrap().health, Health::Down);
		assert!(rx.try_recv().is_ok());
	}
}
