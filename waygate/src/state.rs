//! StateManager (spec.md §4.6): owns the `ServerState` map in two zones.
//! Staging (A) is mutated by admin create/update/delete/activate operations
//! under a write lock; working (B) is an `ArcSwap` snapshot the dispatcher
//! and stats loop read lock-free, matching the crate's "settings pointer is
//! a single atomic load/store" concurrency policy (spec.md §5) applied to
//! the zone swap itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{Event, EventSender};
use crate::model::{Health, ServerProfile, ServerState};
use crate::strategy::{DynStrategy, StrategyContext, build_strategy};

pub type Zone = Arc<HashMap<Uuid, ServerState>>;

pub struct StateManager {
	staging: RwLock<HashMap<Uuid, ServerState>>,
	working: ArcSwap<HashMap<Uuid, ServerState>>,
	ctx: StrategyContext,
	events: EventSender,
}

impl StateManager {
	pub fn new(ctx: StrategyContext, events: EventSender) -> Self {
		StateManager {
			staging: RwLock::new(HashMap::new()),
			working: ArcSwap::new(Arc::new(HashMap::new())),
			ctx,
			events,
		}
	}

	/// The dispatcher's and stats loop's read path: a lock-free load of the
	/// currently published snapshot.
	pub fn working_zone(&self) -> Zone {
		self.working.load_full()
	}

	pub fn upsert_profile(&self, profile: Arc<ServerProfile>) {
		let mut staging = self.staging.write().unwrap();
		match staging.get_mut(&profile.id) {
			Some(state) => state.profile = profile,
			None => {
				let id = profile.id;
				staging.insert(id, ServerState::new(profile));
			},
		}
	}

	pub fn remove_profile(&self, id: Uuid) {
		let removed = self.staging.write().unwrap().remove(&id);
		if let Some(state) = removed {
			if let Some(strategy) = state.strategy {
				tokio::spawn(async move { strategy.close_tunnel().await });
			}
		}
	}

	pub fn set_active(&self, id: Uuid, active: bool) {
		let mut staging = self.staging.write().unwrap();
		if let Some(state) = staging.get_mut(&id) {
			let profile = state.profile.as_ref().clone();
			state.profile = Arc::new(ServerProfile { active, ..profile });
		}
	}

	/// Walks staging, tearing down deactivated/removed instances and
	/// creating+initializing new ones for newly-active profiles (marking
	/// `Down` on failure), per spec.md §4.6.
	pub async fn manage_instances(&self) {
		enum Action {
			Teardown(DynStrategy),
			Activate(Arc<ServerProfile>),
		}

		let actions: Vec<(Uuid, Action)> = {
			let staging = self.staging.read().unwrap();
			staging
				.values()
				.filter_map(|s| {
					if !s.profile.active && s.strategy.is_some() {
						Some((s.id(), Action::Teardown(s.strategy.clone().unwrap())))
					} else if s.profile.active && s.strategy.is_none() {
						Some((s.id(), Action::Activate(s.profile.clone())))
					} else {
						None
					}
				})
				.collect()
		};

		for (id, action) in actions {
			match action {
				Action::Teardown(strategy) => {
					tokio::spawn(async move { strategy.close_tunnel().await });
					if let Some(state) = self.staging.write().unwrap().get_mut(&id) {
						state.strategy = None;
						state.health = Health::Unknown;
					}
				},
				Action::Activate(profile) => match build_strategy(&profile, self.ctx.clone()) {
					Ok(strategy) => {
						let init_result = strategy.initialize_for_gateway().await;
						let mut staging = self.staging.write().unwrap();
						if let Some(state) = staging.get_mut(&id) {
							match init_result {
								Ok(()) => state.strategy = Some(strategy),
								Err(e) => {
									warn!(err=%e, server=%id, "strategy initialization failed");
									state.health = Health::Down;
								},
							}
						}
					},
					Err(e) => {
						warn!(err=%e, server=%id, "strategy creation failed");
						if let Some(state) = self.staging.write().unwrap().get_mut(&id) {
							state.health = Health::Down;
						}
					},
				},
			}
		}
	}

	/// Deep-copies staging into a fresh snapshot (metrics cloned, strategy and
	/// profile shared by reference) and atomically swaps it in as the working
	/// zone (spec.md §4.6).
	pub fn publish(&self) {
		let snapshot: HashMap<Uuid, ServerState> = {
			let staging = self.staging.read().unwrap();
			staging.iter().map(|(id, state)| (*id, state.publish_copy())).collect()
		};
		let count = snapshot.len();
		self.working.store(Arc::new(snapshot));
		info!(servers = count, "published state snapshot");
	}

	/// Increments a server's live connection counter in staging. Writing
	/// through staging (not the published working snapshot) means the count
	/// survives the next `publish()`'s `ServerState::publish_copy()` clone
	/// instead of being reset by it — mirrors `set_health`'s rationale below.
	pub fn incr_active(&self, id: Uuid) {
		if let Some(state) = self.staging.read().unwrap().get(&id) {
			state.metrics.incr_active();
		}
	}

	pub fn decr_active(&self, id: Uuid) {
		if let Some(state) = self.staging.read().unwrap().get(&id) {
			state.metrics.decr_active();
		}
	}

	/// Updates one server's health/exit-ip/latency in staging without
	/// publishing — the health checker batches one publish per sweep rather
	/// than one per server (spec.md §4.7). Writing through staging, rather
	/// than the already-published working snapshot, means the next
	/// `publish()` carries the new values forward instead of clobbering them
	/// with `ServerState::publish_copy()`'s metrics clone.
	pub fn set_health(&self, id: Uuid, health: Health, exit_ip: Option<String>, latency_ms: i64) {
		let mut staging = self.staging.write().unwrap();
		if let Some(state) = staging.get_mut(&id) {
			state.health = health;
			state.exit_ip = exit_ip;
			state.metrics.set_latency_ms(latency_ms);
		}
	}

	/// Transitions a server to `Down` in staging, republishes, and fans out a
	/// status event (spec.md §4.6).
	pub fn set_server_status_down(&self, id: Uuid, reason: &str) {
		{
			let mut staging = self.staging.write().unwrap();
			if let Some(state) = staging.get_mut(&id) {
				state.health = Health::Down;
			}
		}
		self.publish();
		warn!(server=%id, reason, "server marked down");
		let _ = self.events.send(Event::StatusUpdate);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dns::DnsResolver;
	use crate::model::{Credentials, NetworkLayer, ServerKind};

	fn profile(active: bool) -> Arc<ServerProfile> {
		Arc::new(ServerProfile {
			id: Uuid::new_v4(),
			remark: "test".to_string(),
			kind: ServerKind::HttpUpstream,
			network: NetworkLayer::Tcp,
			address: "127.0.0.1".to_string(),
			port: 8080,
			credentials: None::<Credentials>,
			transport: Default::default(),
			security: Default::default(),
			crypt: 1,
			active,
		})
	}

	#[tokio::test]
	async fn publish_is_empty_before_any_profile() {
		let (tx, _rx) = crate::events::channel();
		let ctx = StrategyContext { resolver: Arc::new(DnsResolver::new()) };
		let mgr = StateManager::new(ctx, tx);
		mgr.publish();
		assert!(mgr.working_zone().is_empty());
	}

	#[tokio::test]
	async fn activating_profile_creates_strategy_and_publishes() {
		let (tx, _rx) = crate::events::channel();
		let ctx = StrategyContext { resolver: Arc::new(DnsResolver::new()) };
		let mgr = StateManager::new(ctx, tx);
		let p = profile(true);
		let id = p.id;
		mgr.upsert_profile(p);
		mgr.manage_instances().await;
		mgr.publish();
		let zone = mgr.working_zone();
		let state = zone.get(&id).unwrap();
		assert!(state.strategy.is_some());
		assert!(state.is_usable() == false); // health still Unknown until the checker runs
	}

	#[tokio::test]
	async fn deactivating_tears_down_strategy() {
		let (tx, _rx) = crate::events::channel();
		let ctx = StrategyContext { resolver: Arc::new(DnsResolver::new()) };
		let mgr = StateManager::new(ctx, tx);
		let p = profile(true);
		let id = p.id;
		mgr.upsert_profile(p);
		mgr.manage_instances().await;
		mgr.set_active(id, false);
		mgr.manage_instances().await;
		mgr.publish();
		let zone = mgr.working_zone();
		assert!(zone.get(&id).unwrap().strategy.is_none());
	}
}
