//! Stats sampler (spec.md §4.5.5 / §4.9): every 2 seconds, sums active
//! connections and cumulative traffic counters across the working zone and
//! broadcasts a `DashboardUpdate` carrying instantaneous bytes/s.

use std::sync::Arc;
use std::time::Duration;

use crate::events::{self, EventSender};
use crate::metrics::Metrics;
use crate::state::StateManager;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Runs forever, sampling the working zone on each tick. Intended to be
/// spawned once at bootstrap alongside the health checker.
pub async fn run(state: Arc<StateManager>, events: EventSender, metrics: Arc<Metrics>) {
	let mut tick = tokio::time::interval(SAMPLE_INTERVAL);
	let mut last_uplink = 0u64;
	let mut last_downlink = 0u64;
	loop {
		tick.tick().await;

		let zone = state.working_zone();
		let mut active_connections = 0i64;
		let mut uplink = 0u64;
		let mut downlink = 0u64;
		for server in zone.values() {
			active_connections += server.metrics.active_connections();
			if let Some(strategy) = &server.strategy {
				let (u, d) = strategy.get_traffic_stats();
				uplink += u;
				downlink += d;
			}
		}

		let elapsed_secs = SAMPLE_INTERVAL.as_secs().max(1);
		let uplink_delta = uplink.saturating_sub(last_uplink);
		let downlink_delta = downlink.saturating_sub(last_downlink);
		let uplink_rate = uplink_delta / elapsed_secs;
		let downlink_rate = downlink_delta / elapsed_secs;
		metrics.record_bytes(uplink_delta, downlink_delta);
		last_uplink = uplink;
		last_downlink = downlink;

		let _ = events.send(events::dashboard_update(active_connections, uplink_rate, downlink_rate));
	}
}
