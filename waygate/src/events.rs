//! Broadcast event kinds (spec.md §6) consumed by the out-of-core web/admin
//! surface. Only the event shapes are defined here — the WebSocket hub
//! itself sits outside this crate's scope (spec.md §1).

use std::net::IpAddr;

use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TrafficLog {
	pub timestamp: i64,
	pub client_ip: IpAddr,
	pub protocol: String,
	pub destination: String,
	pub action: String,
	pub target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DashboardUpdate {
	pub timestamp: i64,
	pub active_connections: i64,
	pub uplink_rate: u64,
	pub downlink_rate: u64,
}

#[derive(Debug, Clone)]
pub enum Event {
	/// Empty payload; tells the web layer to re-fetch status.
	StatusUpdate,
	TrafficLog(TrafficLog),
	DashboardUpdate(DashboardUpdate),
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
	broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

fn now_unix() -> i64 {
	chrono::Utc::now().timestamp()
}

pub fn traffic_log(client_ip: IpAddr, protocol: impl Into<String>, destination: impl Into<String>, action: impl Into<String>, target: Option<String>) -> Event {
	Event::TrafficLog(TrafficLog {
		timestamp: now_unix(),
		client_ip,
		protocol: protocol.into(),
		destination: destination.into(),
		action: action.into(),
		target,
	})
}

pub fn dashboard_update(active_connections: i64, uplink_rate: u64, downlink_rate: u64) -> Event {
	Event::DashboardUpdate(DashboardUpdate { timestamp: now_unix(), active_connections, uplink_rate, downlink_rate })
}
