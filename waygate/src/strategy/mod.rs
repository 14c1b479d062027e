//! The `Strategy` abstraction (spec.md §4.5): a pluggable outbound that turns
//! a generic inbound flow into a remote byte stream, plus the four concrete
//! tunnels. Modeled as a capability trait rather than inheritance, per
//! spec.md §9 — callers downcast via the optional `advanced health check`
//! rather than a separate subtype.

pub mod custom_remote;
pub mod http_upstream;
pub mod socks5_upstream;
pub mod vless;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

use crate::dns::DnsResolver;
use crate::model::ServerProfile;

/// Object-safe alias for "anything we can copy bytes through": the raw
/// inbound socket handed to `handle_raw_tcp`, type-erased so the trait stays
/// object safe across TCP/TLS-terminated/whatever callers produce. `Box<dyn
/// AsyncStream>` is itself `Unpin` (boxes always are), so it implements
/// `AsyncRead`/`AsyncWrite` directly without a `Pin` wrapper.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncStream for T {}
pub type BoxedStream = Box<dyn AsyncStream>;

/// One transparent-mode UDP flow: the original client address (for matching
/// replies back) and a channel the strategy uses to write a reply datagram
/// back through the gateway's shared TPROXY UDP socket (spec.md §4.10's
/// "get_udp_listener() accessor").
pub struct UdpFlow {
	pub client: SocketAddr,
	pub reply_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

#[derive(Debug, Error)]
pub enum StrategyError {
	#[error("dial to {0} failed: {1}")]
	DialFailed(String, std::io::Error),
	#[error("upstream refused the connection")]
	UpstreamRefused,
	#[error("{0} does not support {1}")]
	Unsupported(&'static str, &'static str),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("handshake failed: {0}")]
	Handshake(String),
	#[error(transparent)]
	Wire(#[from] waygate_wire::framing::Error),
	#[error(transparent)]
	Socks(#[from] crate::socks5::Socks5Error),
	#[error("health probe failed: {0}")]
	HealthProbe(String),
}

/// A target flows are relayed to, parsed from the sniffer or TPROXY metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
	pub host: String,
	pub port: u16,
}

impl Target {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Target { host: host.into(), port }
	}

	pub fn parse(host_port: &str) -> Option<Self> {
		let (host, port) = host_port.rsplit_once(':')?;
		let port: u16 = port.parse().ok()?;
		Some(Target::new(host.trim_start_matches('[').trim_end_matches(']'), port))
	}
}

impl fmt::Display for Target {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Cumulative uplink/downlink byte counters the stats loop samples every 2s.
pub type TrafficStats = (u64, u64);

/// Shared dependencies every strategy constructor needs.
#[derive(Clone)]
pub struct StrategyContext {
	pub resolver: Arc<DnsResolver>,
}

#[async_trait]
pub trait Strategy: Send + Sync {
	/// No-op for stateless strategies; reserved for ones that own a listener
	/// (e.g. CustomRemote's transparent-UDP per-client session map).
	async fn initialize_for_gateway(&self) -> Result<(), StrategyError> {
		Ok(())
	}

	/// Transparent path: the strategy takes ownership of `inbound` and is
	/// responsible for closing it.
	async fn handle_raw_tcp(&self, inbound: BoxedStream, target: Target) -> Result<(), StrategyError> {
		let _ = (inbound, target);
		Err(StrategyError::Unsupported(self.get_type(), "raw TCP"))
	}

	async fn handle_udp_packet(&self, packet: Vec<u8>, flow: UdpFlow) -> Result<(), StrategyError> {
		let _ = (packet, flow);
		Err(StrategyError::Unsupported(self.get_type(), "UDP"))
	}

	/// Returns the caller's end of an in-memory duplex pipe; the strategy
	/// side performs its own SOCKS5 handshake internally and relays to the
	/// remote. Used by the unified gateway's forward mode.
	async fn get_socks_connection(&self) -> Result<DuplexStream, StrategyError>;

	fn get_type(&self) -> &'static str;

	fn get_listener_info(&self) -> Option<SocketAddr> {
		None
	}

	fn get_traffic_stats(&self) -> TrafficStats;

	async fn update_server(&self, new_profile: Arc<ServerProfile>) -> Result<(), StrategyError>;

	async fn close_tunnel(&self);

	async fn check_health(&self) -> Result<(), StrategyError>;

	/// End-to-end probe through the strategy's own SOCKS pipe, returning
	/// `(latency_ms, exit_ip)`. `None` means the strategy doesn't implement
	/// the advanced probe and the health checker should fall back to
	/// `check_health`.
	async fn check_health_advanced(&self) -> Option<Result<(i64, String), StrategyError>> {
		None
	}
}

pub type DynStrategy = Arc<dyn Strategy>;

/// Builds the concrete strategy instance for a profile, per spec.md §3's
/// "strategy is created on first activation" lifecycle rule.
pub fn build_strategy(
	profile: &Arc<ServerProfile>,
	ctx: StrategyContext,
) -> Result<DynStrategy, StrategyError> {
	use crate::model::ServerKind::*;
	let strategy: DynStrategy = match profile.kind {
		CustomRemote => Arc::new(custom_remote::CustomRemoteStrategy::new(profile.clone(), ctx)),
		HttpUpstream => Arc::new(http_upstream::HttpUpstreamStrategy::new(profile.clone())),
		Socks5Upstream => Arc::new(socks5_upstream::Socks5UpstreamStrategy::new(profile.clone())),
		Vless => Arc::new(vless::VlessStrategy::new(profile.clone())),
	};
	Ok(strategy)
}
