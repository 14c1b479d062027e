//! Forward-only strategy that dials an upstream SOCKS5 proxy (spec.md
//! §4.5.3). Same shape as `HttpUpstreamStrategy` but the outbound handshake
//! is a SOCKS5 CONNECT instead of an HTTP CONNECT, and no credentials are
//! supported.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tracing::warn;
use waygate_core::copy::{FlowCounters, TcpStreamSplitter, copy_bidirectional};

use crate::model::ServerProfile;
use crate::socks5::{self, REPLY_CONNECTION_REFUSED, REPLY_SUCCEEDED};
use crate::strategy::{Strategy, StrategyError, TrafficStats};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PIPE_BUFFER: usize = 8192;

pub struct Socks5UpstreamStrategy {
	profile: ArcSwap<ServerProfile>,
	traffic: Arc<FlowCounters>,
}

impl Socks5UpstreamStrategy {
	pub fn new(profile: Arc<ServerProfile>) -> Self {
		Socks5UpstreamStrategy {
			profile: ArcSwap::new(profile),
			traffic: Arc::new(FlowCounters::new()),
		}
	}

	async fn serve(pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) {
		if let Err(e) = Self::serve_inner(pipe, profile, traffic).await {
			warn!(err=%e, "socks5-upstream connect failed");
		}
	}

	async fn serve_inner(mut pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) -> Result<(), StrategyError> {
		socks5::server_read_greeting(&mut pipe).await?;
		socks5::server_write_no_auth(&mut pipe).await?;
		let (_cmd, target) = socks5::server_read_request(&mut pipe).await?;

		let mut upstream = tokio::time::timeout(
			DIAL_TIMEOUT,
			TcpStream::connect((profile.address.as_str(), profile.port)),
		)
		.await
		.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
		.map_err(|e| StrategyError::DialFailed(profile.addr_string(), e))?;

		if socks5::client_connect(&mut upstream, &target).await.is_err() {
			socks5::server_write_reply(&mut pipe, REPLY_CONNECTION_REFUSED).await?;
			return Err(StrategyError::UpstreamRefused);
		}
		socks5::server_write_reply(&mut pipe, REPLY_SUCCEEDED).await?;

		copy_bidirectional(pipe, TcpStreamSplitter(upstream), &traffic)
			.await
			.map_err(|e| StrategyError::Handshake(e.to_string()))
	}
}

#[async_trait]
impl Strategy for Socks5UpstreamStrategy {
	async fn get_socks_connection(&self) -> Result<DuplexStream, StrategyError> {
		let (caller, strategy_side) = tokio::io::duplex(PIPE_BUFFER);
		let profile = self.profile.load_full();
		let traffic = self.traffic.clone();
		tokio::spawn(Self::serve(strategy_side, profile, traffic));
		Ok(caller)
	}

	fn get_type(&self) -> &'static str {
		"socks5-upstream"
	}

	fn get_traffic_stats(&self) -> TrafficStats {
		(self.traffic.uplink(), self.traffic.downlink())
	}

	async fn update_server(&self, new_profile: Arc<ServerProfile>) -> Result<(), StrategyError> {
		self.profile.store(new_profile);
		Ok(())
	}

	async fn close_tunnel(&self) {}

	async fn check_health(&self) -> Result<(), StrategyError> {
		let profile = self.profile.load_full();
		tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((profile.address.as_str(), profile.port)))
			.await
			.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
			.map_err(|e| StrategyError::DialFailed(profile.addr_string(), e))?;
		Ok(())
	}
}
