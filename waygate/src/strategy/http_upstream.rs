//! Forward-only strategy that dials an upstream HTTP CONNECT proxy.
//! Grounded on `crates/agentgateway/src/proxy/httpproxy.rs`'s CONNECT dial
//! (timeout + status parsing), adapted to the SOCKS-pipe contract of
//! spec.md §4.5.2.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tracing::warn;
use waygate_core::copy::{FlowCounters, TcpStreamSplitter, copy_bidirectional};

use crate::model::ServerProfile;
use crate::socks5::{self, REPLY_CONNECTION_REFUSED, REPLY_SUCCEEDED};
use crate::strategy::{Strategy, StrategyError, Target, TrafficStats};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PIPE_BUFFER: usize = 8192;

pub struct HttpUpstreamStrategy {
	profile: ArcSwap<ServerProfile>,
	traffic: Arc<FlowCounters>,
}

impl HttpUpstreamStrategy {
	pub fn new(profile: Arc<ServerProfile>) -> Self {
		HttpUpstreamStrategy {
			profile: ArcSwap::new(profile),
			traffic: Arc::new(FlowCounters::new()),
		}
	}

	async fn serve(pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) {
		if let Err(e) = Self::serve_inner(pipe, profile, traffic).await {
			warn!(err=%e, "http-upstream connect failed");
		}
	}

	async fn serve_inner(mut pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) -> Result<(), StrategyError> {
		socks5::server_read_greeting(&mut pipe).await?;
		socks5::server_write_no_auth(&mut pipe).await?;
		let (_cmd, target) = socks5::server_read_request(&mut pipe).await?;

		let upstream = tokio::time::timeout(
			DIAL_TIMEOUT,
			TcpStream::connect((profile.address.as_str(), profile.port)),
		)
		.await
		.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
		.map_err(|e| StrategyError::DialFailed(profile.addr_string(), e))?;

		let mut upstream = upstream;
		let request = build_connect_request(&target, &profile);
		upstream.write_all(request.as_bytes()).await?;

		let status = read_status_line(&mut upstream).await?;
		if !(200..300).contains(&status) {
			socks5::server_write_reply(&mut pipe, REPLY_CONNECTION_REFUSED).await?;
			return Err(StrategyError::UpstreamRefused);
		}
		socks5::server_write_reply(&mut pipe, REPLY_SUCCEEDED).await?;

		copy_bidirectional(pipe, TcpStreamSplitter(upstream), &traffic)
			.await
			.map_err(|e| StrategyError::Handshake(e.to_string()))
	}
}

fn build_connect_request(target: &Target, profile: &ServerProfile) -> String {
	let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
	if let Some(creds) = &profile.credentials {
		let basic = BASE64.encode(format!("{}:{}", creds.username, creds.password));
		req.push_str(&format!("Proxy-Authorization: Basic {basic}\r\n"));
	}
	req.push_str("\r\n");
	req
}

async fn read_status_line<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<u16, StrategyError> {
	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	reader
		.read_line(&mut line)
		.await
		.map_err(StrategyError::Io)?;
	let mut parts = line.split_whitespace();
	let _version = parts.next();
	let status: u16 = parts
		.next()
		.and_then(|s| s.parse().ok())
		.ok_or_else(|| StrategyError::Handshake(format!("malformed status line: {line:?}")))?;
	loop {
		let mut hdr = String::new();
		reader.read_line(&mut hdr).await.map_err(StrategyError::Io)?;
		if hdr == "\r\n" || hdr.is_empty() {
			break;
		}
	}
	Ok(status)
}

#[async_trait]
impl Strategy for HttpUpstreamStrategy {
	async fn get_socks_connection(&self) -> Result<DuplexStream, StrategyError> {
		let (caller, strategy_side) = tokio::io::duplex(PIPE_BUFFER);
		let profile = self.profile.load_full();
		let traffic = self.traffic.clone();
		tokio::spawn(Self::serve(strategy_side, profile, traffic));
		Ok(caller)
	}

	fn get_type(&self) -> &'static str {
		"http-upstream"
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
