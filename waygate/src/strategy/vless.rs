//! The `Vless` strategy (spec.md §4.5.4): stateless, opens a fresh tunnel
//! per inbound flow over one of three transports (`ws`, `wss`, `grpc`), then
//! writes the VLESS request header immediately followed by the first client
//! bytes, and interleaves raw bytes in both directions afterward.
//!
//! The WS/gRPC/TLS dialers are treated as opaque `dial(host, port, opts) ->
//! byte_stream` operations per spec.md §9 — whichever transport is
//! configured, the rest of the strategy only ever sees a plain
//! `AsyncRead + AsyncWrite`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tonic::Request;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::warn;
use uuid::Uuid;
use waygate_core::copy::{FlowCounters, copy_bidirectional};

use crate::model::{NetworkLayer, ServerProfile};
use crate::socks5::{self, REPLY_CONNECTION_REFUSED, REPLY_SUCCEEDED};
use crate::strategy::{BoxedStream, Strategy, StrategyError, Target, TrafficStats};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PIPE_BUFFER: usize = 8192;

mod tun {
	tonic::include_proto!("waygate.tun");
}
use tun::Hunk;
use tun::gun_client::GunClient;

#[derive(Debug, Clone, Copy)]
enum VlessAtyp {
	Ipv4 = 0x01,
	Domain = 0x02,
	Ipv6 = 0x03,
}

/// Builds `ver(0) | uuid(16) | addons_len(0) | cmd(CONNECT=1) | port | atyp | addr`.
fn build_request_header(uuid: &Uuid, target: &Target) -> Vec<u8> {
	let mut buf = Vec::with_capacity(24 + target.host.len());
	buf.push(0); // version
	buf.extend_from_slice(uuid.as_bytes());
	buf.push(0); // addons length
	buf.push(0x01); // cmd: TCP CONNECT
	buf.extend_from_slice(&target.port.to_be_bytes());
	if let Ok(ipv4) = target.host.parse::<std::net::Ipv4Addr>() {
		buf.push(VlessAtyp::Ipv4 as u8);
		buf.extend_from_slice(&ipv4.octets());
	} else if let Ok(ipv6) = target.host.parse::<std::net::Ipv6Addr>() {
		buf.push(VlessAtyp::Ipv6 as u8);
		buf.extend_from_slice(&ipv6.octets());
	} else {
		buf.push(VlessAtyp::Domain as u8);
		buf.push(target.host.len() as u8);
		buf.extend_from_slice(target.host.as_bytes());
	}
	buf
}

/// Strips the minimal VLESS response header (`ver(1) | addons_len(1) |
/// addons...`) off the front of the downlink.
async fn strip_response_header<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), StrategyError> {
	let mut hdr = [0u8; 2];
	stream.read_exact(&mut hdr).await?;
	let addons_len = hdr[1] as usize;
	if addons_len > 0 {
		let mut addons = vec![0u8; addons_len];
		stream.read_exact(&mut addons).await?;
	}
	Ok(())
}

pub struct VlessStrategy {
	profile: ArcSwap<ServerProfile>,
	traffic: Arc<FlowCounters>,
}

impl VlessStrategy {
	pub fn new(profile: Arc<ServerProfile>) -> Self {
		VlessStrategy {
			profile: ArcSwap::new(profile),
			traffic: Arc::new(FlowCounters::new()),
		}
	}

	async fn serve(pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) {
		if let Err(e) = Self::serve_inner(pipe, profile, traffic).await {
			warn!(err=%e, "vless tunnel failed");
		}
	}

	async fn serve_inner(mut pipe: DuplexStream, profile: Arc<ServerProfile>, traffic: Arc<FlowCounters>) -> Result<(), StrategyError> {
		socks5::server_read_greeting(&mut pipe).await?;
		socks5::server_write_no_auth(&mut pipe).await?;
		let (_cmd, target) = socks5::server_read_request(&mut pipe).await?;

		let uuid = profile
			.security
			.uuid
			.as_deref()
			.and_then(|s| Uuid::parse_str(s).ok())
			.unwrap_or_default();

		let tunnel = match tokio::time::timeout(DIAL_TIMEOUT, dial(&profile)).await {
			Ok(Ok(stream)) => stream,
			_ => {
				socks5::server_write_reply(&mut pipe, REPLY_CONNECTION_REFUSED).await?;
				return Err(StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()));
			},
		};

		let header = build_request_header(&uuid, &target);
		let (mut tr, mut tw) = tokio::io::split(tunnel);
		tw.write_all(&header).await?;
		strip_response_header(&mut tr).await?;

		socks5::server_write_reply(&mut pipe, REPLY_SUCCEEDED).await?;

		copy_bidirectional(pipe, PairedStream { r: tr, w: tw }, &traffic)
			.await
			.map_err(|e| StrategyError::Handshake(e.to_string()))
	}
}

#[async_trait]
impl Strategy for VlessStrategy {
	async fn get_socks_connection(&self) -> Result<DuplexStream, StrategyError> {
		let (caller, strategy_side) = tokio::io::duplex(PIPE_BUFFER);
		let profile = self.profile.load_full();
		let traffic = self.traffic.clone();
		tokio::spawn(Self::serve(strategy_side, profile, traffic));
		Ok(caller)
	}

	fn get_type(&self) -> &'static str {
		"vless"
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
		tokio::time::timeout(DIAL_TIMEOUT, dial(&profile))
			.await
			.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
			.map(|_| ())
	}
}

async fn dial(profile: &ServerProfile) -> Result<BoxedStream, StrategyError> {
	match profile.network {
		NetworkLayer::Ws | NetworkLayer::Wss => {
			let scheme = if matches!(profile.network, NetworkLayer::Wss) { "wss" } else { "ws" };
			let path = profile.transport.ws_path.clone().unwrap_or_else(|| "/".to_string());
			let host = profile.transport.ws_host.clone().unwrap_or_else(|| profile.address.clone());
			let url = format!("{scheme}://{host}:{}{path}", profile.port);
			let stream = crate::ws::dial(&url)
				.await
				.map_err(|e| StrategyError::Handshake(e.to_string()))?;
			Ok(Box::new(stream))
		},
		NetworkLayer::Grpc => dial_grpc(profile).await,
		NetworkLayer::Tcp => Err(StrategyError::Unsupported("vless", "raw-tcp network (use ws/wss/grpc)")),
	}
}

/// Dials the `Gun` service's `Tun` RPC and adapts the resulting
/// bidirectional `Hunk` stream to a plain byte stream, matching spec.md
/// §4.5.4's "a gRPC bidirectional stream Tun/TunMulti".
async fn dial_grpc(profile: &ServerProfile) -> Result<BoxedStream, StrategyError> {
	let scheme = if profile.security.sni.is_some() { "https" } else { "http" };
	let endpoint_uri = format!("{scheme}://{}:{}", profile.address, profile.port);
	let mut endpoint = Endpoint::from_shared(endpoint_uri).map_err(|e| StrategyError::Handshake(e.to_string()))?;
	if let Some(sni) = &profile.security.sni {
		let tls = ClientTlsConfig::new().domain_name(sni.clone());
		endpoint = endpoint.tls_config(tls).map_err(|e| StrategyError::Handshake(e.to_string()))?;
	}
	if let Some(authority) = &profile.transport.grpc_authority {
		endpoint = endpoint.origin(authority.parse().map_err(|_| StrategyError::Handshake("invalid grpc authority".into()))?);
	}
	let channel: Channel = endpoint.connect().await.map_err(|e| StrategyError::DialFailed(profile.addr_string(), std::io::Error::other(e)))?;
	let mut client = GunClient::new(channel);

	let (tx, rx) = mpsc::channel::<Hunk>(32);
	let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
	let mut request = Request::new(outbound);
	if let Some(service) = &profile.transport.grpc_service {
		request.metadata_mut().insert(
			"x-grpc-service",
			service.parse().map_err(|_| StrategyError::Handshake("invalid grpc service name".into()))?,
		);
	}
	let response = client.tun(request).await.map_err(|e| StrategyError::Handshake(e.to_string()))?;
	let inbound = response.into_inner();
	Ok(Box::new(GrpcTunStream { tx, inbound, read_buf: bytes::Bytes::new() }))
}

/// Adapts the `Gun.Tun` bidirectional RPC to `AsyncRead + AsyncWrite`.
struct GrpcTunStream {
	tx: mpsc::Sender<Hunk>,
	inbound: tonic::Streaming<Hunk>,
	read_buf: bytes::Bytes,
}

impl AsyncRead for GrpcTunStream {
	fn poll_read(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		use futures::Stream;
		if !self.read_buf.is_empty() {
			let n = std::cmp::min(self.read_buf.len(), buf.remaining());
			let chunk = self.read_buf.split_to(n);
			buf.put_slice(&chunk);
			return std::task::Poll::Ready(Ok(()));
		}
		match std::pin::Pin::new(&mut self.inbound).poll_next(cx) {
			std::task::Poll::Ready(Some(Ok(hunk))) => {
				self.read_buf = hunk.data.into();
				let n = std::cmp::min(self.read_buf.len(), buf.remaining());
				let chunk = self.read_buf.split_to(n);
				buf.put_slice(&chunk);
				std::task::Poll::Ready(Ok(()))
			},
			std::task::Poll::Ready(Some(Err(status))) => std::task::Poll::Ready(Err(std::io::Error::other(status))),
			std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
			std::task::Poll::Pending => std::task::Poll::Pending,
		}
	}
}

impl AsyncWrite for GrpcTunStream {
	fn poll_write(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		let permit = match self.tx.clone().try_reserve_owned() {
			Ok(permit) => permit,
			Err(mpsc::error::TrySendError::Full(_)) => {
				cx.waker().wake_by_ref();
				return std::task::Poll::Pending;
			},
			Err(mpsc::error::TrySendError::Closed(_)) => {
				return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
			},
		};
		permit.send(Hunk { data: buf.to_vec() });
		std::task::Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::task::Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::task::Poll::Ready(Ok(()))
	}
}

/// Joins a split read half and write half back into one `AsyncRead +
/// AsyncWrite` for `copy_bidirectional`'s generic splitter.
struct PairedStream<R, W> {
	r: R,
	w: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for PairedStream<R, W> {
	fn poll_read(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.r).poll_read(cx, buf)
	}
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for PairedStream<R, W> {
	fn poll_write(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.w).poll_write(cx, buf)
	}

	fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.w).poll_flush(cx)
	}

	fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.w).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_header_encodes_domain_target() {
		let uuid = Uuid::nil();
		let target = Target::new("example.com", 443);
		let header = build_request_header(&uuid, &target);
		assert_eq!(header[0], 0); // version
		assert_eq!(&header[1..17], uuid.as_bytes());
		assert_eq!(header[17], 0); // addons len
		assert_eq!(header[18], 0x01); // cmd
		assert_eq!(&header[19..21], &443u16.to_be_bytes());
		assert_eq!(header[21], VlessAtyp::Domain as u8);
		assert_eq!(header[22], "example.com".len() as u8);
		assert_eq!(&header[23..], b"example.com");
	}

	#[test]
	fn request_header_encodes_ipv4_target() {
		let uuid = Uuid::nil();
		let target = Target::new("10.0.0.1", 80);
		let header = build_request_header(&uuid, &target);
		assert_eq!(header[21], VlessAtyp::Ipv4 as u8);
		assert_eq!(&header[22..26], &[10, 0, 0, 1]);
	}
}
