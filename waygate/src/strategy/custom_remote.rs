//! The `CustomRemote` strategy: spec.md §4.5.1's multi-connection /
//! multiplexed tunnel over the crate's own wire protocol
//! (`waygate_wire::framing`/`secure`), optionally carried over TCP or
//! WebSocket.
//!
//! The wire protocol's `STREAM_ID` field doubles as the stream multiplexer:
//! multi-connection mode dials a fresh physical connection per flow and uses
//! a fixed `stream_id` of 1 on it; multiplexed mode keeps one physical
//! connection per strategy and allocates a fresh `stream_id` per flow on it.
//!
//! All state that a detached `tokio::spawn`ed task needs to outlive the
//! triggering call lives behind `Arc<Inner>`, cloned cheaply into the task —
//! `Strategy`'s methods take `&self`, so this crate never needs `Arc<Self>`
//! receivers just for this one strategy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::warn;
use waygate_wire::cipher::Cipher;
use waygate_wire::framing::Flag;
use waygate_wire::{framing, secure};

use crate::dns::DnsResolver;
use crate::model::{NetworkLayer, ServerProfile};
use crate::socks5::{self, Command, REPLY_CONNECTION_REFUSED, REPLY_SUCCEEDED};
use crate::strategy::{BoxedStream, Strategy, StrategyContext, StrategyError, Target, TrafficStats, UdpFlow};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PIPE_BUFFER: usize = 8192;
const UDP_SESSION_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum StreamType {
	Tcp = 0x01,
}

#[derive(Debug, Clone, Copy)]
enum AddrType {
	Ipv4 = 0x01,
	Domain = 0x03,
	Ipv6 = 0x04,
}

fn build_preamble(stream_type: StreamType, target: &Target) -> Vec<u8> {
	let mut buf = vec![stream_type as u8];
	if let Ok(ipv4) = target.host.parse::<std::net::Ipv4Addr>() {
		buf.push(AddrType::Ipv4 as u8);
		buf.extend_from_slice(&ipv4.octets());
	} else if let Ok(ipv6) = target.host.parse::<std::net::Ipv6Addr>() {
		buf.push(AddrType::Ipv6 as u8);
		buf.extend_from_slice(&ipv6.octets());
	} else {
		buf.push(AddrType::Domain as u8);
		buf.push(target.host.len() as u8);
		buf.extend_from_slice(target.host.as_bytes());
	}
	buf.extend_from_slice(&target.port.to_be_bytes());
	buf
}

/// One physical connection shared by every logical stream in multiplexed
/// mode. A mutex guards creation (spec.md §4.5.1); a session observed closed
/// is replaced lazily, and in-flight streams on it simply fail and the
/// caller retries per-request (spec.md §9).
struct MuxSession {
	writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
	streams: std::sync::Mutex<HashMap<u16, mpsc::UnboundedSender<(Flag, Vec<u8>)>>>,
	next_id: AtomicU16,
	closed: std::sync::atomic::AtomicBool,
}

impl MuxSession {
	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Relaxed)
	}

	fn alloc_stream_id(&self) -> u16 {
		loop {
			let id = self.next_id.fetch_add(1, Ordering::Relaxed);
			if id != 0 {
				return id;
			}
		}
	}

	fn register(&self, id: u16) -> mpsc::UnboundedReceiver<(Flag, Vec<u8>)> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.streams.lock().unwrap().insert(id, tx);
		rx
	}

	fn unregister(&self, id: u16) {
		self.streams.lock().unwrap().remove(&id);
	}
}

async fn run_mux_reader<R: AsyncRead + Unpin + Send + 'static>(mut reader: R, session: Arc<MuxSession>) {
	loop {
		match framing::read_packet(&mut reader).await {
			Ok(Some(packet)) => {
				let sender = session.streams.lock().unwrap().get(&packet.stream_id).cloned();
				if let Some(sender) = sender {
					let _ = sender.send((packet.flag, packet.payload));
				}
			},
			Ok(None) | Err(_) => {
				session.closed.store(true, Ordering::Relaxed);
				session.streams.lock().unwrap().clear();
				return;
			},
		}
	}
}

struct UdpRemoteSession {
	last_seen: std::sync::Mutex<Instant>,
}

/// Byte counters for this strategy's own hand-rolled framed copy loops.
/// `waygate_core::copy::FlowCounters` is scoped to `copy_bidirectional`'s
/// internal accounting and has no public increment API, so CustomRemote (which
/// can't use `copy_bidirectional` once frames need AEAD-sealing per chunk)
/// keeps its own pair of atomics instead.
#[derive(Default)]
struct TunnelTraffic {
	uplink: std::sync::atomic::AtomicU64,
	downlink: std::sync::atomic::AtomicU64,
}

impl TunnelTraffic {
	fn add_uplink(&self, n: u64) {
		self.uplink.fetch_add(n, Ordering::Relaxed);
	}

	fn add_downlink(&self, n: u64) {
		self.downlink.fetch_add(n, Ordering::Relaxed);
	}

	fn snapshot(&self) -> TrafficStats {
		(self.uplink.load(Ordering::Relaxed), self.downlink.load(Ordering::Relaxed))
	}
}

/// Everything a detached relay task needs; cheap to clone via `Arc`.
struct Inner {
	profile: ArcSwap<ServerProfile>,
	resolver: Arc<DnsResolver>,
	cipher: ArcSwap<Cipher>,
	traffic: TunnelTraffic,
	mux: AsyncMutex<Option<Arc<MuxSession>>>,
	udp_sessions: std::sync::Mutex<HashMap<SocketAddr, Arc<UdpRemoteSession>>>,
}

impl Inner {
	fn is_multiplexed(&self) -> bool {
		self.profile.load().transport.multiplex
	}

	async fn dial_physical(&self) -> Result<BoxedStream, StrategyError> {
		let profile = self.profile.load_full();
		match profile.network {
			NetworkLayer::Tcp => {
				let stream = tokio::time::timeout(
					DIAL_TIMEOUT,
					TcpStream::connect((profile.address.as_str(), profile.port)),
				)
				.await
				.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
				.map_err(|e| StrategyError::DialFailed(profile.addr_string(), e))?;
				Ok(Box::new(stream))
			},
			NetworkLayer::Ws | NetworkLayer::Wss => {
				let scheme = if matches!(profile.network, NetworkLayer::Wss) { "wss" } else { "ws" };
				let path = profile.transport.ws_path.clone().unwrap_or_else(|| "/".to_string());
				let url = format!("{scheme}://{}:{}{path}", profile.address, profile.port);
				let stream = tokio::time::timeout(DIAL_TIMEOUT, crate::ws::dial(&url))
					.await
					.map_err(|_| StrategyError::DialFailed(profile.addr_string(), std::io::ErrorKind::TimedOut.into()))?
					.map_err(|e| StrategyError::Handshake(e.to_string()))?;
				Ok(Box::new(stream))
			},
			NetworkLayer::Grpc => Err(StrategyError::Unsupported("custom-remote", "grpc transport")),
		}
	}

	async fn get_or_create_mux(self: &Arc<Self>) -> Result<Arc<MuxSession>, StrategyError> {
		let mut guard = self.mux.lock().await;
		if let Some(session) = guard.as_ref() {
			if !session.is_closed() {
				return Ok(session.clone());
			}
		}
		let physical = self.dial_physical().await?;
		let (reader, writer) = tokio::io::split(physical);
		let session = Arc::new(MuxSession {
			writer: AsyncMutex::new(Box::new(writer)),
			streams: std::sync::Mutex::new(HashMap::new()),
			next_id: AtomicU16::new(1),
			closed: std::sync::atomic::AtomicBool::new(false),
		});
		tokio::spawn(run_mux_reader(reader, session.clone()));
		*guard = Some(session.clone());
		Ok(session)
	}

	async fn relay_tcp_multiplexed(
		self: &Arc<Self>,
		pipe: impl AsyncRead + AsyncWrite + Unpin,
		target: Target,
	) -> Result<(), StrategyError> {
		let cipher = self.cipher.load_full();
		let session = self.get_or_create_mux().await?;
		let stream_id = session.alloc_stream_id();
		let mut from_remote = session.register(stream_id);
		let preamble = build_preamble(StreamType::Tcp, &target);
		{
			let mut writer = session.writer.lock().await;
			secure::write_secure(&mut *writer, &cipher, stream_id, Flag::NewStreamTcp, &preamble)
				.await
				.map_err(wire_err)?;
		}
		match from_remote.recv().await {
			Some((Flag::NewStreamTcpSuccess, _)) => {},
			_ => {
				session.unregister(stream_id);
				return Err(StrategyError::UpstreamRefused);
			},
		}

		let (mut pr, mut pw) = tokio::io::split(pipe);
		let traffic = &self.traffic;
		let uplink = async {
			let mut buf = vec![0u8; 16 * 1024];
			loop {
				let n = pr.read(&mut buf).await?;
				let mut writer = session.writer.lock().await;
				if n == 0 {
					let _ = secure::write_secure(&mut *writer, &cipher, stream_id, Flag::CloseStream, &[]).await;
					break;
				}
				traffic.add_uplink(n as u64);
				secure::write_secure(&mut *writer, &cipher, stream_id, Flag::TcpData, &buf[..n])
					.await
					.map_err(wire_err)?;
			}
			Ok::<(), StrategyError>(())
		};
		let downlink = async {
			while let Some((flag, payload)) = from_remote.recv().await {
				match flag {
					Flag::TcpData => {
						traffic.add_downlink(payload.len() as u64);
						pw.write_all(&payload).await?;
					},
					Flag::CloseStream => break,
					_ => {},
				}
			}
			Ok::<(), StrategyError>(())
		};
		let res = tokio::join!(uplink, downlink);
		session.unregister(stream_id);
		res.0?;
		res.1?;
		Ok(())
	}

	async fn relay_tcp_single_use(
		self: &Arc<Self>,
		pipe: impl AsyncRead + AsyncWrite + Unpin,
		target: Target,
	) -> Result<(), StrategyError> {
		let cipher = self.cipher.load_full();
		let physical = self.dial_physical().await?;
		let (mut reader, mut writer) = tokio::io::split(physical);
		let preamble = build_preamble(StreamType::Tcp, &target);
		secure::write_secure(&mut writer, &cipher, 1, Flag::NewStreamTcp, &preamble)
			.await
			.map_err(wire_err)?;
		match secure::read_secure(&mut reader, &cipher).await.map_err(wire_err)? {
			Some((_, Flag::NewStreamTcpSuccess, _)) => {},
			_ => return Err(StrategyError::UpstreamRefused),
		}

		let (mut pr, mut pw) = tokio::io::split(pipe);
		let traffic = &self.traffic;
		let uplink = async {
			let mut buf = vec![0u8; 16 * 1024];
			loop {
				let n = pr.read(&mut buf).await?;
				if n == 0 {
					let _ = secure::write_secure(&mut writer, &cipher, 1, Flag::CloseStream, &[]).await;
					break;
				}
				traffic.add_uplink(n as u64);
				secure::write_secure(&mut writer, &cipher, 1, Flag::TcpData, &buf[..n])
					.await
					.map_err(wire_err)?;
			}
			Ok::<(), StrategyError>(())
		};
		let downlink = async {
			loop {
				match secure::read_secure(&mut reader, &cipher).await.map_err(wire_err)? {
					Some((_, Flag::TcpData, payload)) => {
						traffic.add_downlink(payload.len() as u64);
						pw.write_all(&payload).await?;
					},
					Some((_, Flag::CloseStream, _)) | None => break,
					_ => {},
				}
			}
			Ok::<(), StrategyError>(())
		};
		let (u, d) = tokio::join!(uplink, downlink);
		u?;
		d?;
		Ok(())
	}

	async fn relay_tcp(
		self: &Arc<Self>,
		pipe: impl AsyncRead + AsyncWrite + Unpin,
		target: Target,
	) -> Result<(), StrategyError> {
		if self.is_multiplexed() {
			self.relay_tcp_multiplexed(pipe, target).await
		} else {
			self.relay_tcp_single_use(pipe, target).await
		}
	}

	/// Forward-mode UDP-ASSOCIATE bridge: a transient local UDP listener is
	/// bridged to the remote using the SOCKS5 UDP-request encapsulation over
	/// a dedicated UDP socket, matching spec.md §4.5.1's description of the
	/// transparent-mode wire shape reused here for simplicity.
	async fn bridge_udp_associate(self: &Arc<Self>, local: UdpSocket) -> Result<(), StrategyError> {
		let profile = self.profile.load_full();
		let remote_ip = self.resolver.resolve_first(&profile.address).await.map_err(|e| {
			StrategyError::DialFailed(profile.addr_string(), std::io::Error::other(e.to_string()))
		})?;
		let remote = SocketAddr::new(remote_ip, profile.port);
		let mut buf = vec![0u8; 64 * 1024];
		loop {
			let (n, client) = match local.recv_from(&mut buf).await {
				Ok(v) => v,
				Err(_) => return Ok(()),
			};
			let mut wrapped = vec![0u8, 0u8, 0u8, 0x01, 0, 0, 0, 0, 0, 0];
			wrapped.extend_from_slice(&buf[..n]);
			local.send_to(&wrapped, remote).await?;
			let mut reply = vec![0u8; 64 * 1024];
			if let Ok(Ok((rn, _))) = tokio::time::timeout(Duration::from_secs(5), local.recv_from(&mut reply)).await {
				if rn > 10 {
					let _ = local.send_to(&reply[10..rn], client).await;
				}
			}
		}
	}
}

fn wire_err(e: waygate_wire::secure::Error) -> StrategyError {
	match e {
		waygate_wire::secure::Error::Framing(f) => StrategyError::Wire(f),
		waygate_wire::secure::Error::Cipher(c) => StrategyError::Handshake(c.to_string()),
	}
}

pub struct CustomRemoteStrategy {
	inner: Arc<Inner>,
}

impl CustomRemoteStrategy {
	pub fn new(profile: Arc<ServerProfile>, ctx: StrategyContext) -> Self {
		let cipher = Cipher::chacha20_poly1305(profile.crypt);
		CustomRemoteStrategy {
			inner: Arc::new(Inner {
				profile: ArcSwap::new(profile),
				resolver: ctx.resolver,
				cipher: ArcSwap::new(Arc::new(cipher)),
				traffic: TunnelTraffic::default(),
				mux: AsyncMutex::new(None),
				udp_sessions: std::sync::Mutex::new(HashMap::new()),
			}),
		}
	}
}

#[async_trait]
impl Strategy for CustomRemoteStrategy {
	async fn handle_raw_tcp(&self, inbound: BoxedStream, target: Target) -> Result<(), StrategyError> {
		self.inner.relay_tcp(inbound, target).await
	}

	async fn handle_udp_packet(&self, packet: Vec<u8>, flow: UdpFlow) -> Result<(), StrategyError> {
		let now = Instant::now();
		let session = {
			let mut sessions = self.inner.udp_sessions.lock().unwrap();
			sessions.retain(|_, s| now.duration_since(*s.last_seen.lock().unwrap()) < UDP_SESSION_TTL);
			sessions
				.entry(flow.client)
				.or_insert_with(|| Arc::new(UdpRemoteSession { last_seen: std::sync::Mutex::new(now) }))
				.clone()
		};
		*session.last_seen.lock().unwrap() = now;

		let profile = self.inner.profile.load_full();
		let remote: SocketAddr = self
			.inner
			.resolver
			.resolve_first(&profile.address)
			.await
			.map(|ip| SocketAddr::new(ip, profile.port))
			.map_err(|e| StrategyError::DialFailed(profile.addr_string(), std::io::Error::other(e.to_string())))?;

		let local = UdpSocket::bind("0.0.0.0:0").await?;
		let mut wrapped = vec![0u8, 0u8, 0u8, 0x01, 0, 0, 0, 0, 0, 0];
		wrapped.extend_from_slice(&packet);
		local.send_to(&wrapped, remote).await?;

		let mut reply = vec![0u8; 64 * 1024];
		if let Ok(res) = tokio::time::timeout(Duration::from_secs(5), local.recv_from(&mut reply)).await {
			let (n, _from) = res?;
			if n > 10 {
				let _ = flow.reply_tx.send((flow.client, Bytes::copy_from_slice(&reply[10..n])));
			}
		}
		Ok(())
	}

	async fn get_socks_connection(&self) -> Result<DuplexStream, StrategyError> {
		let (caller, mut strategy_side) = tokio::io::duplex(PIPE_BUFFER);
		let inner = self.inner.clone();
		tokio::spawn(async move {
			if let Err(e) = serve_pipe(inner, &mut strategy_side).await {
				warn!(err=%e, "custom-remote forward failed");
			}
		});
		Ok(caller)
	}

	fn get_type(&self) -> &'static str {
		"custom-remote"
	}

	fn get_traffic_stats(&self) -> TrafficStats {
		self.inner.traffic.snapshot()
	}

	async fn update_server(&self, new_profile: Arc<ServerProfile>) -> Result<(), StrategyError> {
		self.inner.cipher.store(Arc::new(Cipher::chacha20_poly1305(new_profile.crypt)));
		self.inner.profile.store(new_profile);
		Ok(())
	}

	async fn close_tunnel(&self) {
		let mut guard = self.inner.mux.lock().await;
		*guard = None;
	}

	async fn check_health(&self) -> Result<(), StrategyError> {
		self.inner.dial_physical().await.map(|_| ())
	}
}

async fn serve_pipe(inner: Arc<Inner>, pipe: &mut DuplexStream) -> Result<(), StrategyError> {
	socks5::server_read_greeting(pipe).await?;
	socks5::server_write_no_auth(pipe).await?;
	let (cmd, target) = socks5::server_read_request(pipe).await?;
	match cmd {
		Command::Connect => {
			socks5::server_write_reply(pipe, REPLY_SUCCEEDED).await?;
			inner.relay_tcp(pipe, target).await
		},
		Command::UdpAssociate => {
			let local = UdpSocket::bind("0.0.0.0:0").await?;
			let local_addr = local.local_addr()?;
			socks5::server_write_reply_with_addr(pipe, REPLY_SUCCEEDED, local_addr).await?;
			inner.bridge_udp_associate(local).await
		},
		Command::Unsupported(_) => {
			socks5::server_write_reply(pipe, REPLY_CONNECTION_REFUSED).await?;
			Err(StrategyError::Unsupported("custom-remote", "socks command"))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preamble_encodes_domain_targets_with_length_prefix() {
		let target = Target::new("example.com", 443);
		let preamble = build_preamble(StreamType::Tcp, &target);
		assert_eq!(preamble[0], StreamType::Tcp as u8);
		assert_eq!(preamble[1], AddrType::Domain as u8);
		assert_eq!(preamble[2], "example.com".len() as u8);
		assert_eq!(&preamble[3..3 + 11], b"example.com");
		assert_eq!(&preamble[preamble.len() - 2..], &443u16.to_be_bytes());
	}

	#[test]
	fn preamble_encodes_ipv4_targets() {
		let target = Target::new("127.0.0.1", 80);
		let preamble = build_preamble(StreamType::Tcp, &target);
		assert_eq!(preamble[1], AddrType::Ipv4 as u8);
		assert_eq!(&preamble[2..6], &[127, 0, 0, 1]);
	}
}
