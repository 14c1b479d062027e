//! Transparent Gateway (spec.md §4.10, Linux only): accepts TCP/UDP
//! redirected by TPROXY/REDIRECT iptables rules. TCP recovers the original
//! destination via `SO_ORIGINAL_DST`; UDP can't recover a real destination
//! this way, so every datagram dispatches against one configured virtual
//! target (documented as an open question in DESIGN.md).

#![cfg(target_os = "linux")]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use waygate_core::copy::{FlowCounters, TcpStreamSplitter, copy_bidirectional};
use waygate_core::drain::DrainWatcher;

use crate::dispatcher::{Dispatcher, REJECT};
use crate::events::{self, EventSender};
use crate::firewall::{FirewallHandle, FlowMeta};
use crate::model::{FirewallAction, Protocol};
use crate::strategy::{BoxedStream, Target, UdpFlow};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SO_ORIGINAL_DST: libc::c_int = 80;

pub struct TransparentGateway {
	dispatcher: Arc<Dispatcher>,
	firewall: Arc<FirewallHandle>,
	events: EventSender,
	/// The host name synthesized for every UDP datagram's dispatch target,
	/// since TPROXY UDP can't recover the real destination per-packet.
	virtual_udp_host: String,
}

impl TransparentGateway {
	pub fn new(dispatcher: Arc<Dispatcher>, firewall: Arc<FirewallHandle>, events: EventSender, virtual_udp_host: impl Into<String>) -> Arc<Self> {
		Arc::new(TransparentGateway { dispatcher, firewall, events, virtual_udp_host: virtual_udp_host.into() })
	}

	pub async fn run_tcp(self: Arc<Self>, addr: SocketAddr, drain: DrainWatcher) -> std::io::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		info!(%addr, "transparent TCP gateway listening");

		let shutdown = drain.clone().signaled();
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					let gw = self.clone();
					let conn_guard = drain.clone();
					tokio::spawn(async move {
						gw.handle_tcp(stream, peer).await;
						drop(conn_guard);
					});
				}
				released = &mut shutdown => {
					drop(released);
					info!(%addr, "transparent TCP gateway draining, no longer accepting");
					return Ok(());
				}
			}
		}
	}

	async fn handle_tcp(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
		let original = match original_dst(&stream) {
			Ok(addr) => addr,
			Err(e) => {
				warn!(%peer, err = %e, "SO_ORIGINAL_DST failed");
				return;
			},
		};
		let target_str = format!("{}:{}", original.ip(), original.port());

		let meta = FlowMeta { protocol: Protocol::Tcp, source: peer.ip(), dest: original.ip(), dest_port: original.port() };
		if self.firewall.check(meta) == FirewallAction::Deny {
			let _ = self.events.send(events::traffic_log(peer.ip(), "tcp", target_str, "denied", None));
			return;
		}

		let decision = match self.dispatcher.dispatch(peer.ip(), &target_str).await {
			Ok(d) => d,
			Err(_) => return,
		};

		let backend_id = decision.backend_id;
		let result = match decision.strategy {
			None if decision.server_id == REJECT => return,
			None => relay_direct(stream, original).await,
			Some(strategy) => {
				if let Some(id) = backend_id {
					self.dispatcher.mark_active_start(id);
				}
				let target = Target::new(original.ip().to_string(), original.port());
				let boxed: BoxedStream = Box::new(stream);
				let result = strategy.handle_raw_tcp(boxed, target).await.map_err(|e| std::io::Error::other(e.to_string()));
				if let Some(id) = backend_id {
					self.dispatcher.mark_active_end(id);
				}
				result
			},
		};
		if let Err(e) = result {
			warn!(%peer, %target_str, err = %e, "transparent TCP relay failed");
		}
	}

	/// UDP has no per-packet original destination to recover under TPROXY, so
	/// every datagram dispatches against the same configured virtual target;
	/// the chosen strategy's `handle_udp_packet` decides what happens next.
	pub async fn run_udp(self: Arc<Self>, addr: SocketAddr, drain: DrainWatcher) -> std::io::Result<()> {
		let socket = Arc::new(UdpSocket::bind(addr).await?);
		info!(%addr, "transparent UDP gateway listening");

		let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
		{
			let socket = socket.clone();
			tokio::spawn(async move {
				while let Some((to, payload)) = reply_rx.recv().await {
					let _ = socket.send_to(&payload, to).await;
				}
			});
		}

		let shutdown = drain.clone().signaled();
		tokio::pin!(shutdown);
		let mut buf = vec![0u8; 64 * 1024];
		loop {
			tokio::select! {
				recvd = socket.recv_from(&mut buf) => {
					let (n, client) = recvd?;
					let packet = buf[..n].to_vec();
					self.clone().handle_udp(packet, client, reply_tx.clone());
				}
				released = &mut shutdown => {
					drop(released);
					info!(%addr, "transparent UDP gateway draining, no longer accepting");
					return Ok(());
				}
			}
		}
	}

	fn handle_udp(self: Arc<Self>, packet: Vec<u8>, client: SocketAddr, reply_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>) {
		tokio::spawn(async move {
			let virtual_target = self.virtual_udp_host.clone();
			let (host, port) = virtual_target.rsplit_once(':').unwrap_or((virtual_target.as_str(), "0"));
			let dest_port: u16 = port.parse().unwrap_or(0);

			let meta = FlowMeta { protocol: Protocol::Udp, source: client.ip(), dest: client.ip(), dest_port };
			if self.firewall.check(meta) == FirewallAction::Deny {
				let _ = self.events.send(events::traffic_log(client.ip(), "udp", virtual_target, "denied", None));
				return;
			}

			let decision = match self.dispatcher.dispatch(client.ip(), &virtual_target).await {
				Ok(d) => d,
				Err(_) => return,
			};
			if let Some(strategy) = decision.strategy {
				let flow = UdpFlow { client, reply_tx };
				if let Err(e) = strategy.handle_udp_packet(packet, flow).await {
					warn!(%client, host, err = %e, "transparent UDP relay failed");
				}
			}
		});
	}
}

async fn relay_direct(stream: TcpStream, original: SocketAddr) -> std::io::Result<()> {
	let upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(original)).await.map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
	let counters = FlowCounters::new();
	copy_bidirectional(TcpStreamSplitter(stream), TcpStreamSplitter(upstream), &counters)
		.await
		.map_err(|e| std::io::Error::other(e.to_string()))
}

/// Recovers the pre-NAT destination of a REDIRECT'd IPv4 TCP socket via
/// `getsockopt(SOL_IP, SO_ORIGINAL_DST)`. IPv6 REDIRECT targets aren't
/// supported (documented in DESIGN.md).
fn original_dst(stream: &TcpStream) -> std::io::Result<SocketAddr> {
	let fd = stream.as_raw_fd();
	let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
	let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
	let ret = unsafe { libc::getsockopt(fd, libc::SOL_IP, SO_ORIGINAL_DST, &mut addr as *mut _ as *mut libc::c_void, &mut len) };
	if ret != 0 {
		return Err(std::io::Error::last_os_error());
	}
	let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
	let port = u16::from_be(addr.sin_port);
	Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}
