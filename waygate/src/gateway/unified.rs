//! Unified Gateway (spec.md §4.9): one TCP listener that sniffs the client
//! protocol on every accepted connection, asks the dispatcher for a
//! decision, and either relays directly or hands the flow to the chosen
//! strategy's SOCKS pipe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use waygate_core::copy::{FlowCounters, TcpStreamSplitter, copy_bidirectional};
use waygate_core::drain::DrainWatcher;

use crate::dispatcher::{Dispatcher, REJECT};
use crate::dns::DnsResolver;
use crate::events::{self, EventSender};
use crate::metrics::Metrics;
use crate::sniffer::{self, Proto, Sniffed};
use crate::socks5;
use crate::strategy::DynStrategy;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UnifiedGateway {
	dispatcher: Arc<Dispatcher>,
	resolver: Arc<DnsResolver>,
	events: EventSender,
	metrics: Arc<Metrics>,
}

impl UnifiedGateway {
	pub fn new(dispatcher: Arc<Dispatcher>, resolver: Arc<DnsResolver>, events: EventSender, metrics: Arc<Metrics>) -> Arc<Self> {
		Arc::new(UnifiedGateway { dispatcher, resolver, events, metrics })
	}

	/// Accepts until the drain signals, holding one `DrainWatcher` clone per
	/// in-flight connection so a drain waits for them to finish naturally.
	pub async fn run(self: Arc<Self>, addr: SocketAddr, drain: DrainWatcher) -> std::io::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		info!(%addr, "unified gateway listening");

		let shutdown = drain.clone().signaled();
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					let gw = self.clone();
					let conn_guard = drain.clone();
					tokio::spawn(async move {
						gw.handle(stream, peer).await;
						drop(conn_guard);
					});
				}
				released = &mut shutdown => {
					drop(released);
					info!(%addr, "unified gateway draining, no longer accepting");
					return Ok(());
				}
			}
		}
	}

	async fn handle(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
		let trace_id = Uuid::new_v4();
		let _ = stream.set_nodelay(true);

		let sniffed = match sniffer::sniff(&mut stream).await {
			Ok(s) => s,
			Err(e) => {
				debug!(%trace_id, %peer, err = %e, "sniff failed, dropping connection");
				return;
			},
		};

		let proto_name = match sniffed.proto {
			Proto::Socks5 => "socks5",
			Proto::Http => "http",
			Proto::Tls => "tls",
		};
		let target_str = sniffed.target.to_string();
		let _ = self.events.send(events::traffic_log(peer.ip(), proto_name, target_str.clone(), "intercepted", None));

		let decision = match self.dispatcher.dispatch(peer.ip(), &target_str).await {
			Ok(d) => d,
			Err(_) => {
				debug!(%trace_id, %peer, %target_str, "no healthy backend");
				return;
			},
		};
		let _ = self.events.send(events::traffic_log(
			peer.ip(),
			proto_name,
			target_str,
			"decided",
			Some(decision.server_id.clone()),
		));
		let decision_label = match decision.server_id.as_str() {
			REJECT => "reject",
			crate::dispatcher::DIRECT => "direct",
			_ => "backend",
		};
		self.metrics.record_flow(proto_name, decision_label);

		let backend_id = decision.backend_id;
		let result = match decision.strategy {
			None if decision.server_id == REJECT => {
				debug!(%trace_id, %peer, "rejected by routing rule");
				return;
			},
			None => self.forward_direct(stream, sniffed).await,
			Some(strategy) => {
				if let Some(id) = backend_id {
					self.dispatcher.mark_active_start(id);
				}
				let result = self.forward_via_strategy(stream, sniffed, strategy).await;
				if let Some(id) = backend_id {
					self.dispatcher.mark_active_end(id);
				}
				result
			},
		};
		if let Err(e) = result {
			warn!(%trace_id, %peer, err = %e, "relay ended with an error");
		}
	}

	/// DIRECT: answer the client's own protocol handshake, dial the target
	/// straight from this process, and relay (spec.md §4.9 step 5).
	async fn forward_direct(&self, mut stream: TcpStream, sniffed: Sniffed) -> std::io::Result<()> {
		answer_client(&mut stream, &sniffed).await?;

		let ip = self
			.resolver
			.resolve_first(&sniffed.target.host)
			.await
			.map_err(|e| std::io::Error::other(e.to_string()))?;
		let addr = SocketAddr::new(ip, sniffed.target.port);
		let mut upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
			.await
			.map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

		if !sniffed.replay.is_empty() {
			upstream.write_all(&sniffed.replay).await?;
		}

		let counters = FlowCounters::new();
		copy_bidirectional(TcpStreamSplitter(stream), TcpStreamSplitter(upstream), &counters)
			.await
			.map_err(|e| std::io::Error::other(e.to_string()))
	}

	/// Forward mode: drive the strategy's own SOCKS5 server handshake as its
	/// client, then tie the two streams together (spec.md §4.9 step 6).
	async fn forward_via_strategy(&self, mut stream: TcpStream, sniffed: Sniffed, strategy: DynStrategy) -> std::io::Result<()> {
		let mut pipe = strategy.get_socks_connection().await.map_err(|e| std::io::Error::other(e.to_string()))?;

		let is_connect = sniffed.http.as_ref().map(|h| h.is_connect).unwrap_or(true);
		match socks5::client_connect(&mut pipe, &sniffed.target).await {
			Ok(()) => match sniffed.proto {
				Proto::Socks5 => socks5::server_write_reply(&mut stream, socks5::REPLY_SUCCEEDED).await?,
				Proto::Http if is_connect => stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?,
				Proto::Http => pipe.write_all(&sniffed.replay).await?,
				Proto::Tls => pipe.write_all(&sniffed.replay).await?,
			},
			Err(_) => {
				match sniffed.proto {
					Proto::Socks5 => {
						let _ = socks5::server_write_reply(&mut stream, socks5::REPLY_CONNECTION_REFUSED).await;
					},
					Proto::Http if is_connect => {
						let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
					},
					_ => {},
				}
				return Ok(());
			},
		}

		let counters = FlowCounters::new();
		copy_bidirectional(TcpStreamSplitter(stream), pipe, &counters)
			.await
			.map_err(|e| std::io::Error::other(e.to_string()))
	}
}

async fn answer_client(stream: &mut TcpStream, sniffed: &Sniffed) -> std::io::Result<()> {
	match sniffed.proto {
		Proto::Socks5 => socks5::server_write_reply(stream, socks5::REPLY_SUCCEEDED).await.map_err(|e| std::io::Error::other(e.to_string())),
		Proto::Http => {
			if sniffed.http.as_ref().map(|h| h.is_connect).unwrap_or(false) {
				stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await
			} else {
				Ok(())
			}
		},
		Proto::Tls => Ok(()),
	}
}
