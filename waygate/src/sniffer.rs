//! Protocol sniffer (spec.md §4.2): classifies an inbound connection from its
//! first byte, completing just enough of the SOCKS5 greeting or HTTP request
//! line to learn the target `host:port`, without ever answering the client —
//! the gateway answers after the dispatcher has made a routing decision.
//!
//! The TLS branch only ever reads one ClientHello record, so unlike the other
//! two branches there is nothing left on the wire for `client_connect`/HTTP to
//! consume; instead the exact bytes read are handed back in `Sniffed::replay`
//! so the caller can retransmit them as the first uplink bytes once a
//! backend is chosen (spec.md §4.9 step 6).

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::socks5::{self, Socks5Error};
use crate::strategy::Target;

const SNIFF_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_HTTP_HEADER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
	Socks5,
	Http,
	Tls,
}

#[derive(Debug, Clone)]
pub struct HttpInfo {
	pub method: String,
	pub is_connect: bool,
}

#[derive(Debug, Error)]
pub enum SnifferError {
	#[error("unrecognized protocol")]
	Unknown,
	#[error("sniff timed out")]
	Timeout,
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Socks5(#[from] Socks5Error),
	#[error("malformed http request")]
	MalformedHttp,
	#[error("malformed tls client hello")]
	MalformedTls,
}

/// The classification result. `replay` holds raw bytes the sniffer consumed
/// that still need to reach the backend as the first uplink bytes — non-empty
/// only for TLS (the whole ClientHello record) and non-CONNECT HTTP (the
/// whole request line + headers); empty for SOCKS5, whose handshake the
/// sniffer fully completes itself.
pub struct Sniffed {
	pub proto: Proto,
	pub target: Target,
	pub http: Option<HttpInfo>,
	pub replay: Vec<u8>,
}

/// Classifies `stream` and extracts its target, bounded by a 2-second
/// deadline (spec.md §4.2).
pub async fn sniff<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Sniffed, SnifferError> {
	tokio::time::timeout(SNIFF_TIMEOUT, sniff_inner(stream)).await.map_err(|_| SnifferError::Timeout)?
}

async fn sniff_inner<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Sniffed, SnifferError> {
	let mut first = [0u8; 1];
	stream.read_exact(&mut first).await?;
	match first[0] {
		0x05 => sniff_socks5(stream).await,
		0x16 => sniff_tls(stream, first[0]).await,
		b if b.is_ascii_uppercase() => sniff_http(stream, first[0]).await,
		_ => Err(SnifferError::Unknown),
	}
}

/// `first_byte` (0x05) is already consumed by the caller; only NMETHODS and
/// METHODS remain of the greeting (spec.md §4.2's SOCKS5 branch).
async fn sniff_socks5<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Sniffed, SnifferError> {
	let mut nmethods = [0u8; 1];
	stream.read_exact(&mut nmethods).await?;
	let mut methods = vec![0u8; nmethods[0] as usize];
	stream.read_exact(&mut methods).await?;
	socks5::server_write_no_auth(stream).await?;
	let (_cmd, target) = socks5::server_read_request(stream).await?;
	Ok(Sniffed { proto: Proto::Socks5, target, http: None, replay: Vec::new() })
}

fn target_with_default_port(host_port: &str, default_port: u16) -> Target {
	match Target::parse(host_port) {
		Some(t) => t,
		None => Target::new(host_port.trim_start_matches('[').trim_end_matches(']'), default_port),
	}
}

async fn sniff_http<S: AsyncRead + Unpin>(stream: &mut S, first_byte: u8) -> Result<Sniffed, SnifferError> {
	let mut buf = vec![first_byte];
	let mut chunk = [0u8; 512];
	loop {
		let mut headers = [httparse::EMPTY_HEADER; 64];
		let mut req = httparse::Request::new(&mut headers);
		match req.parse(&buf) {
			Ok(httparse::Status::Complete(_)) => {
				let method = req.method.unwrap_or("").to_string();
				let is_connect = method.eq_ignore_ascii_case("CONNECT");
				let host = req
					.headers
					.iter()
					.find(|h| h.name.eq_ignore_ascii_case("host"))
					.map(|h| String::from_utf8_lossy(h.value).into_owned())
					.ok_or(SnifferError::MalformedHttp)?;
				let default_port = if is_connect { 443 } else { 80 };
				let target = target_with_default_port(&host, default_port);
				let replay = if is_connect { Vec::new() } else { buf.clone() };
				return Ok(Sniffed { proto: Proto::Http, target, http: Some(HttpInfo { method, is_connect }), replay });
			},
			Ok(httparse::Status::Partial) => {
				if buf.len() > MAX_HTTP_HEADER {
					return Err(SnifferError::MalformedHttp);
				}
				let n = stream.read(&mut chunk).await?;
				if n == 0 {
					return Err(SnifferError::MalformedHttp);
				}
				buf.extend_from_slice(&chunk[..n]);
			},
			Err(_) => return Err(SnifferError::MalformedHttp),
		}
	}
}

/// Reads exactly one TLS record (assumed to hold the whole ClientHello,
/// unfragmented — a simplification documented in DESIGN.md) and extracts the
/// SNI hostname.
async fn sniff_tls<S: AsyncRead + Unpin>(stream: &mut S, first_byte: u8) -> Result<Sniffed, SnifferError> {
	let mut header = [0u8; 5];
	header[0] = first_byte;
	stream.read_exact(&mut header[1..]).await?;
	if header[1] < 3 {
		return Err(SnifferError::MalformedTls);
	}
	let len = u16::from_be_bytes([header[3], header[4]]) as usize;
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await?;

	let sni = parse_sni(&body).ok_or(SnifferError::MalformedTls)?;

	let mut replay = Vec::with_capacity(5 + body.len());
	replay.extend_from_slice(&header);
	replay.extend_from_slice(&body);

	Ok(Sniffed { proto: Proto::Tls, target: Target::new(sni, 443), http: None, replay })
}

/// Walks a ClientHello handshake body (the bytes after the 5-byte TLS record
/// header) to find the SNI extension's hostname.
fn parse_sni(body: &[u8]) -> Option<String> {
	let mut pos = 0usize;
	if body.len() < 4 || body[0] != 0x01 {
		return None; // not a ClientHello
	}
	pos += 4; // handshake type (1) + length (3)
	pos += 2; // client version
	pos += 32; // client random
	if body.len() < pos + 1 {
		return None;
	}
	let session_id_len = body[pos] as usize;
	pos += 1 + session_id_len;

	if body.len() < pos + 2 {
		return None;
	}
	let cipher_suites_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
	pos += 2 + cipher_suites_len;

	if body.len() < pos + 1 {
		return None;
	}
	let compression_methods_len = body[pos] as usize;
	pos += 1 + compression_methods_len;

	if body.len() < pos + 2 {
		return None;
	}
	let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
	pos += 2;
	let extensions_end = (pos + extensions_len).min(body.len());

	while pos + 4 <= extensions_end {
		let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
		let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
		pos += 4;
		if pos + ext_len > extensions_end {
			break;
		}
		if ext_type == 0 {
			return parse_server_name_extension(&body[pos..pos + ext_len]);
		}
		pos += ext_len;
	}
	None
}

fn parse_server_name_extension(ext: &[u8]) -> Option<String> {
	if ext.len() < 2 {
		return None;
	}
	let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
	let list = ext.get(2..2 + list_len)?;
	if list.len() < 3 || list[0] != 0x00 {
		return None; // name_type 0 = hostname
	}
	let host_len = u16::from_be_bytes([list[1], list[2]]) as usize;
	let host = list.get(3..3 + host_len)?;
	std::str::from_utf8(host).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
		let mut sni_inner = vec![0x00]; // name_type: hostname
		sni_inner.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
		sni_inner.extend_from_slice(hostname.as_bytes());

		let mut sni_list = Vec::new();
		sni_list.extend_from_slice(&(sni_inner.len() as u16).to_be_bytes());
		sni_list.extend_from_slice(&sni_inner);

		let mut ext = vec![0x00, 0x00]; // ext_type = server_name
		ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
		ext.extend_from_slice(&sni_list);

		let mut body = vec![0x01]; // ClientHello
		body.extend_from_slice(&[0, 0, 0]); // length placeholder, unused by parser
		body.extend_from_slice(&[3, 3]); // client version
		body.extend_from_slice(&[0u8; 32]); // random
		body.push(0); // session id len
		body.extend_from_slice(&[0, 2]); // cipher suites len
		body.extend_from_slice(&[0, 0]); // cipher suites
		body.push(1); // compression methods len
		body.push(0); // compression methods
		body.extend_from_slice(&(ext.len() as u16).to_be_bytes()); // extensions len
		body.extend_from_slice(&ext);
		body
	}

	#[test]
	fn parses_sni_from_client_hello() {
		let body = client_hello_with_sni("example.com");
		assert_eq!(parse_sni(&body).as_deref(), Some("example.com"));
	}

	#[test]
	fn rejects_non_client_hello() {
		assert!(parse_sni(&[0x02, 0, 0, 0]).is_none());
	}

	#[test]
	fn target_with_default_port_uses_default_when_absent() {
		assert_eq!(target_with_default_port("example.com", 443), Target::new("example.com", 443));
		assert_eq!(target_with_default_port("example.com:8080", 443), Target::new("example.com", 8080));
	}
}
