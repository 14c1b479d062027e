//! Minimal SOCKS5 server- and client-side helpers (RFC 1928), shared by the
//! sniffer (server greeting/request parsing), the unified gateway (server
//! reply), and the upstream-dialing strategies (client handshake against a
//! remote SOCKS5 proxy).
//!
//! No-auth only, matching spec.md §6's "SOCKS5 server surface: no-auth only".

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::strategy::Target;

#[derive(Debug, Error)]
pub enum Socks5Error {
	#[error("unsupported SOCKS version {0:#04x}")]
	BadVersion(u8),
	#[error("unsupported address type {0:#04x}")]
	BadAtyp(u8),
	#[error("upstream SOCKS5 handshake rejected: {0:#04x}")]
	Rejected(u8),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	Connect,
	UdpAssociate,
	Unsupported(u8),
}

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Consumes the greeting (`VER | NMETHODS | METHODS...`) and replies
/// `05 00` (no-auth). Spec.md §4.2's sniffer already peeked the first
/// greeting byte to classify the connection; this re-reads from the start
/// of a stream that still has those bytes buffered (the caller is
/// responsible for replaying sniffed bytes).
pub async fn server_read_greeting<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), Socks5Error> {
	let mut hdr = [0u8; 2];
	stream.read_exact(&mut hdr).await?;
	if hdr[0] != 0x05 {
		return Err(Socks5Error::BadVersion(hdr[0]));
	}
	let nmethods = hdr[1] as usize;
	let mut methods = vec![0u8; nmethods];
	stream.read_exact(&mut methods).await?;
	Ok(())
}

pub async fn server_write_no_auth<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), Socks5Error> {
	stream.write_all(&[0x05, 0x00]).await?;
	Ok(())
}

/// Reads the request header (`VER | CMD | RSV | ATYP | ADDR | PORT`) and
/// returns the command and target. Does not send a reply — spec.md §4.2:
/// "the request is not answered here; the gateway answers after routing".
pub async fn server_read_request<S: AsyncRead + Unpin>(
	stream: &mut S,
) -> Result<(Command, Target), Socks5Error> {
	let mut hdr = [0u8; 4];
	stream.read_exact(&mut hdr).await?;
	if hdr[0] != 0x05 {
		return Err(Socks5Error::BadVersion(hdr[0]));
	}
	let cmd = match hdr[1] {
		0x01 => Command::Connect,
		0x03 => Command::UdpAssociate,
		other => Command::Unsupported(other),
	};
	let target = read_address_port(stream, hdr[3]).await?;
	Ok((cmd, target))
}

async fn read_address_port<S: AsyncRead + Unpin>(stream: &mut S, atyp: u8) -> Result<Target, Socks5Error> {
	let host = match atyp {
		0x01 => {
			let mut buf = [0u8; 4];
			stream.read_exact(&mut buf).await?;
			Ipv4Addr::from(buf).to_string()
		},
		0x03 => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len).await?;
			let mut buf = vec![0u8; len[0] as usize];
			stream.read_exact(&mut buf).await?;
			String::from_utf8_lossy(&buf).into_owned()
		},
		0x04 => {
			let mut buf = [0u8; 16];
			stream.read_exact(&mut buf).await?;
			Ipv6Addr::from(buf).to_string()
		},
		other => return Err(Socks5Error::BadAtyp(other)),
	};
	let mut port_buf = [0u8; 2];
	stream.read_exact(&mut port_buf).await?;
	let port = u16::from_be_bytes(port_buf);
	Ok(Target::new(host, port))
}

/// Writes a `REP` reply with a zeroed bind-address (the gateway never binds
/// a real local relay port for CONNECT).
pub async fn server_write_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> Result<(), Socks5Error> {
	let mut buf = vec![0x05, rep, 0x00, 0x01];
	buf.extend_from_slice(&[0, 0, 0, 0]);
	buf.extend_from_slice(&[0, 0]);
	stream.write_all(&buf).await?;
	Ok(())
}

/// Like `server_write_reply`, but the bind address is the given UDP relay
/// socket (used by CustomRemote's forward-mode UDP-ASSOCIATE reply).
pub async fn server_write_reply_with_addr<S: AsyncWrite + Unpin>(
	stream: &mut S,
	rep: u8,
	addr: std::net::SocketAddr,
) -> Result<(), Socks5Error> {
	let mut buf = vec![0x05, rep, 0x00];
	match addr {
		std::net::SocketAddr::V4(a) => {
			buf.push(0x01);
			buf.extend_from_slice(&a.ip().octets());
		},
		std::net::SocketAddr::V6(a) => {
			buf.push(0x04);
			buf.extend_from_slice(&a.ip().octets());
		},
	}
	buf.extend_from_slice(&addr.port().to_be_bytes());
	stream.write_all(&buf).await?;
	Ok(())
}

/// Client-side CONNECT handshake against an upstream SOCKS5 proxy: greeting,
/// request, and reading back the reply. Used by `Socks5UpstreamStrategy` and
/// by `CustomRemoteStrategy`'s internal forward-mode pipe.
pub async fn client_connect<S: AsyncRead + AsyncWrite + Unpin>(
	stream: &mut S,
	target: &Target,
) -> Result<(), Socks5Error> {
	stream.write_all(&[0x05, 0x01, 0x00]).await?;
	let mut reply = [0u8; 2];
	stream.read_exact(&mut reply).await?;
	if reply[0] != 0x05 {
		return Err(Socks5Error::BadVersion(reply[0]));
	}

	let mut req = vec![0x05, 0x01, 0x00];
	match target.host.parse::<Ipv4Addr>() {
		Ok(ip) => {
			req.push(0x01);
			req.extend_from_slice(&ip.octets());
		},
		Err(_) => match target.host.parse::<Ipv6Addr>() {
			Ok(ip) => {
				req.push(0x04);
				req.extend_from_slice(&ip.octets());
			},
			Err(_) => {
				req.push(0x03);
				req.push(target.host.len() as u8);
				req.extend_from_slice(target.host.as_bytes());
			},
		},
	}
	req.extend_from_slice(&target.port.to_be_bytes());
	stream.write_all(&req).await?;

	let mut hdr = [0u8; 4];
	stream.read_exact(&mut hdr).await?;
	if hdr[1] != REPLY_SUCCEEDED {
		return Err(Socks5Error::Rejected(hdr[1]));
	}
	let _ = read_address_port(stream, hdr[3]).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn server_parses_domain_request() {
		let mut buf = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
		buf.extend_from_slice(b"example.com");
		buf.extend_from_slice(&443u16.to_be_bytes());
		let mut cursor = std::io::Cursor::new(buf);
		let (cmd, target) = server_read_request(&mut cursor).await.unwrap();
		assert_eq!(cmd, Command::Connect);
		assert_eq!(target, Target::new("example.com", 443));
	}
}
