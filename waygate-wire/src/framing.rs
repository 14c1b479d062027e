//! Length-prefixed framing for the custom-remote tunnel protocol.
//!
//! Wire shape: `LEN(u16 BE, covers everything after itself) | STREAM_ID(u16 BE)
//! | FLAG(u8) | PAYLOAD`. `LEN` must be at least 3 (`STREAM_ID` + `FLAG`) or
//! the packet is rejected as malformed.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a single packet can carry: `u16::MAX` minus the 3-byte
/// `STREAM_ID | FLAG` header that `LEN` also covers.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - 3;

#[derive(Debug, Error)]
pub enum Error {
	#[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN}-byte frame limit")]
	PayloadTooLarge(usize),
	#[error("frame length {0} is shorter than the 3-byte stream_id+flag header")]
	TooShort(u16),
	#[error("unknown flag byte {0:#04x}")]
	UnknownFlag(u8),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
	NewStreamTcp,
	NewStreamTcpSuccess,
	TcpData,
	UdpData,
	CloseStream,
}

impl Flag {
	fn from_byte(b: u8) -> Result<Self, Error> {
		match b {
			0x01 => Ok(Flag::NewStreamTcp),
			0x02 => Ok(Flag::NewStreamTcpSuccess),
			0x03 => Ok(Flag::TcpData),
			0x04 => Ok(Flag::UdpData),
			0x05 => Ok(Flag::CloseStream),
			other => Err(Error::UnknownFlag(other)),
		}
	}

	fn to_byte(self) -> u8 {
		match self {
			Flag::NewStreamTcp => 0x01,
			Flag::NewStreamTcpSuccess => 0x02,
			Flag::TcpData => 0x03,
			Flag::UdpData => 0x04,
			Flag::CloseStream => 0x05,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
	pub stream_id: u16,
	pub flag: Flag,
	pub payload: Vec<u8>,
}

impl Packet {
	pub fn new(stream_id: u16, flag: Flag, payload: Vec<u8>) -> Result<Self, Error> {
		if payload.len() > MAX_PAYLOAD_LEN {
			return Err(Error::PayloadTooLarge(payload.len()));
		}
		Ok(Packet { stream_id, flag, payload })
	}

	fn encoded_len(&self) -> u16 {
		// stream_id (2) + flag (1) + payload
		3 + self.payload.len() as u16
	}
}

/// Writes one framed packet. Returns `payload-too-large` if the payload
/// cannot fit in a u16 length field.
pub async fn write_packet<W: AsyncWrite + Unpin>(sink: &mut W, packet: &Packet) -> Result<(), Error> {
	if packet.payload.len() > MAX_PAYLOAD_LEN {
		return Err(Error::PayloadTooLarge(packet.payload.len()));
	}
	let mut buf = BytesMut::with_capacity(2 + packet.encoded_len() as usize);
	buf.put_u16(packet.encoded_len());
	buf.put_u16(packet.stream_id);
	buf.put_u8(packet.flag.to_byte());
	buf.put_slice(&packet.payload);
	sink.write_all(&buf).await?;
	Ok(())
}

/// Reads one framed packet. Returns `Ok(None)` on a clean end-of-stream
/// (zero bytes read before any header byte), so callers can distinguish a
/// graceful close from a malformed frame.
pub async fn read_packet<R: AsyncRead + Unpin>(source: &mut R) -> Result<Option<Packet>, Error> {
	let mut len_buf = [0u8; 2];
	match read_exact_or_eof(source, &mut len_buf).await? {
		false => return Ok(None),
		true => {},
	}
	let len = u16::from_be_bytes(len_buf);
	if (len as usize) < 3 {
		return Err(Error::TooShort(len));
	}
	let mut rest = vec![0u8; len as usize];
	source.read_exact(&mut rest).await?;
	let mut rest = rest.as_slice();
	let stream_id = rest.get_u16();
	let flag = Flag::from_byte(rest.get_u8())?;
	let payload = rest.to_vec();
	Ok(Some(Packet { stream_id, flag, payload }))
}

/// Like `read_exact`, but returns `Ok(false)` instead of erroring when the
/// stream ends before any byte of `buf` is filled.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
	source: &mut R,
	buf: &mut [u8],
) -> std::io::Result<bool> {
	let mut filled = 0;
	while filled < buf.len() {
		let n = source.read(&mut buf[filled..]).await?;
		if n == 0 {
			if filled == 0 {
				return Ok(false);
			}
			return Err(std::io::ErrorKind::UnexpectedEof.into());
		}
		filled += n;
	}
	Ok(true)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_a_simple_packet() {
		let packet = Packet::new(1, Flag::NewStreamTcp, vec![0x68, 0x69]).unwrap();
		let mut buf = Vec::new();
		write_packet(&mut buf, &packet).await.unwrap();
		assert_eq!(buf, vec![0x00, 0x06, 0x00, 0x01, 0x01, 0x68, 0x69]);

		let mut cursor = std::io::Cursor::new(buf);
		let decoded = read_packet(&mut cursor).await.unwrap().unwrap();
		assert_eq!(decoded, packet);
	}

	#[tokio::test]
	async fn rejects_oversized_payload() {
		let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
		let err = Packet::new(1, Flag::TcpData, payload).unwrap_err();
		assert!(matches!(err, Error::PayloadTooLarge(_)));
	}

	#[tokio::test]
	async fn rejects_frames_shorter_than_the_header() {
		let mut cursor = std::io::Cursor::new(vec![0x00u8, 0x02]);
		let err = read_packet(&mut cursor).await.unwrap_err();
		assert!(matches!(err, Error::TooShort(2)));
	}

	#[tokio::test]
	async fn clean_eof_before_any_header_byte_is_not_an_error() {
		let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
		let result = read_packet(&mut cursor).await.unwrap();
		assert!(result.is_none());
	}

	#[tokio::test]
	async fn max_payload_round_trips() {
		let payload = vec![0xab; MAX_PAYLOAD_LEN];
		let packet = Packet::new(7, Flag::UdpData, payload).unwrap();
		let mut buf = Vec::new();
		write_packet(&mut buf, &packet).await.unwrap();
		let mut cursor = std::io::Cursor::new(buf);
		let decoded = read_packet(&mut cursor).await.unwrap().unwrap();
		assert_eq!(decoded, packet);
	}
}
