//! `write_secure`/`read_secure`: the AEAD-protected variant of [`crate::framing`].
//!
//! The packet header (`LEN | STREAM_ID | FLAG`) stays clear; only the
//! payload is sealed, so a packet with an empty payload is indistinguishable
//! from a plaintext one on the wire except for ciphertext expansion.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::Cipher;
use crate::framing::{self, Flag, Packet};

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Framing(#[from] framing::Error),
	#[error(transparent)]
	Cipher(#[from] crate::cipher::Error),
}

pub async fn write_secure<W: AsyncWrite + Unpin>(
	sink: &mut W,
	cipher: &Cipher,
	stream_id: u16,
	flag: Flag,
	plaintext: &[u8],
) -> Result<(), Error> {
	let sealed = cipher.seal(plaintext)?;
	let packet = Packet::new(stream_id, flag, sealed)?;
	framing::write_packet(sink, &packet).await?;
	Ok(())
}

/// Returns `Ok(None)` on a clean end-of-stream, matching `read_packet`.
pub async fn read_secure<R: AsyncRead + Unpin>(
	source: &mut R,
	cipher: &Cipher,
) -> Result<Option<(u16, Flag, Vec<u8>)>, Error> {
	let Some(packet) = framing::read_packet(source).await? else {
		return Ok(None);
	};
	let plaintext = cipher.open(&packet.payload)?;
	Ok(Some((packet.stream_id, packet.flag, plaintext)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_through_aead() {
		let cipher = Cipher::chacha20_poly1305(99);
		let mut buf = Vec::new();
		write_secure(&mut buf, &cipher, 3, Flag::TcpData, b"payload bytes")
			.await
			.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		let (stream_id, flag, plaintext) = read_secure(&mut cursor, &cipher).await.unwrap().unwrap();
		assert_eq!(stream_id, 3);
		assert_eq!(flag, Flag::TcpData);
		assert_eq!(plaintext, b"payload bytes");
	}

	#[tokio::test]
	async fn wrong_key_fails_to_open() {
		let writer_cipher = Cipher::chacha20_poly1305(1);
		let reader_cipher = Cipher::chacha20_poly1305(2);
		let mut buf = Vec::new();
		write_secure(&mut buf, &writer_cipher, 1, Flag::TcpData, b"secret")
			.await
			.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		let result = read_secure(&mut cursor, &reader_cipher).await;
		assert!(result.is_err());
	}
}
