//! Adapts a `tokio_tungstenite` WebSocket connection to a plain
//! `AsyncRead`/`AsyncWrite` byte stream, so callers that frame their own
//! protocol over the connection (CustomRemote's wire packets, VLESS's
//! request/response header) don't need to know whether the bytes are riding
//! raw TCP or a WS upgrade underneath.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub struct WsStream {
	inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
	read_buf: Bytes,
}

impl WsStream {
	pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
		WsStream { inner, read_buf: Bytes::new() }
	}
}

impl AsyncRead for WsStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		use futures::Stream;
		if !self.read_buf.is_empty() {
			let n = std::cmp::min(self.read_buf.len(), buf.remaining());
			let chunk = self.read_buf.split_to(n);
			buf.put_slice(&chunk);
			return Poll::Ready(Ok(()));
		}
		loop {
			match Pin::new(&mut self.inner).poll_next(cx) {
				Poll::Ready(Some(Ok(Message::Binary(data)))) => {
					self.read_buf = data.into();
					continue;
				},
				Poll::Ready(Some(Ok(_))) => continue,
				Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(std::io::Error::other(e))),
				Poll::Ready(None) => return Poll::Ready(Ok(())),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

impl AsyncWrite for WsStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		use futures::Sink;
		match Pin::new(&mut self.inner).poll_ready(cx) {
			Poll::Ready(Ok(())) => {},
			Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::other(e))),
			Poll::Pending => return Poll::Pending,
		}
		let msg = Message::Binary(buf.to_vec().into());
		match Pin::new(&mut self.inner).start_send(msg) {
			Ok(()) => Poll::Ready(Ok(buf.len())),
			Err(e) => Poll::Ready(Err(std::io::Error::other(e))),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		use futures::Sink;
		Pin::new(&mut self.inner).poll_flush(cx).map_err(std::io::Error::other)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		use futures::Sink;
		Pin::new(&mut self.inner).poll_close(cx).map_err(std::io::Error::other)
	}
}

/// Dials a plain or TLS-wrapped WebSocket and returns the adapted stream.
pub async fn dial(url: &str) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
	Ok(WsStream::new(ws))
}
