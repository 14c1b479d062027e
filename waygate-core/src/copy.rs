//! Bidirectional stream copy with adaptive buffer sizing and byte accounting.
//!
//! Every forwarded flow — regardless of which `Strategy` dialed the upstream —
//! is copied through [`copy_bidirectional`], so uplink/downlink byte counts
//! and half-close behavior are identical across strategies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pin_project_lite::pin_project;
use std::future::Future;
use std::io::IoSlice;
use std::marker::PhantomPinned;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

/// Splits a duplex stream into a buffered reader half and a writer half.
pub trait BufferedSplitter: Unpin {
	type R: ResizeBufRead + Unpin;
	type W: AsyncWriteBuf + Unpin;
	fn split_into_buffered_reader(self) -> (Self::R, Self::W);
}

impl<I> BufferedSplitter for I
where
	I: AsyncRead + AsyncWrite + Unpin,
{
	type R = BufReader<io::ReadHalf<I>>;
	type W = WriteAdapter<io::WriteHalf<I>>;
	fn split_into_buffered_reader(self) -> (Self::R, Self::W) {
		let (rh, wh) = tokio::io::split(self);
		let rb = BufReader::new(rh);
		(rb, WriteAdapter(wh))
	}
}

/// A specialized splitter for `TcpStream` avoiding the lock overhead of the
/// generic [`tokio::io::split`].
pub struct TcpStreamSplitter(pub TcpStream);

impl BufferedSplitter for TcpStreamSplitter {
	type R = BufReader<OwnedReadHalf>;
	type W = WriteAdapter<OwnedWriteHalf>;

	fn split_into_buffered_reader(self) -> (Self::R, Self::W) {
		let (rh, wh) = self.0.into_split();
		let rb = BufReader::new(rh);
		(rb, WriteAdapter(wh))
	}
}

/// Like `AsyncWrite`, but writes a `Bytes` instead of `&[u8]` to avoid copies.
pub trait AsyncWriteBuf {
	fn poll_write_buf(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: Bytes,
	) -> Poll<std::io::Result<usize>>;
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>>;
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>>;
}

impl<T: ?Sized + AsyncWriteBuf + Unpin> AsyncWriteBuf for &mut T {
	fn poll_write_buf(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: Bytes,
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut **self).poll_write_buf(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut **self).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut **self).poll_shutdown(cx)
	}
}

/// Adapts any `AsyncWrite` into [`AsyncWriteBuf`].
pub struct WriteAdapter<T>(T);

impl<T: AsyncWrite + Unpin> AsyncWriteBuf for WriteAdapter<T> {
	fn poll_write_buf(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		mut buf: Bytes,
	) -> Poll<std::io::Result<usize>> {
		poll_write_buf(Pin::new(&mut self.0), cx, &mut buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.0).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.0).poll_shutdown(cx)
	}
}

/// Like `AsyncBufRead`, but allows the caller to trigger a buffer resize.
pub trait ResizeBufRead {
	fn poll_bytes(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<Bytes>>;
	fn resize(self: Pin<&mut Self>, new_size: usize);
}

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("failed to bind to address {0}: {1}")]
	Bind(SocketAddr, std::io::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("while closing connection: {0}")]
	ShutdownError(Box<CopyError>),

	#[error("destination disconnected before all data was written")]
	BackendDisconnected,
	#[error("receive: {0}")]
	ReceiveError(Box<CopyError>),

	#[error("client disconnected before all data was written")]
	ClientDisconnected,
	#[error("send: {0}")]
	SendError(Box<CopyError>),
}

// One 1k buffer per direction initially; bumped up as a flow proves itself
// long-lived. Two buffers per connection (uplink, downlink).
const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
const JUMBO_BUFFER_SIZE: usize = (16 * 16_384) - 64;
// After 128k on one direction, grow its buffer from INITIAL to LARGE.
const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
// After 10Mb, grow from LARGE to JUMBO.
const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

/// Atomic uplink/downlink byte counters for one flow.
///
/// Each direction is wrapped exactly once per flow lifetime (see spec's
/// "wrap-once-per-flow" counting rule) — the counters here are the
/// authoritative total, read by the health/metrics layer after the flow ends.
#[derive(Default)]
pub struct FlowCounters {
	uplink: AtomicU64,
	downlink: AtomicU64,
}

impl FlowCounters {
	pub fn new() -> Self {
		Self::default()
	}

	fn increment_send(&self, n: u64) {
		self.uplink.fetch_add(n, Ordering::Relaxed);
	}

	fn increment_recv(&self, n: u64) {
		self.downlink.fetch_add(n, Ordering::Relaxed);
	}

	pub fn uplink(&self) -> u64 {
		self.uplink.load(Ordering::Relaxed)
	}

	pub fn downlink(&self) -> u64 {
		self.downlink.load(Ordering::Relaxed)
	}
}

/// Copies `downstream <-> upstream` until either side closes, accounting
/// bytes into `counters`. Half-close is propagated in both directions
/// independently: a downstream EOF shuts down the upstream write half (and
/// vice versa) without waiting for the other direction to finish.
pub async fn copy_bidirectional<A, B>(
	downstream: A,
	upstream: B,
	counters: &FlowCounters,
) -> Result<(), CopyError>
where
	A: BufferedSplitter,
	B: BufferedSplitter,
{
	let (mut rd, mut wd) = downstream.split_into_buffered_reader();
	let (mut ru, mut wu) = upstream.split_into_buffered_reader();
	let downstream_to_upstream = async {
		let translate_error = |e: io::Error| {
			CopyError::SendError(Box::new(match e.kind() {
				io::ErrorKind::NotConnected => CopyError::BackendDisconnected,
				io::ErrorKind::WriteZero => CopyError::BackendDisconnected,
				io::ErrorKind::UnexpectedEof => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res = ignore_io_errors(copy_buf(&mut rd, &mut wu, counters, true).await)
			.map_err(translate_error);
		trace!(?res, "uplink copy done");
		ignore_shutdown_errors(shutdown(&mut wu).await)
			.map_err(translate_error)
			.map_err(|e| CopyError::ShutdownError(Box::new(e)))?;
		res
	};

	let upstream_to_downstream = async {
		let translate_error = |e: io::Error| {
			CopyError::ReceiveError(Box::new(match e.kind() {
				io::ErrorKind::NotConnected => CopyError::ClientDisconnected,
				io::ErrorKind::WriteZero => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res = ignore_io_errors(copy_buf(&mut ru, &mut wd, counters, false).await)
			.map_err(translate_error);
		trace!(?res, "downlink copy done");
		ignore_shutdown_errors(shutdown(&mut wd).await)
			.map_err(translate_error)
			.map_err(|e| CopyError::ShutdownError(Box::new(e)))?;
		res
	};

	// join!(), not try_join!(): a half finishing with an error should not
	// cut the other half short before it drains whatever it still has.
	let (sent, received) = tokio::join!(downstream_to_upstream, upstream_to_downstream);

	let sent = sent?;
	let received = received?;
	trace!(sent, received, "copy complete");
	Ok(())
}

/// A TCP connection can close at any time; prefer treating an abrupt close
/// as the end of the flow rather than surfacing it as an error the caller
/// needs to react to.
fn ignore_io_errors<T: Default>(res: Result<T, io::Error>) -> Result<T, io::Error> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(Default::default())
			},
			_ => res,
		},
		_ => res,
	}
}

/// The peer may already have disconnected by the time we shut our half down;
/// that is just them shutting down for us.
fn ignore_shutdown_errors(res: Result<(), io::Error>) -> Result<(), io::Error> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "failed to shut down peer, already shut down");
			Ok(())
		},
		_ => res,
	}
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
struct CopyBuf<'a, R: ?Sized, W: ?Sized> {
	send: bool,
	reader: &'a mut R,
	writer: &'a mut W,
	buf: Option<Bytes>,
	counters: &'a FlowCounters,
	amt: u64,
}

async fn copy_buf<'a, R, W>(
	reader: &'a mut R,
	writer: &'a mut W,
	counters: &FlowCounters,
	is_send: bool,
) -> std::io::Result<u64>
where
	R: ResizeBufRead + Unpin + ?Sized,
	W: AsyncWriteBuf + Unpin + ?Sized,
{
	CopyBuf {
		send: is_send,
		reader,
		writer,
		buf: None,
		counters,
		amt: 0,
	}
	.await
}

impl<R, W> Future for CopyBuf<'_, R, W>
where
	R: ResizeBufRead + Unpin + ?Sized,
	W: AsyncWriteBuf + Unpin + ?Sized,
{
	type Output = std::io::Result<u64>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		loop {
			let me = &mut *self;

			let buffer = if let Some(buffer) = me.buf.take() {
				buffer
			} else {
				ready!(Pin::new(&mut *me.reader).poll_bytes(cx))?
			};
			if buffer.is_empty() {
				ready!(AsyncWriteBuf::poll_flush(Pin::new(&mut self.writer), cx))?;
				return Poll::Ready(Ok(self.amt));
			}

			let mut our_copy = buffer.clone();
			let i = match Pin::new(&mut *me.writer).poll_write_buf(cx, buffer) {
				Poll::Ready(written) => written?,
				Poll::Pending => {
					me.buf = Some(our_copy);
					return Poll::Pending;
				},
			};
			if i == 0 {
				return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
			}
			if i < our_copy.len() {
				our_copy.advance(i);
				me.buf = Some(our_copy);
			}
			if me.send {
				me.counters.increment_send(i as u64);
			} else {
				me.counters.increment_recv(i as u64);
			}
			let old = self.amt;
			self.amt += i as u64;

			if old < RESIZE_THRESHOLD_LARGE && RESIZE_THRESHOLD_LARGE <= self.amt {
				Pin::new(&mut *self.reader).resize(LARGE_BUFFER_SIZE);
			}
			if old < RESIZE_THRESHOLD_JUMBO && RESIZE_THRESHOLD_JUMBO <= self.amt {
				Pin::new(&mut *self.reader).resize(JUMBO_BUFFER_SIZE);
			}
		}
	}
}

// Fork of tokio's `BufReader` with resize support.
pin_project! {
	pub struct BufReader<R> {
		#[pin]
		inner: R,
		buf: BytesMut,
		buffer_size: usize,
	}
}

impl<R: AsyncRead> BufReader<R> {
	pub fn new(inner: R) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
			buffer_size: INITIAL_BUFFER_SIZE,
		}
	}
}

impl<R: AsyncRead> ResizeBufRead for BufReader<R> {
	fn poll_bytes(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
		let me = self.project();
		me.buf.reserve(*me.buffer_size);
		ready!(poll_read_buf(me.inner, cx, me.buf))?;
		Poll::Ready(Ok(me.buf.split().freeze()))
	}

	fn resize(self: Pin<&mut Self>, new_size: usize) {
		let me = self.project();
		*me.buffer_size = new_size;
	}
}

pin_project! {
	#[must_use = "futures do nothing unless you `.await` or poll them"]
	struct Shutdown<'a, A: ?Sized> {
		a: &'a mut A,
		#[pin]
		_pin: PhantomPinned,
	}
}

fn shutdown<A>(a: &mut A) -> Shutdown<'_, A>
where
	A: AsyncWriteBuf + Unpin + ?Sized,
{
	Shutdown { a, _pin: PhantomPinned }
}

impl<A> Future for Shutdown<'_, A>
where
	A: AsyncWriteBuf + Unpin + ?Sized,
{
	type Output = std::io::Result<()>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let me = self.project();
		AsyncWriteBuf::poll_shutdown(Pin::new(me.a), cx)
	}
}

pub fn poll_write_buf<T: AsyncWrite + ?Sized, B: Buf>(
	io: Pin<&mut T>,
	cx: &mut Context<'_>,
	buf: &mut B,
) -> Poll<std::io::Result<usize>> {
	const MAX_BUFS: usize = 64;

	if !buf.has_remaining() {
		return Poll::Ready(Ok(0));
	}

	let n = if io.is_write_vectored() {
		let mut slices = [IoSlice::new(&[]); MAX_BUFS];
		let cnt = buf.chunks_vectored(&mut slices);
		ready!(io.poll_write_vectored(cx, &slices[..cnt]))?
	} else {
		ready!(io.poll_write(cx, buf.chunk()))?
	};

	buf.advance(n);

	Poll::Ready(Ok(n))
}

pub fn poll_read_buf<T: AsyncRead + ?Sized, B: BufMut>(
	io: Pin<&mut T>,
	cx: &mut Context<'_>,
	buf: &mut B,
) -> Poll<std::io::Result<usize>> {
	if !buf.has_remaining_mut() {
		return Poll::Ready(Ok(0));
	}

	let n = {
		let dst = buf.chunk_mut();
		// Safety: `chunk_mut()` returns `&mut UninitSlice`, a transparent wrapper
		// around `[MaybeUninit<u8>]`.
		let dst = unsafe { &mut *(dst as *mut _ as *mut [MaybeUninit<u8>]) };
		let mut buf = ReadBuf::uninit(dst);
		let ptr = buf.filled().as_ptr();
		ready!(io.poll_read(cx, &mut buf)?);
		assert_eq!(ptr, buf.filled().as_ptr());
		buf.filled().len()
	};

	unsafe {
		buf.advance_mut(n);
	}

	Poll::Ready(Ok(n))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	#[tokio::test]
	async fn copy_moves_bytes_both_ways_and_counts_them() {
		let (mut client_end, client_io) = duplex(64);
		let (mut server_end, server_io) = duplex(64);
		let counters = FlowCounters::new();

		let copy = tokio::spawn(async move { copy_bidirectional(client_io, server_io, &counters).await });

		client_end.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		server_end.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		server_end.write_all(b"world!").await.unwrap();
		let mut buf2 = [0u8; 6];
		client_end.read_exact(&mut buf2).await.unwrap();
		assert_eq!(&buf2, b"world!");

		drop(client_end);
		drop(server_end);
		copy.await.unwrap().unwrap();
	}
}
