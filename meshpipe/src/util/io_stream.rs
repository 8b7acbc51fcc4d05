// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use super::counter::Metered;

/// Default buffer capacity for in-memory pass-through streams.
const PASS_THROUGH_CAPACITY: usize = 64 * 1024;

/// A duplex stream abstracting over a transport connection, allowing use of
/// memory streams, TCP sockets, and connected datagram sockets behind one type.
pub enum WrappedStream {
  Tcp(TcpStream),
  Duplex(DuplexStream),
  Datagram(DatagramStream),
  Metered(Box<Metered<WrappedStream>>),
  Boxed(
    Box<dyn AsyncRead + Send + Unpin + 'static>,
    Box<dyn AsyncWrite + Send + Unpin + 'static>,
  ),
}

impl WrappedStream {
  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  /// A stream that yields back whatever is written into it, in order.
  ///
  /// This is the transport of synthetic clusters: piped in as a chain stage it
  /// acts as a pass-through, piped in as the destination it echoes the
  /// session's traffic back into the egress direction.
  pub fn pass_through() -> WrappedStream {
    let (a, b) = tokio::io::duplex(PASS_THROUGH_CAPACITY);
    let (read_b, _) = tokio::io::split(b);
    let (_, write_a) = tokio::io::split(a);
    WrappedStream::Boxed(Box::new(read_b), Box::new(write_a))
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self {
      WrappedStream::Tcp(_) => "Tcp",
      WrappedStream::Duplex(_) => "Duplex",
      WrappedStream::Datagram(_) => "Datagram",
      WrappedStream::Metered(_) => "Metered",
      WrappedStream::Boxed(..) => "Boxed",
    };
    f.debug_tuple("WrappedStream").field(&kind).finish()
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(stream: DuplexStream) -> WrappedStream {
    WrappedStream::Duplex(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> WrappedStream {
    WrappedStream::Tcp(stream)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Duplex(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Datagram(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Metered(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      WrappedStream::Boxed(ref mut s, _) => AsyncRead::poll_read(Pin::new(&mut *s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Datagram(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Metered(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_write(Pin::new(&mut *s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Datagram(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Metered(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut *s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Datagram(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Metered(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut *s), cx),
    }
  }
}

/// Connected-UDP transport adapted to the stream interface.
///
/// One datagram per read or write call; datagram boundaries survive the trip
/// through a pump because each pump write forwards exactly one read's worth.
pub struct DatagramStream {
  socket: Arc<UdpSocket>,
}

impl DatagramStream {
  pub fn new(socket: UdpSocket) -> Self {
    Self {
      socket: Arc::new(socket),
    }
  }
}

impl AsyncRead for DatagramStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    self.socket.poll_recv(cx, buf)
  }
}

impl AsyncWrite for DatagramStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    self.socket.poll_send(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    Poll::Ready(Ok(()))
  }
}
