// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A duplex byte stream over any of the upstream kinds, allowing memory streams in tests
pub enum WrappedStream {
  Tcp(TcpStream),
  /// A TCP connection whose handshake was read through a buffer that may hold payload bytes
  Buffered(BufReader<TcpStream>),
  Quinn(quinn::SendStream, quinn::RecvStream),
  DuplexStream(DuplexStream),
}

impl WrappedStream {
  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn kind(&self) -> &'static str {
    match self {
      WrappedStream::Tcp(_) => "tcp",
      WrappedStream::Buffered(_) => "buffered-tcp",
      WrappedStream::Quinn(..) => "quinn",
      WrappedStream::DuplexStream(_) => "duplex",
    }
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(stream: DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> Self {
    WrappedStream::Tcp(stream)
  }
}

impl From<(quinn::SendStream, quinn::RecvStream)> for WrappedStream {
  fn from((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
    WrappedStream::Quinn(send, recv)
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("WrappedStream").field(&self.kind()).finish()
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
      WrappedStream::Buffered(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Quinn(_, ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
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
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Quinn(ref mut s, _) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Quinn(ref mut s, _) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Quinn(ref mut s, _) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}
