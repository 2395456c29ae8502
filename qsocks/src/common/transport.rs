// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Transports handed from a winning connector back to the proxy frontend

use std::{
  io::Error as IOError,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  sync::Notify,
};

use crate::{common::session::SessionId, util::tunnel_stream::WrappedStream};

/// Counts the outstanding stream leases of one multiplexed session
#[derive(Debug, Default)]
pub struct LeaseCounter {
  active: AtomicUsize,
  idle: Notify,
}

impl LeaseCounter {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn acquire(self: &Arc<Self>) -> Arc<Lease> {
    self.active.fetch_add(1, Ordering::AcqRel);
    Arc::new(Lease {
      released: AtomicBool::new(false),
      counter: Arc::clone(self),
    })
  }

  pub fn active(&self) -> usize {
    self.active.load(Ordering::Acquire)
  }

  /// Resolves once no lease is outstanding
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      if self.active() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// One stream's claim on its session; released exactly once
#[derive(Debug)]
pub struct Lease {
  released: AtomicBool,
  counter: Arc<LeaseCounter>,
}

impl Lease {
  /// Returns `true` if this call performed the release
  pub fn release(&self) -> bool {
    if self.released.swap(true, Ordering::AcqRel) {
      return false;
    }
    if self.counter.active.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.counter.idle.notify_one();
    }
    true
  }

  pub fn is_released(&self) -> bool {
    self.released.load(Ordering::Acquire)
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    self.release();
  }
}

/// A logical stream of a multiplexed session, holding its lease until dropped
pub struct LeasedStream {
  stream: WrappedStream,
  lease: Arc<Lease>,
  session: SessionId,
}

impl LeasedStream {
  pub fn new(stream: WrappedStream, lease: Arc<Lease>, session: SessionId) -> Self {
    Self {
      stream,
      lease,
      session,
    }
  }

  pub fn session(&self) -> SessionId {
    self.session
  }
}

impl Drop for LeasedStream {
  fn drop(&mut self) {
    self.lease.release();
  }
}

impl std::fmt::Debug for LeasedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeasedStream")
      .field("session", &self.session)
      .field("stream", &self.stream)
      .finish_non_exhaustive()
  }
}

/// An established path to a destination
#[derive(Debug)]
pub enum Transport {
  RawSocket(WrappedStream),
  MultiplexedStream(LeasedStream),
}

impl Transport {
  pub fn is_multiplexed(&self) -> bool {
    matches!(self, Transport::MultiplexedStream(_))
  }
}

impl From<WrappedStream> for Transport {
  fn from(stream: WrappedStream) -> Self {
    Transport::RawSocket(stream)
  }
}

impl From<LeasedStream> for Transport {
  fn from(stream: LeasedStream) -> Self {
    Transport::MultiplexedStream(stream)
  }
}

impl AsyncRead for LeasedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    AsyncRead::poll_read(Pin::new(&mut self.get_mut().stream), cx, buf)
  }
}

impl AsyncWrite for LeasedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    AsyncWrite::poll_write(Pin::new(&mut self.get_mut().stream), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().stream), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().stream), cx)
  }
}

impl AsyncRead for Transport {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      Transport::RawSocket(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      Transport::MultiplexedStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for Transport {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      Transport::RawSocket(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      Transport::MultiplexedStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      Transport::RawSocket(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      Transport::MultiplexedStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      Transport::RawSocket(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      Transport::MultiplexedStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{LeaseCounter, LeasedStream, Transport};
  use crate::{common::session::SessionId, util::tunnel_stream::WrappedStream};

  #[tokio::test]
  async fn lease_releases_once_from_either_path() {
    let counter = LeaseCounter::new();
    let first = counter.acquire();
    let second = counter.acquire();
    assert_eq!(counter.active(), 2);
    assert!(first.release());
    assert!(!first.release());
    assert_eq!(counter.active(), 1);

    let (stream, _peer) = WrappedStream::duplex(16);
    let leased = LeasedStream::new(stream, second.clone(), SessionId::new(1));
    let waiter = tokio::spawn({
      let counter = counter.clone();
      async move { counter.wait_idle().await }
    });
    drop(leased);
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("Dropping the last leased stream must wake the drain")
      .unwrap();
    assert!(second.is_released());
    assert!(!second.release());
    assert_eq!(counter.active(), 0);
  }

  #[tokio::test]
  async fn transport_forwards_io_to_inner_stream() {
    let counter = LeaseCounter::new();
    let (stream, mut peer) = WrappedStream::duplex(16);
    let mut transport: Transport =
      LeasedStream::new(stream, counter.acquire(), SessionId::new(7)).into();
    assert!(transport.is_multiplexed());
    transport.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
  }
}
