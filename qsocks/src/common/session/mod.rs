// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Pooled multiplexed sessions leasing a bounded number of streams each
//!
//! A single driver task per pool keeps one session in service at a time. Each session grants up
//! to `max_streams_per_session` stream leases, then drains in the background and is closed once
//! its last lease is released, while the driver dials its replacement.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::{
  common::{
    connector::ConnectRequest,
    protocol::header::{self, DestinationHeader},
    transport::{LeaseCounter, LeasedStream, Transport},
    BrokerError,
  },
  util::{cancellation::CancelContext, tunnel_stream::WrappedStream},
};

mod quinn_session;

pub use quinn_session::{QuinnDialer, QuinnDialerConfig, QuinnSession};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionId").field(&self.0).finish()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub struct MonotonicSessionIds {
  next: std::sync::atomic::AtomicU64,
}

impl MonotonicSessionIds {
  pub fn new(next: u64) -> Self {
    Self {
      next: std::sync::atomic::AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SessionId {
    SessionId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

/// One connection capable of carrying many independent bidirectional streams
pub trait MultiplexedSession: Send + Sync + 'static {
  fn open_stream(&self) -> BoxFuture<'static, Result<WrappedStream, BrokerError>>;

  /// Closes the session and every stream still open on it
  fn close(&self, reason: &str);

  fn remote(&self) -> String;
}

pub trait SessionDialer: Send + Sync + 'static {
  fn dial(&self, remote: &str) -> BoxFuture<'static, Result<Arc<dyn MultiplexedSession>, BrokerError>>;
}

#[derive(Clone, Debug)]
pub struct SessionPoolConfig {
  /// Remotes tried in round-robin order whenever a dial fails
  pub remotes: Vec<String>,
  pub max_streams_per_session: usize,
  pub redial_delay: Duration,
}

impl Default for SessionPoolConfig {
  fn default() -> Self {
    Self {
      remotes: Vec::new(),
      max_streams_per_session: 5,
      redial_delay: Duration::from_secs(1),
    }
  }
}

/// Handle for submitting requests to a running pool; cheap to clone
#[derive(Clone)]
pub struct SessionPool {
  requests: mpsc::UnboundedSender<ConnectRequest>,
  root: CancelContext,
}

impl std::fmt::Debug for SessionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionPool")
      .field("root", &self.root)
      .finish_non_exhaustive()
  }
}

impl SessionPool {
  /// Starts the pool driver under a fork of `parent`
  ///
  /// Canceling `parent` (or calling [SessionPool::close]) closes every session and fails every
  /// queued request with [BrokerError::PoolClosed].
  ///
  /// A `max_streams_per_session` of zero is raised to one; every session must grant a lease.
  pub fn spawn(
    parent: &CancelContext,
    dialer: Arc<dyn SessionDialer>,
    mut config: SessionPoolConfig,
  ) -> Self {
    if config.max_streams_per_session == 0 {
      tracing::warn!("max_streams_per_session of 0 would never serve a request; using 1");
      config.max_streams_per_session = 1;
    }
    let root = parent.fork();
    let (sender, receiver) = mpsc::unbounded_channel();
    let span = tracing::info_span!("session_pool", remotes = ?config.remotes);
    let driver = PoolDriver {
      root: root.clone(),
      dialer,
      config,
      requests: receiver,
      carried: None,
      next_remote: 0,
      ids: MonotonicSessionIds::new(1),
    };
    tokio::spawn(driver.run().instrument(span));
    Self {
      requests: sender,
      root,
    }
  }

  /// Queues a request; a closed pool hands the request back
  pub fn submit(&self, request: ConnectRequest) -> Result<(), ConnectRequest> {
    if self.root.is_canceled() {
      return Err(request);
    }
    self.requests.send(request).map_err(|rejected| rejected.0)
  }

  pub fn context(&self) -> &CancelContext {
    &self.root
  }

  pub fn close(&self) {
    self.root.cancel_with(BrokerError::PoolClosed);
  }
}

enum GrantOutcome {
  Granted,
  /// The request failed on its own account and has been canceled
  Rejected,
  /// The session could not serve the request, which must be retried elsewhere
  SessionBroken(ConnectRequest, BrokerError),
}

struct PoolDriver {
  root: CancelContext,
  dialer: Arc<dyn SessionDialer>,
  config: SessionPoolConfig,
  requests: mpsc::UnboundedReceiver<ConnectRequest>,
  carried: Option<ConnectRequest>,
  next_remote: usize,
  ids: MonotonicSessionIds,
}

impl PoolDriver {
  async fn run(mut self) {
    if self.config.remotes.is_empty() {
      tracing::warn!("session pool has no remotes configured");
    } else {
      while let Some(session) = self.dial().await {
        if !self.serve(session).await {
          break;
        }
      }
    }
    self.shutdown();
  }

  /// Dials until a session is established or the pool is canceled
  async fn dial(&mut self) -> Option<(SessionId, Arc<dyn MultiplexedSession>)> {
    loop {
      let remote = &self.config.remotes[self.next_remote % self.config.remotes.len()];
      tracing::debug!(remote = %remote, "dialing session");
      match self
        .root
        .run_until_canceled(self.dialer.dial(remote))
        .await?
      {
        Ok(session) => {
          let id = self.ids.next();
          tracing::info!(session = %id, remote = %session.remote(), "session established");
          return Some((id, session));
        }
        Err(e) => {
          tracing::warn!(remote = %remote, error = %e, "session dial failed");
          self.next_remote = self.next_remote.wrapping_add(1);
          self
            .root
            .run_until_canceled(tokio::time::sleep(self.config.redial_delay))
            .await?;
        }
      }
    }
  }

  /// Serves requests from one session until its quota is spent or it breaks
  ///
  /// Returns `false` once the pool is shutting down.
  async fn serve(&mut self, (id, session): (SessionId, Arc<dyn MultiplexedSession>)) -> bool {
    let session_ctx = self.root.fork();
    session_ctx.on_cancel({
      let session = Arc::clone(&session);
      move |reason| {
        if reason.is_canceled() {
          tracing::info!(session = %id, "session drained; closing");
          session.close("drained");
        } else {
          tracing::info!(session = %id, reason = %reason, "closing session");
          session.close(&reason.to_string());
        }
      }
    });
    let counter = LeaseCounter::new();
    let mut granted = 0;
    let mut open = true;
    while granted < self.config.max_streams_per_session && !session_ctx.is_canceled() {
      let request = match self.next_request().await {
        Some(request) => request,
        None => {
          open = false;
          break;
        }
      };
      if request.context.is_canceled() {
        tracing::trace!(destination = %request.destination, "skipping request that already ended");
        continue;
      }
      match Self::grant(id, &session, &session_ctx, &counter, request).await {
        GrantOutcome::Granted => granted += 1,
        GrantOutcome::Rejected => {}
        GrantOutcome::SessionBroken(request, e) => {
          tracing::warn!(session = %id, error = %e, "stream open failed; retiring session");
          session_ctx.cancel_with(e);
          self.carried = Some(request);
        }
      }
    }

    let drain = async move {
      tokio::select! {
        _ = counter.wait_idle() => {
          session_ctx.cancel();
        }
        _ = session_ctx.done() => {}
      }
    };
    tokio::spawn(drain.instrument(tracing::debug_span!("drain", session = %id)));
    open
  }

  async fn next_request(&mut self) -> Option<ConnectRequest> {
    if let Some(request) = self.carried.take() {
      return Some(request);
    }
    tokio::select! {
      biased;
      _ = self.root.done() => None,
      request = self.requests.recv() => request,
    }
  }

  async fn grant(
    id: SessionId,
    session: &Arc<dyn MultiplexedSession>,
    session_ctx: &CancelContext,
    counter: &Arc<LeaseCounter>,
    request: ConnectRequest,
  ) -> GrantOutcome {
    let frame = match DestinationHeader::connect(request.destination.clone()).encode() {
      Ok(frame) => frame,
      Err(e) => {
        request.context.cancel_with(e);
        return GrantOutcome::Rejected;
      }
    };
    let opened = async {
      use tokio::io::AsyncWriteExt;
      let mut stream = session.open_stream().await?;
      stream.write_all(&frame).await?;
      stream.flush().await?;
      Ok::<_, BrokerError>(stream)
    };
    let mut stream = match session_ctx.run_until_canceled(opened).await {
      Some(Ok(stream)) => stream,
      Some(Err(e)) => return GrantOutcome::SessionBroken(request, e),
      None => {
        let reason = session_ctx.err().unwrap_or(BrokerError::Canceled);
        return GrantOutcome::SessionBroken(request, reason);
      }
    };

    let lease = counter.acquire();
    let ConnectRequest {
      context,
      destination,
      ready,
    } = request;
    context.cleanup({
      let lease = Arc::clone(&lease);
      move || {
        lease.release();
      }
    });
    let span = tracing::debug_span!("lease", session = %id, destination = %destination);
    tokio::spawn(
      async move {
        let status = context
          .run_until_canceled(header::read_status(&mut stream))
          .await;
        match status {
          None => tracing::trace!("request ended before the server answered"),
          Some(Err(e)) => {
            tracing::debug!(error = %e, "server refused stream");
            context.cancel_with(e);
          }
          Some(Ok(())) => {
            if !ready.push(Transport::MultiplexedStream(LeasedStream::new(
              stream, lease, id,
            ))) {
              tracing::trace!("stream refused by the race; dropped");
            }
          }
        }
      }
      .instrument(span),
    );
    GrantOutcome::Granted
  }

  fn shutdown(&mut self) {
    self.root.cancel_with(BrokerError::PoolClosed);
    self.requests.close();
    let mut failed = 0;
    if let Some(request) = self.carried.take() {
      request.context.cancel_with(BrokerError::PoolClosed);
      failed += 1;
    }
    while let Ok(request) = self.requests.try_recv() {
      request.context.cancel_with(BrokerError::PoolClosed);
      failed += 1;
    }
    tracing::info!(failed, "session pool closed");
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc, Mutex,
    },
    time::Duration,
  };

  use futures::{future::BoxFuture, FutureExt};
  use tokio::{io::AsyncReadExt, sync::mpsc};

  use super::{MultiplexedSession, SessionDialer, SessionId, SessionPool, SessionPoolConfig};
  use crate::{
    common::{
      connector::{ConnectRequest, PushReady},
      protocol::{
        header::{self, DestinationHeader, OpenStatus},
        Destination,
      },
      transport::Transport,
      BrokerError,
    },
    util::{self, cancellation::CancelContext, tunnel_stream::WrappedStream},
  };

  struct FakeSession {
    remote: String,
    fail_opens: bool,
    closed: AtomicBool,
  }

  impl MultiplexedSession for FakeSession {
    fn open_stream(&self) -> BoxFuture<'static, Result<WrappedStream, BrokerError>> {
      if self.fail_opens || self.closed.load(Ordering::SeqCst) {
        return futures::future::ready(Err(BrokerError::protocol("stream limit reached"))).boxed();
      }
      let (near, mut far) = WrappedStream::duplex(4096);
      tokio::spawn(async move {
        if DestinationHeader::read_from(&mut far).await.is_ok() {
          let _ = header::write_status(&mut far, OpenStatus::Connected).await;
          let mut sink = Vec::new();
          let _ = far.read_to_end(&mut sink).await;
        }
      });
      futures::future::ready(Ok(near)).boxed()
    }

    fn close(&self, _reason: &str) {
      self.closed.store(true, Ordering::SeqCst);
    }

    fn remote(&self) -> String {
      self.remote.clone()
    }
  }

  /// Hands out sessions from a script; once the script is exhausted, healthy sessions
  #[derive(Default)]
  struct FakeDialer {
    script: Mutex<VecDeque<Result<bool, ()>>>,
    dialed: Mutex<Vec<Arc<FakeSession>>>,
    attempts: Mutex<Vec<String>>,
  }

  impl FakeDialer {
    fn scripted(script: impl IntoIterator<Item = Result<bool, ()>>) -> Arc<Self> {
      Arc::new(Self {
        script: Mutex::new(script.into_iter().collect()),
        dialed: Mutex::default(),
        attempts: Mutex::default(),
      })
    }

    fn session(&self, index: usize) -> Arc<FakeSession> {
      self.dialed.lock().unwrap()[index].clone()
    }
  }

  impl SessionDialer for FakeDialer {
    fn dial(
      &self,
      remote: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn MultiplexedSession>, BrokerError>> {
      self.attempts.lock().unwrap().push(remote.to_string());
      let step = self.script.lock().unwrap().pop_front().unwrap_or(Ok(false));
      let result = match step {
        Err(()) => Err(BrokerError::dial(
          remote,
          std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted failure"),
        )),
        Ok(fail_opens) => {
          let session = Arc::new(FakeSession {
            remote: remote.to_string(),
            fail_opens,
            closed: AtomicBool::new(false),
          });
          self.dialed.lock().unwrap().push(session.clone());
          Ok(session as Arc<dyn MultiplexedSession>)
        }
      };
      futures::future::ready(result).boxed()
    }
  }

  fn config(max_streams_per_session: usize) -> SessionPoolConfig {
    SessionPoolConfig {
      remotes: vec!["10.0.0.1:10086".into()],
      max_streams_per_session,
      redial_delay: Duration::from_millis(10),
    }
  }

  fn request(
    index: usize,
    pushed: &mpsc::UnboundedSender<(usize, Transport)>,
  ) -> (CancelContext, ConnectRequest) {
    let context = CancelContext::new();
    let pushed = pushed.clone();
    let request = ConnectRequest {
      context: context.clone(),
      destination: Destination::new("127.0.0.1", 9001),
      ready: PushReady::new(move |transport| pushed.send((index, transport)).is_ok()),
    };
    (context, request)
  }

  fn session_of(transport: &Transport) -> SessionId {
    match transport {
      Transport::MultiplexedStream(leased) => leased.session(),
      Transport::RawSocket(_) => panic!("Pool must only push multiplexed streams"),
    }
  }

  async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("Condition must hold eventually");
  }

  #[tokio::test]
  async fn quota_moves_extra_requests_to_a_new_session() {
    util::init_test_logging();
    let root = CancelContext::new();
    let dialer = FakeDialer::scripted(Vec::<Result<bool, ()>>::new());
    let pool = SessionPool::spawn(&root, dialer.clone(), config(3));
    let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();

    let mut contexts = Vec::new();
    for index in 0..4 {
      let (context, request) = request(index, &pushed_tx);
      contexts.push(context);
      pool.submit(request).unwrap();
    }

    let mut by_request = std::collections::BTreeMap::new();
    for _ in 0..4 {
      let (index, transport) = tokio::time::timeout(Duration::from_secs(5), pushed_rx.recv())
        .await
        .expect("Every request must be served")
        .unwrap();
      by_request.insert(index, transport);
    }
    let first = session_of(&by_request[&0]);
    assert_eq!(session_of(&by_request[&1]), first);
    assert_eq!(session_of(&by_request[&2]), first);
    assert_ne!(session_of(&by_request[&3]), first);

    // The first session stays open until its last lease is returned
    let first_session = dialer.session(0);
    by_request.remove(&0);
    by_request.remove(&1);
    contexts[0].cancel();
    contexts[1].cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!first_session.closed.load(Ordering::SeqCst));
    contexts[2].cancel();
    eventually(|| first_session.closed.load(Ordering::SeqCst)).await;
    assert!(!dialer.session(1).closed.load(Ordering::SeqCst));
    root.cancel();
  }

  #[tokio::test]
  async fn failed_stream_open_redelivers_request() {
    util::init_test_logging();
    let root = CancelContext::new();
    let dialer = FakeDialer::scripted([Ok(true), Err(()), Ok(false)]);
    let pool = SessionPool::spawn(&root, dialer.clone(), config(5));
    let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();
    let (context, request) = request(0, &pushed_tx);
    pool.submit(request).unwrap();

    let (index, transport) = tokio::time::timeout(Duration::from_secs(5), pushed_rx.recv())
      .await
      .expect("Request must be carried to a healthy session")
      .unwrap();
    assert_eq!(index, 0);
    assert!(transport.is_multiplexed());
    assert!(!context.is_canceled());
    assert!(dialer.session(0).closed.load(Ordering::SeqCst));
    assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
    root.cancel();
  }

  #[tokio::test]
  async fn shutdown_fails_pending_requests() {
    util::init_test_logging();
    let root = CancelContext::new();
    let dialer = FakeDialer::scripted(std::iter::repeat(Err::<bool, ()>(())).take(10_000));
    let pool = SessionPool::spawn(&root, dialer, config(5));
    let (pushed_tx, _pushed_rx) = mpsc::unbounded_channel();
    let (first, request_a) = request(0, &pushed_tx);
    let (second, request_b) = request(1, &pushed_tx);
    pool.submit(request_a).unwrap();
    pool.submit(request_b).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    root.cancel();
    eventually(|| first.is_canceled() && second.is_canceled()).await;
    assert!(matches!(first.err(), Some(BrokerError::PoolClosed)));
    assert!(matches!(second.err(), Some(BrokerError::PoolClosed)));

    let (late, request_c) = request(2, &pushed_tx);
    let rejected = pool.submit(request_c).unwrap_err();
    assert!(!late.is_canceled());
    drop(rejected);
  }

  #[tokio::test]
  async fn zero_quota_still_grants_one_stream_per_session() {
    util::init_test_logging();
    let root = CancelContext::new();
    let dialer = FakeDialer::scripted(Vec::<Result<bool, ()>>::new());
    let pool = SessionPool::spawn(&root, dialer.clone(), config(0));
    let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();
    let (_first, request_a) = request(0, &pushed_tx);
    let (_second, request_b) = request(1, &pushed_tx);
    pool.submit(request_a).unwrap();
    pool.submit(request_b).unwrap();

    let mut sessions = Vec::new();
    for _ in 0..2 {
      let (_, transport) = tokio::time::timeout(Duration::from_secs(5), pushed_rx.recv())
        .await
        .expect("A zero quota must still serve requests")
        .unwrap();
      sessions.push(session_of(&transport));
    }
    assert_ne!(sessions[0], sessions[1]);
    root.cancel();
  }

  #[tokio::test]
  async fn failed_dial_rotates_through_remotes() {
    util::init_test_logging();
    let root = CancelContext::new();
    let dialer = FakeDialer::scripted([Err(()), Ok(false), Err(()), Ok(false)]);
    let pool = SessionPool::spawn(
      &root,
      dialer.clone(),
      SessionPoolConfig {
        remotes: vec!["a:1".into(), "b:2".into()],
        max_streams_per_session: 1,
        redial_delay: Duration::from_millis(10),
      },
    );
    let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel();

    // "a" refuses, so "b" serves the first request
    let (_first, request_a) = request(0, &pushed_tx);
    pool.submit(request_a).unwrap();
    let (_, first) = tokio::time::timeout(Duration::from_secs(5), pushed_rx.recv())
      .await
      .expect("The second remote must serve the request")
      .unwrap();
    assert!(first.is_multiplexed());
    assert_eq!(dialer.session(0).remote(), "b:2");

    // "b" is kept until it fails; then the rotation wraps back to "a"
    let (_second, request_b) = request(1, &pushed_tx);
    pool.submit(request_b).unwrap();
    let (_, second) = tokio::time::timeout(Duration::from_secs(5), pushed_rx.recv())
      .await
      .expect("The wrapped-around remote must serve the request")
      .unwrap();
    assert!(second.is_multiplexed());
    assert_eq!(dialer.session(1).remote(), "a:1");
    assert_eq!(
      dialer.attempts.lock().unwrap()[..4],
      ["a:1", "b:2", "b:2", "a:1"]
    );
    root.cancel();
  }
}
