// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use futures::{future::BoxFuture, FutureExt};
use tracing_futures::Instrument;

use super::{ConnectRequest, Connector, ConnectorKind};
use crate::common::{session::SessionPool, BrokerError};

/// Leases a stream from a pool of multiplexed sessions
#[derive(Debug, Clone)]
pub struct SessionConnector {
  pool: SessionPool,
}

impl SessionConnector {
  pub fn new(pool: SessionPool) -> Self {
    Self { pool }
  }
}

impl Connector for SessionConnector {
  fn kind(&self) -> ConnectorKind {
    ConnectorKind::Session
  }

  fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, ()> {
    let pool = self.pool.clone();
    let span = tracing::debug_span!("session", destination = %request.destination);
    async move {
      let context = request.context.clone();
      if let Err(rejected) = pool.submit(request) {
        tracing::debug!("session pool already closed");
        rejected.context.cancel_with(BrokerError::PoolClosed);
        return;
      }
      // The pool answers through the request; only a dead pool needs reporting here
      tokio::select! {
        biased;
        _ = context.done() => {}
        _ = pool.context().done() => {
          context.cancel_with(BrokerError::PoolClosed);
        }
      }
    }
    .instrument(span)
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use futures::{future::BoxFuture, FutureExt};

  use super::SessionConnector;
  use crate::{
    common::{
      connector::{ConnectRequest, Connector, PushReady},
      protocol::Destination,
      session::{MultiplexedSession, SessionDialer, SessionPool, SessionPoolConfig},
      BrokerError,
    },
    util::cancellation::CancelContext,
  };

  struct Unreachable;

  impl SessionDialer for Unreachable {
    fn dial(
      &self,
      remote: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn MultiplexedSession>, BrokerError>> {
      let error = BrokerError::dial(
        remote,
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"),
      );
      futures::future::ready(Err(error)).boxed()
    }
  }

  #[tokio::test]
  async fn closed_pool_fails_request() {
    let root = CancelContext::new();
    let pool = SessionPool::spawn(
      &root,
      Arc::new(Unreachable),
      SessionPoolConfig {
        remotes: vec!["127.0.0.1:1".into()],
        ..SessionPoolConfig::default()
      },
    );
    let connector = SessionConnector::new(pool.clone());
    let context = CancelContext::new();
    let attempt = tokio::spawn(connector.connect(ConnectRequest {
      context: context.clone(),
      destination: Destination::new("127.0.0.1", 9001),
      ready: PushReady::new(|_| panic!("An unreachable pool must not push")),
    }));
    pool.close();
    tokio::time::timeout(std::time::Duration::from_secs(5), attempt)
      .await
      .expect("Connector must finish once its pool closes")
      .unwrap();
    assert!(matches!(context.err(), Some(BrokerError::PoolClosed)));

    // Submitting to an already-closed pool fails immediately
    let late = CancelContext::new();
    connector
      .connect(ConnectRequest {
        context: late.clone(),
        destination: Destination::new("127.0.0.1", 9001),
        ready: PushReady::new(|_| panic!("A closed pool must not push")),
      })
      .await;
    assert!(matches!(late.err(), Some(BrokerError::PoolClosed)));
  }
}
