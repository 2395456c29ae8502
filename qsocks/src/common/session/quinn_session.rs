// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use futures::{future::BoxFuture, FutureExt};

use super::{MultiplexedSession, SessionDialer};
use crate::{
  common::BrokerError,
  util::{tls, tunnel_stream::WrappedStream},
};

#[derive(Clone, Debug)]
pub struct QuinnDialerConfig {
  pub bind: SocketAddr,
  pub connect_timeout: Duration,
  pub keep_alive: Duration,
  pub idle_timeout: Duration,
}

impl Default for QuinnDialerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 0)),
      connect_timeout: Duration::from_secs(10),
      keep_alive: Duration::from_secs(5),
      idle_timeout: Duration::from_secs(30),
    }
  }
}

/// Dials QUIC sessions from a single client endpoint
pub struct QuinnDialer {
  endpoint: quinn::Endpoint,
  connect_timeout: Duration,
}

impl QuinnDialer {
  pub fn new(config: QuinnDialerConfig) -> Result<Self> {
    let client_config = tls::build_insecure_client_config(config.keep_alive, config.idle_timeout)?;
    let mut endpoint = quinn::Endpoint::client(config.bind)
      .with_context(|| format!("Failed to bind QUIC client endpoint at {}", config.bind))?;
    endpoint.set_default_client_config(client_config);
    Ok(Self {
      endpoint,
      connect_timeout: config.connect_timeout,
    })
  }
}

async fn resolve(remote: &str) -> Result<SocketAddr, BrokerError> {
  tokio::net::lookup_host(remote)
    .await
    .map_err(|e| BrokerError::dial(remote, e))?
    .next()
    .ok_or_else(|| {
      BrokerError::dial(
        remote,
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
      )
    })
}

impl SessionDialer for QuinnDialer {
  fn dial(
    &self,
    remote: &str,
  ) -> BoxFuture<'static, Result<Arc<dyn MultiplexedSession>, BrokerError>> {
    let endpoint = self.endpoint.clone();
    let connect_timeout = self.connect_timeout;
    let remote = remote.to_string();
    async move {
      let addr = resolve(&remote).await?;
      let connecting = endpoint
        .connect(addr, tls::SESSION_SERVER_NAME)
        .map_err(BrokerError::session)?;
      let connection = tokio::time::timeout(connect_timeout, connecting)
        .await
        .map_err(|_| {
          BrokerError::dial(
            remote.as_str(),
            std::io::Error::new(std::io::ErrorKind::TimedOut, "QUIC handshake timed out"),
          )
        })?
        .map_err(BrokerError::session)?;
      tracing::debug!(remote = ?connection.remote_address(), "QUIC handshake complete");
      Ok(Arc::new(QuinnSession::new(connection, remote)) as Arc<dyn MultiplexedSession>)
    }
    .boxed()
  }
}

pub struct QuinnSession {
  connection: quinn::Connection,
  remote: String,
}

impl QuinnSession {
  pub fn new(connection: quinn::Connection, remote: impl Into<String>) -> Self {
    Self {
      connection,
      remote: remote.into(),
    }
  }
}

impl MultiplexedSession for QuinnSession {
  fn open_stream(&self) -> BoxFuture<'static, Result<WrappedStream, BrokerError>> {
    let connection = self.connection.clone();
    async move {
      let (send, recv) = connection.open_bi().await.map_err(BrokerError::session)?;
      Ok(WrappedStream::from((send, recv)))
    }
    .boxed()
  }

  fn close(&self, reason: &str) {
    self
      .connection
      .close(quinn::VarInt::from_u32(0), reason.as_bytes());
  }

  fn remote(&self) -> String {
    self.remote.clone()
  }
}
