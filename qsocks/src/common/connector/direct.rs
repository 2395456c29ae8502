// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use futures::{future::BoxFuture, FutureExt};
use tokio::net::TcpStream;
use tracing_futures::Instrument;

use super::{ConnectRequest, Connector, ConnectorKind};
use crate::common::{transport::Transport, BrokerError};

/// Dials the destination over plain TCP
#[derive(Debug, Default, Clone)]
pub struct DirectConnector;

impl DirectConnector {
  pub fn new() -> Self {
    Self
  }
}

impl Connector for DirectConnector {
  fn kind(&self) -> ConnectorKind {
    ConnectorKind::Direct
  }

  fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, ()> {
    let ConnectRequest {
      context,
      destination,
      ready,
    } = request;
    let span = tracing::debug_span!("direct", destination = %destination);
    async move {
      let target = (destination.host.as_str(), destination.port);
      match context.run_until_canceled(TcpStream::connect(target)).await {
        None => tracing::trace!("canceled before the dial completed"),
        Some(Err(e)) => {
          tracing::debug!(error = %e, "dial failed");
          context.cancel_with(BrokerError::dial(destination.to_string(), e));
        }
        Some(Ok(stream)) => {
          let _ = stream.set_nodelay(true);
          if !ready.push(Transport::RawSocket(stream.into())) {
            tracing::trace!("connection refused by the race; dropped");
          }
        }
      }
    }
    .instrument(span)
    .boxed()
  }
}
