// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use futures::{future::BoxFuture, FutureExt};
use tokio::{io::BufReader, net::TcpStream};
use tracing_futures::Instrument;

use super::{ConnectRequest, Connector, ConnectorKind};
use crate::{
  common::{
    protocol::{http_tunnel, Destination},
    transport::Transport,
    BrokerError,
  },
  util::tunnel_stream::WrappedStream,
};

/// Reaches the destination through an HTTP tunnel gateway
#[derive(Debug, Clone)]
pub struct HttpTunnelConnector {
  gateway: String,
}

impl HttpTunnelConnector {
  pub fn new(gateway: impl Into<String>) -> Self {
    Self {
      gateway: gateway.into(),
    }
  }
}

async fn establish(gateway: &str, destination: &Destination) -> Result<WrappedStream, BrokerError> {
  let mut stream = TcpStream::connect(gateway)
    .await
    .map_err(|e| BrokerError::dial(gateway, e))?;
  let _ = stream.set_nodelay(true);
  http_tunnel::write_request(&mut stream, gateway, destination).await?;
  // Bytes following the response headers stay in the reader's buffer and belong to the tunnel
  let mut reader = BufReader::new(stream);
  http_tunnel::read_response(&mut reader).await?;
  Ok(WrappedStream::Buffered(reader))
}

impl Connector for HttpTunnelConnector {
  fn kind(&self) -> ConnectorKind {
    ConnectorKind::HttpTunnel
  }

  fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, ()> {
    let ConnectRequest {
      context,
      destination,
      ready,
    } = request;
    let gateway = self.gateway.clone();
    let span = tracing::debug_span!("http", gateway = %gateway, destination = %destination);
    async move {
      match context
        .run_until_canceled(establish(&gateway, &destination))
        .await
      {
        None => tracing::trace!("canceled during tunnel handshake"),
        Some(Err(e)) => {
          tracing::debug!(error = %e, "tunnel handshake failed");
          context.cancel_with(e);
        }
        Some(Ok(stream)) => {
          if !ready.push(Transport::RawSocket(stream)) {
            tracing::trace!("tunnel refused by the race; dropped");
          }
        }
      }
    }
    .instrument(span)
    .boxed()
  }
}
