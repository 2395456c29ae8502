// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use anyhow::{Context as AnyhowContext, Result};
use futures::StreamExt;
use tokio::{
  io::{AsyncWriteExt, BufReader},
  net::{TcpListener, TcpStream},
};
use tracing_futures::Instrument;

use crate::{
  common::{protocol::http_tunnel, BrokerError},
  util::{self, cancellation::CancelContext, tunnel_stream::WrappedStream},
};

/// Accepts HTTP tunnel handshakes and relays each connection to its requested destination
pub struct TunnelGateway {
  listener: TcpListener,
  root: CancelContext,
}

impl TunnelGateway {
  pub async fn bind(addr: SocketAddr, parent: &CancelContext) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind tunnel gateway at {}", addr))?;
    Ok(Self {
      listener,
      root: parent.fork(),
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub async fn run(self) {
    let Self { listener, root } = self;
    tracing::info!(addr = ?listener.local_addr().ok(), "tunnel gateway listening");
    tokio_stream::wrappers::TcpListenerStream::new(listener)
      .take_until(root.done())
      .for_each_concurrent(None, |accepted| {
        let root = root.clone();
        async move {
          match accepted {
            Ok(stream) => {
              let peer = stream.peer_addr().ok();
              let connection_ctx = root.fork();
              tokio::spawn(
                serve_connection(stream, connection_ctx)
                  .instrument(tracing::debug_span!("tunnel", peer = ?peer)),
              );
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
          }
        }
      })
      .await;
    tracing::info!("tunnel gateway stopped");
  }
}

async fn serve_connection(stream: TcpStream, connection_ctx: CancelContext) {
  let mut reader = BufReader::new(stream);
  let requested = match connection_ctx
    .run_until_canceled(http_tunnel::read_request(&mut reader))
    .await
  {
    None => return,
    Some(Err(e)) => {
      tracing::debug!(error = %e, "malformed tunnel request");
      let _ = reader
        .get_mut()
        .write_all(http_tunnel::RESPONSE_BAD_REQUEST)
        .await;
      connection_ctx.cancel_with(e);
      return;
    }
    Some(Ok(requested)) => requested,
  };
  let destination = match requested {
    Some(destination) => destination,
    None => {
      tracing::debug!("tunnel request without a Proxy header");
      let _ = reader
        .get_mut()
        .write_all(http_tunnel::RESPONSE_BAD_REQUEST)
        .await;
      connection_ctx.cancel_with(BrokerError::protocol("missing Proxy header"));
      return;
    }
  };

  let target = (destination.host.as_str(), destination.port);
  let upstream = match connection_ctx
    .run_until_canceled(TcpStream::connect(target))
    .await
  {
    None => return,
    Some(Err(e)) => {
      tracing::debug!(destination = %destination, error = %e, "destination dial failed");
      let _ = reader
        .get_mut()
        .write_all(http_tunnel::RESPONSE_BAD_GATEWAY)
        .await;
      connection_ctx.cancel_with(BrokerError::dial(destination.to_string(), e));
      return;
    }
    Some(Ok(upstream)) => upstream,
  };
  if let Err(e) = reader
    .get_mut()
    .write_all(http_tunnel::RESPONSE_CREATED)
    .await
  {
    connection_ctx.cancel_with(e.into());
    return;
  }
  tracing::debug!(destination = %destination, "relaying");
  let reason =
    util::relay_until_closed(&connection_ctx, WrappedStream::Buffered(reader), upstream).await;
  tracing::debug!(destination = %destination, reason = %reason, "relay finished");
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
  };

  use super::TunnelGateway;
  use crate::{
    common::{connector::HttpTunnelConnector, protocol::Destination, race::RaceBroker, BrokerError},
    util::{self, cancellation::CancelContext},
  };

  async fn start(root: &CancelContext) -> String {
    let gateway = TunnelGateway::bind("127.0.0.1:0".parse().unwrap(), root)
      .await
      .unwrap();
    let addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run());
    addr.to_string()
  }

  #[tokio::test]
  async fn http_connector_tunnels_through_gateway() {
    let root = CancelContext::new();
    let echo = util::spawn_echo_server().await;
    let gateway = start(&root).await;
    let broker = RaceBroker::new(
      vec![Arc::new(HttpTunnelConnector::new(gateway))],
      Some(Duration::from_secs(5)),
    );
    let connection = root.fork();
    let mut winner = broker
      .race_connect(&connection, &echo.into())
      .await
      .unwrap();
    winner.transport.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    winner.transport.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Nothing listens on a released port, so the gateway answers 502
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0")
      .await
      .unwrap()
      .local_addr()
      .unwrap();
    let result = broker
      .race_connect(&connection, &Destination::from(closed))
      .await;
    match result {
      Err(BrokerError::NoConnectorSucceeded(causes)) => assert!(matches!(
        &causes[0],
        BrokerError::TunnelRefused(line) if line.contains("502")
      )),
      other => panic!("expected a refused tunnel, got {:?}", other),
    }
    root.cancel();
  }

  #[tokio::test]
  async fn missing_proxy_header_is_a_bad_request() {
    let root = CancelContext::new();
    let gateway = start(&root).await;
    let mut stream = TcpStream::connect(gateway.as_str()).await.unwrap();
    stream
      .write_all(b"POST / HTTP/1.1\r\nHOST:gw\r\n\r\n")
      .await
      .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400"));
    root.cancel();
  }
}
