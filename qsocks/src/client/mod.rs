// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! The local SOCKS5 listener, racing connectors for every accepted connection

use std::net::SocketAddr;

use anyhow::{Context as AnyhowContext, Result};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tracing_futures::Instrument;

use crate::{
  common::{
    protocol::socks5::{self, Reply},
    race::RaceBroker,
    BrokerError,
  },
  util::{self, cancellation::CancelContext},
};

pub struct ProxyFrontend {
  listener: TcpListener,
  broker: RaceBroker,
  root: CancelContext,
}

impl ProxyFrontend {
  /// Binds the SOCKS5 listener; accepting stops when `parent` is canceled
  pub async fn bind(addr: SocketAddr, broker: RaceBroker, parent: &CancelContext) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind SOCKS5 listener at {}", addr))?;
    Ok(Self {
      listener,
      broker,
      root: parent.fork(),
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub async fn run(self) {
    let Self {
      listener,
      broker,
      root,
    } = self;
    tracing::info!(addr = ?listener.local_addr().ok(), "SOCKS5 listener ready");
    tokio_stream::wrappers::TcpListenerStream::new(listener)
      .take_until(root.done())
      .for_each_concurrent(None, |accepted| {
        let broker = broker.clone();
        let root = root.clone();
        async move {
          match accepted {
            Ok(stream) => {
              let peer = stream.peer_addr().ok();
              let _ = stream.set_nodelay(true);
              let connection_ctx = root.fork();
              tokio::spawn(
                async move {
                  if let Err(e) = serve_connection(&broker, &connection_ctx, stream).await {
                    tracing::debug!(error = %e, "connection failed");
                  }
                  connection_ctx.cancel();
                }
                .instrument(tracing::info_span!("socks", peer = ?peer)),
              );
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
          }
        }
      })
      .await;
    tracing::info!("SOCKS5 listener stopped");
  }
}

/// Runs one SOCKS5 exchange: handshake, race, reply, then relay until either side closes
///
/// The caller owns `connection_ctx` and cancels it afterwards, releasing whatever the winning
/// connector still holds for this connection.
pub async fn serve_connection(
  broker: &RaceBroker,
  connection_ctx: &CancelContext,
  mut stream: TcpStream,
) -> Result<(), BrokerError> {
  let bound = stream.local_addr().ok();
  let handshake = async {
    socks5::negotiate_method(&mut stream).await?;
    socks5::read_request(&mut stream).await
  };
  let destination = match connection_ctx.run_until_canceled(handshake).await {
    None => return Err(connection_ctx.err().unwrap_or(BrokerError::Canceled)),
    Some(Ok(destination)) => destination,
    Some(Err(e)) => {
      if let Some(reply) = e.reply() {
        let _ = socks5::write_reply(&mut stream, reply, None).await;
      }
      return Err(e.into());
    }
  };

  let winner = match broker.race_connect(connection_ctx, &destination).await {
    Ok(winner) => winner,
    Err(e) => {
      tracing::info!(destination = %destination, error = %e, "no route to destination");
      let _ = socks5::write_reply(&mut stream, Reply::HostUnreachable, None).await;
      return Err(e);
    }
  };
  socks5::write_reply(&mut stream, Reply::Succeeded, bound).await?;
  tracing::info!(destination = %destination, via = %winner.kind, "tunnel established");

  let reason = util::relay_until_closed(connection_ctx, stream, winner.transport).await;
  tracing::debug!(destination = %destination, reason = %reason, "tunnel closed");
  if reason.is_canceled() {
    Ok(())
  } else {
    Err(reason)
  }
}
