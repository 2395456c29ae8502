// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Servers terminating the upstream side of qsocks transports
//!
//! [StreamServer] accepts QUIC sessions and dials the destination named by each leased stream;
//! [gateway::TunnelGateway] does the same for HTTP tunnel handshakes.

use std::net::SocketAddr;

use anyhow::{Context as AnyhowContext, Result};
use tokio::net::TcpStream;
use tracing_futures::Instrument;

use crate::{
  common::{
    protocol::header::{self, DestinationHeader, OpenStatus, FRAME_TYPE_TCP_CONNECT},
    BrokerError,
  },
  util::{self, cancellation::CancelContext, tls, tunnel_stream::WrappedStream},
};

pub mod gateway;

pub struct StreamServer {
  endpoint: quinn::Endpoint,
  root: CancelContext,
}

impl StreamServer {
  /// Binds a QUIC endpoint presenting `identity`; the server stops when `parent` is canceled
  pub fn bind(addr: SocketAddr, identity: tls::CertifiedKey, parent: &CancelContext) -> Result<Self> {
    let server_config = tls::build_server_config(identity)?;
    let endpoint = quinn::Endpoint::server(server_config, addr)
      .with_context(|| format!("Failed to bind QUIC listener at {}", addr))?;
    Ok(Self {
      endpoint,
      root: parent.fork(),
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.endpoint.local_addr()
  }

  pub async fn run(self) {
    tracing::info!(addr = ?self.endpoint.local_addr().ok(), "stream server listening");
    loop {
      let connecting = tokio::select! {
        biased;
        _ = self.root.done() => break,
        connecting = self.endpoint.accept() => match connecting {
          Some(connecting) => connecting,
          None => break,
        },
      };
      let remote = connecting.remote_address();
      let session_ctx = self.root.fork();
      tokio::spawn(
        serve_session(connecting, session_ctx).instrument(tracing::info_span!("session", remote = ?remote)),
      );
    }
    self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    tracing::info!("stream server stopped");
  }
}

async fn serve_session(connecting: quinn::Connecting, session_ctx: CancelContext) {
  let connection = match session_ctx.run_until_canceled(connecting).await {
    None => return,
    Some(Err(e)) => {
      tracing::debug!(error = %e, "handshake failed");
      session_ctx.cancel_with(BrokerError::session(e));
      return;
    }
    Some(Ok(connection)) => connection,
  };
  tracing::debug!("session accepted");
  session_ctx.cleanup({
    let connection = connection.clone();
    move || connection.close(quinn::VarInt::from_u32(0), b"closed")
  });
  loop {
    let accepted = tokio::select! {
      biased;
      _ = session_ctx.done() => break,
      accepted = connection.accept_bi() => accepted,
    };
    match accepted {
      Ok(streams) => {
        let stream_ctx = session_ctx.fork();
        tokio::spawn(
          serve_stream(WrappedStream::from(streams), stream_ctx)
            .instrument(tracing::debug_span!("stream")),
        );
      }
      Err(e) => {
        tracing::debug!(error = %e, "session ended");
        session_ctx.cancel_with(BrokerError::session(e));
        break;
      }
    }
  }
}

/// Reads the destination of one leased stream, dials it, and relays until either side closes
async fn serve_stream(mut stream: WrappedStream, stream_ctx: CancelContext) {
  let header = match stream_ctx
    .run_until_canceled(DestinationHeader::read_from(&mut stream))
    .await
  {
    None => return,
    Some(Err(e)) => {
      tracing::debug!(error = %e, "unreadable stream header");
      stream_ctx.cancel_with(e);
      return;
    }
    Some(Ok(header)) => header,
  };
  if header.frame_type != FRAME_TYPE_TCP_CONNECT {
    tracing::debug!(frame_type = header.frame_type, "unsupported frame type");
    let _ = header::write_status(&mut stream, OpenStatus::UnsupportedFrame).await;
    stream_ctx.cancel_with(BrokerError::Unsupported(format!(
      "frame type {:#04x}",
      header.frame_type
    )));
    return;
  }
  let destination = header.destination;
  let target = (destination.host.as_str(), destination.port);
  let upstream = match stream_ctx.run_until_canceled(TcpStream::connect(target)).await {
    None => return,
    Some(Err(e)) => {
      tracing::debug!(destination = %destination, error = %e, "destination dial failed");
      let _ = header::write_status(&mut stream, OpenStatus::DialFailed).await;
      stream_ctx.cancel_with(BrokerError::dial(destination.to_string(), e));
      return;
    }
    Some(Ok(upstream)) => upstream,
  };
  let _ = upstream.set_nodelay(true);
  if let Err(e) = header::write_status(&mut stream, OpenStatus::Connected).await {
    stream_ctx.cancel_with(e);
    return;
  }
  tracing::debug!(destination = %destination, "relaying");
  let reason = util::relay_until_closed(&stream_ctx, stream, upstream).await;
  tracing::debug!(destination = %destination, reason = %reason, "relay finished");
}
