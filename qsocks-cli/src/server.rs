// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use qsocks::{
  server::{gateway::TunnelGateway, StreamServer},
  util::{cancellation::CancelContext, tls},
};
use std::{net::SocketAddr, path::PathBuf};

/// Parameters used to run a QUIC stream server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub listen: SocketAddr,
  pub cert: Option<PathBuf>,
  pub key: Option<PathBuf>,
}

/// Parameters used to run an HTTP tunnel gateway
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct GatewayArgs {
  pub listen: SocketAddr,
}

fn shutdown_on_interrupt(root: &CancelContext) -> tokio::task::JoinHandle<()> {
  let shutdown_trigger = root.clone();
  tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupt received; shutting down");
    shutdown_trigger.cancel();
  })
}

pub async fn server_main(config: ServerArgs) -> Result<()> {
  let identity = match (&config.cert, &config.key) {
    (Some(cert), Some(key)) => tls::load_pem(cert, key)?,
    _ => {
      tracing::info!(
        san = tls::SESSION_SERVER_NAME,
        "No certificate given; using an in-memory self-signed certificate"
      );
      tls::self_signed(tls::SESSION_SERVER_NAME)?
    }
  };
  let root = CancelContext::new();
  let sigint_handler_task = shutdown_on_interrupt(&root);
  let server = StreamServer::bind(config.listen, identity, &root)?;
  tracing::info!(addr = ?server.local_addr()?, "Accepting QUIC sessions");
  server.run().await;
  sigint_handler_task.abort();
  Ok(())
}

pub async fn gateway_main(config: GatewayArgs) -> Result<()> {
  let root = CancelContext::new();
  let sigint_handler_task = shutdown_on_interrupt(&root);
  let gateway = TunnelGateway::bind(config.listen, &root).await?;
  tracing::info!(addr = ?gateway.local_addr()?, "Accepting HTTP tunnel requests");
  gateway.run().await;
  sigint_handler_task.abort();
  Ok(())
}
