// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0

use anyhow::Result;
use qsocks::{
  client::ProxyFrontend,
  common::{
    connector::{build_connectors, ConnectorSpec},
    race::RaceBroker,
    session::{QuinnDialer, QuinnDialerConfig, SessionPoolConfig},
  },
  util::cancellation::CancelContext,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub listen: SocketAddr,
  pub connectors: Vec<ConnectorSpec>,
  pub timeout: Duration,
  pub streams_per_session: usize,
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let root = CancelContext::new();
  let sigint_handler_task = {
    let shutdown_trigger = root.clone();
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("Interrupt received; shutting down");
      shutdown_trigger.cancel();
    })
  };

  let dialer = Arc::new(QuinnDialer::new(QuinnDialerConfig {
    connect_timeout: config.timeout,
    ..QuinnDialerConfig::default()
  })?);
  let connectors = build_connectors(
    &config.connectors,
    &root,
    dialer,
    SessionPoolConfig {
      max_streams_per_session: config.streams_per_session,
      ..SessionPoolConfig::default()
    },
  );
  let broker = RaceBroker::new(connectors, Some(config.timeout));
  tracing::debug!(broker = ?broker, "Connectors ready");

  let frontend = ProxyFrontend::bind(config.listen, broker, &root).await?;
  tracing::info!(addr = ?frontend.local_addr()?, "Accepting SOCKS5 connections");
  frontend.run().await;

  root.cancel();
  sigint_handler_task.abort();
  Ok(())
}
