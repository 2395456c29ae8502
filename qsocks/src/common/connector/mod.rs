// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Strategies for reaching a destination
//!
//! A [Connector] is handed a [ConnectRequest] and either pushes exactly one [Transport] through
//! its [PushReady] handle or cancels the request context with the reason it failed.

use std::{str::FromStr, sync::Arc};

use futures::future::BoxFuture;

use crate::{
  common::{
    protocol::Destination,
    session::{SessionDialer, SessionPool, SessionPoolConfig},
    transport::Transport,
  },
  util::cancellation::CancelContext,
};

mod direct;
mod http;
mod session;

pub use direct::DirectConnector;
pub use http::HttpTunnelConnector;
pub use session::SessionConnector;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
  Direct,
  HttpTunnel,
  Session,
}

impl std::fmt::Display for ConnectorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ConnectorKind::Direct => "direct",
      ConnectorKind::HttpTunnel => "http",
      ConnectorKind::Session => "session",
    })
  }
}

/// Hands a transport to whoever is waiting on a request; consumed by its first use
pub struct PushReady(Box<dyn FnOnce(Transport) -> bool + Send + 'static>);

impl PushReady {
  pub fn new<F>(push: F) -> Self
  where
    F: FnOnce(Transport) -> bool + Send + 'static,
  {
    Self(Box::new(push))
  }

  /// Returns `false` if the transport was refused and has been dropped
  pub fn push(self, transport: Transport) -> bool {
    (self.0)(transport)
  }
}

impl std::fmt::Debug for PushReady {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PushReady").finish_non_exhaustive()
  }
}

#[derive(Debug)]
pub struct ConnectRequest {
  pub context: CancelContext,
  pub destination: Destination,
  pub ready: PushReady,
}

pub trait Connector: Send + Sync + 'static {
  fn kind(&self) -> ConnectorKind;

  /// Attempts to reach `request.destination`
  ///
  /// On success the transport is pushed exactly once; on failure `request.context` is canceled
  /// with the cause. Implementations never push once the context has ended.
  fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, ()>;
}

/// A connector as named on the command line: `direct`, `http://gateway:port`,
/// `session://host:port`, or a bare `host:port` session remote
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectorSpec {
  Direct,
  HttpTunnel { gateway: String },
  Session { remote: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectorSpecError {
  #[error("unknown connector scheme {0:?}; expected one of direct, http, session")]
  UnknownScheme(String),
  #[error("connector target {0:?} must be of the form host:port")]
  InvalidAddress(String),
}

impl FromStr for ConnectorSpec {
  type Err = ConnectorSpecError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let (scheme, target) = match s.split_once("://") {
      Some((scheme, target)) => (scheme.to_ascii_lowercase(), target),
      None if s.eq_ignore_ascii_case("direct") => return Ok(ConnectorSpec::Direct),
      None => ("session".to_string(), s),
    };
    match scheme.as_str() {
      "direct" => Ok(ConnectorSpec::Direct),
      "http" => validate_host_port(target).map(|gateway| ConnectorSpec::HttpTunnel { gateway }),
      "session" => validate_host_port(target).map(|remote| ConnectorSpec::Session { remote }),
      _ => Err(ConnectorSpecError::UnknownScheme(scheme)),
    }
  }
}

fn validate_host_port(target: &str) -> Result<String, ConnectorSpecError> {
  let target = target.trim_end_matches('/');
  match target.rsplit_once(':') {
    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(target.to_string()),
    _ => Err(ConnectorSpecError::InvalidAddress(target.to_string())),
  }
}

/// Instantiates connectors in the order given
///
/// Every session remote joins one shared [SessionPool], whose connector takes the position of the
/// first session entry. The pool lives under `root`.
pub fn build_connectors(
  specs: &[ConnectorSpec],
  root: &CancelContext,
  dialer: Arc<dyn SessionDialer>,
  pool_config: SessionPoolConfig,
) -> Vec<Arc<dyn Connector>> {
  let remotes = specs
    .iter()
    .filter_map(|spec| match spec {
      ConnectorSpec::Session { remote } => Some(remote.clone()),
      _ => None,
    })
    .collect::<Vec<_>>();
  let mut pool = if remotes.is_empty() {
    None
  } else {
    Some(SessionPool::spawn(
      root,
      dialer,
      SessionPoolConfig {
        remotes,
        ..pool_config
      },
    ))
  };

  let mut connectors: Vec<Arc<dyn Connector>> = Vec::with_capacity(specs.len());
  for spec in specs {
    match spec {
      ConnectorSpec::Direct => connectors.push(Arc::new(DirectConnector::new())),
      ConnectorSpec::HttpTunnel { gateway } => {
        connectors.push(Arc::new(HttpTunnelConnector::new(gateway.clone())))
      }
      ConnectorSpec::Session { .. } => {
        if let Some(pool) = pool.take() {
          connectors.push(Arc::new(SessionConnector::new(pool)));
        }
      }
    }
  }
  connectors
}
