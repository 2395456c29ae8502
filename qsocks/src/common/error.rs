// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

/// The reason carried by a canceled [CancelContext](crate::util::cancellation::CancelContext)
///
/// Every failure in the broker is reported by canceling the nearest enclosing context
/// with one of these, so the type is cheaply cloneable; non-clone sources sit behind [Arc].
#[derive(thiserror::Error, Debug, Clone)]
pub enum BrokerError {
  #[error("context canceled")]
  Canceled,
  #[error("failed to dial {target}: {source}")]
  Dial {
    target: String,
    #[source]
    source: Arc<std::io::Error>,
  },
  #[error("I/O failure: {0}")]
  Io(#[source] Arc<std::io::Error>),
  #[error("protocol violation: {0}")]
  Protocol(String),
  #[error("tunnel gateway refused the request with status line {0:?}")]
  TunnelRefused(String),
  #[error("multiplexed stream refused by server with status {0:#04x}")]
  StreamRefused(u8),
  #[error("session failure: {0}")]
  Session(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
  #[error("lost the race to another connector")]
  RaceLost,
  #[error("no connector succeeded: [{}]", render_causes(.0))]
  NoConnectorSucceeded(Arc<[BrokerError]>),
  #[error("race timed out after {0:?}")]
  RaceTimedOut(Duration),
  #[error("session pool closed")]
  PoolClosed,
  #[error("unsupported request: {0}")]
  Unsupported(String),
}

fn render_causes(causes: &[BrokerError]) -> String {
  causes
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

impl BrokerError {
  pub fn dial(target: impl Into<String>, source: std::io::Error) -> Self {
    Self::Dial {
      target: target.into(),
      source: Arc::new(source),
    }
  }

  pub fn protocol(message: impl Into<String>) -> Self {
    Self::Protocol(message.into())
  }

  pub fn session<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Session(Arc::new(error))
  }

  /// Returns `true` for the reason given by a plain, error-free cancellation
  #[must_use]
  pub fn is_canceled(&self) -> bool {
    matches!(self, Self::Canceled)
  }
}

impl From<std::io::Error> for BrokerError {
  fn from(error: std::io::Error) -> Self {
    Self::Io(Arc::new(error))
  }
}
