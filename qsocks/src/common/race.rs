// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Races every configured connector for one destination; the first transport pushed wins

use std::{
  sync::{Arc, Mutex, PoisonError},
  time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::{
  common::{
    connector::{ConnectRequest, Connector, ConnectorKind, PushReady},
    protocol::Destination,
    transport::Transport,
    BrokerError,
  },
  util::cancellation::CancelContext,
};

#[derive(Debug)]
pub struct RaceWinner {
  pub index: usize,
  pub kind: ConnectorKind,
  pub transport: Transport,
}

type WinnerGate = Arc<Mutex<Option<oneshot::Sender<(usize, Transport)>>>>;

#[derive(Clone)]
pub struct RaceBroker {
  connectors: Arc<[Arc<dyn Connector>]>,
  timeout: Option<Duration>,
}

impl std::fmt::Debug for RaceBroker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kinds = self.connectors.iter().map(|c| c.kind()).collect::<Vec<_>>();
    f.debug_struct("RaceBroker")
      .field("connectors", &kinds)
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl RaceBroker {
  pub fn new(connectors: Vec<Arc<dyn Connector>>, timeout: Option<Duration>) -> Self {
    Self {
      connectors: connectors.into(),
      timeout,
    }
  }

  /// Starts every connector against `destination` and returns the first transport pushed
  ///
  /// Losing attempts are canceled with [BrokerError::RaceLost] and any transport they push later
  /// is dropped. The winner's attempt context stays alive under `parent`, so canceling `parent`
  /// is what eventually releases the winning transport's resources.
  pub async fn race_connect(
    &self,
    parent: &CancelContext,
    destination: &Destination,
  ) -> Result<RaceWinner, BrokerError> {
    let race = parent.fork();
    let started = Instant::now();
    let (winner_sender, winner_receiver) = oneshot::channel();
    let gate: WinnerGate = Arc::new(Mutex::new(Some(winner_sender)));

    let attempts = self
      .connectors
      .iter()
      .enumerate()
      .map(|(index, connector)| {
        let attempt = race.fork();
        let request = ConnectRequest {
          context: attempt.clone(),
          destination: destination.clone(),
          ready: Self::gated_push(index, &attempt, &gate),
        };
        let span = tracing::debug_span!("attempt", index, kind = %connector.kind());
        tokio::spawn(connector.connect(request).instrument(span));
        attempt
      })
      .collect::<Vec<_>>();
    // Only pending attempts may keep the gate alive
    drop(gate);

    let all_done = futures::future::join_all(attempts.iter().map(|attempt| attempt.done()));
    let deadline = async {
      match self.timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => futures::future::pending::<()>().await,
      }
    };
    let outcome = tokio::select! {
      biased;
      won = winner_receiver => won.ok(),
      _ = race.done() => None,
      _ = all_done => None,
      _ = deadline => {
        if let Some(timeout) = self.timeout {
          race.cancel_with(BrokerError::RaceTimedOut(timeout));
        }
        None
      }
    };

    match outcome {
      Some((index, transport)) => {
        let kind = self.connectors[index].kind();
        tracing::debug!(
          destination = %destination,
          winner = %kind,
          elapsed = ?started.elapsed(),
          "race won"
        );
        let losers = attempts
          .into_iter()
          .enumerate()
          .filter(|(i, _)| *i != index)
          .map(|(_, attempt)| attempt)
          .collect::<Vec<_>>();
        tokio::spawn(async move {
          for loser in losers {
            loser.cancel_with(BrokerError::RaceLost);
          }
        });
        Ok(RaceWinner {
          index,
          kind,
          transport,
        })
      }
      None => {
        let causes = attempts
          .iter()
          .map(|attempt| attempt.err().unwrap_or(BrokerError::Canceled))
          .collect::<Vec<_>>();
        race.cancel_with(BrokerError::NoConnectorSucceeded(causes.into()));
        let reason = race.err().unwrap_or(BrokerError::Canceled);
        tracing::debug!(destination = %destination, error = %reason, "race failed");
        Err(reason)
      }
    }
  }

  /// A push handle admitting only the first transport across the whole race
  fn gated_push(index: usize, attempt: &CancelContext, gate: &WinnerGate) -> PushReady {
    let attempt = attempt.clone();
    let gate = Arc::clone(gate);
    PushReady::new(move |transport| {
      if attempt.is_canceled() {
        drop(transport);
        return false;
      }
      let sender = gate.lock().unwrap_or_else(PoisonError::into_inner).take();
      let accepted = match sender {
        Some(sender) => sender.send((index, transport)).is_ok(),
        None => false,
      };
      if !accepted {
        attempt.cancel_with(BrokerError::RaceLost);
      }
      accepted
    })
  }
}
