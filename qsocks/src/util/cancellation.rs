// Copyright (c) qsocks contributors.
// Licensed under the MIT license OR Apache 2.0
//! Hierarchical cancellation with a single, sticky reason and exactly-once cleanup callbacks

use std::{
  collections::BTreeMap,
  future::Future,
  sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::common::BrokerError;

type Callback = Box<dyn FnOnce(&BrokerError) + Send + 'static>;

/// A node in a cancellation tree
///
/// Cloning produces another handle to the same node. Canceling a node fires its callbacks in
/// registration order, then cancels every descendant produced by [CancelContext::fork] with the
/// same reason. Descendants never cancel their ancestors.
#[derive(Clone)]
pub struct CancelContext {
  inner: Arc<ContextInner>,
}

struct ContextInner {
  done: CancellationToken,
  state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
  reason: Option<BrokerError>,
  callbacks: BTreeMap<u64, Callback>,
  next_callback_id: u64,
  /// Registration of this node inside its parent's callback list, removed once this node ends
  parent: Option<(Weak<ContextInner>, u64)>,
}

impl ContextInner {
  fn lock(&self) -> MutexGuard<'_, ContextState> {
    // Callbacks never run under the lock, so a poisoned state is still consistent
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Registers a callback, or hands it back if the node is already canceled
  fn register(&self, callback: Callback) -> Result<u64, (Callback, BrokerError)> {
    let mut state = self.lock();
    match &state.reason {
      Some(reason) => Err((callback, reason.clone())),
      None => {
        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state.callbacks.insert(id, callback);
        Ok(id)
      }
    }
  }

  fn deregister(&self, id: u64) {
    self.lock().callbacks.remove(&id);
  }
}

impl CancelContext {
  /// Creates a root context with no ancestors
  pub fn new() -> Self {
    Self {
      inner: Arc::new(ContextInner {
        done: CancellationToken::new(),
        state: Mutex::new(ContextState::default()),
      }),
    }
  }

  /// Creates a child which is canceled, with the same reason, whenever this context is
  pub fn fork(&self) -> CancelContext {
    let child = CancelContext::new();
    let weak_child = Arc::downgrade(&child.inner);
    let propagate: Callback = Box::new(move |reason| {
      if let Some(inner) = weak_child.upgrade() {
        CancelContext { inner }.cancel_with(reason.clone());
      }
    });
    match self.inner.register(propagate) {
      Err((propagate, reason)) => propagate(&reason),
      Ok(id) => {
        let mut state = child.inner.lock();
        if state.reason.is_none() {
          state.parent = Some((Arc::downgrade(&self.inner), id));
        } else {
          drop(state);
          self.inner.deregister(id);
        }
      }
    }
    child
  }

  /// Cancels with the plain "context canceled" reason
  pub fn cancel(&self) -> bool {
    self.cancel_with(BrokerError::Canceled)
  }

  /// Cancels this context and its descendants
  ///
  /// Only the first call has any effect; it fixes the reason and returns `true`.
  pub fn cancel_with(&self, reason: BrokerError) -> bool {
    let (callbacks, parent) = {
      let mut state = self.inner.lock();
      if state.reason.is_some() {
        return false;
      }
      state.reason = Some(reason.clone());
      (
        std::mem::take(&mut state.callbacks),
        state.parent.take(),
      )
    };
    self.inner.done.cancel();
    if let Some((parent, id)) = parent {
      if let Some(parent) = parent.upgrade() {
        parent.deregister(id);
      }
    }
    for (_, callback) in callbacks {
      callback(&reason);
    }
    true
  }

  /// Runs `callback` once with the final reason when this context is canceled
  ///
  /// Fires immediately, on the calling task, if the context has already been canceled.
  pub fn on_cancel<F>(&self, callback: F)
  where
    F: FnOnce(&BrokerError) + Send + 'static,
  {
    if let Err((callback, reason)) = self.inner.register(Box::new(callback)) {
      callback(&reason);
    }
  }

  /// Releases a resource exactly once when this context is canceled
  pub fn cleanup<F>(&self, cleanup: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.on_cancel(move |_| cleanup())
  }

  pub fn done(&self) -> WaitForCancellationFuture<'_> {
    self.inner.done.cancelled()
  }

  pub fn is_canceled(&self) -> bool {
    self.inner.done.is_cancelled()
  }

  /// The cancellation reason, once canceled
  pub fn err(&self) -> Option<BrokerError> {
    self.inner.lock().reason.clone()
  }

  /// Drives `future` to completion unless this context is canceled first
  pub async fn run_until_canceled<F: Future>(&self, future: F) -> Option<F::Output> {
    tokio::select! {
      biased;
      _ = self.done() => None,
      output = future => Some(output),
    }
  }

  #[cfg(test)]
  fn pending_callbacks(&self) -> usize {
    self.inner.lock().callbacks.len()
  }
}

impl Default for CancelContext {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for CancelContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancelContext")
      .field("reason", &self.err())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc, Mutex,
    },
    time::Duration,
  };

  use super::CancelContext;
  use crate::common::BrokerError;

  #[tokio::test]
  async fn cancellation_propagates_through_three_levels() {
    let root = CancelContext::new();
    let child = root.fork();
    let grandchild = child.fork();
    let great_grandchild = grandchild.fork();
    let sibling = root.fork();

    assert!(root.cancel_with(BrokerError::PoolClosed));
    for ctx in [&child, &grandchild, &great_grandchild, &sibling] {
      assert!(ctx.is_canceled(), "Descendants must be canceled synchronously");
      assert!(matches!(ctx.err(), Some(BrokerError::PoolClosed)));
    }
    tokio::time::timeout(Duration::from_millis(100), great_grandchild.done())
      .await
      .expect("Done must resolve for canceled descendants");
  }

  #[test]
  fn children_never_cancel_ancestors() {
    let root = CancelContext::new();
    let child = root.fork();
    child.cancel();
    assert!(!root.is_canceled());
    assert!(root.err().is_none());
  }

  #[test]
  fn first_reason_is_sticky() {
    let ctx = CancelContext::new();
    assert!(ctx.cancel_with(BrokerError::protocol("first")));
    assert!(!ctx.cancel_with(BrokerError::protocol("second")));
    assert!(!ctx.cancel());
    assert_eq!(
      ctx.err().map(|e| e.to_string()),
      Some("protocol violation: first".to_string())
    );
  }

  #[test]
  fn plain_cancel_reports_context_canceled() {
    let ctx = CancelContext::new();
    ctx.cancel();
    let reason = ctx.err().expect("Canceled contexts must carry a reason");
    assert!(reason.is_canceled());
    assert_eq!(reason.to_string(), "context canceled");
  }

  #[test]
  fn late_callback_fires_immediately() {
    let ctx = CancelContext::new();
    ctx.cancel_with(BrokerError::RaceLost);
    let seen = Arc::new(Mutex::new(None));
    ctx.on_cancel({
      let seen = seen.clone();
      move |reason| *seen.lock().unwrap() = Some(reason.to_string())
    });
    assert_eq!(
      seen.lock().unwrap().as_deref(),
      Some("lost the race to another connector")
    );
  }

  #[test]
  fn callbacks_fire_once_in_order() {
    let ctx = CancelContext::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
      let order = order.clone();
      ctx.cleanup(move || order.lock().unwrap().push(i));
    }
    ctx.cancel();
    ctx.cancel();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn fork_of_canceled_parent_starts_canceled() {
    let root = CancelContext::new();
    root.cancel_with(BrokerError::PoolClosed);
    let child = root.fork();
    assert!(child.is_canceled());
    assert!(matches!(child.err(), Some(BrokerError::PoolClosed)));
  }

  #[test]
  fn canceled_children_detach_from_parent() {
    let root = CancelContext::new();
    let children = (0..16).map(|_| root.fork()).collect::<Vec<_>>();
    assert_eq!(root.pending_callbacks(), 16);
    children.iter().for_each(|c| {
      c.cancel();
    });
    assert_eq!(
      root.pending_callbacks(),
      0,
      "Ended children must not accumulate in a long-lived parent"
    );
  }

  #[test]
  fn callbacks_may_reenter_the_context() {
    let ctx = CancelContext::new();
    let count = Arc::new(AtomicUsize::new(0));
    ctx.on_cancel({
      let ctx = ctx.clone();
      let count = count.clone();
      move |_| {
        // Registering from inside a callback must not deadlock
        ctx.cleanup(move || {
          count.fetch_add(1, Ordering::SeqCst);
        });
      }
    });
    ctx.cancel();
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn run_until_canceled_stops_pending_work() {
    let ctx = CancelContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      canceller.cancel();
    });
    let result = ctx.run_until_canceled(futures::future::pending::<()>()).await;
    assert!(result.is_none());
    assert_eq!(ctx.run_until_canceled(async { 7 }).await, None);
    assert_eq!(CancelContext::new().run_until_canceled(async { 7 }).await, Some(7));
  }
}
