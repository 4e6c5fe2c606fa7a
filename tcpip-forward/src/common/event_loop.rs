// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Single-threaded execution contexts that own sessions and their channels
//!
//! Work meant for a session is always submitted to that session's loop; the
//! result is handed back to whichever context awaited it.

use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, Future, FutureExt};
use std::{
  cell::Cell,
  sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
  },
};
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};

use crate::{common::error::ForwardingError, util::dropkick::Dropkick};

static NEXT_EVENT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
  static CURRENT_EVENT_LOOP: Cell<Option<u64>> = Cell::new(None);
}

struct EventLoopInner {
  id: u64,
  name: String,
  handle: Handle,
  shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl EventLoopInner {
  fn shutdown(&self) {
    let sender = match self.shutdown.lock() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(sender) = sender {
      tracing::debug!(event_loop = %self.name, "Shutting down event loop");
      let _ = sender.send(());
    }
  }
}

impl Drop for EventLoopInner {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[derive(Clone)]
pub struct EventLoop {
  inner: Arc<EventLoopInner>,
}

impl std::fmt::Debug for EventLoop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLoop")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .finish_non_exhaustive()
  }
}

impl EventLoop {
  /// Starts a loop on a dedicated thread driving a current-thread runtime
  ///
  /// The loop runs until [`EventLoop::shutdown`] is called or the last handle
  /// is dropped; tasks still pending at that point are dropped.
  pub fn start<N: Into<String>>(name: N) -> Result<Self, std::io::Error> {
    let name = name.into();
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()?;
    let handle = runtime.handle().clone();
    let id = NEXT_EVENT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
    std::thread::Builder::new()
      .name(name.clone())
      .spawn({
        let name = name.clone();
        move || {
          CURRENT_EVENT_LOOP.with(|current| current.set(Some(id)));
          // Either an explicit shutdown or every handle being dropped ends the loop
          runtime.block_on(async move {
            let _ = shutdown_receiver.await;
          });
          tracing::trace!(event_loop = %name, "Event loop exited");
        }
      })?;
    Ok(Self {
      inner: Arc::new(EventLoopInner {
        id,
        name,
        handle,
        shutdown: Mutex::new(Some(shutdown_sender)),
      }),
    })
  }

  /// Wraps the runtime the caller is currently running on
  ///
  /// The loop's lifetime belongs to that runtime; [`EventLoop::shutdown`] is a no-op.
  pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
    let handle = Handle::try_current()?;
    Ok(Self {
      inner: Arc::new(EventLoopInner {
        id: NEXT_EVENT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
        name: String::from("current"),
        handle,
        shutdown: Mutex::new(None),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn handle(&self) -> &Handle {
    &self.inner.handle
  }

  /// Whether the calling thread is this loop's thread
  pub fn in_event_loop(&self) -> bool {
    CURRENT_EVENT_LOOP.with(|current| current.get()) == Some(self.inner.id)
  }

  pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.inner.handle.spawn(task)
  }

  /// Runs `task` on this loop and returns its output to the awaiting context
  ///
  /// Already on the loop, the task is polled inline instead of being re-queued.
  /// Dropping the returned future aborts the task wherever it is suspended.
  pub fn submit<F>(&self, task: F) -> BoxFuture<'static, Result<F::Output, ForwardingError>>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    if self.in_event_loop() {
      return task.map(Ok).boxed();
    }
    let name = self.inner.name.clone();
    let (abort_handle, registration) = AbortHandle::new_pair();
    let joined = self.spawn(Abortable::new(task, registration));
    let abort_on_drop = Dropkick::new(abort_handle);
    async move {
      let joined = joined.await;
      abort_on_drop.counter();
      match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(Aborted)) => Err(ForwardingError::EventLoopShutdown),
        Err(join_error) if join_error.is_panic() => {
          std::panic::resume_unwind(join_error.into_panic())
        }
        Err(join_error) => {
          tracing::debug!(event_loop = %name, error = %join_error, "Submitted task was cancelled");
          Err(ForwardingError::EventLoopShutdown)
        }
      }
    }
    .boxed()
  }

  pub fn shutdown(&self) {
    self.inner.shutdown();
  }
}

/// A bounded pool of event loops handed out round-robin
#[derive(Debug)]
pub struct EventLoopGroup {
  loops: Vec<EventLoop>,
  next: AtomicUsize,
}

impl EventLoopGroup {
  pub fn new(threads: usize) -> Result<Self, std::io::Error> {
    let loops = (0..threads.max(1))
      .map(|index| EventLoop::start(format!("tcpip-forward-loop-{}", index)))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self {
      loops,
      next: AtomicUsize::new(0),
    })
  }

  pub fn next(&self) -> EventLoop {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
    self.loops[index].clone()
  }

  pub fn len(&self) -> usize {
    self.loops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.loops.is_empty()
  }

  pub fn shutdown(&self) {
    self.loops.iter().for_each(EventLoop::shutdown);
  }
}

#[cfg(test)]
mod tests {
  use super::{EventLoop, EventLoopGroup};
  use crate::{common::error::ForwardingError, test_util::TEST_TIMEOUT};

  #[tokio::test]
  async fn submit_hops_to_the_loop_and_back() {
    let event_loop = EventLoop::start("submit-test").unwrap();
    assert!(!event_loop.in_event_loop());
    let checker = event_loop.clone();
    let (ran_on_loop, thread_name) = tokio::time::timeout(
      TEST_TIMEOUT,
      event_loop.submit(async move {
        (
          checker.in_event_loop(),
          std::thread::current().name().map(String::from),
        )
      }),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(ran_on_loop);
    assert_eq!(thread_name.as_deref(), Some("submit-test"));
    event_loop.shutdown();
  }

  #[tokio::test]
  async fn nested_submit_runs_inline() {
    let event_loop = EventLoop::start("nested-test").unwrap();
    let inner_loop = event_loop.clone();
    let result = tokio::time::timeout(
      TEST_TIMEOUT,
      event_loop.submit(async move { inner_loop.submit(async { 21 * 2 }).await }),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(result, 42);
    event_loop.shutdown();
  }

  #[tokio::test]
  async fn dropping_a_submission_aborts_its_task() {
    let event_loop = EventLoop::start("abort-test").unwrap();
    let (guard, released) = tokio::sync::oneshot::channel::<()>();
    let submitted = event_loop.submit(async move {
      let _guard = guard;
      futures::future::pending::<()>().await
    });
    drop(submitted);
    // The guard is dropped unsent once the task is torn down
    assert!(tokio::time::timeout(TEST_TIMEOUT, released)
      .await
      .unwrap()
      .is_err());
    event_loop.shutdown();
  }

  #[tokio::test]
  async fn submit_after_shutdown_fails() {
    let event_loop = EventLoop::start("shutdown-test").unwrap();
    event_loop.shutdown();
    // Give the loop thread a moment to tear its runtime down
    let mut outcome = Ok(());
    for _ in 0..50 {
      outcome = event_loop.submit(async {}).await;
      if outcome.is_err() {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(matches!(outcome, Err(ForwardingError::EventLoopShutdown)));
  }

  #[tokio::test]
  async fn current_loop_runs_on_the_caller_runtime() {
    let event_loop = EventLoop::current().unwrap();
    assert!(!event_loop.in_event_loop());
    assert_eq!(event_loop.submit(async { 7 }).await.unwrap(), 7);
  }

  #[test]
  fn group_hands_out_loops_round_robin() {
    let group = EventLoopGroup::new(2).unwrap();
    assert_eq!(group.len(), 2);
    let first = group.next();
    let second = group.next();
    let third = group.next();
    assert_ne!(first.name(), second.name());
    assert_eq!(first.name(), third.name());
    group.shutdown();
  }
}
