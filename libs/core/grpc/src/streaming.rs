//! Collects the messages of a server-streaming call
//!
//! A [`StreamingCollector`] receives `on_next`/`on_error`/`on_completed`
//! events, usually by draining a `tonic::Streaming<T>` with
//! [`StreamingCollector::collect`], and lets a test wait for completion or for
//! an expected number of messages with a timeout.
//!
//! The first terminal event wins. Anything that arrives after it is dropped
//! and logged.
//!
//! ## Example
//! ```ignore
//! let collector = Arc::new(StreamingCollector::with_expected_count(3));
//! let stream = stub.list_campaigns(request).await?.into_inner();
//! collector.spawn_collect(stream);
//!
//! assert!(collector.await_completion(Duration::from_secs(10)).await);
//! assert_eq!(collector.response_count(), 3);
//! ```

use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, error, info, warn};

/// One-shot countdown that tasks can wait on with a timeout
#[derive(Debug)]
struct Latch {
  remaining: watch::Sender<usize>,
}

impl Latch {
  fn new(count: usize) -> Self {
    let (remaining, _) = watch::channel(count);
    Self { remaining }
  }

  fn count_down(&self) {
    self.remaining.send_modify(|n| *n = n.saturating_sub(1));
  }

  fn release(&self) {
    self.remaining.send_replace(0);
  }

  async fn wait(&self, timeout: Duration) -> bool {
    let mut rx = self.remaining.subscribe();
    let result = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
    matches!(result, Ok(Ok(_)))
  }
}

#[derive(Debug)]
struct CollectorState<T> {
  messages: Vec<T>,
  error: Option<Status>,
  completed: bool,
  late_events: usize,
}

impl<T> CollectorState<T> {
  fn is_terminated(&self) -> bool {
    self.completed || self.error.is_some()
  }
}

/// Thread-safe sink for streamed messages
#[derive(Debug)]
pub struct StreamingCollector<T> {
  state: Mutex<CollectorState<T>>,
  completion: Latch,
  expected: Option<(usize, Latch)>,
}

impl<T> Default for StreamingCollector<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> StreamingCollector<T> {
  pub fn new() -> Self {
    Self::build(None)
  }

  /// Collector that can also be awaited until `count` messages have arrived
  pub fn with_expected_count(count: usize) -> Self {
    Self::build(Some(count))
  }

  fn build(expected: Option<usize>) -> Self {
    Self {
      state: Mutex::new(CollectorState {
        messages: Vec::new(),
        error: None,
        completed: false,
        late_events: 0,
      }),
      completion: Latch::new(1),
      expected: expected.map(|count| (count, Latch::new(count))),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CollectorState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn on_next(&self, message: T) {
    let received = {
      let mut state = self.lock();
      if state.is_terminated() {
        state.late_events += 1;
        warn!(target: "grpc_client", "Dropping stream message received after termination");
        return;
      }
      state.messages.push(message);
      state.messages.len()
    };

    debug!(target: "grpc_client", received, "Received streaming message");
    if let Some((_, latch)) = &self.expected {
      latch.count_down();
    }
  }

  pub fn on_error(&self, status: Status) {
    {
      let mut state = self.lock();
      if state.is_terminated() {
        state.late_events += 1;
        warn!(target: "grpc_client", code = ?status.code(), "Ignoring stream error after termination");
        return;
      }
      error!(
        target: "grpc_client",
        code = ?status.code(),
        description = status.message(),
        received = state.messages.len(),
        "Stream error occurred"
      );
      state.error = Some(status);
    }
    self.completion.release();
  }

  pub fn on_completed(&self) {
    {
      let mut state = self.lock();
      if state.is_terminated() {
        state.late_events += 1;
        warn!(target: "grpc_client", "Ignoring stream completion after termination");
        return;
      }
      state.completed = true;
      info!(target: "grpc_client", received = state.messages.len(), "Stream completed");
    }
    self.completion.release();
  }

  /// Wait for a terminal event; `false` on timeout
  pub async fn await_completion(&self, timeout: Duration) -> bool {
    self.completion.wait(timeout).await
  }

  /// Wait until the expected number of messages arrived; `false` on timeout
  /// or when the collector was created without an expected count
  pub async fn await_expected_count(&self, timeout: Duration) -> bool {
    match &self.expected {
      Some((_, latch)) => latch.wait(timeout).await,
      None => false,
    }
  }

  pub fn expected_count(&self) -> Option<usize> {
    self.expected.as_ref().map(|(count, _)| *count)
  }

  /// Completed normally, without an error
  pub fn is_completed_successfully(&self) -> bool {
    let state = self.lock();
    state.completed && state.error.is_none()
  }

  pub fn is_terminated(&self) -> bool {
    self.lock().is_terminated()
  }

  pub fn error(&self) -> Option<Status> {
    self.lock().error.clone()
  }

  pub fn response_count(&self) -> usize {
    self.lock().messages.len()
  }

  /// Events that arrived after the stream had terminated
  pub fn late_event_count(&self) -> usize {
    self.lock().late_events
  }

  /// Drain `stream` into the collector until it ends or fails
  pub async fn collect<S>(&self, stream: S)
  where
    S: Stream<Item = Result<T, Status>>,
  {
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
      match item {
        Ok(message) => self.on_next(message),
        Err(status) => {
          self.on_error(status);
          return;
        }
      }
    }
    self.on_completed();
  }

  /// Run [`collect`](Self::collect) on a background task
  pub fn spawn_collect<S>(self: &Arc<Self>, stream: S) -> JoinHandle<()>
  where
    S: Stream<Item = Result<T, Status>> + Send + 'static,
    T: Send + 'static,
  {
    let collector = Arc::clone(self);
    tokio::spawn(async move { collector.collect(stream).await })
  }
}

impl<T: Clone> StreamingCollector<T> {
  /// Copy of the message at `index`, in arrival order
  pub fn response(&self, index: usize) -> Option<T> {
    self.lock().messages.get(index).cloned()
  }

  /// Copy of every message received so far
  pub fn responses(&self) -> Vec<T> {
    self.lock().messages.clone()
  }
}
