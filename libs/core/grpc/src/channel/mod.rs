//! Pooled channels keyed by target
//!
//! The pool hands out one shared channel per `host:port`. Channels are created
//! lazily on first request (no connection attempt until the first RPC) with the
//! HTTP/2 tuning from [`ClientConfig`], and every unary call made through a
//! [`PooledChannel`] runs the pool's interceptor chain.
//!
//! ## Example
//! ```ignore
//! use grpc_harness::{ChannelPool, ClientConfig};
//!
//! let pool = ChannelPool::new(ClientConfig::new().with_auth_token(token));
//! let channel = pool.get_channel("campaigns.internal", 9090)?;
//! let client = CampaignServiceClient::new(channel.transport());
//!
//! // ... on exit
//! pool.shutdown_all().await;
//! ```

use crate::config::ClientConfig;
use crate::error::{GrpcError, GrpcResult};
use crate::interceptors::{
  AuthInterceptor, HeaderCaptureInterceptor, Interceptor, InterceptorChain, LoggingInterceptor,
  MetricsInterceptor, Payload, RetryInterceptor,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tonic::Status;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

/// Pool key: one channel per distinct target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
  pub host: String,
  pub port: u16,
}

impl ChannelKey {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
}

impl fmt::Display for ChannelKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Lifecycle state of a pooled target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  /// Pooled and recently used
  Ready,
  /// Pooled but unused for longer than the idle timeout
  Idle,
  /// Not in the pool (never created, or shut down)
  Shutdown,
}

/// How a channel left the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
  /// All in-flight calls finished within the grace period
  Graceful,
  /// The grace period elapsed with calls still running; they were cancelled
  Forced { in_flight: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
  pub key: ChannelKey,
  pub outcome: ShutdownOutcome,
}

struct ChannelInner {
  key: ChannelKey,
  transport: Channel,
  chain: Arc<InterceptorChain>,
  config: Arc<ClientConfig>,
  in_flight: AtomicUsize,
  closed: AtomicBool,
  drained: Notify,
  /// Set once a shutdown gives up waiting; cancels calls still running
  aborted: watch::Sender<bool>,
  created_at: Instant,
  last_used_ms: AtomicU64,
}

impl ChannelInner {
  fn touch(&self) {
    let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    self.last_used_ms.store(elapsed, Ordering::Relaxed);
  }

  fn idle_for(&self) -> Duration {
    let last_used = self.created_at + Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
    last_used.elapsed()
  }
}

/// Handle to a pooled channel; clones share the same underlying connection
#[derive(Clone)]
pub struct PooledChannel {
  inner: Arc<ChannelInner>,
}

/// Counts a call as in flight until dropped
struct InFlightGuard<'a> {
  inner: &'a ChannelInner,
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    let previous = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    if previous == 1 && self.inner.closed.load(Ordering::SeqCst) {
      self.inner.drained.notify_waiters();
    }
  }
}

impl PooledChannel {
  pub fn key(&self) -> &ChannelKey {
    &self.inner.key
  }

  /// The tonic channel, for building generated clients
  pub fn transport(&self) -> Channel {
    self.inner.transport.clone()
  }

  pub fn interceptor_chain(&self) -> &InterceptorChain {
    &self.inner.chain
  }

  pub fn config(&self) -> &ClientConfig {
    &self.inner.config
  }

  pub fn in_flight(&self) -> usize {
    self.inner.in_flight.load(Ordering::SeqCst)
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::SeqCst)
  }

  /// Whether both handles point at the same pooled channel
  pub fn same_channel(&self, other: &PooledChannel) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Time since the channel was last handed out or last started a call
  pub fn idle_for(&self) -> Duration {
    self.inner.idle_for()
  }

  /// Run a unary call through the interceptor chain
  ///
  /// `method` is the full method name used for logs, metrics and header
  /// capture. Calls on a channel that has been shut down fail with
  /// `UNAVAILABLE` without reaching the transport. Calls still running when
  /// a shutdown's grace period runs out are cancelled and fail the same way.
  pub async fn unary<Req, Resp, F, Fut>(
    &self,
    method: &str,
    request: tonic::Request<Req>,
    callable: F,
  ) -> Result<tonic::Response<Resp>, Status>
  where
    Req: Payload + Clone,
    Resp: Payload + Clone,
    F: Fn(tonic::Request<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send,
  {
    let _guard = self.begin_call()?;
    let mut aborted = self.inner.aborted.subscribe();

    tokio::select! {
      result = self.inner.chain.unary(method, request, callable) => result,
      _ = aborted.wait_for(|aborted| *aborted) => {
        warn!(target: "grpc_client", target_addr = %self.inner.key, method, "Cancelled gRPC call on force-closed channel");
        Err(Status::unavailable(format!(
          "gRPC channel {} was force-closed during shutdown",
          self.inner.key
        )))
      }
    }
  }

  fn begin_call(&self) -> Result<InFlightGuard<'_>, Status> {
    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
    let guard = InFlightGuard { inner: &self.inner };
    if self.is_closed() {
      return Err(GrpcError::ChannelClosed(self.inner.key.to_string()).into());
    }
    self.inner.touch();
    Ok(guard)
  }

  /// Stop accepting calls and wait up to `grace` for in-flight ones,
  /// cancelling whatever is still running once it elapses
  async fn drain(&self, grace: Duration) -> ShutdownOutcome {
    self.inner.closed.store(true, Ordering::SeqCst);

    let drained = async {
      loop {
        let notified = self.inner.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.in_flight() == 0 {
          return;
        }
        notified.await;
      }
    };

    match tokio::time::timeout(grace, drained).await {
      Ok(()) => ShutdownOutcome::Graceful,
      Err(_) => {
        let in_flight = self.in_flight();
        self.inner.aborted.send_replace(true);
        ShutdownOutcome::Forced { in_flight }
      }
    }
  }
}

impl fmt::Debug for PooledChannel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PooledChannel")
      .field("key", &self.inner.key)
      .field("in_flight", &self.in_flight())
      .field("closed", &self.is_closed())
      .finish()
  }
}

/// Builder for a [`ChannelPool`] with extra interceptors
///
/// Custom interceptors wrap the default chain, so the one added last runs
/// first on the way out.
pub struct ChannelPoolBuilder {
  config: ClientConfig,
  custom: Vec<Arc<dyn Interceptor>>,
}

impl ChannelPoolBuilder {
  pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
    self.custom.push(Arc::new(interceptor));
    self
  }

  pub fn build(self) -> ChannelPool {
    let config = self.config;
    let mut chain = InterceptorChain::new();

    if config.log_request_enabled || config.log_response_enabled {
      chain = chain.wrap(LoggingInterceptor::from_config(&config));
    }
    if config.auth_enabled {
      chain = chain.wrap(AuthInterceptor::from_config(&config));
    }
    let metrics = config.metrics_enabled.then(MetricsInterceptor::new);
    if let Some(metrics) = &metrics {
      chain = chain.wrap(metrics.clone());
    }
    let header_capture = HeaderCaptureInterceptor::new();
    chain = chain.wrap(header_capture.clone());
    chain = chain.wrap(RetryInterceptor::from_config(&config));

    for interceptor in self.custom {
      chain = chain.wrap_arc(interceptor);
    }

    debug!(target: "grpc_client", interceptors = ?chain.names(), "Interceptor chain assembled");

    ChannelPool {
      config: Arc::new(config),
      chain: Arc::new(chain),
      channels: DashMap::new(),
      header_capture,
      metrics,
    }
  }
}

/// Process-wide pool of channels, one per target
///
/// Pass it around explicitly (usually in an `Arc`); there is no global
/// instance.
pub struct ChannelPool {
  config: Arc<ClientConfig>,
  chain: Arc<InterceptorChain>,
  channels: DashMap<ChannelKey, PooledChannel>,
  header_capture: HeaderCaptureInterceptor,
  metrics: Option<MetricsInterceptor>,
}

impl ChannelPool {
  /// Pool with the default interceptor chain for `config`
  pub fn new(config: ClientConfig) -> Self {
    Self::builder(config).build()
  }

  pub fn builder(config: ClientConfig) -> ChannelPoolBuilder {
    ChannelPoolBuilder {
      config,
      custom: Vec::new(),
    }
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  pub fn interceptor_chain(&self) -> &InterceptorChain {
    &self.chain
  }

  pub fn header_capture(&self) -> &HeaderCaptureInterceptor {
    &self.header_capture
  }

  /// Per-method call metrics, `None` when metrics are disabled
  pub fn metrics(&self) -> Option<&MetricsInterceptor> {
    self.metrics.as_ref()
  }

  /// Channel for `host:port`, created on first request
  ///
  /// Concurrent first requests for the same target all receive the same
  /// channel.
  pub fn get_channel(&self, host: &str, port: u16) -> GrpcResult<PooledChannel> {
    let key = ChannelKey::new(host, port);
    if let Some(existing) = self.channels.get(&key) {
      existing.inner.touch();
      return Ok(existing.value().clone());
    }

    match self.channels.entry(key) {
      Entry::Occupied(entry) => Ok(entry.get().clone()),
      Entry::Vacant(entry) => {
        let channel = self.create_channel(entry.key())?;
        entry.insert(channel.clone());
        Ok(channel)
      }
    }
  }

  /// Channel for the configured default target
  pub fn get_default_channel(&self) -> GrpcResult<PooledChannel> {
    self.get_channel(&self.config.host, self.config.port)
  }

  pub fn contains(&self, host: &str, port: u16) -> bool {
    self.channels.contains_key(&ChannelKey::new(host, port))
  }

  pub fn len(&self) -> usize {
    self.channels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.channels.is_empty()
  }

  pub fn channel_state(&self, host: &str, port: u16) -> ChannelState {
    match self.channels.get(&ChannelKey::new(host, port)) {
      None => ChannelState::Shutdown,
      Some(channel) if channel.idle_for() >= self.config.idle_timeout => ChannelState::Idle,
      Some(_) => ChannelState::Ready,
    }
  }

  /// Remove one channel and shut it down, waiting up to the grace period
  ///
  /// Returns `None` when no channel exists for the target.
  pub async fn shutdown_channel(&self, host: &str, port: u16) -> Option<ShutdownReport> {
    let (key, channel) = self.channels.remove(&ChannelKey::new(host, port))?;
    Some(self.close(key, channel).await)
  }

  /// Shut down every pooled channel; the pool is empty afterwards
  pub async fn shutdown_all(&self) -> Vec<ShutdownReport> {
    let keys: Vec<ChannelKey> = self.channels.iter().map(|e| e.key().clone()).collect();
    let removed: Vec<_> = keys
      .into_iter()
      .filter_map(|key| self.channels.remove(&key))
      .collect();

    info!(target: "grpc_client", channels = removed.len(), "Shutting down all gRPC channels");

    futures::future::join_all(
      removed
        .into_iter()
        .map(|(key, channel)| self.close(key, channel)),
    )
    .await
  }

  /// Shut down channels with no calls for at least the idle timeout
  pub async fn shutdown_idle(&self) -> Vec<ShutdownReport> {
    let idle_timeout = self.config.idle_timeout;
    let idle: Vec<ChannelKey> = self
      .channels
      .iter()
      .filter(|e| e.value().in_flight() == 0 && e.value().idle_for() >= idle_timeout)
      .map(|e| e.key().clone())
      .collect();

    let mut reports = Vec::with_capacity(idle.len());
    for key in idle {
      let removed = self
        .channels
        .remove_if(&key, |_, ch| ch.in_flight() == 0 && ch.idle_for() >= idle_timeout);
      if let Some((key, channel)) = removed {
        reports.push(self.close(key, channel).await);
      }
    }
    reports
  }

  fn create_channel(&self, key: &ChannelKey) -> GrpcResult<PooledChannel> {
    if key.host.trim().is_empty() {
      return Err(GrpcError::InvalidConfig("host must not be empty".to_string()));
    }
    self.config.validate()?;

    let uri = self.config.endpoint_uri(&key.host, key.port);
    let endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| {
      error!(target: "grpc_client", uri = %uri, error = %e, "Invalid gRPC target");
      GrpcError::InvalidUri(e)
    })?;
    let transport = self.config.apply_to_endpoint(endpoint)?.connect_lazy();

    info!(
      target: "grpc_client",
      target_addr = %key,
      tls = self.config.tls_enabled,
      "Created gRPC channel"
    );

    Ok(PooledChannel {
      inner: Arc::new(ChannelInner {
        key: key.clone(),
        transport,
        chain: Arc::clone(&self.chain),
        config: Arc::clone(&self.config),
        in_flight: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        drained: Notify::new(),
        aborted: watch::channel(false).0,
        created_at: Instant::now(),
        last_used_ms: AtomicU64::new(0),
      }),
    })
  }

  async fn close(&self, key: ChannelKey, channel: PooledChannel) -> ShutdownReport {
    let outcome = channel.drain(self.config.shutdown_grace_period).await;
    match &outcome {
      ShutdownOutcome::Graceful => {
        info!(target: "grpc_client", target_addr = %key, "gRPC channel shut down");
      }
      ShutdownOutcome::Forced { in_flight } => {
        warn!(
          target: "grpc_client",
          target_addr = %key,
          in_flight,
          grace_ms = self.config.shutdown_grace_period.as_millis() as u64,
          "gRPC channel did not drain in time, cancelled remaining calls"
        );
      }
    }
    ShutdownReport { key, outcome }
  }
}

impl fmt::Debug for ChannelPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelPool")
      .field("channels", &self.channels.len())
      .field("interceptors", &self.chain)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interceptors::test_support::{Ping, Pong, Recording};
  use std::sync::Mutex;
  use tonic::Code;

  fn quiet_config() -> ClientConfig {
    ClientConfig::new()
      .with_logging(false, false)
      .with_retry(0, 1)
      .with_shutdown_grace_period(Duration::from_millis(50))
  }

  #[tokio::test]
  async fn test_same_target_returns_same_channel() {
    let pool = ChannelPool::new(quiet_config());
    let a = pool.get_channel("localhost", 50051).unwrap();
    let b = pool.get_channel("localhost", 50051).unwrap();
    let c = pool.get_channel("localhost", 50052).unwrap();

    assert!(a.same_channel(&b));
    assert!(!a.same_channel(&c));
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.channel_state("localhost", 50051), ChannelState::Ready);
  }

  #[tokio::test]
  async fn test_concurrent_first_requests_share_one_channel() {
    let pool = Arc::new(ChannelPool::new(quiet_config()));
    let handles: Vec<_> = (0..16)
      .map(|_| {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get_channel("localhost", 9000).unwrap() })
      })
      .collect();

    let channels: Vec<_> = futures::future::join_all(handles)
      .await
      .into_iter()
      .map(|r| r.unwrap())
      .collect();
    assert!(channels.windows(2).all(|w| w[0].same_channel(&w[1])));
    assert_eq!(pool.len(), 1);
  }

  #[tokio::test]
  async fn test_default_channel_uses_config_target() {
    let pool = ChannelPool::new(quiet_config().with_address("10.0.0.1", 7000));
    let channel = pool.get_default_channel().unwrap();
    assert_eq!(channel.key(), &ChannelKey::new("10.0.0.1", 7000));
    assert!(pool.contains("10.0.0.1", 7000));
  }

  #[tokio::test]
  async fn test_invalid_targets_are_rejected() {
    let pool = ChannelPool::new(quiet_config());
    assert!(matches!(pool.get_channel("", 9090), Err(GrpcError::InvalidConfig(_))));
    assert!(matches!(pool.get_channel("bad host", 9090), Err(GrpcError::InvalidUri(_))));
    assert!(pool.is_empty());

    let ipv6 = pool.get_channel("::1", 50051).unwrap();
    assert_eq!(ipv6.key(), &ChannelKey::new("::1", 50051));
  }

  #[test]
  fn test_default_chain_order() {
    let pool = ChannelPool::new(ClientConfig::new().with_auth_token("t"));
    assert_eq!(
      pool.interceptor_chain().names(),
      ["retry", "header-capture", "metrics", "auth", "logging"]
    );
    assert!(pool.metrics().is_some());
  }

  #[test]
  fn test_disabled_interceptors_are_left_out() {
    let pool = ChannelPool::new(quiet_config().with_metrics(false));
    assert_eq!(pool.interceptor_chain().names(), ["retry", "header-capture"]);
    assert!(pool.metrics().is_none());
  }

  #[tokio::test]
  async fn test_custom_interceptor_wraps_defaults() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let pool = ChannelPool::builder(quiet_config())
      .with_interceptor(Recording {
        name: "custom",
        events: Arc::clone(&events),
      })
      .build();
    assert_eq!(pool.interceptor_chain().names()[0], "custom");

    let channel = pool.get_channel("localhost", 9001).unwrap();
    let response = channel
      .unary("svc/Ping", tonic::Request::new(Ping { id: 1 }), |req| async move {
        assert!(req.metadata().get("x-visited").is_some());
        Ok(tonic::Response::new(Pong { id: req.get_ref().id }))
      })
      .await
      .unwrap();

    assert_eq!(response.into_inner(), Pong { id: 1 });
    assert_eq!(*events.lock().unwrap(), ["custom:out", "custom:in"]);
    assert_eq!(pool.metrics().unwrap().metrics("svc/Ping").unwrap().successful_calls, 1);
  }

  #[tokio::test]
  async fn test_shutdown_removes_channel_and_rejects_calls() {
    let pool = ChannelPool::new(quiet_config());
    let channel = pool.get_channel("localhost", 9002).unwrap();

    let report = pool.shutdown_channel("localhost", 9002).await.unwrap();
    assert_eq!(report.outcome, ShutdownOutcome::Graceful);
    assert_eq!(pool.channel_state("localhost", 9002), ChannelState::Shutdown);
    assert!(pool.shutdown_channel("localhost", 9002).await.is_none());

    let err = channel
      .unary("svc/Ping", tonic::Request::new(Ping { id: 1 }), |_req| async {
        Ok(tonic::Response::new(Pong { id: 1 }))
      })
      .await
      .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    // A later request creates a fresh channel
    let fresh = pool.get_channel("localhost", 9002).unwrap();
    assert!(!fresh.same_channel(&channel));
  }

  #[tokio::test]
  async fn test_shutdown_waits_for_in_flight_calls() {
    let pool = Arc::new(ChannelPool::new(
      quiet_config().with_shutdown_grace_period(Duration::from_secs(5)),
    ));
    let channel = pool.get_channel("localhost", 9003).unwrap();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let call = tokio::spawn({
      let channel = channel.clone();
      async move {
        channel
          .unary("svc/Slow", tonic::Request::new(Ping { id: 1 }), move |_req| {
            let mut release = release_rx.clone();
            async move {
              let _ = release.wait_for(|released| *released).await;
              Ok(tonic::Response::new(Pong { id: 1 }))
            }
          })
          .await
      }
    });

    while channel.in_flight() == 0 {
      tokio::task::yield_now().await;
    }
    let shutdown = tokio::spawn({
      let pool = Arc::clone(&pool);
      async move { pool.shutdown_all().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    release_tx.send_replace(true);

    assert!(call.await.unwrap().is_ok());
    let reports = shutdown.await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, ShutdownOutcome::Graceful);
    assert!(pool.is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_forced_after_grace_period() {
    let pool = ChannelPool::new(quiet_config());
    let channel = pool.get_channel("localhost", 9004).unwrap();

    let stuck = tokio::spawn({
      let channel = channel.clone();
      async move {
        channel
          .unary("svc/Stuck", tonic::Request::new(Ping { id: 1 }), |_req| {
            std::future::pending::<Result<tonic::Response<Pong>, Status>>()
          })
          .await
      }
    });
    while channel.in_flight() == 0 {
      tokio::task::yield_now().await;
    }

    let reports = pool.shutdown_all().await;
    assert_eq!(reports[0].outcome, ShutdownOutcome::Forced { in_flight: 1 });

    let err = stuck.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(channel.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_call_released_after_forced_shutdown_still_fails() {
    let pool = ChannelPool::new(quiet_config().with_shutdown_grace_period(Duration::from_millis(30)));
    let channel = pool.get_channel("localhost", 9007).unwrap();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let call = tokio::spawn({
      let channel = channel.clone();
      async move {
        channel
          .unary("svc/Slow", tonic::Request::new(Ping { id: 1 }), move |_req| {
            let mut release = release_rx.clone();
            async move {
              let _ = release.wait_for(|released| *released).await;
              Ok(tonic::Response::new(Pong { id: 1 }))
            }
          })
          .await
      }
    });
    while channel.in_flight() == 0 {
      tokio::task::yield_now().await;
    }

    let reports = pool.shutdown_all().await;
    assert_eq!(reports[0].outcome, ShutdownOutcome::Forced { in_flight: 1 });
    release_tx.send_replace(true);

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("force-closed"));
  }

  #[tokio::test]
  async fn test_shutdown_idle_only_closes_idle_channels() {
    let pool = ChannelPool::new(quiet_config().with_idle_timeout(Duration::from_millis(30)));
    pool.get_channel("localhost", 9005).unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    pool.get_channel("localhost", 9006).unwrap();

    assert_eq!(pool.channel_state("localhost", 9005), ChannelState::Idle);
    let reports = pool.shutdown_idle().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].key, ChannelKey::new("localhost", 9005));
    assert!(pool.contains("localhost", 9006));
  }
}
