use crate::error::{GrpcError, GrpcResult};
use core_config::{ConfigError, Environment, FromEnv, env_optional, env_or_default, env_parse_or};
use std::net::Ipv6Addr;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::transport::Endpoint;

/// Configuration bundle for the channel pool and its interceptor chain
///
/// Passed explicitly to [`ChannelPool`](crate::ChannelPool); there is no global
/// instance. Defaults mirror the settings the services run with in production.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  // Default target
  pub host: String,
  pub port: u16,
  pub tls_enabled: bool,

  // HTTP/2 Keep-Alive
  pub keepalive_time: Option<Duration>,
  pub keepalive_timeout: Duration,

  // Connection settings
  pub connect_timeout: Duration,
  pub idle_timeout: Duration,
  pub deadline: Duration,
  pub tcp_nodelay: bool,
  pub http2_adaptive_window: bool,

  // Message limits (applied to generated stubs)
  pub max_inbound_message_size: usize,
  pub compression: Option<CompressionEncoding>,

  // Interceptors
  pub auth_enabled: bool,
  pub auth_token: Option<String>,
  pub log_request_enabled: bool,
  pub log_response_enabled: bool,
  pub metrics_enabled: bool,
  pub max_retry_attempts: u32,
  pub retry_backoff_ms: u64,

  // Shutdown
  pub shutdown_grace_period: Duration,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 9090,
      tls_enabled: false,
      keepalive_time: Some(Duration::from_secs(30)),
      keepalive_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(5),
      idle_timeout: Duration::from_secs(300),
      deadline: Duration::from_secs(30),
      tcp_nodelay: true,
      http2_adaptive_window: true,
      max_inbound_message_size: 4 * 1024 * 1024, // 4MB
      compression: None,
      auth_enabled: false,
      auth_token: None,
      log_request_enabled: true,
      log_response_enabled: true,
      metrics_enabled: true,
      max_retry_attempts: 3,
      retry_backoff_ms: 1000,
      shutdown_grace_period: Duration::from_secs(5),
    }
  }
}

impl ClientConfig {
  /// Create a new configuration with production defaults
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the default target used by `ChannelPool::get_default_channel`
  pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
    self.host = host.into();
    self.port = port;
    self
  }

  /// Use transport security instead of plaintext
  pub fn with_tls(mut self, enabled: bool) -> Self {
    self.tls_enabled = enabled;
    self
  }

  /// Enable bearer auth with the given token
  ///
  /// # Example
  /// ```ignore
  /// let config = ClientConfig::new().with_auth_token("eyJhbGciOi...");
  /// ```
  pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
    self.auth_enabled = true;
    self.auth_token = Some(token.into());
    self
  }

  /// Toggle request and response payload logging independently
  pub fn with_logging(mut self, requests: bool, responses: bool) -> Self {
    self.log_request_enabled = requests;
    self.log_response_enabled = responses;
    self
  }

  pub fn with_metrics(mut self, enabled: bool) -> Self {
    self.metrics_enabled = enabled;
    self
  }

  /// Configure the interceptor-level retry (exponential backoff)
  ///
  /// # Example
  /// ```ignore
  /// // up to 5 re-issues, waiting 100ms, 200ms, 400ms, ...
  /// let config = ClientConfig::new().with_retry(5, 100);
  /// ```
  pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
    self.max_retry_attempts = max_attempts;
    self.retry_backoff_ms = backoff_ms;
    self
  }

  /// Set the HTTP/2 keep-alive interval and ack timeout
  pub fn with_keepalive(mut self, time: Duration, timeout: Duration) -> Self {
    self.keepalive_time = Some(time);
    self.keepalive_timeout = timeout;
    self
  }

  /// Disable HTTP/2 keep-alive
  pub fn without_keepalive(mut self) -> Self {
    self.keepalive_time = None;
    self
  }

  /// Channels unused for longer than this are closed by `shutdown_idle`
  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = timeout;
    self
  }

  /// Set the connection timeout
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Default per-call deadline applied by the transport
  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = deadline;
    self
  }

  pub fn with_max_inbound_message_size(mut self, bytes: usize) -> Self {
    self.max_inbound_message_size = bytes;
    self
  }

  pub fn with_compression(mut self, encoding: CompressionEncoding) -> Self {
    self.compression = Some(encoding);
    self
  }

  /// Bound on how long shutdown waits for in-flight calls
  pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
    self.shutdown_grace_period = grace;
    self
  }

  /// Token the auth interceptor should inject, if any
  pub fn effective_auth_token(&self) -> Option<&str> {
    if !self.auth_enabled {
      return None;
    }
    self.auth_token.as_deref().filter(|token| !token.is_empty())
  }

  /// Reject configurations that can never produce a working channel
  pub fn validate(&self) -> GrpcResult<()> {
    if self.max_inbound_message_size == 0 {
      return Err(GrpcError::InvalidConfig(
        "max_inbound_message_size must be greater than zero".to_string(),
      ));
    }
    if self.tls_enabled && !cfg!(feature = "tls") {
      return Err(GrpcError::InvalidConfig(
        "TLS requested but grpc-harness was built without the `tls` feature".to_string(),
      ));
    }
    Ok(())
  }

  /// URI for a target, scheme selected by `tls_enabled`
  ///
  /// IPv6 literals are bracketed (`http://[::1]:50051`).
  pub(crate) fn endpoint_uri(&self, host: &str, port: u16) -> String {
    let scheme = if self.tls_enabled { "https" } else { "http" };
    if host.parse::<Ipv6Addr>().is_ok() {
      format!("{scheme}://[{host}]:{port}")
    } else {
      format!("{scheme}://{host}:{port}")
    }
  }

  /// Apply this configuration to a tonic Endpoint
  pub(crate) fn apply_to_endpoint(&self, mut endpoint: Endpoint) -> GrpcResult<Endpoint> {
    // HTTP/2 keep-alive
    if let Some(interval) = self.keepalive_time {
      endpoint = endpoint.http2_keep_alive_interval(interval);
    }
    endpoint = endpoint
      .keep_alive_timeout(self.keepalive_timeout)
      .keep_alive_while_idle(true);

    // Connection settings
    endpoint = endpoint
      .connect_timeout(self.connect_timeout)
      .timeout(self.deadline)
      .http2_adaptive_window(self.http2_adaptive_window)
      .tcp_nodelay(self.tcp_nodelay);

    #[cfg(feature = "tls")]
    if self.tls_enabled {
      endpoint = endpoint.tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())?;
    }

    Ok(endpoint)
  }
}

impl FromEnv for ClientConfig {
  /// Reads `GRPC_*`, `AUTH_*`, `LOGGING_*` and `METRICS_ENABLED`, falling back
  /// to the defaults for anything unset. `GRPC_TLS_ENABLED` defaults to on when
  /// `APP_ENV=production`.
  fn from_env() -> Result<Self, ConfigError> {
    let defaults = ClientConfig::default();
    let environment = Environment::from_env();

    let keepalive_secs: u64 = env_parse_or("GRPC_KEEPALIVE_TIME_SECONDS", 30)?;
    let auth_token = env_optional("AUTH_TOKEN");

    Ok(Self {
      host: env_or_default("GRPC_HOST", &defaults.host),
      port: env_parse_or("GRPC_PORT", defaults.port)?,
      tls_enabled: env_parse_or("GRPC_TLS_ENABLED", environment.use_tls())?,
      keepalive_time: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
      keepalive_timeout: Duration::from_secs(env_parse_or("GRPC_KEEPALIVE_TIMEOUT_SECONDS", 10)?),
      connect_timeout: Duration::from_secs(env_parse_or("GRPC_CONNECT_TIMEOUT_SECONDS", 5)?),
      idle_timeout: Duration::from_secs(env_parse_or("GRPC_IDLE_TIMEOUT_SECONDS", 300)?),
      deadline: Duration::from_secs(env_parse_or("GRPC_DEADLINE_SECONDS", 30)?),
      max_inbound_message_size: env_parse_or(
        "GRPC_MAX_INBOUND_MESSAGE_SIZE",
        defaults.max_inbound_message_size,
      )?,
      max_retry_attempts: env_parse_or("GRPC_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
      retry_backoff_ms: env_parse_or("GRPC_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
      auth_enabled: env_parse_or("AUTH_ENABLED", defaults.auth_enabled)?,
      auth_token,
      log_request_enabled: env_parse_or("LOGGING_REQUEST_ENABLED", defaults.log_request_enabled)?,
      log_response_enabled: env_parse_or(
        "LOGGING_RESPONSE_ENABLED",
        defaults.log_response_enabled,
      )?,
      metrics_enabled: env_parse_or("METRICS_ENABLED", defaults.metrics_enabled)?,
      ..defaults
    })
  }
}
