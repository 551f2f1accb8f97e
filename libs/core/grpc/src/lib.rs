//! # gRPC Client Harness
//!
//! Client-side execution framework for calling gRPC services: pooled
//! channels, an interceptor chain around every call, a resilience layer, and
//! a uniform response envelope carrying status, payload and timing.
//!
//! Generated tonic stubs stay untouched. Service clients hold a
//! [`GrpcClient`] and hand it a closure that performs the stub call.
//!
//! ## Features
//!
//! - **Channel Pool**: one lazily-connected channel per `(host, port)`,
//!   graceful shutdown with a bounded drain period
//! - **Interceptors**: auth (Bearer tokens), JSON payload logging, per-method
//!   metrics, header capture, retry with exponential backoff
//! - **Resilience**: fixed-wait retry and a count-based circuit breaker
//! - **Response Envelope**: [`GrpcResponse`] never turns an RPC failure into
//!   an `Err`
//! - **Streaming**: [`StreamingCollector`] for server-streaming calls
//! - **Contracts**: [`ContractValidator`] for backward-compatible schema changes
//!
//! ## Quick Start
//!
//! ### Basic Usage
//! ```ignore
//! use grpc_harness::{ChannelPool, ClientConfig, GrpcClient, configure_client};
//!
//! let pool = ChannelPool::new(ClientConfig::from_env()?);
//! let client = GrpcClient::connect_default(&pool)?;
//! let stub = configure_client(CampaignServiceClient::new(client.transport()), pool.config());
//!
//! let response = client
//!     .execute_unary("campaign.v1.CampaignService/GetCampaign", request, |req| {
//!         let mut stub = stub.clone();
//!         async move { stub.get_campaign(req).await }
//!     })
//!     .await;
//! ```
//!
//! ### With Custom Interceptors
//! ```ignore
//! use grpc_harness::{ChannelPool, ClientConfig};
//!
//! let pool = ChannelPool::builder(ClientConfig::new().with_auth_token("my-token"))
//!     .with_interceptor(TenantInterceptor::new("acme"))
//!     .build();
//! ```
//!
//! ### With Resilience
//! ```ignore
//! use grpc_harness::ResilienceManager;
//!
//! let resilience = ResilienceManager::new();
//! let campaign = resilience
//!     .execute_with_resilience(|| async { client.execute_unary(method, request.clone(), call).await.into_result() })
//!     .await?;
//! ```

pub mod assertions;
pub mod channel;
pub mod chaos;
pub mod client;
pub mod config;
pub mod contract;
pub mod error;
pub mod executor;
pub mod interceptors;
pub mod resilience;
pub mod response;
pub mod retry;
pub mod streaming;

// Re-export main types and functions for convenience
pub use channel::{
    ChannelKey, ChannelPool, ChannelPoolBuilder, ChannelState, PooledChannel, ShutdownOutcome,
    ShutdownReport,
};
pub use client::{ConfigurableClient, GrpcClient, configure_client, with_compression, with_limits};
pub use config::ClientConfig;
pub use contract::{ContractValidator, FieldSchema, FieldType, MessageSchema, ValidationResult};
pub use error::{Classify, ErrorCategory, GrpcError, GrpcResult};
pub use executor::{execute_unary, execute_with_deadline};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ResilienceError, ResilienceManager,
};
pub use response::GrpcResponse;
pub use retry::{Backoff, RetryConfig, retry, retry_with_backoff};
pub use streaming::StreamingCollector;

// Re-export interceptors for convenience
pub use interceptors::{
    AuthInterceptor, HeaderCaptureInterceptor, Interceptor, InterceptorChain, LoggingInterceptor,
    MetricsInterceptor, RetryInterceptor,
};
