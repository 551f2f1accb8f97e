//! Typed clients bound to a pooled channel

use crate::channel::{ChannelPool, PooledChannel};
use crate::config::ClientConfig;
use crate::error::GrpcResult;
use crate::executor;
use crate::interceptors::Payload;
use crate::response::GrpcResponse;
use std::future::Future;
use std::time::Duration;
use tonic::Status;
use tonic::codec::CompressionEncoding;

/// Trait for configurable gRPC clients
///
/// Generated tonic clients have all of these methods but no shared trait, so
/// implement this once per client type you want to configure:
///
/// ```ignore
/// impl ConfigurableClient for CampaignServiceClient<Channel> {
///     fn accept_compressed(self, e: CompressionEncoding) -> Self { self.accept_compressed(e) }
///     fn send_compressed(self, e: CompressionEncoding) -> Self { self.send_compressed(e) }
///     fn max_decoding_message_size(self, l: usize) -> Self { self.max_decoding_message_size(l) }
///     fn max_encoding_message_size(self, l: usize) -> Self { self.max_encoding_message_size(l) }
/// }
/// ```
pub trait ConfigurableClient: Sized {
    /// Accept compressed responses
    fn accept_compressed(self, encoding: CompressionEncoding) -> Self;

    /// Send compressed requests
    fn send_compressed(self, encoding: CompressionEncoding) -> Self;

    /// Set maximum size for incoming messages
    fn max_decoding_message_size(self, limit: usize) -> Self;

    /// Set maximum size for outgoing messages
    fn max_encoding_message_size(self, limit: usize) -> Self;
}

/// Apply the message size limit and compression from `config` to a generated client
///
/// ## Example
/// ```ignore
/// let channel = pool.get_default_channel()?;
/// let client = configure_client(CampaignServiceClient::new(channel.transport()), pool.config());
/// ```
pub fn configure_client<T>(client: T, config: &ClientConfig) -> T
where
    T: ConfigurableClient,
{
    let client = client.max_decoding_message_size(config.max_inbound_message_size);
    match config.compression {
        Some(encoding) => with_compression(client, encoding),
        None => client,
    }
}

/// Apply compression configuration to any tonic client
pub fn with_compression<T>(client: T, encoding: CompressionEncoding) -> T
where
    T: ConfigurableClient,
{
    client
        .accept_compressed(encoding)
        .send_compressed(encoding)
}

/// Apply message size limits to any tonic client
///
/// ## Example
/// ```ignore
/// let client = with_limits(
///     CampaignServiceClient::new(channel.transport()),
///     16 * 1024 * 1024,  // 16MB max incoming
///     16 * 1024 * 1024   // 16MB max outgoing
/// );
/// ```
pub fn with_limits<T>(client: T, max_decoding: usize, max_encoding: usize) -> T
where
    T: ConfigurableClient,
{
    client
        .max_decoding_message_size(max_decoding)
        .max_encoding_message_size(max_encoding)
}

/// Service client bound to one pooled channel
///
/// Calls go through the pool's interceptor chain and come back as
/// [`GrpcResponse`] envelopes.
///
/// ## Example
/// ```ignore
/// let client = GrpcClient::connect(&pool, "campaigns.internal", 9090)?;
/// let stub = configure_client(CampaignServiceClient::new(client.transport()), pool.config());
///
/// let response = client
///     .execute_unary(
///         "campaign.v1.CampaignService/GetCampaign",
///         GetCampaignRequest { id: "42".into() },
///         |req| {
///             let mut stub = stub.clone();
///             async move { stub.get_campaign(req).await }
///         },
///     )
///     .await;
/// ```
#[derive(Clone, Debug)]
pub struct GrpcClient {
    channel: PooledChannel,
}

impl GrpcClient {
    pub fn new(channel: PooledChannel) -> Self {
        Self { channel }
    }

    pub fn connect(pool: &ChannelPool, host: &str, port: u16) -> GrpcResult<Self> {
        pool.get_channel(host, port).map(Self::new)
    }

    /// Client for the pool's default target
    pub fn connect_default(pool: &ChannelPool) -> GrpcResult<Self> {
        pool.get_default_channel().map(Self::new)
    }

    pub fn channel(&self) -> &PooledChannel {
        &self.channel
    }

    /// The tonic channel, for building generated stubs
    pub fn transport(&self) -> tonic::transport::Channel {
        self.channel.transport()
    }

    pub async fn execute_unary<Req, Resp, F, Fut>(
        &self,
        method: &str,
        message: Req,
        callable: F,
    ) -> GrpcResponse<Resp>
    where
        Req: Payload + Clone,
        Resp: Payload + Clone,
        F: Fn(tonic::Request<Req>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send,
    {
        executor::execute_unary(tonic::Request::new(message), |request| {
            self.channel.unary(method, request, callable)
        })
        .await
    }

    /// Like [`execute_unary`](Self::execute_unary) with a per-call deadline
    pub async fn execute_with_deadline<Req, Resp, F, Fut>(
        &self,
        method: &str,
        message: Req,
        callable: F,
        timeout: Duration,
    ) -> GrpcResponse<Resp>
    where
        Req: Payload + Clone,
        Resp: Payload + Clone,
        F: Fn(tonic::Request<Req>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send,
    {
        executor::execute_with_deadline(
            tonic::Request::new(message),
            |request| self.channel.unary(method, request, callable),
            timeout,
        )
        .await
    }
}
