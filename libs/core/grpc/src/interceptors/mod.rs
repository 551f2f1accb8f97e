//! Interceptor chain for unary calls
//!
//! Every interceptor sees the outbound call (method, metadata, message) and
//! decides when to hand it to the rest of the chain through [`Next`]. Because
//! the interceptor owns that hand-off it can run code on the way in and on the
//! way out, and it can re-issue the call (see [`RetryInterceptor`]).
//!
//! Chain order is outermost first. [`InterceptorChain::wrap`] makes the new
//! interceptor the outermost layer, so the interceptor added last sees the
//! outbound call first and the inbound result last.
//!
//! # Example
//! ```ignore
//! use grpc_harness::interceptors::*;
//!
//! let chain = InterceptorChain::new()
//!     .wrap(LoggingInterceptor::new())
//!     .wrap(AuthInterceptor::bearer("token"))
//!     .wrap(RetryInterceptor::new(3, Duration::from_millis(100)));
//!
//! assert_eq!(chain.names(), ["retry", "auth", "logging"]);
//! ```

pub mod auth;
pub mod header_capture;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use auth::AuthInterceptor;
pub use header_capture::HeaderCaptureInterceptor;
pub use logging::LoggingInterceptor;
pub use metrics::{CallMetrics, CallMetricsSnapshot, MetricsInterceptor};
pub use retry::RetryInterceptor;

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tonic::Status;
use tonic::metadata::MetadataMap;

/// A request or response message as seen by interceptors
///
/// Implemented for every `Serialize + Debug` message, which covers prost
/// messages generated with serde derives.
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    /// JSON rendering used for payload logging
    fn to_json(&self) -> Result<String, serde_json::Error>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Payload for T
where
    T: serde::Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The outbound half of a unary call
#[derive(Clone, Debug)]
pub struct OutboundCall {
    method: Arc<str>,
    attempt: u32,
    metadata: MetadataMap,
    message: Arc<dyn Payload>,
}

impl OutboundCall {
    pub fn new(method: impl Into<Arc<str>>, metadata: MetadataMap, message: Arc<dyn Payload>) -> Self {
        Self {
            method: method.into(),
            attempt: 1,
            metadata,
            message,
        }
    }

    /// Full method name, e.g. `campaign.v1.CampaignService/GetCampaign`
    pub fn method(&self) -> &str {
        &self.method
    }

    /// 1 for the initial issue, incremented on every re-issue
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn message(&self) -> &dyn Payload {
        self.message.as_ref()
    }

    pub fn message_arc(&self) -> Arc<dyn Payload> {
        Arc::clone(&self.message)
    }
}

/// The inbound half of a successful unary call
#[derive(Debug)]
pub struct InboundResponse {
    /// Response metadata (tonic merges trailers into this map for unary calls)
    pub headers: MetadataMap,
    pub message: Arc<dyn Payload>,
}

impl InboundResponse {
    pub fn new(headers: MetadataMap, message: Arc<dyn Payload>) -> Self {
        Self { headers, message }
    }
}

pub type CallResult = Result<InboundResponse, Status>;

/// A single layer of the chain
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Short name used for introspection and logs
    fn name(&self) -> &'static str;

    /// Handle `call`, usually by running `next` once and observing the result
    async fn intercept(&self, call: OutboundCall, next: Next<'_>) -> CallResult;
}

/// The end of the chain: actually sends the call
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, call: OutboundCall) -> CallResult;
}

/// The remainder of the chain after the current interceptor
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors and the transport
    ///
    /// `Next` is `Copy`, so an interceptor may call this more than once.
    pub async fn run(self, call: OutboundCall) -> CallResult {
        match self.rest.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    rest: tail,
                    transport: self.transport,
                };
                head.intercept(call, next).await
            }
            None => self.transport.send(call).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.rest.iter().map(|i| i.name()).collect();
        f.debug_struct("Next").field("rest", &names).finish()
    }
}

/// Ordered interceptors, outermost first
#[derive(Clone, Default)]
pub struct InterceptorChain {
    layers: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the current chain: `interceptor` becomes the outermost layer
    pub fn wrap(self, interceptor: impl Interceptor) -> Self {
        self.wrap_arc(Arc::new(interceptor))
    }

    pub fn wrap_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.layers.insert(0, interceptor);
        self
    }

    /// Interceptor names in outbound order
    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `call` through every layer and finally `transport`
    pub async fn execute(&self, call: OutboundCall, transport: &dyn Transport) -> CallResult {
        Next {
            rest: &self.layers,
            transport,
        }
        .run(call)
        .await
    }

    /// Run a typed unary call through the chain
    ///
    /// `callable` performs the actual RPC, typically a generated stub method:
    /// ```ignore
    /// let response = chain
    ///     .unary("campaign.v1.CampaignService/GetCampaign", request, |req| {
    ///         let mut client = client.clone();
    ///         async move { client.get_campaign(req).await }
    ///     })
    ///     .await?;
    /// ```
    /// `callable` is invoked once per issue of the call, so interceptors that
    /// re-issue (retry) invoke it several times with fresh requests.
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
        let (metadata, _extensions, message) = request.into_parts();
        let message = Arc::new(message);
        let call = OutboundCall::new(method, metadata, Arc::clone(&message) as Arc<dyn Payload>);
        let stub = UnaryStub {
            message,
            callable,
            _marker: PhantomData,
        };

        let InboundResponse { headers, message } = self.execute(call, &stub).await?;
        let message = message.into_any().downcast::<Resp>().map_err(|_| {
            Status::internal(format!(
                "an interceptor replaced the {method} response with a different message type"
            ))
        })?;

        Ok(tonic::Response::from_parts(
            headers,
            Arc::unwrap_or_clone(message),
            tonic::Extensions::default(),
        ))
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Transport that hands the call to a typed stub method
struct UnaryStub<Req, Resp, F, Fut> {
    message: Arc<Req>,
    callable: F,
    _marker: PhantomData<fn() -> (Resp, Fut)>,
}

#[async_trait]
impl<Req, Resp, F, Fut> Transport for UnaryStub<Req, Resp, F, Fut>
where
    Req: Payload + Clone,
    Resp: Payload,
    F: Fn(tonic::Request<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send,
{
    async fn send(&self, call: OutboundCall) -> CallResult {
        // The stub always sends the original typed message; interceptors may
        // rewrite metadata but not the request body.
        let request = tonic::Request::from_parts(
            call.metadata,
            tonic::Extensions::default(),
            Req::clone(&self.message),
        );
        let (headers, message, _extensions) = (self.callable)(request).await?.into_parts();
        Ok(InboundResponse::new(headers, Arc::new(message)))
    }
}
