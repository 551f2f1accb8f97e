use super::{CallResult, Interceptor, Next, OutboundCall};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tonic::metadata::MetadataMap;

/// Keeps the most recent response metadata per method
///
/// A successful call records its response metadata under [`headers`](Self::headers)
/// (for unary calls tonic delivers headers and trailers as one merged map). A
/// failed call records the status metadata under [`trailers`](Self::trailers),
/// matching how [`GrpcResponse`](crate::GrpcResponse) reports failures. Each
/// completed call replaces its method's previous capture on both sides.
///
/// Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct HeaderCaptureInterceptor {
    headers: Arc<DashMap<String, MetadataMap>>,
    trailers: Arc<DashMap<String, MetadataMap>>,
}

impl HeaderCaptureInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self, method: &str) -> Option<MetadataMap> {
        self.headers.get(method).map(|m| m.value().clone())
    }

    pub fn trailers(&self, method: &str) -> Option<MetadataMap> {
        self.trailers.get(method).map(|m| m.value().clone())
    }

    /// Convenience lookup of a single ASCII header value
    pub fn header_value(&self, method: &str, key: &str) -> Option<String> {
        let headers = self.headers.get(method)?;
        headers.get(key)?.to_str().ok().map(str::to_string)
    }

    pub fn clear(&self) {
        self.headers.clear();
        self.trailers.clear();
    }
}

#[async_trait]
impl Interceptor for HeaderCaptureInterceptor {
    fn name(&self) -> &'static str {
        "header-capture"
    }

    async fn intercept(&self, call: OutboundCall, next: Next<'_>) -> CallResult {
        let method = call.method().to_string();
        let result = next.run(call).await;

        match &result {
            Ok(response) => {
                self.trailers.remove(&method);
                self.headers.insert(method, response.headers.clone());
            }
            Err(status) => {
                self.headers.remove(&method);
                self.trailers.insert(method, status.metadata().clone());
            }
        }

        result
    }
}
