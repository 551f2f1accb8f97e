use super::{CallResult, Interceptor, Next, OutboundCall, Payload};
use crate::config::ClientConfig;
use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Logs request and response payloads as JSON
///
/// Each call gets a fresh call id so the request, response and failure records
/// of one call can be correlated. Failures are always logged; the request and
/// response records can be switched off independently.
#[derive(Clone, Debug)]
pub struct LoggingInterceptor {
    log_requests: bool,
    log_responses: bool,
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingInterceptor {
    /// Log both requests and responses
    pub fn new() -> Self {
        Self {
            log_requests: true,
            log_responses: true,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            log_requests: config.log_request_enabled,
            log_responses: config.log_response_enabled,
        }
    }

    pub fn with_requests(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn with_responses(mut self, enabled: bool) -> Self {
        self.log_responses = enabled;
        self
    }
}

/// JSON for `payload`, or its Debug form when it cannot be serialized
fn render(payload: &dyn Payload) -> String {
    match payload.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(target: "grpc_client", error = %e, "Failed to serialize payload for logging");
            format!("{payload:?}")
        }
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(&self, call: OutboundCall, next: Next<'_>) -> CallResult {
        let call_id = Uuid::new_v4();
        let method = call.method().to_string();

        if self.log_requests {
            info!(
                target: "grpc_client",
                %call_id,
                method = %method,
                attempt = call.attempt(),
                payload = %render(call.message()),
                "gRPC request"
            );
        }

        let result = next.run(call).await;

        match &result {
            Ok(response) if self.log_responses => {
                info!(
                    target: "grpc_client",
                    %call_id,
                    method = %method,
                    payload = %render(response.message.as_ref()),
                    "gRPC response"
                );
            }
            Ok(_) => {}
            Err(status) => {
                error!(
                    target: "grpc_client",
                    %call_id,
                    method = %method,
                    code = ?status.code(),
                    description = status.message(),
                    "gRPC call failed"
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::test_support::{Echo, Failing, Ping, call};
    use crate::interceptors::{InterceptorChain, OutboundCall};
    use serde::{Serialize, Serializer};
    use std::sync::Arc;
    use tonic::metadata::MetadataMap;
    use tonic::{Code, Status};

    #[derive(Debug)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not serializable"))
        }
    }

    #[test]
    fn test_render_json() {
        assert_eq!(render(&Ping { id: 3 }), r#"{"id":3}"#);
    }

    #[test]
    fn test_render_falls_back_to_debug() {
        assert_eq!(render(&Unserializable), "Unserializable");
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig::new().with_logging(true, false);
        let logging = LoggingInterceptor::from_config(&config);
        assert!(logging.log_requests);
        assert!(!logging.log_responses);
    }

    #[tokio::test]
    async fn test_serialization_failure_does_not_fail_call() {
        let chain = InterceptorChain::new().wrap(LoggingInterceptor::new());
        let call = OutboundCall::new("svc/Method", MetadataMap::new(), Arc::new(Unserializable));
        assert!(chain.execute(call, &Echo).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_passes_through_unchanged() {
        let chain = InterceptorChain::new().wrap(LoggingInterceptor::new().with_requests(false));
        let err = chain
            .execute(call("svc/Method"), &Failing(Status::unavailable("down")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(err.message(), "down");
    }
}
