use super::{CallResult, Interceptor, Next, OutboundCall};
use crate::config::ClientConfig;
use async_trait::async_trait;
use std::fmt;
use tonic::metadata::MetadataMap;
use tonic::{Request, Status};

/// Interceptor for injecting the `authorization` header
///
/// Without a token the interceptor passes calls through untouched, so it can
/// sit in the chain unconditionally.
///
/// # Example
/// ```ignore
/// use grpc_harness::interceptors::{AuthInterceptor, InterceptorChain};
///
/// let chain = InterceptorChain::new().wrap(AuthInterceptor::bearer("my-jwt-token"));
/// ```
#[derive(Clone, Default)]
pub struct AuthInterceptor {
    header_value: Option<String>,
}

impl AuthInterceptor {
    /// Send `Bearer <token>`. An empty token disables the interceptor.
    ///
    /// # Example
    /// ```ignore
    /// let auth = AuthInterceptor::bearer("eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...");
    /// ```
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            header_value: (!token.is_empty()).then(|| format!("Bearer {token}")),
        }
    }

    /// Send a custom authorization header value verbatim
    ///
    /// # Example
    /// ```ignore
    /// let auth = AuthInterceptor::custom("Basic dXNlcjpwYXNz");
    /// ```
    pub fn custom(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            header_value: (!value.is_empty()).then_some(value),
        }
    }

    /// Bearer auth from `auth_enabled`/`auth_token`
    pub fn from_config(config: &ClientConfig) -> Self {
        config
            .effective_auth_token()
            .map(Self::bearer)
            .unwrap_or_default()
    }

    /// Whether calls will carry an authorization header
    pub fn is_active(&self) -> bool {
        self.header_value.is_some()
    }

    fn apply(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        if let Some(value) = &self.header_value {
            metadata.insert(
                "authorization",
                value
                    .parse()
                    .map_err(|_| Status::internal("Invalid auth header"))?,
            );
        }
        Ok(())
    }
}

impl fmt::Debug for AuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInterceptor")
            .field("active", &self.is_active())
            .finish()
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn intercept(&self, mut call: OutboundCall, next: Next<'_>) -> CallResult {
        self.apply(call.metadata_mut())?;
        next.run(call).await
    }
}

/// Also usable directly on generated clients: `Client::with_interceptor(channel, auth)`
impl tonic::service::Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        self.apply(request.metadata_mut())?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::InterceptorChain;
    use crate::interceptors::test_support::{Echo, call};

    #[test]
    fn test_bearer_token() {
        let mut auth = AuthInterceptor::bearer("test-token");
        let req = tonic::service::Interceptor::call(&mut auth, Request::new(())).unwrap();
        let auth_header = req.metadata().get("authorization").unwrap();
        assert_eq!(auth_header, "Bearer test-token");
    }

    #[test]
    fn test_custom() {
        let mut auth = AuthInterceptor::custom("Basic xyz123");
        let req = tonic::service::Interceptor::call(&mut auth, Request::new(())).unwrap();
        assert_eq!(req.metadata().get("authorization").unwrap(), "Basic xyz123");
    }

    #[test]
    fn test_empty_token_is_a_no_op() {
        let mut auth = AuthInterceptor::bearer("");
        assert!(!auth.is_active());
        let req = tonic::service::Interceptor::call(&mut auth, Request::new(())).unwrap();
        assert!(req.metadata().get("authorization").is_none());
    }

    #[test]
    fn test_from_config_requires_enabled_flag() {
        let mut config = ClientConfig::new();
        config.auth_token = Some("abc".to_string());
        assert!(!AuthInterceptor::from_config(&config).is_active());

        config.auth_enabled = true;
        assert!(AuthInterceptor::from_config(&config).is_active());
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let auth = AuthInterceptor::bearer("super-secret");
        assert!(!format!("{auth:?}").contains("super-secret"));
    }

    #[test]
    fn test_invalid_header_value_is_rejected() {
        let mut auth = AuthInterceptor::custom("line\nbreak");
        let err = tonic::service::Interceptor::call(&mut auth, Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_header_added_in_chain() {
        let chain = InterceptorChain::new().wrap(AuthInterceptor::bearer("chain-token"));
        // Echo returns the outbound metadata as response headers
        let response = chain.execute(call("svc/Method"), &Echo).await.unwrap();
        assert_eq!(
            response.headers.get("authorization").unwrap(),
            "Bearer chain-token"
        );
    }
}
