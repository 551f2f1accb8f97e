use super::{CallResult, Interceptor, Next, OutboundCall};
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free counters for one method
#[derive(Debug)]
pub struct CallMetrics {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_latency_us: AtomicU64,
    min_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
        }
    }
}

impl CallMetrics {
    pub fn record_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, latency: Duration, success: bool) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.min_latency_us.fetch_min(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        let min = self.min_latency_us.load(Ordering::Relaxed);
        CallMetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed)),
            min_latency: Duration::from_micros(if min == u64::MAX { 0 } else { min }),
            max_latency: Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`CallMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallMetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl CallMetricsSnapshot {
    pub fn completed_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls
    }

    /// Calls started but not yet completed
    pub fn in_flight(&self) -> u64 {
        self.total_calls.saturating_sub(self.completed_calls())
    }

    pub fn average_latency(&self) -> Duration {
        match self.completed_calls() {
            0 => Duration::ZERO,
            n => self.total_latency / u32::try_from(n).unwrap_or(u32::MAX),
        }
    }

    /// Percentage of started calls that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64 * 100.0
    }
}

/// Per-method call counters and latency
///
/// Clones share the same registry, so the pool can keep a handle for queries
/// while the chain records into it. Every call is also reported through the
/// `metrics` facade as `grpc_client_calls_total` and
/// `grpc_client_call_duration_seconds`.
///
/// # Example
/// ```ignore
/// let metrics = MetricsInterceptor::new();
/// let chain = InterceptorChain::new().wrap(metrics.clone());
///
/// // Later, check metrics
/// let snapshot = metrics.metrics("campaign.v1.CampaignService/GetCampaign");
/// ```
#[derive(Clone, Debug, Default)]
pub struct MetricsInterceptor {
    calls: Arc<DashMap<String, Arc<CallMetrics>>>,
}

impl MetricsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for one method, `None` if it was never called
    pub fn metrics(&self, method: &str) -> Option<CallMetricsSnapshot> {
        self.calls.get(method).map(|m| m.value().snapshot())
    }

    /// Snapshots for every method seen so far
    pub fn all_metrics(&self) -> Vec<(String, CallMetricsSnapshot)> {
        let mut all: Vec<_> = self
            .calls
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop all recorded data
    pub fn reset(&self) {
        self.calls.clear();
    }

    fn for_method(&self, method: &str) -> Arc<CallMetrics> {
        if let Some(existing) = self.calls.get(method) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.calls.entry(method.to_string()).or_default().value())
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn intercept(&self, call: OutboundCall, next: Next<'_>) -> CallResult {
        let method = call.method().to_string();
        let metrics = self.for_method(&method);
        metrics.record_start();

        let start = Instant::now();
        let result = next.run(call).await;
        let latency = start.elapsed();

        let status = match &result {
            Ok(_) => "OK".to_string(),
            Err(status) => format!("{:?}", status.code()),
        };
        metrics.record_completion(latency, result.is_ok());

        counter!("grpc_client_calls_total", "method" => method.clone(), "status" => status.clone())
            .increment(1);
        histogram!("grpc_client_call_duration_seconds", "method" => method.clone())
            .record(latency.as_secs_f64());

        tracing::debug!(
            target: "grpc_client",
            method = %method,
            status = %status,
            latency_ms = latency.as_millis() as u64,
            "gRPC call metrics"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::InterceptorChain;
    use crate::interceptors::test_support::{Echo, Failing, call};
    use tonic::Status;

    #[test]
    fn test_snapshot_of_fresh_metrics() {
        let snapshot = CallMetrics::default().snapshot();
        assert_eq!(snapshot, CallMetricsSnapshot::default());
        assert_eq!(snapshot.average_latency(), Duration::ZERO);
        assert_eq!(snapshot.success_rate(), 0.0);
    }

    #[test]
    fn test_latency_aggregation() {
        let metrics = CallMetrics::default();
        for (ms, ok) in [(10, true), (30, false), (20, true)] {
            metrics.record_start();
            metrics.record_completion(Duration::from_millis(ms), ok);
        }
        metrics.record_start();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.in_flight(), 1);
        assert_eq!(snapshot.min_latency, Duration::from_millis(10));
        assert_eq!(snapshot.max_latency, Duration::from_millis(30));
        assert_eq!(snapshot.average_latency(), Duration::from_millis(20));
        assert_eq!(snapshot.success_rate(), 50.0);
    }

    #[tokio::test]
    async fn test_metrics_counting() {
        let metrics = MetricsInterceptor::new();
        let chain = InterceptorChain::new().wrap(metrics.clone());
        assert!(metrics.metrics("svc/A").is_none());

        chain.execute(call("svc/A"), &Echo).await.unwrap();
        chain.execute(call("svc/A"), &Echo).await.unwrap();
        let _ = chain
            .execute(call("svc/B"), &Failing(Status::internal("boom")))
            .await;

        let a = metrics.metrics("svc/A").unwrap();
        assert_eq!(a.total_calls, 2);
        assert_eq!(a.successful_calls, 2);
        let b = metrics.metrics("svc/B").unwrap();
        assert_eq!(b.failed_calls, 1);
        assert_eq!(b.in_flight(), 0);

        let methods: Vec<_> = metrics.all_metrics().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, ["svc/A", "svc/B"]);

        metrics.reset();
        assert!(metrics.metrics("svc/A").is_none());
    }
}
