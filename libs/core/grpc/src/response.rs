use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

/// Outcome of one unary call: payload or failure, plus metadata and latency
///
/// Exactly one of two shapes:
/// - success: `code == OK`, payload present, description empty
/// - failure: `code != OK`, payload absent, description from the status
///
/// Unary success delivers headers and trailers as one merged map (`headers`);
/// failures carry their metadata on the status, exposed as `trailers`.
#[derive(Debug, Clone)]
pub struct GrpcResponse<T> {
  payload: Option<T>,
  code: Code,
  description: String,
  headers: Option<MetadataMap>,
  trailers: Option<MetadataMap>,
  latency: Duration,
}

impl<T> GrpcResponse<T> {
  pub fn success(payload: T, headers: Option<MetadataMap>, latency: Duration) -> Self {
    Self {
      payload: Some(payload),
      code: Code::Ok,
      description: String::new(),
      headers,
      trailers: None,
      latency,
    }
  }

  /// Envelope for a failed call. A status carrying `OK` is recorded as
  /// `UNKNOWN` so the envelope can never be a payload-less success.
  pub fn failure(status: &Status, latency: Duration) -> Self {
    let (code, description) = match status.code() {
      Code::Ok => (Code::Unknown, format!("call failed with an OK status: {}", status.message())),
      code => (code, status.message().to_string()),
    };
    Self {
      payload: None,
      code,
      description,
      headers: None,
      trailers: Some(status.metadata().clone()),
      latency,
    }
  }

  pub fn from_result(result: Result<tonic::Response<T>, Status>, latency: Duration) -> Self {
    match result {
      Ok(response) => {
        let (metadata, payload, _extensions) = response.into_parts();
        Self::success(payload, Some(metadata), latency)
      }
      Err(status) => Self::failure(&status, latency),
    }
  }

  pub fn is_success(&self) -> bool {
    self.code == Code::Ok
  }

  pub fn payload(&self) -> Option<&T> {
    self.payload.as_ref()
  }

  pub fn into_payload(self) -> Option<T> {
    self.payload
  }

  pub fn code(&self) -> Code {
    self.code
  }

  /// Failure description, empty on success
  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn headers(&self) -> Option<&MetadataMap> {
    self.headers.as_ref()
  }

  pub fn trailers(&self) -> Option<&MetadataMap> {
    self.trailers.as_ref()
  }

  /// ASCII header value from the response headers
  pub fn header(&self, key: &str) -> Option<&str> {
    self.headers.as_ref()?.get(key)?.to_str().ok()
  }

  pub fn latency(&self) -> Duration {
    self.latency
  }

  pub fn latency_ms(&self) -> u64 {
    u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
  }

  /// Back to a `Result`, rebuilding the status for failures
  pub fn into_result(self) -> Result<T, Status> {
    match self.payload {
      Some(payload) if self.code == Code::Ok => Ok(payload),
      _ => Err(Status::with_metadata(
        self.code,
        self.description,
        self.trailers.unwrap_or_default(),
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_success_shape() {
    let mut headers = MetadataMap::new();
    headers.insert("x-campaign-version", "7".parse().unwrap());
    let response = GrpcResponse::success("payload", Some(headers), Duration::from_millis(12));

    assert!(response.is_success());
    assert_eq!(response.code(), Code::Ok);
    assert_eq!(response.payload(), Some(&"payload"));
    assert_eq!(response.description(), "");
    assert_eq!(response.header("x-campaign-version"), Some("7"));
    assert!(response.trailers().is_none());
    assert_eq!(response.latency_ms(), 12);
  }

  #[test]
  fn test_failure_shape() {
    let status = Status::not_found("campaign 42 not found");
    let response = GrpcResponse::<String>::failure(&status, Duration::from_millis(3));

    assert!(!response.is_success());
    assert_eq!(response.code(), Code::NotFound);
    assert!(response.payload().is_none());
    assert_eq!(response.description(), "campaign 42 not found");
    assert!(response.headers().is_none());
    assert!(response.trailers().is_some());
  }

  #[test]
  fn test_ok_status_failure_is_recorded_as_unknown() {
    let response = GrpcResponse::<()>::failure(&Status::new(Code::Ok, "odd"), Duration::ZERO);
    assert_eq!(response.code(), Code::Unknown);
    assert!(!response.is_success());
  }

  #[test]
  fn test_from_result_and_back() {
    let ok = GrpcResponse::from_result(Ok(tonic::Response::new(5u32)), Duration::ZERO);
    assert_eq!(ok.into_result().unwrap(), 5);

    let failed =
      GrpcResponse::<u32>::from_result(Err(Status::unavailable("down")), Duration::ZERO);
    let status = failed.into_result().unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), "down");
  }
}
