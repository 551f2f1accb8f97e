//! Fluent assertions over [`GrpcResponse`] envelopes for tests
//!
//! Field checks go through caller-supplied accessors instead of reflection:
//!
//! ```ignore
//! let fields = FieldAccessors::<Campaign>::new()
//!     .field("name", |c| c.name.clone())
//!     .optional_field("end_date", |c| c.end_date.map(|d| d.to_string()));
//!
//! assert_that(&response)
//!     .has_status_ok()
//!     .latency_less_than(Duration::from_millis(200))
//!     .has_field(&fields, "name", "Spring sale")
//!     .has_field_empty(&fields, "end_date");
//! ```

use crate::response::GrpcResponse;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tonic::Code;

type Accessor<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Named field readers for a payload type
pub struct FieldAccessors<T> {
    accessors: HashMap<&'static str, Accessor<T>>,
}

impl<T> Default for FieldAccessors<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FieldAccessors<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.accessors.keys().collect();
        names.sort();
        f.debug_struct("FieldAccessors").field("fields", &names).finish()
    }
}

impl<T> FieldAccessors<T> {
    pub fn new() -> Self {
        Self {
            accessors: HashMap::new(),
        }
    }

    /// Field that always has a value; an empty string counts as empty
    pub fn field<F, V>(mut self, name: &'static str, accessor: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: ToString,
    {
        self.accessors.insert(
            name,
            Box::new(move |payload| Some(accessor(payload).to_string()).filter(|v| !v.is_empty())),
        );
        self
    }

    /// Field that may be unset (proto3 `optional`, message-typed fields)
    pub fn optional_field<F>(mut self, name: &'static str, accessor: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.accessors.insert(name, Box::new(accessor));
        self
    }

    fn read(&self, payload: &T, name: &str) -> Result<Option<String>, String> {
        self.accessors
            .get(name)
            .map(|accessor| accessor(payload))
            .ok_or_else(|| format!("No accessor registered for field '{name}'"))
    }
}

/// Start an assertion chain on `response`
pub fn assert_that<T>(response: &GrpcResponse<T>) -> ResponseAssert<'_, T> {
    ResponseAssert { response }
}

/// Chainable checks; every method panics with a description on failure
#[derive(Debug)]
pub struct ResponseAssert<'a, T> {
    response: &'a GrpcResponse<T>,
}

impl<'a, T> ResponseAssert<'a, T> {
    #[track_caller]
    pub fn has_status_ok(self) -> Self {
        if !self.response.is_success() {
            panic!(
                "Expected status OK but was <{:?}> with description: {}",
                self.response.code(),
                self.response.description()
            );
        }
        self
    }

    #[track_caller]
    pub fn has_status(self, expected: Code) -> Self {
        if self.response.code() != expected {
            panic!(
                "Expected status <{expected:?}> but was <{:?}>",
                self.response.code()
            );
        }
        self
    }

    #[track_caller]
    pub fn latency_less_than(self, max: Duration) -> Self {
        let latency = self.response.latency();
        if latency >= max {
            panic!("Expected latency less than {max:?} but was {latency:?}");
        }
        self
    }

    #[track_caller]
    pub fn latency_greater_than(self, min: Duration) -> Self {
        let latency = self.response.latency();
        if latency <= min {
            panic!("Expected latency greater than {min:?} but was {latency:?}");
        }
        self
    }

    #[track_caller]
    pub fn has_header(self, key: &str) -> Self {
        if self.response.header(key).is_none() {
            panic!("Expected header '{key}' to be present");
        }
        self
    }

    #[track_caller]
    pub fn has_header_value(self, key: &str, expected: &str) -> Self {
        match self.response.header(key) {
            Some(value) if value == expected => {}
            other => panic!("Expected header '{key}' to be <{expected}> but was <{other:?}>"),
        }
        self
    }

    #[track_caller]
    pub fn has_error_description_containing(self, text: &str) -> Self {
        if self.response.is_success() {
            panic!("Expected an error containing '{text}' but the call succeeded");
        }
        if !self.response.description().contains(text) {
            panic!(
                "Expected error description to contain '{text}' but was: {}",
                self.response.description()
            );
        }
        self
    }

    #[track_caller]
    pub fn has_field(self, fields: &FieldAccessors<T>, name: &str, expected: &str) -> Self {
        let actual = self.field_value(fields, name);
        if actual.as_deref() != Some(expected) {
            panic!("Expected field '{name}' to be <{expected}> but was <{actual:?}>");
        }
        self
    }

    #[track_caller]
    pub fn has_field_present(self, fields: &FieldAccessors<T>, name: &str) -> Self {
        if self.field_value(fields, name).is_none() {
            panic!("Expected field '{name}' to be present");
        }
        self
    }

    #[track_caller]
    pub fn has_field_empty(self, fields: &FieldAccessors<T>, name: &str) -> Self {
        if let Some(value) = self.field_value(fields, name) {
            panic!("Expected field '{name}' to be empty but was <{value}>");
        }
        self
    }

    /// Arbitrary check against the payload
    #[track_caller]
    pub fn satisfies<F>(self, description: &str, predicate: F) -> Self
    where
        F: FnOnce(&T) -> bool,
    {
        let payload = self.payload();
        if !predicate(payload) {
            panic!("Expected payload to satisfy: {description}");
        }
        self
    }

    #[track_caller]
    fn payload(&self) -> &'a T {
        match self.response.payload() {
            Some(payload) => payload,
            None => panic!(
                "Expected a payload but the call failed with <{:?}>: {}",
                self.response.code(),
                self.response.description()
            ),
        }
    }

    #[track_caller]
    fn field_value(&self, fields: &FieldAccessors<T>, name: &str) -> Option<String> {
        let payload = self.payload();
        fields.read(payload, name).unwrap_or_else(|message| panic!("{message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Status;
    use tonic::metadata::MetadataMap;

    #[derive(Debug, Clone)]
    struct Campaign {
        name: String,
        budget: i64,
        end_date: Option<String>,
    }

    fn accessors() -> FieldAccessors<Campaign> {
        FieldAccessors::new()
            .field("name", |c: &Campaign| c.name.clone())
            .field("budget", |c: &Campaign| c.budget)
            .optional_field("end_date", |c: &Campaign| c.end_date.clone())
    }

    fn ok_response() -> GrpcResponse<Campaign> {
        let mut headers = MetadataMap::new();
        headers.insert("x-request-id", "abc".parse().unwrap());
        GrpcResponse::success(
            Campaign {
                name: "Spring sale".into(),
                budget: 500,
                end_date: None,
            },
            Some(headers),
            Duration::from_millis(40),
        )
    }

    #[test]
    fn test_passing_chain() {
        let fields = accessors();
        assert_that(&ok_response())
            .has_status_ok()
            .has_status(Code::Ok)
            .latency_less_than(Duration::from_millis(100))
            .latency_greater_than(Duration::from_millis(10))
            .has_header("x-request-id")
            .has_header_value("x-request-id", "abc")
            .has_field(&fields, "name", "Spring sale")
            .has_field(&fields, "budget", "500")
            .has_field_present(&fields, "name")
            .has_field_empty(&fields, "end_date")
            .satisfies("budget is positive", |c| c.budget > 0);
    }

    #[test]
    fn test_failure_description() {
        let response =
            GrpcResponse::<Campaign>::failure(&Status::not_found("Resource not found: 42"), Duration::ZERO);
        assert_that(&response)
            .has_status(Code::NotFound)
            .has_error_description_containing("not found: 42");
    }

    #[test]
    #[should_panic(expected = "Expected status OK but was <Unavailable>")]
    fn test_status_ok_fails_on_error() {
        let response = GrpcResponse::<Campaign>::failure(&Status::unavailable("down"), Duration::ZERO);
        assert_that(&response).has_status_ok();
    }

    #[test]
    #[should_panic(expected = "Expected latency less than")]
    fn test_latency_bound() {
        assert_that(&ok_response()).latency_less_than(Duration::from_millis(5));
    }

    #[test]
    #[should_panic(expected = "Expected field 'end_date' to be present")]
    fn test_missing_optional_field() {
        assert_that(&ok_response()).has_field_present(&accessors(), "end_date");
    }

    #[test]
    #[should_panic(expected = "No accessor registered for field 'owner'")]
    fn test_unknown_field() {
        assert_that(&ok_response()).has_field(&accessors(), "owner", "bob");
    }

    #[test]
    #[should_panic(expected = "Expected a payload but the call failed")]
    fn test_field_check_on_failed_call() {
        let response = GrpcResponse::<Campaign>::failure(&Status::internal("boom"), Duration::ZERO);
        assert_that(&response).has_field_present(&accessors(), "name");
    }
}
