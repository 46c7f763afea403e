//! Response generation utilities and trait implementations.
//!
//! This module provides the core [`Responder`] trait that lets handler
//! return values of different types be converted into HTTP responses:
//! strings, status-code tuples, pre-built responses, JSON documents, and
//! `Result`s thereof. The JSON impls set `Content-Type: application/json`,
//! which is what the emulated wire contract speaks everywhere.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::responder::{Json, Responder};
//! use http::StatusCode;
//! use serde_json::json;
//!
//! // String response
//! let response = "pong".into_response();
//! assert_eq!(response.status(), 200);
//!
//! // Status code with body
//! let response = (StatusCode::CREATED, "created").into_response();
//! assert_eq!(response.status(), 201);
//!
//! // JSON response
//! let response = Json(json!({"object": "customer"})).into_response();
//! assert_eq!(response.headers()["content-type"], "application/json");
//! ```

use bytes::Bytes;
use http::{StatusCode, header};
use http_body_util::Full;
use serde_json::Value;

use crate::types::Response;

/// Trait for converting handler return values into HTTP responses.
///
/// Route closures and middleware may return any type implementing this
/// trait; the router performs the conversion at dispatch time.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::responder::Responder;
/// use paper_tiger::types::Response;
/// use bytes::Bytes;
/// use http_body_util::Full;
///
/// struct Teapot;
///
/// impl Responder for Teapot {
///     fn into_response(self) -> Response {
///         let mut resp = Response::new(Full::from(Bytes::from("short and stout")));
///         *resp.status_mut() = http::StatusCode::IM_A_TEAPOT;
///         resp
///     }
/// }
/// ```
pub trait Responder {
    /// Converts the implementing type into an HTTP response.
    fn into_response(self) -> Response;
}

/// Pass-through for pre-built responses.
impl Responder for Response {
    fn into_response(self) -> Response {
        self
    }
}

/// Converts a static string slice into a 200 plain-text response.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::responder::Responder;
///
/// let response = "pong".into_response();
/// assert_eq!(response.status(), 200);
/// ```
impl Responder for &'static str {
    fn into_response(self) -> Response {
        Response::new(Full::from(Bytes::from_static(self.as_bytes())))
    }
}

/// Converts an owned string into a 200 plain-text response.
impl Responder for String {
    fn into_response(self) -> Response {
        Response::new(Full::from(Bytes::from(self)))
    }
}

/// Converts the unit type into an empty 200 response.
impl Responder for () {
    fn into_response(self) -> Response {
        Response::new(Full::from(Bytes::new()))
    }
}

/// Overrides the status of any inner responder.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::responder::Responder;
/// use http::StatusCode;
///
/// let response = (StatusCode::ACCEPTED, "queued").into_response();
/// assert_eq!(response.status(), 202);
/// ```
impl<R: Responder> Responder for (StatusCode, R) {
    fn into_response(self) -> Response {
        let mut resp = self.1.into_response();
        *resp.status_mut() = self.0;
        resp
    }
}

/// Lets fallible handlers return `Result<Json, ApiError>` directly: the `Ok`
/// and `Err` arms each render themselves.
impl<T, E> Responder for Result<T, E>
where
    T: Responder,
    E: Responder,
{
    fn into_response(self) -> Response {
        match self {
            Ok(v) => v.into_response(),
            Err(e) => e.into_response(),
        }
    }
}

/// JSON response wrapper; serializes the value and tags the content type.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::responder::{Json, Responder};
/// use serde_json::json;
///
/// let response = Json(json!({"deleted": true, "id": "cus_1"})).into_response();
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.headers()["content-type"], "application/json");
/// ```
pub struct Json(pub Value);

impl Responder for Json {
    fn into_response(self) -> Response {
        json_response(StatusCode::OK, &self.0)
    }
}

/// Builds a JSON response with the given status.
///
/// This is the single point where response bodies are serialized, used by
/// [`Json`] for 200s and by the error envelope for everything else.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::responder::json_response;
/// use http::StatusCode;
/// use serde_json::json;
///
/// let response = json_response(StatusCode::NOT_FOUND, &json!({
///     "error": {"type": "invalid_request_error", "message": "No such customer: 'cus_x'"}
/// }));
/// assert_eq!(response.status(), 404);
/// ```
pub fn json_response(status: StatusCode, value: &Value) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Full::from(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    resp
}
