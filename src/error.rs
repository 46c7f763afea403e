//! Error taxonomy and the wire error envelope.
//!
//! Every user-visible failure renders as
//! `{"error": {"type": ..., "message": ..., "code"?: ..., "param"?: ...}}`
//! with the HTTP status dictated by the kind. The `type` strings follow the
//! upstream vendor contract (`invalid_request_error`, `card_error`, ...), not
//! the internal kind names.

use http::StatusCode;
use serde_json::{Value, json};

use crate::responder::{Responder, json_response};
use crate::types::Response;

/// Classified request failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed parameter, bad form shape.
    InvalidRequest,
    /// Referenced resource does not exist.
    NotFound,
    /// Missing or invalid API key.
    Authentication,
    /// A request with the same idempotency key is in flight.
    IdempotencyConflict,
    /// Simulated card decline.
    Card,
    /// Injected API rate limit.
    RateLimited,
    /// Injected server failure.
    ServerError,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorKind::Card => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn wire_type(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest | ErrorKind::NotFound | ErrorKind::Authentication => {
                "invalid_request_error"
            }
            ErrorKind::IdempotencyConflict => "idempotency_error",
            ErrorKind::Card => "card_error",
            ErrorKind::RateLimited => "rate_limit_error",
            ErrorKind::ServerError | ErrorKind::Internal => "api_error",
        }
    }
}

/// A user-visible API error, carrying everything the envelope needs.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::error::ApiError;
/// use paper_tiger::responder::Responder;
///
/// let err = ApiError::not_found("customer", "cus_x");
/// let response = err.into_response();
/// assert_eq!(response.status(), 404);
///
/// let err = ApiError::invalid_request("Missing required param: email.").with_param("email");
/// assert_eq!(err.envelope()["error"]["param"], "email");
/// ```
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub param: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            param: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// The canonical miss message: `No such customer: 'cus_x'`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::error::ApiError;
    ///
    /// let err = ApiError::not_found("invoice", "in_missing");
    /// assert_eq!(err.message, "No such invoice: 'in_missing'");
    /// ```
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("No such {resource}: '{id}'"))
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn idempotency_conflict(key: &str) -> Self {
        Self::new(
            ErrorKind::IdempotencyConflict,
            format!("A request with idempotency key '{key}' is currently in flight."),
        )
    }

    pub fn card(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Card, message).with_code(code)
    }

    pub fn rate_limited() -> Self {
        Self::new(
            ErrorKind::RateLimited,
            "Too many requests. Please retry shortly.",
        )
    }

    pub fn server_error() -> Self {
        Self::new(
            ErrorKind::ServerError,
            "Something went wrong on the mock server's end.",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Envelope body without the surrounding HTTP response.
    pub fn envelope(&self) -> Value {
        let mut error = json!({
            "type": self.kind.wire_type(),
            "message": self.message,
        });
        if let Some(code) = &self.code {
            error["code"] = json!(code);
        }
        if let Some(param) = &self.param {
            error["param"] = json!(param);
        }
        json!({ "error": error })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.wire_type(), self.message)
    }
}

impl std::error::Error for ApiError {}

/// Renders the error as its HTTP response: status from the kind, body from
/// [`ApiError::envelope`].
///
/// # Examples
///
/// ```rust
/// use paper_tiger::error::ApiError;
/// use paper_tiger::responder::Responder;
///
/// let response = ApiError::rate_limited().into_response();
/// assert_eq!(response.status(), 429);
/// ```
impl Responder for ApiError {
    fn into_response(self) -> Response {
        json_response(self.kind.status(), &self.envelope())
    }
}
