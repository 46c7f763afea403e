//! Core type aliases used throughout the mock server.
//!
//! This module provides the fundamental aliases that standardize the types
//! used across the crate for requests, responses, middleware, and handlers.
//! Requests arrive with their bodies already buffered to [`bytes::Bytes`]:
//! every emulated endpoint needs the whole payload (form/JSON parsing,
//! idempotency capture), so the server collects the hyper `Incoming` stream
//! up front and the rest of the crate works with plain in-memory requests.
//! Responses carry a [`http_body_util::Full`] body for the same reason — the
//! mock never streams.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::types::{Request, Response};
//! use bytes::Bytes;
//! use http_body_util::Full;
//!
//! let request: Request = http::Request::builder()
//!     .uri("/v1/customers")
//!     .body(Bytes::from("email=a%40b.com"))
//!     .unwrap();
//!
//! let response: Response = http::Response::new(Full::from(Bytes::from("{}")));
//! assert_eq!(response.status(), 200);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::Full;

use crate::middleware::Next;

/// HTTP request with a fully buffered body.
///
/// The server collects each incoming body into `Bytes` before dispatch, so
/// handlers and middleware can read it repeatedly without body-streaming
/// plumbing. Path parameters extracted by the router ride along in the
/// request extensions.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::types::Request;
/// use bytes::Bytes;
///
/// let req: Request = http::Request::builder()
///     .method(http::Method::POST)
///     .uri("/v1/customers")
///     .header("content-type", "application/x-www-form-urlencoded")
///     .body(Bytes::from("name=Alice"))
///     .unwrap();
/// assert_eq!(req.body().as_ref(), b"name=Alice");
/// ```
pub type Request = http::Request<Bytes>;

/// HTTP response with an in-memory body.
///
/// Every response the mock produces is a complete JSON document (or an empty
/// preflight body), so a [`Full`] body is all the flexibility the server
/// needs.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::types::Response;
/// use bytes::Bytes;
/// use http_body_util::Full;
///
/// let mut resp = Response::new(Full::from(Bytes::from_static(b"{\"ok\":true}")));
/// *resp.status_mut() = http::StatusCode::OK;
/// ```
pub type Response = http::Response<Full<Bytes>>;

/// Thread-safe boxed error, used at server-loop seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed middleware function: takes the request and the rest of the chain.
///
/// Middleware either short-circuits with its own response (auth failures,
/// CORS preflights, idempotency replays) or calls `next.run(req)` to continue
/// down the chain.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use paper_tiger::types::BoxMiddleware;
///
/// let logging: BoxMiddleware = Arc::new(|req, next| {
///     Box::pin(async move {
///         tracing::debug!(path = %req.uri().path(), "request started");
///         next.run(req).await
///     })
/// });
/// ```
pub type BoxMiddleware = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Boxed endpoint handler.
///
/// The router stores every registered handler behind this type; route
/// closures are converted through the [`crate::responder::Responder`] trait
/// at registration time.
pub type BoxHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;
