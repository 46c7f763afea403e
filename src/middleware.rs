//! Middleware chain execution.
//!
//! The server composes its request pipeline (CORS, auth, chaos injection,
//! idempotency) as boxed middleware functions. The [`Next`] struct manages
//! the flow of execution through the chain, ensuring each middleware runs in
//! registration order before the matched endpoint handler is reached.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::middleware::Next;
//! use paper_tiger::types::{Request, Response};
//!
//! async fn logging_middleware(req: Request, next: Next) -> Response {
//!     tracing::info!("processing {}", req.uri());
//!     let response = next.run(req).await;
//!     tracing::info!("responded {}", response.status());
//!     response
//! }
//! ```

use std::sync::Arc;

use crate::types::{BoxHandler, BoxMiddleware, Request, Response};

/// The remainder of the middleware chain plus the final endpoint.
///
/// Each middleware receives a `Next` describing everything downstream of it;
/// calling [`Next::run`] hands the request to the following middleware, or to
/// the endpoint once the chain is exhausted. Dropping the `Next` without
/// calling it short-circuits the pipeline with whatever response the
/// middleware produces itself.
pub struct Next {
    /// Remaining middlewares to execute, in order.
    pub middlewares: Arc<Vec<BoxMiddleware>>,
    /// Endpoint handler to call after all middlewares have run.
    pub endpoint: BoxHandler,
}

impl Next {
    /// Runs the next middleware in the chain, or the endpoint if none remain.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use futures_util::future::BoxFuture;
    /// use paper_tiger::middleware::Next;
    /// use paper_tiger::types::{BoxHandler, Request, Response};
    /// use bytes::Bytes;
    /// use http_body_util::Full;
    ///
    /// # async fn example() {
    /// let endpoint: BoxHandler = Arc::new(|_req: Request| {
    ///     Box::pin(async { Response::new(Full::from(Bytes::from("{}"))) })
    ///         as BoxFuture<'static, Response>
    /// });
    /// let next = Next {
    ///     middlewares: Arc::new(Vec::new()),
    ///     endpoint,
    /// };
    /// let req = http::Request::builder().body(Bytes::new()).unwrap();
    /// let response = next.run(req).await;
    /// assert_eq!(response.status(), 200);
    /// # }
    /// ```
    pub async fn run(self, req: Request) -> Response {
        if let Some((mw, rest)) = self.middlewares.split_first() {
            let mw = mw.clone();
            let next = Next {
                middlewares: Arc::new(rest.to_vec()),
                endpoint: self.endpoint,
            };
            mw(req, next).await
        } else {
            (self.endpoint)(req).await
        }
    }
}
