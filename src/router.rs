//! HTTP request routing and dispatch.
//!
//! This module provides the core [`Router`] that manages route registration,
//! the global middleware chain, and request dispatch. Routes are registered
//! per method with `{param}` path segments (`/v1/customers/{id}`); dispatch
//! matches the request, stows extracted parameters in the request
//! extensions, and runs the middleware chain in registration order.
//! Unmatched requests flow through the same chain into a fallback handler so
//! that filters (CORS, auth) apply to every response.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::router::{PathParams, Router};
//! use paper_tiger::types::Request;
//! use http::Method;
//!
//! let mut router = Router::new();
//! router.route(Method::GET, "/v1/customers/{id}", |req: Request| async move {
//!     let id = PathParams::get(&req, "id").unwrap_or_default();
//!     format!("customer {id}")
//! });
//!
//! // Global middleware runs for every request, matched or not.
//! router.middleware(|req, next| async move {
//!     tracing::debug!(path = %req.uri().path(), "dispatching");
//!     next.run(req).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http::{Method, StatusCode};

use crate::error::ApiError;
use crate::middleware::Next;
use crate::responder::{Responder, json_response};
use crate::types::{BoxHandler, BoxMiddleware, Request, Response};

/// Path parameters extracted during route matching.
///
/// The router inserts this into the request extensions whenever the matched
/// pattern contains `{param}` segments; handlers read individual values back
/// through [`PathParams::get`].
///
/// # Examples
///
/// ```rust
/// use paper_tiger::router::PathParams;
/// use bytes::Bytes;
///
/// let mut req = http::Request::builder()
///     .uri("/v1/customers/cus_123")
///     .body(Bytes::new())
///     .unwrap();
/// let mut params = std::collections::HashMap::new();
/// params.insert("id".to_string(), "cus_123".to_string());
/// req.extensions_mut().insert(PathParams(params));
///
/// assert_eq!(PathParams::get(&req, "id").as_deref(), Some("cus_123"));
/// assert_eq!(PathParams::get(&req, "missing"), None);
/// ```
#[derive(Clone, Debug, Default)]
pub struct PathParams(pub HashMap<String, String>);

impl PathParams {
    /// Looks up a named parameter on a dispatched request.
    ///
    /// Returns `None` when the route had no such segment or the request
    /// never went through dispatch.
    pub fn get(req: &Request, name: &str) -> Option<String> {
        req.extensions()
            .get::<PathParams>()
            .and_then(|p| p.0.get(name).cloned())
    }
}

/// A registered route: method, parsed path pattern, handler.
struct Route {
    method: Method,
    segments: Vec<Segment>,
    handler: BoxHandler,
}

/// One path segment of a route pattern.
enum Segment {
    Literal(String),
    Param(String),
}

impl Route {
    fn new(method: Method, path: &str, handler: BoxHandler) -> Self {
        let segments = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self {
            method,
            segments,
            handler,
        }
    }

    /// Matches a concrete path against the pattern, extracting `{param}`
    /// values. Segment counts must agree exactly.
    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (seg, part) in self.segments.iter().zip(parts) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

/// Route table plus the global middleware chain.
///
/// The router is the central dispatch component: every registered route is
/// keyed by method and pattern, and a single ordered middleware chain wraps
/// all of them. The server builds one router at startup
/// ([`crate::server::build_router`]) and shares it across connections.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::router::Router;
/// use http::Method;
///
/// let mut router = Router::new();
/// router.route(Method::GET, "/healthz", |_req| async { "ok" });
/// router.route(Method::POST, "/v1/customers", |_req| async { "created" });
/// ```
pub struct Router {
    /// Registered routes keyed by (method, pattern).
    routes: DashMap<(Method, String), Arc<Route>>,
    /// Global middleware chain applied to every dispatch.
    middlewares: RwLock<Vec<BoxMiddleware>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a new, empty router.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::router::Router;
    ///
    /// let router = Router::new();
    /// // ready for route registrations
    /// ```
    pub fn new() -> Self {
        Self {
            routes: DashMap::default(),
            middlewares: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler for a method and path pattern.
    ///
    /// Patterns may contain `{param}` segments, extracted into
    /// [`PathParams`] during dispatch. Handlers are any `Fn(Request)`
    /// returning a future of something implementing
    /// [`Responder`](crate::responder::Responder).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::router::{PathParams, Router};
    /// use paper_tiger::types::Request;
    /// use http::Method;
    ///
    /// let mut router = Router::new();
    /// router.route(Method::GET, "/v1/invoices/{id}", |req: Request| async move {
    ///     format!("invoice {}", PathParams::get(&req, "id").unwrap_or_default())
    /// });
    /// router.route(Method::DELETE, "/_config/data", |_req| async { "flushed" });
    /// ```
    pub fn route<H, Fut, R>(&mut self, method: Method, path: &str, handler: H)
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Responder + 'static,
    {
        let handler: BoxHandler = Arc::new(move |req| {
            let fut = handler(req);
            Box::pin(async move { fut.await.into_response() }) as BoxFuture<'static, Response>
        });
        let route = Arc::new(Route::new(method.clone(), path, handler));
        self.routes.insert((method, path.to_owned()), route);
    }

    /// Appends a global middleware; middlewares run in registration order.
    ///
    /// The first middleware registered is the outermost: it sees the request
    /// first and the response last.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::responder::Responder;
    /// use paper_tiger::router::Router;
    ///
    /// let router = Router::new();
    /// router.middleware(|req, next| async move {
    ///     if req.headers().contains_key("authorization") {
    ///         next.run(req).await
    ///     } else {
    ///         (http::StatusCode::UNAUTHORIZED, "missing key").into_response()
    ///     }
    /// });
    /// ```
    pub fn middleware<F, Fut, R>(&self, f: F)
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Responder + 'static,
    {
        let mw: BoxMiddleware = Arc::new(move |req, next| {
            let fut = f(req, next);
            Box::pin(async move { fut.await.into_response() })
        });
        self.middlewares.write().unwrap().push(mw);
    }

    /// Matches and runs a request through the middleware chain.
    ///
    /// Unmatched paths still traverse the chain and land in a 404 fallback
    /// with the standard error envelope, so cross-cutting filters apply to
    /// every response the server produces.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::router::Router;
    /// use bytes::Bytes;
    /// use http::Method;
    ///
    /// # async fn example() {
    /// let mut router = Router::new();
    /// router.route(Method::GET, "/ping", |_req| async { "pong" });
    ///
    /// let req = http::Request::builder()
    ///     .method(Method::GET)
    ///     .uri("/ping")
    ///     .body(Bytes::new())
    ///     .unwrap();
    /// let response = router.dispatch(req).await;
    /// assert_eq!(response.status(), 200);
    /// # }
    /// ```
    pub async fn dispatch(&self, mut req: Request) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut endpoint: Option<BoxHandler> = None;
        for route in self.routes.iter() {
            if route.method != method {
                continue;
            }
            if let Some(params) = route.match_path(&path) {
                if !params.is_empty() {
                    req.extensions_mut().insert(PathParams(params));
                }
                endpoint = Some(route.handler.clone());
                break;
            }
        }

        let endpoint = endpoint.unwrap_or_else(|| {
            Arc::new(move |req: Request| {
                Box::pin(async move { not_found(&req) }) as BoxFuture<'static, Response>
            })
        });

        let chain = self.middlewares.read().unwrap().clone();
        let next = Next {
            middlewares: Arc::new(chain),
            endpoint,
        };
        next.run(req).await
    }
}

fn not_found(req: &Request) -> Response {
    let err = ApiError::invalid_request(format!(
        "Unrecognized request URL ({} {}).",
        req.method(),
        req.uri().path()
    ));
    json_response(StatusCode::NOT_FOUND, &err.envelope())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn req(method: Method, path: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn matches_param_segments() {
        let mut router = Router::new();
        router.route(Method::GET, "/v1/customers/{id}", |req: Request| async move {
            PathParams::get(&req, "id").unwrap_or_default()
        });
        let resp = router.dispatch(req(Method::GET, "/v1/customers/cus_123")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_gets_error_envelope() {
        let router = Router::new();
        let resp = router.dispatch(req(Method::GET, "/v1/nothing")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn middleware_runs_in_order() {
        let mut router = Router::new();
        router.route(Method::GET, "/ping", |_req| async { "pong" });
        router.middleware(|req, next| async move {
            let mut resp = next.run(req).await;
            resp.headers_mut()
                .insert("x-first", http::HeaderValue::from_static("1"));
            resp
        });
        let resp = router.dispatch(req(Method::GET, "/ping")).await;
        assert_eq!(resp.headers()["x-first"], "1");
    }
}
