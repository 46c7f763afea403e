//! CORS filter with the fixed mock-server policy.
//!
//! Every response gets the permissive header set (`*` origin, the emulated
//! methods, the auth/content/idempotency request headers, a 24h preflight
//! cache); OPTIONS preflights short-circuit with 200 and an empty body.
//! Browser-based test harnesses talk to the mock cross-origin, so this
//! filter runs outermost — even a 401 from the auth filter carries the
//! headers.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::config::ServerConfig;
//! use paper_tiger::server::build_router;
//! use bytes::Bytes;
//! use http::Method;
//!
//! # async fn example() {
//! let state = paper_tiger::bootstrap(ServerConfig::default());
//! let router = build_router(state);
//! let preflight = http::Request::builder()
//!     .method(Method::OPTIONS)
//!     .uri("/v1/customers")
//!     .body(Bytes::new())
//!     .unwrap();
//! let resp = router.dispatch(preflight).await;
//! assert_eq!(resp.status(), 200);
//! assert_eq!(resp.headers()["access-control-allow-origin"], "*");
//! # }
//! ```

use http::{HeaderValue, Method, StatusCode, header};

use crate::middleware::Next;
use crate::types::{Request, Response};

const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Authorization, Content-Type, Idempotency-Key";
const MAX_AGE: &str = "86400";

/// Stamps the fixed policy onto an outgoing response.
fn apply_headers(resp: &mut Response) {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(MAX_AGE),
    );
}

/// CORS middleware: short-circuits preflights, decorates everything else.
pub async fn handle(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = Response::new(http_body_util::Full::from(bytes::Bytes::new()));
        *resp.status_mut() = StatusCode::OK;
        apply_headers(&mut resp);
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_headers(&mut resp);
    resp
}
