//! HTTP server: router composition, the admin surface, and the accept loop.
//!
//! The middleware chain is fixed: CORS (outermost, so every response carries
//! the headers and preflights short-circuit), auth, API chaos injection, then
//! idempotency for POSTs. Handlers parse bodies themselves via
//! [`crate::params`].

use std::convert::Infallible;
use std::sync::Arc;

use http::Method;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rand::Rng;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::auth;
use crate::billing;
use crate::catalog;
use crate::chaos::ApiOutcome;
use crate::config::ServerConfig;
use crate::cors;
use crate::error::ApiError;
use crate::idempotency;
use crate::middleware::Next;
use crate::params;
use crate::resources::new_id;
use crate::responder::{Json, Responder};
use crate::router::{PathParams, Router};
use crate::state::ApiState;
use crate::types::{Request, Response};

/// Ephemeral range probed when no port is configured.
const PORT_RANGE: std::ops::Range<u16> = 59000..60000;
const PORT_PROBE_ATTEMPTS: usize = 50;

/// Builds the full router: emulated routes, admin routes, middleware chain.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::config::ServerConfig;
/// use paper_tiger::server::build_router;
/// use bytes::Bytes;
/// use http::Method;
///
/// # async fn example() {
/// let state = paper_tiger::bootstrap(ServerConfig::default());
/// let router = build_router(state);
///
/// // drive requests straight through dispatch, no sockets needed
/// let req = http::Request::builder()
///     .method(Method::POST)
///     .uri("/v1/customers")
///     .header("authorization", "Bearer sk_test_abc")
///     .header("content-type", "application/x-www-form-urlencoded")
///     .body(Bytes::from("email=a%40b.com"))
///     .unwrap();
/// let resp = router.dispatch(req).await;
/// assert_eq!(resp.status(), 200);
/// # }
/// ```
pub fn build_router(state: Arc<ApiState>) -> Router {
    let mut router = Router::new();
    catalog::register_routes(&mut router, &state);
    register_admin_routes(&mut router, &state);

    router.middleware(cors::handle);
    {
        let policy = state.config.auth_policy;
        router.middleware(move |req, next| auth::handle(policy, req, next));
    }
    {
        let state = state.clone();
        router.middleware(move |req, next| chaos_filter(state.clone(), req, next));
    }
    {
        let cache = state.idempotency.clone();
        router.middleware(move |req, next| idempotency::handle(cache.clone(), req, next));
    }
    router
}

/// Numeric field that may arrive as a JSON number or a form-coerced string
/// (`failure_rate=0.5` decodes as the string `"0.5"`).
fn float_field(body: &Value, name: &str) -> Option<f64> {
    match body.get(name) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Injected API failures, applied to emulated (`/v1/`) paths only.
async fn chaos_filter(state: Arc<ApiState>, req: Request, next: Next) -> Response {
    if !req.uri().path().starts_with("/v1/") {
        return next.run(req).await;
    }
    match state.chaos.should_api_fail(req.uri().path()) {
        ApiOutcome::Ok => next.run(req).await,
        ApiOutcome::Timeout(ms) => {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            ApiError::server_error().into_response()
        }
        ApiOutcome::RateLimit => ApiError::rate_limited().into_response(),
        ApiOutcome::ServerError => ApiError::server_error().into_response(),
    }
}

fn register_admin_routes(router: &mut Router, state: &Arc<ApiState>) {
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/webhooks/{id}", move |req| {
            register_webhook(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::DELETE, "/_config/webhooks/{id}", move |req| {
            let state = state.clone();
            async move {
                let id = PathParams::get(&req, "id")
                    .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))?;
                state.stores.webhook_endpoints.delete(&id);
                Ok::<_, ApiError>(Json(json!({"deleted": true, "id": id})))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::DELETE, "/_config/data", move |_req| {
            let state = state.clone();
            async move {
                state.stores.clear_all();
                state.idempotency.clear();
                tracing::info!("all stores flushed");
                Json(json!({"ok": true}))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/time/advance", move |req| {
            advance_time(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/billing/run", move |_req| {
            let state = state.clone();
            async move {
                let processed = billing::process_billing(&state).await;
                Json(json!({"ok": true, "processed": processed}))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/chaos/payments", move |req| {
            configure_payment_chaos(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/chaos/events", move |req| {
            let state = state.clone();
            async move {
                let body = params::parse_body(&req)?;
                state.chaos.configure_events(
                    body.get("out_of_order").and_then(Value::as_bool).unwrap_or(false),
                    float_field(&body, "duplicate_rate").unwrap_or(0.0),
                    body.get("buffer_window_ms").and_then(Value::as_u64).unwrap_or(0),
                );
                Ok::<_, ApiError>(Json(json!({"ok": true})))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/chaos/api", move |req| {
            let state = state.clone();
            async move {
                let body = params::parse_body(&req)?;
                state.chaos.configure_api(
                    float_field(&body, "timeout_rate").unwrap_or(0.0),
                    float_field(&body, "rate_limit_rate").unwrap_or(0.0),
                    float_field(&body, "error_rate").unwrap_or(0.0),
                    body.get("timeout_ms").and_then(Value::as_u64).unwrap_or(5000),
                );
                Ok::<_, ApiError>(Json(json!({"ok": true})))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/chaos/flush", move |_req| {
            let state = state.clone();
            async move {
                state.chaos.flush_events();
                Json(json!({"ok": true}))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/_config/chaos/reset", move |_req| {
            let state = state.clone();
            async move {
                state.chaos.reset();
                Json(json!({"ok": true}))
            }
        });
    }
    {
        let state = state.clone();
        router.route(Method::GET, "/_config/chaos/stats", move |_req| {
            let state = state.clone();
            async move { Json(state.chaos.stats().to_value()) }
        });
    }
}

/// `POST /_config/webhooks/{id}` — registers a delivery endpoint under a
/// caller-chosen id.
async fn register_webhook(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let id = PathParams::get(&req, "id")
        .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))?;
    let body = params::parse_body(&req)?;
    let url = body
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::invalid_request("Missing required param: url.").with_param("url"))?;
    let secret = body
        .get("secret")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("whsec_{}", &new_id("x")[2..]));
    let record = state.stores.webhook_endpoints.insert(json!({
        "id": id,
        "object": "webhook_endpoint",
        "url": url,
        "secret": secret,
        "events": body.get("events").cloned().unwrap_or(Value::Null),
        "status": "enabled",
        "created": state.clock.now(),
        "livemode": false,
    }));
    tracing::info!(webhook = %id, %url, "webhook registered");
    Ok(Json(record))
}

/// `POST /_config/time/advance` — accepts seconds/minutes/hours/days.
async fn advance_time(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let body = params::parse_body(&req)?;
    let field = |name: &str| body.get(name).and_then(Value::as_i64).unwrap_or(0);
    let delta = field("seconds") + field("minutes") * 60 + field("hours") * 3600 + field("days") * 86_400;
    if delta <= 0 {
        return Err(ApiError::invalid_request(
            "Provide a positive duration via seconds, minutes, hours, or days.",
        ));
    }
    state.clock.advance(delta);
    Ok(Json(json!({"ok": true, "advanced": delta, "now": state.clock.now()})))
}

async fn configure_payment_chaos(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let body = params::parse_body(&req)?;
    // per-customer override form
    if let Some(customer) = body.get("customer").and_then(Value::as_str) {
        let code = body
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("card_declined");
        state
            .chaos
            .simulate_failure(customer, code)
            .map_err(|e| ApiError::invalid_request(e.to_string()).with_param("code"))?;
        return Ok(Json(json!({"ok": true, "customer": customer, "code": code})));
    }
    let codes = body
        .get("decline_codes")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let weights = body.get("decline_weights").and_then(Value::as_object).map(|map| {
        map.iter()
            .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w)))
            .collect()
    });
    state
        .chaos
        .configure_payment(float_field(&body, "failure_rate").unwrap_or(0.0), codes, weights)
        .map_err(|e| ApiError::invalid_request(e.to_string()).with_param("decline_codes"))?;
    Ok(Json(json!({"ok": true})))
}

/// Binds the listener: explicit port wins, otherwise the ephemeral range is
/// probed with random attempts.
///
/// # Examples
///
/// ```rust,no_run
/// use paper_tiger::config::ServerConfig;
/// use paper_tiger::server::bind_listener;
///
/// # async fn example() -> anyhow::Result<()> {
/// let listener = bind_listener(&ServerConfig::default()).await?;
/// let port = listener.local_addr()?.port();
/// assert!((59000..60000).contains(&port));
/// # Ok(())
/// # }
/// ```
pub async fn bind_listener(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    if let Some(port) = config.port {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        return Ok(listener);
    }
    let mut last_err = None;
    for _ in 0..PORT_PROBE_ATTEMPTS {
        let port = rand::thread_rng().gen_range(PORT_RANGE.start..PORT_RANGE.end);
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    Err(anyhow::anyhow!(
        "no free port in {}..{} after {PORT_PROBE_ATTEMPTS} attempts: {:?}",
        PORT_RANGE.start,
        PORT_RANGE.end,
        last_err,
    ))
}

/// Accept loop: buffers each request body, dispatches through the router.
///
/// Each accepted connection is served on its own task with HTTP/1.1
/// keep-alive; the loop itself only returns on accept errors.
///
/// # Examples
///
/// ```rust,no_run
/// use paper_tiger::config::ServerConfig;
/// use paper_tiger::server::{bind_listener, build_router, serve};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = ServerConfig::default();
/// let listener = bind_listener(&config).await?;
/// let state = paper_tiger::bootstrap(config);
/// serve(listener, build_router(state)).await
/// # }
/// ```
pub async fn serve(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    let router = Arc::new(router);
    tracing::info!("paper-tiger listening on {}", listener.local_addr()?);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let router = router.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let router = router.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let bytes = match body.collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(err) => {
                            tracing::debug!(%err, "failed to read request body");
                            bytes::Bytes::new()
                        }
                    };
                    let req = http::Request::from_parts(parts, bytes);
                    Ok::<_, Infallible>(router.dispatch(req).await)
                }
            });
            let conn = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, svc);
            if let Err(err) = conn.await {
                tracing::debug!(%err, "error serving connection");
            }
        });
    }
}
