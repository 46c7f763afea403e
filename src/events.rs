//! Event materialization and signed webhook delivery.
//!
//! A catch-all telemetry subscriber turns every lifecycle signal into an
//! immutable Event record, then routes it through the chaos coordinator's
//! event queue toward the delivery pipeline. Delivery fans out to every
//! registered webhook endpoint whose allowlist admits the event type, signs
//! the payload (`Stripe-Signature: t=<created>,v1=<hmac-sha256>`), and POSTs
//! it with a bounded worker pool. Failures retry on an exponential backoff
//! measured against the virtual clock; every attempt lands in the
//! webhook_deliveries store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use http::header;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use url::Url;

use crate::resources::new_id;
use crate::signals::Signal;
use crate::state::ApiState;

/// Max delivery attempts per (webhook, event) pair.
const MAX_ATTEMPTS: u32 = 8;
/// Per-attempt timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the retry scheduler compares due-times against the clock.
const RETRY_SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// One pending delivery of an event to a webhook endpoint.
///
/// A job is created per (event, matching endpoint) pair at fan-out time and
/// carries everything an attempt needs, so retries never re-read the
/// webhook record: a secret rotated mid-dunning does not invalidate
/// in-flight deliveries.
#[derive(Clone, Debug)]
pub struct DeliveryJob {
    /// Registered endpoint id (`we_...` or the admin-chosen id).
    pub webhook_id: String,
    /// Destination URL, plain HTTP.
    pub url: String,
    /// Shared signing secret (`whsec_...`).
    pub secret: String,
    /// Id of the event being delivered.
    pub event_id: String,
    /// Event timestamp; the `t=` half of the signature header.
    pub created: i64,
    /// Canonical JSON of the event; signed and sent byte-for-byte.
    pub payload: String,
    /// 1-based attempt counter; delivery gives up after eight attempts.
    pub attempt: u32,
}

/// Computes the `v1` signature over `"<created>.<payload>"`.
///
/// The result is lowercase hex of `HMAC-SHA256(secret, "<created>.<payload>")`,
/// exactly what a receiver recomputes to verify the
/// `Stripe-Signature: t=<created>,v1=<signature>` header.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::events::sign;
///
/// let signature = sign("whsec_abc", 1700000000, "{\"id\":\"evt_1\"}");
/// assert_eq!(signature.len(), 64);
/// assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
/// ```
pub fn sign(secret: &str, created: i64, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(format!("{created}.{payload}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Seconds to wait after a failed attempt `n` (1-based): 1, 2, 4, ... 128.
fn backoff_secs(attempt: u32) -> i64 {
    1i64 << (attempt.saturating_sub(1)).min(7)
}

/// Does this endpoint's allowlist admit the event type? An absent or empty
/// `events` field means "everything".
///
/// # Examples
///
/// ```rust
/// use paper_tiger::events::webhook_matches;
/// use serde_json::json;
///
/// let scoped = json!({"events": ["invoice.paid"]});
/// assert!(webhook_matches(&scoped, "invoice.paid"));
/// assert!(!webhook_matches(&scoped, "customer.created"));
///
/// let unscoped = json!({"url": "http://localhost:9000/"});
/// assert!(webhook_matches(&unscoped, "customer.created"));
/// ```
pub fn webhook_matches(webhook: &Value, event_type: &str) -> bool {
    match webhook.get("events") {
        None | Some(Value::Null) => true,
        Some(Value::Array(allow)) if allow.is_empty() => true,
        Some(Value::Array(allow)) => allow
            .iter()
            .any(|v| v.as_str() == Some(event_type)),
        Some(_) => true,
    }
}

/// Installs the materializer on the bus and starts the delivery workers and
/// the retry scheduler. Called once per [`ApiState`], from
/// [`crate::bootstrap`].
///
/// Three pieces are wired up:
/// 1. a catch-all bus subscriber that materializes Event records,
/// 2. the bounded pool of delivery workers draining the job channel,
/// 3. the retry scheduler, which re-enqueues failed jobs once their
///    virtual-clock due-time passes.
///
/// Workers hold only a `Weak` reference to the state, so dropping the last
/// `Arc<ApiState>` shuts the pipeline down.
///
/// # Examples
///
/// ```rust,no_run
/// use paper_tiger::config::ServerConfig;
/// use paper_tiger::state::ApiState;
///
/// # async fn example() {
/// let state = ApiState::new(ServerConfig::default());
/// paper_tiger::events::wire(&state);
/// // lifecycle signals now materialize events and fan out deliveries
/// # }
/// ```
pub fn wire(state: &Arc<ApiState>) {
    let (tx, rx) = mpsc::unbounded_channel::<DeliveryJob>();
    let _ = state.delivery_tx.set(tx.clone());

    let weak = Arc::downgrade(state);
    state.bus.on_any(move |signal| {
        let weak = weak.clone();
        async move {
            if let Some(state) = weak.upgrade() {
                materialize(&state, signal);
            }
        }
    });

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker in 0..state.config.webhook_workers.max(1) {
        let rx = rx.clone();
        let weak = Arc::downgrade(state);
        tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { break };
                let Some(state) = weak.upgrade() else { break };
                attempt_delivery(&state, job).await;
            }
            tracing::debug!(worker, "webhook delivery worker stopped");
        });
    }

    let retries: Arc<Mutex<Vec<(i64, DeliveryJob)>>> = Arc::new(Mutex::new(Vec::new()));
    let _ = state.retry_queue.set(retries.clone());
    let weak = Arc::downgrade(state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RETRY_SCAN_INTERVAL);
        loop {
            tick.tick().await;
            let Some(state) = weak.upgrade() else { break };
            let now = state.clock.now();
            let due: Vec<DeliveryJob> = {
                let mut queue = retries.lock();
                let (ready, pending): (Vec<_>, Vec<_>) =
                    queue.drain(..).partition(|(at, _)| *at <= now);
                *queue = pending;
                ready.into_iter().map(|(_, job)| job).collect()
            };
            for job in due {
                let _ = tx.send(job);
            }
        }
    });
}

/// Builds and persists the Event record, then hands it to the chaos event
/// queue for delivery fan-out.
fn materialize(state: &Arc<ApiState>, signal: Signal) {
    let event = json!({
        "id": new_id("evt"),
        "object": "event",
        "type": signal.name,
        "created": state.clock.now(),
        "livemode": false,
        "data": { "object": signal.object },
    });
    state.stores.events.insert(event.clone());

    let weak = Arc::downgrade(state);
    state.chaos.queue_event(
        event,
        Arc::new(move |event| {
            if let Some(state) = weak.upgrade() {
                fan_out(&state, &event);
            }
        }),
    );
}

/// Enqueues one delivery job per matching webhook endpoint.
fn fan_out(state: &Arc<ApiState>, event: &Value) {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    let event_id = event.get("id").and_then(Value::as_str).unwrap_or("");
    let created = event.get("created").and_then(Value::as_i64).unwrap_or(0);
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(%err, event_id, "failed to serialize event for delivery");
            return;
        }
    };
    let Some(tx) = state.delivery_tx.get() else {
        return;
    };
    for webhook in state.stores.webhook_endpoints.snapshot() {
        if !webhook_matches(&webhook, event_type) {
            continue;
        }
        let (Some(id), Some(url), Some(secret)) = (
            webhook.get("id").and_then(Value::as_str),
            webhook.get("url").and_then(Value::as_str),
            webhook.get("secret").and_then(Value::as_str),
        ) else {
            continue;
        };
        let _ = tx.send(DeliveryJob {
            webhook_id: id.to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            event_id: event_id.to_string(),
            created,
            payload: payload.clone(),
            attempt: 1,
        });
    }
}

enum AttemptOutcome {
    Delivered(u16),
    Failed { code: Option<u16>, error: String },
}

async fn attempt_delivery(state: &Arc<ApiState>, job: DeliveryJob) {
    let signature = sign(&job.secret, job.created, &job.payload);
    let header_value = format!("t={},v1={}", job.created, signature);

    let outcome =
        match tokio::time::timeout(ATTEMPT_TIMEOUT, post_event(&job.url, &header_value, &job.payload))
            .await
        {
            Ok(Ok(code)) if (200..300).contains(&code) => AttemptOutcome::Delivered(code),
            Ok(Ok(code)) => AttemptOutcome::Failed {
                code: Some(code),
                error: format!("endpoint returned HTTP {code}"),
            },
            Ok(Err(err)) => AttemptOutcome::Failed { code: None, error: err },
            Err(_) => AttemptOutcome::Failed {
                code: None,
                error: format!("attempt timed out after {}s", ATTEMPT_TIMEOUT.as_secs()),
            },
        };

    let now = state.clock.now();
    match outcome {
        AttemptOutcome::Delivered(code) => {
            tracing::debug!(
                webhook = %job.webhook_id,
                event = %job.event_id,
                attempt = job.attempt,
                code,
                "webhook delivered"
            );
            record_attempt(state, &job, "succeeded", Some(code), None, None);
        }
        AttemptOutcome::Failed { code, error } => {
            let retrying = job.attempt < MAX_ATTEMPTS;
            let next_attempt_at = retrying.then(|| now + backoff_secs(job.attempt));
            tracing::warn!(
                webhook = %job.webhook_id,
                event = %job.event_id,
                attempt = job.attempt,
                %error,
                retrying,
                "webhook delivery failed"
            );
            record_attempt(
                state,
                &job,
                if retrying { "retrying" } else { "failed" },
                code,
                Some(error),
                next_attempt_at,
            );
            if let Some(due) = next_attempt_at {
                schedule_retry(state, due, DeliveryJob {
                    attempt: job.attempt + 1,
                    ..job
                });
            }
        }
    }
}

fn record_attempt(
    state: &Arc<ApiState>,
    job: &DeliveryJob,
    status: &str,
    response_code: Option<u16>,
    error: Option<String>,
    next_attempt_at: Option<i64>,
) {
    state.stores.webhook_deliveries.insert(json!({
        "id": new_id("whd"),
        "object": "webhook_delivery",
        "created": state.clock.now(),
        "webhook_id": job.webhook_id,
        "event_id": job.event_id,
        "attempt": job.attempt,
        "status": status,
        "response_code": response_code,
        "error": error,
        "next_attempt_at": next_attempt_at,
    }));
}

// Retries live in a per-state queue created in `wire`; jobs re-enter the
// worker channel once their virtual due-time passes.
fn schedule_retry(state: &Arc<ApiState>, due: i64, job: DeliveryJob) {
    if let Some(queue) = state.retry_queue.get() {
        queue.lock().push((due, job));
    }
}

/// Plain-HTTP POST of the signed payload. One connection per attempt: a
/// fresh TCP stream, an HTTP/1.1 handshake with the connection task spawned
/// off, then a single request/response exchange. Returns the status code, or
/// a description of the transport failure.
async fn post_event(raw_url: &str, signature: &str, payload: &str) -> Result<u16, String> {
    let url = Url::parse(raw_url).map_err(|e| format!("invalid webhook url: {e}"))?;
    if url.scheme() != "http" {
        return Err(format!("unsupported webhook scheme: {}", url.scheme()));
    }
    let host = url.host_str().ok_or_else(|| "webhook url has no host".to_string())?;
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| format!("connect failed: {e}"))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
        .await
        .map_err(|e| format!("handshake failed: {e}"))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(%err, "webhook connection closed with error");
        }
    });

    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(header::HOST, format!("{host}:{port}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature)
        .body(Full::from(Bytes::from(payload.to_string())))
        .map_err(|e| format!("request build failed: {e}"))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("send failed: {e}"))?;
    Ok(response.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_lowercase_hex_over_timestamp_dot_body() {
        let sig = sign("whsec_abc", 1700000000, "{\"id\":\"evt_1\"}");
        assert_eq!(sig.len(), 64);
        assert!(sig.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(sig, sig.to_lowercase());
        // independent recomputation matches
        let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_abc").unwrap();
        mac.update(b"1700000000.{\"id\":\"evt_1\"}");
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = sign("whsec_a", 1, "{}");
        let b = sign("whsec_b", 1, "{}");
        assert_ne!(a, b);
    }

    #[test]
    fn backoff_doubles_and_caps_at_128() {
        let delays: Vec<i64> = (1..=8).map(backoff_secs).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128]);
        assert_eq!(backoff_secs(20), 128);
    }

    #[test]
    fn allowlist_filtering() {
        let all = serde_json::json!({"id": "we_1", "url": "http://x/", "secret": "s"});
        assert!(webhook_matches(&all, "customer.created"));
        let empty = serde_json::json!({"events": []});
        assert!(webhook_matches(&empty, "customer.created"));
        let scoped = serde_json::json!({"events": ["invoice.paid"]});
        assert!(webhook_matches(&scoped, "invoice.paid"));
        assert!(!webhook_matches(&scoped, "customer.created"));
    }
}
