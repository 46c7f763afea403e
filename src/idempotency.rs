//! Idempotency-Key request de-duplication.
//!
//! POSTs carrying an `Idempotency-Key` header resolve through a process-wide
//! cache. A key is either absent (the caller becomes the owning request and
//! receives a token to store the final response), in flight (concurrent
//! callers get 409 with `Retry-After: 1`), or complete (callers get the
//! captured response verbatim plus `X-Idempotency-Cached: true`).
//!
//! Only successful (2xx) responses are captured; a failed owning request
//! clears its in-flight marker so the client can retry. Entries expire 24
//! hours after capture, measured on the virtual clock, and an hourly janitor
//! sweeps them out.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use http::{HeaderValue, Method, StatusCode, header};
use http_body_util::{BodyExt, Full};

use crate::clock::VirtualClock;
use crate::error::ApiError;
use crate::middleware::Next;
use crate::responder::Responder;
use crate::types::{Request, Response};

const TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Clone)]
enum Entry {
    InFlight,
    Complete {
        status: u16,
        body: Bytes,
        expires_at: i64,
    },
}

/// Outcome of a key lookup at request start.
pub enum Begin {
    /// The caller owns this key; it must redeem the token with
    /// [`IdempotencyCache::store`] or [`IdempotencyCache::abort`].
    Fresh(Token),
    /// Another request with this key is still running.
    InFlight,
    /// A previous request completed; replay its response.
    Cached { status: u16, body: Bytes },
}

/// Permission to store the final response for a key.
pub struct Token {
    key: String,
}

/// Process-wide idempotency cache.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use paper_tiger::clock::VirtualClock;
/// use paper_tiger::idempotency::{Begin, IdempotencyCache};
///
/// let cache = IdempotencyCache::new(Arc::new(VirtualClock::new()));
/// let token = match cache.begin("K-1") {
///     Begin::Fresh(token) => token,
///     _ => unreachable!("first caller owns the key"),
/// };
/// cache.store(token, 200, Bytes::from_static(b"{\"id\":\"cus_1\"}"));
/// assert!(matches!(cache.begin("K-1"), Begin::Cached { .. }));
/// ```
pub struct IdempotencyCache {
    entries: DashMap<String, Entry>,
    clock: Arc<VirtualClock>,
}

impl IdempotencyCache {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Resolves a key, atomically claiming it when absent or expired.
    ///
    /// At most one caller ever receives `Fresh` for a live key; everyone
    /// else sees `InFlight` until the owner stores or aborts, then `Cached`.
    pub fn begin(&self, key: &str) -> Begin {
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(slot) => {
                slot.insert(Entry::InFlight);
                Begin::Fresh(Token {
                    key: key.to_string(),
                })
            }
            MapEntry::Occupied(mut slot) => match slot.get().clone() {
                Entry::InFlight => Begin::InFlight,
                Entry::Complete {
                    status,
                    body,
                    expires_at,
                } => {
                    if expires_at <= self.clock.now() {
                        slot.insert(Entry::InFlight);
                        Begin::Fresh(Token {
                            key: key.to_string(),
                        })
                    } else {
                        Begin::Cached { status, body }
                    }
                }
            },
        }
    }

    /// Captures a successful response for the key the token owns.
    pub fn store(&self, token: Token, status: u16, body: Bytes) {
        let expires_at = self.clock.now() + TTL_SECS;
        self.entries.insert(
            token.key,
            Entry::Complete {
                status,
                body,
                expires_at,
            },
        );
    }

    /// Releases an in-flight key without caching (owning request failed).
    pub fn abort(&self, token: Token) {
        self.entries.remove(&token.key);
    }

    /// Drops expired completed entries. In-flight markers are kept; they are
    /// resolved by their owning request.
    pub fn sweep(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| match entry {
            Entry::InFlight => true,
            Entry::Complete { expires_at, .. } => *expires_at > now,
        });
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawns the hourly sweep task.
pub fn spawn_sweeper(cache: Arc<IdempotencyCache>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        tick.tick().await;
        loop {
            tick.tick().await;
            cache.sweep();
        }
    });
}

/// Middleware wiring the cache into the POST pipeline for emulated routes.
///
/// Non-POSTs, admin paths, and requests without an `Idempotency-Key` header
/// pass straight through. Replays come back verbatim with
/// `X-Idempotency-Cached: true`; a concurrent duplicate gets the 409
/// `idempotency_error` envelope with `Retry-After: 1`.
pub async fn handle(cache: Arc<IdempotencyCache>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST || !req.uri().path().starts_with("/v1/") {
        return next.run(req).await;
    }
    let key = match req
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        Some(k) => k.to_string(),
        None => return next.run(req).await,
    };

    let token = match cache.begin(&key) {
        Begin::Cached { status, body } => {
            let mut resp = Response::new(Full::from(body));
            *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            resp.headers_mut()
                .insert("x-idempotency-cached", HeaderValue::from_static("true"));
            return resp;
        }
        Begin::InFlight => {
            let mut resp = ApiError::idempotency_conflict(&key).into_response();
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            return resp;
        }
        Begin::Fresh(token) => token,
    };

    let mut resp = next.run(req).await;
    let status = resp.status();
    // Buffer the outgoing body so it can be captured and replayed.
    let body = match std::mem::replace(resp.body_mut(), Full::from(Bytes::new()))
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    if status.is_success() {
        cache.store(token, status.as_u16(), body.clone());
    } else {
        cache.abort(token);
    }
    *resp.body_mut() = Full::from(body);
    resp
}
