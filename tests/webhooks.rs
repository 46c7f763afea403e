//! Scenario F: signed webhook delivery to a live local receiver.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use paper_tiger::config::ServerConfig;
use paper_tiger::server::build_router;

/// A captured webhook POST: the `Stripe-Signature` header and the raw body.
type Captured = (String, String);

/// One-endpoint HTTP receiver that records every POST it sees.
async fn spawn_receiver(respond_with: StatusCode) -> (SocketAddr, mpsc::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let signature = req
                            .headers()
                            .get("stripe-signature")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let _ = tx
                            .send((signature, String::from_utf8_lossy(&body).into_owned()))
                            .await;
                        let mut resp = hyper::Response::new(Full::new(Bytes::from("ok")));
                        *resp.status_mut() = respond_with;
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    (addr, rx)
}

fn request(method: Method, path: &str, body: Value) -> paper_tiger::types::Request {
    http::Request::builder()
        .method(method)
        .uri(path)
        .header("authorization", "Bearer sk_test_paper")
        .header("content-type", "application/json")
        .body(Bytes::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn delivered_webhooks_verify_against_the_shared_secret() {
    let (addr, mut rx) = spawn_receiver(StatusCode::OK).await;
    let state = paper_tiger::bootstrap(ServerConfig::default());
    let router = build_router(state.clone());

    let resp = router
        .dispatch(request(
            Method::POST,
            "/_config/webhooks/wh_test",
            json!({"url": format!("http://{addr}/"), "secret": "whsec_abc"}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    router
        .dispatch(request(
            Method::POST,
            "/v1/customers",
            json!({"email": "hook@co.com"}),
        ))
        .await;

    let (signature, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("webhook was not delivered in time")
        .expect("receiver channel closed");

    // header shape: t=<created>,v1=<hex>
    let (t_part, v1_part) = signature.split_once(',').expect("two signature parts");
    let timestamp = t_part.strip_prefix("t=").unwrap();
    let v1 = v1_part.strip_prefix("v1=").unwrap();

    let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_abc").unwrap();
    mac.update(format!("{timestamp}.{body}").as_bytes());
    assert_eq!(v1, hex::encode(mac.finalize().into_bytes()));

    let event: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(event["object"], "event");
    assert_eq!(event["type"], "customer.created");
    assert_eq!(event["created"].as_i64().unwrap().to_string(), timestamp);
    assert_eq!(event["data"]["object"]["email"], "hook@co.com");
    assert_eq!(event["livemode"], false);
}

#[tokio::test]
async fn allowlisted_endpoints_only_get_their_event_types() {
    let (addr, mut rx) = spawn_receiver(StatusCode::OK).await;
    let state = paper_tiger::bootstrap(ServerConfig::default());
    let router = build_router(state.clone());

    router
        .dispatch(request(
            Method::POST,
            "/_config/webhooks/wh_scoped",
            json!({
                "url": format!("http://{addr}/"),
                "secret": "whsec_scoped",
                "events": ["product.created"],
            }),
        ))
        .await;

    // filtered out
    router
        .dispatch(request(
            Method::POST,
            "/v1/customers",
            json!({"name": "NotDelivered"}),
        ))
        .await;
    // delivered
    router
        .dispatch(request(
            Method::POST,
            "/v1/products",
            json!({"name": "Delivered"}),
        ))
        .await;

    let (_, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    let event: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(event["type"], "product.created");

    // nothing else arrives
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "customer event should have been filtered");
}

#[tokio::test]
async fn delivery_attempts_are_recorded() {
    let (addr, mut rx) = spawn_receiver(StatusCode::OK).await;
    let state = paper_tiger::bootstrap(ServerConfig::default());
    let router = build_router(state.clone());

    router
        .dispatch(request(
            Method::POST,
            "/_config/webhooks/wh_rec",
            json!({"url": format!("http://{addr}/"), "secret": "whsec_rec"}),
        ))
        .await;
    router
        .dispatch(request(Method::POST, "/v1/customers", json!({"name": "R"})))
        .await;

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .unwrap();

    // the delivery record may land just after the response is written
    let mut attempts = Vec::new();
    for _ in 0..50 {
        attempts = state.stores.webhook_deliveries.snapshot();
        if !attempts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(attempts.len(), 1);
    let attempt = &attempts[0];
    assert_eq!(attempt["webhook_id"], "wh_rec");
    assert_eq!(attempt["status"], "succeeded");
    assert_eq!(attempt["attempt"], 1);
    assert_eq!(attempt["response_code"], 200);
    assert!(attempt["event_id"].as_str().unwrap().starts_with("evt_"));
}

#[tokio::test]
async fn failed_deliveries_schedule_a_retry() {
    let (addr, mut rx) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let state = paper_tiger::bootstrap(ServerConfig::default());
    let router = build_router(state.clone());

    router
        .dispatch(request(
            Method::POST,
            "/_config/webhooks/wh_flaky",
            json!({"url": format!("http://{addr}/"), "secret": "whsec_flaky"}),
        ))
        .await;
    router
        .dispatch(request(Method::POST, "/v1/customers", json!({"name": "F"})))
        .await;

    // first attempt arrives and fails
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first attempt timed out")
        .unwrap();

    let mut first = Vec::new();
    for _ in 0..50 {
        first = state.stores.webhook_deliveries.snapshot();
        if !first.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!first.is_empty());
    let attempt = first
        .iter()
        .find(|a| a["attempt"] == 1)
        .expect("first attempt recorded");
    assert_eq!(attempt["status"], "retrying");
    assert_eq!(attempt["response_code"], 500);
    assert!(attempt["next_attempt_at"].is_i64());

    // backoff is 1s (real clock here); the second attempt should arrive
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("retry attempt timed out")
        .unwrap();
}

#[tokio::test]
async fn event_chaos_buffers_until_flush() {
    let (addr, mut rx) = spawn_receiver(StatusCode::OK).await;
    let state = paper_tiger::bootstrap(ServerConfig::default());
    let router = build_router(state.clone());
    // long window so nothing flushes on its own during the test
    state.chaos.configure_events(false, 0.0, 60_000);

    router
        .dispatch(request(
            Method::POST,
            "/_config/webhooks/wh_buf",
            json!({"url": format!("http://{addr}/"), "secret": "whsec_buf"}),
        ))
        .await;
    router
        .dispatch(request(Method::POST, "/v1/customers", json!({"name": "B"})))
        .await;

    // buffered: nothing should arrive yet
    let early = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(early.is_err(), "event should still be buffered");

    state.chaos.flush_events();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("flushed event never arrived")
        .unwrap();
}
