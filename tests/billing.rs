//! Billing engine scenarios on a manual clock: the successful cycle and the
//! dunning ladder into `past_due`.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Method;
use http_body_util::BodyExt;
use serde_json::Value;

use paper_tiger::billing;
use paper_tiger::clock::ClockMode;
use paper_tiger::config::ServerConfig;
use paper_tiger::router::Router;
use paper_tiger::server::build_router;
use paper_tiger::signals::Signal;
use paper_tiger::state::ApiState;

const MONTH: i64 = 2_592_000;
const DAY: i64 = 86_400;

fn request(method: Method, path: &str, body: &str) -> paper_tiger::types::Request {
    http::Request::builder()
        .method(method)
        .uri(path)
        .header("authorization", "Bearer sk_test_paper")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Bytes::from(body.to_string()))
        .unwrap()
}

async fn post_json(router: &Router, path: &str, body: &str) -> Value {
    let resp = router.dispatch(request(Method::POST, path, body)).await;
    assert_eq!(resp.status(), http::StatusCode::OK, "POST {path} failed");
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Product + monthly 2000-cent price + customer + subscription one day past
/// its period end, on a frozen clock.
async fn billing_fixture() -> (Arc<ApiState>, Router, String, String) {
    let state = paper_tiger::bootstrap(ServerConfig::default());
    state.clock.set_mode(ClockMode::Manual, 1);
    let router = build_router(state.clone());
    let now = state.clock.now();

    let product = post_json(&router, "/v1/products", "name=Pro%20Plan").await;
    let price = post_json(
        &router,
        "/v1/prices",
        &format!(
            "unit_amount=2000&currency=usd&recurring[interval]=month&product={}",
            product["id"].as_str().unwrap()
        ),
    )
    .await;
    let customer = post_json(&router, "/v1/customers", "email=bill%40co.com").await;
    let cus_id = customer["id"].as_str().unwrap().to_string();
    let subscription = post_json(
        &router,
        "/v1/subscriptions",
        &format!(
            "customer={cus_id}&items[0][price]={}&current_period_start={}&current_period_end={}",
            price["id"].as_str().unwrap(),
            now - MONTH,
            now - DAY,
        ),
    )
    .await;
    let sub_id = subscription["id"].as_str().unwrap().to_string();
    (state, router, cus_id, sub_id)
}

fn record_signals(state: &ApiState) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    state.bus.on_any(move |signal: Signal| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(signal.name);
        }
    });
    seen
}

// ---- Scenario D: successful cycle ---------------------------------------

#[tokio::test]
async fn successful_cycle_pays_the_invoice_and_advances_the_period() {
    let (state, _router, _cus_id, sub_id) = billing_fixture().await;
    let now = state.clock.now();
    let old_start = now - MONTH;
    let old_end = now - DAY;

    let signals = record_signals(&state);
    let processed = billing::process_billing(&state).await;
    assert_eq!(processed, 1);

    assert_eq!(
        *signals.lock().unwrap(),
        vec![
            "invoice.created",
            "payment_intent.created",
            "payment_intent.succeeded",
            "charge.succeeded",
            "invoice.finalized",
            "invoice.paid",
            "invoice.payment_succeeded",
            "subscription.updated",
        ]
    );

    let invoices = state.stores.invoices.snapshot();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert!(invoice["id"].as_str().unwrap().starts_with("in_"));
    assert_eq!(invoice["amount_due"], 2000);
    assert_eq!(invoice["amount_paid"], 2000);
    assert_eq!(invoice["amount_remaining"], 0);
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["paid"], true);
    assert_eq!(invoice["billing_reason"], "subscription_cycle");
    assert_eq!(invoice["period_start"], old_start);
    assert_eq!(invoice["period_end"], old_end);

    let charges = state.stores.charges.snapshot();
    assert_eq!(charges.len(), 1);
    let charge = &charges[0];
    assert!(charge["id"].as_str().unwrap().starts_with("ch_"));
    assert_eq!(charge["status"], "succeeded");
    assert_eq!(charge["amount"], 2000);
    assert_eq!(charge["captured"], true);
    assert_eq!(charge["paid"], true);

    let txn_id = charge["balance_transaction"].as_str().unwrap();
    assert!(txn_id.starts_with("txn_"));
    let txn = state.stores.balance_transactions.get(txn_id).unwrap();
    assert_eq!(txn["amount"], 2000);
    assert_eq!(txn["fee"], 88);
    assert_eq!(txn["net"], 1912);
    assert_eq!(txn["status"], "pending");
    assert_eq!(txn["available_on"], now + 172_800);
    assert_eq!(txn["type"], "charge");
    assert_eq!(txn["source"], charge["id"]);

    let sub = state.stores.subscriptions.get(&sub_id).unwrap();
    assert_eq!(sub["current_period_start"], old_end);
    assert_eq!(sub["current_period_end"], old_end + MONTH);
    assert_eq!(sub["status"], "active");

    // one line item was attached to the invoice
    let items = state.stores.invoice_items.snapshot();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["invoice"], invoice["id"]);
    assert_eq!(items[0]["amount"], 2000);
}

#[tokio::test]
async fn period_advance_composes_across_cycles() {
    let (state, _router, _cus, sub_id) = billing_fixture().await;
    let first_end = state.stores.subscriptions.get(&sub_id).unwrap()["current_period_end"]
        .as_i64()
        .unwrap();

    billing::process_billing(&state).await;
    // period advanced once; advance the clock past the new end and bill again
    state.clock.advance(MONTH + DAY);
    billing::process_billing(&state).await;

    let sub = state.stores.subscriptions.get(&sub_id).unwrap();
    assert_eq!(sub["current_period_start"], first_end + MONTH);
    assert_eq!(sub["current_period_end"], first_end + 2 * MONTH);
    assert_eq!(state.stores.invoices.count(), 2);
}

#[tokio::test]
async fn subscriptions_inside_their_period_are_not_billed() {
    let state = paper_tiger::bootstrap(ServerConfig::default());
    state.clock.set_mode(ClockMode::Manual, 1);
    let router = build_router(state.clone());
    let now = state.clock.now();
    let customer = post_json(&router, "/v1/customers", "name=Early").await;
    post_json(
        &router,
        "/v1/subscriptions",
        &format!(
            "customer={}&current_period_start={}&current_period_end={}",
            customer["id"].as_str().unwrap(),
            now,
            now + MONTH,
        ),
    )
    .await;
    assert_eq!(billing::process_billing(&state).await, 0);
    assert_eq!(state.stores.invoices.count(), 0);
}

#[tokio::test]
async fn missing_price_reference_skips_without_poisoning_the_sweep() {
    let (state, router, _cus, _sub) = billing_fixture().await;
    let now = state.clock.now();
    // a second subscription pointing at a price that does not exist
    let broken_customer = post_json(&router, "/v1/customers", "name=Broken").await;
    post_json(
        &router,
        "/v1/subscriptions",
        &format!(
            "customer={}&items[0][price]=price_ghost&current_period_start={}&current_period_end={}",
            broken_customer["id"].as_str().unwrap(),
            now - MONTH,
            now - DAY,
        ),
    )
    .await;

    // the healthy subscription still bills
    assert_eq!(billing::process_billing(&state).await, 1);
    assert_eq!(state.stores.invoices.count(), 1);
}

#[tokio::test]
async fn plan_fallback_derives_the_amount() {
    let state = paper_tiger::bootstrap(ServerConfig::default());
    state.clock.set_mode(ClockMode::Manual, 1);
    let router = build_router(state.clone());
    let now = state.clock.now();

    let plan = post_json(
        &router,
        "/v1/plans",
        "amount=500&currency=usd&interval=week",
    )
    .await;
    let customer = post_json(&router, "/v1/customers", "name=Planned").await;
    post_json(
        &router,
        "/v1/subscriptions",
        &format!(
            "customer={}&plan={}&current_period_start={}&current_period_end={}",
            customer["id"].as_str().unwrap(),
            plan["id"].as_str().unwrap(),
            now - MONTH,
            now - DAY,
        ),
    )
    .await;

    assert_eq!(billing::process_billing(&state).await, 1);
    let invoice = &state.stores.invoices.snapshot()[0];
    assert_eq!(invoice["amount_due"], 500);
    let sub = &state.stores.subscriptions.snapshot()[0];
    assert_eq!(sub["current_period_end"], (now - DAY) + 604_800);
}

// ---- Scenario E: dunning into past_due ----------------------------------

#[tokio::test]
async fn dunning_reuses_the_invoice_and_tips_into_past_due() {
    let (state, _router, cus_id, sub_id) = billing_fixture().await;
    state
        .chaos
        .simulate_failure(&cus_id, "card_declined")
        .unwrap();

    // attempt 1
    let signals = record_signals(&state);
    assert_eq!(billing::process_billing(&state).await, 1);
    assert_eq!(
        *signals.lock().unwrap(),
        vec![
            "invoice.created",
            "payment_intent.created",
            "payment_intent.payment_failed",
            "charge.failed",
            "invoice.payment_failed",
        ]
    );

    let invoices = state.stores.invoices.snapshot();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0]["status"], "open");
    assert_eq!(invoices[0]["attempt_count"], 1);
    let now = state.clock.now();
    assert_eq!(invoices[0]["next_payment_attempt"], now + DAY);

    let charges = state.stores.charges.snapshot();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0]["status"], "failed");
    assert_eq!(charges[0]["paid"], false);
    assert_eq!(charges[0]["failure_code"], "card_declined");
    assert_eq!(charges[0]["failure_message"], "Your card was declined.");

    assert_eq!(
        state.stores.subscriptions.get(&sub_id).unwrap()["status"],
        "active"
    );

    // attempts 2 and 3 reuse the open invoice and stay active
    for expected_attempts in 2..=3 {
        assert_eq!(billing::process_billing(&state).await, 1);
        let invoices = state.stores.invoices.snapshot();
        assert_eq!(invoices.len(), 1, "open invoice must be reused");
        assert_eq!(invoices[0]["attempt_count"], expected_attempts);
        assert_eq!(
            state.stores.subscriptions.get(&sub_id).unwrap()["status"],
            "active"
        );
    }

    // attempt 4 tips the subscription into past_due
    assert_eq!(billing::process_billing(&state).await, 1);
    let invoices = state.stores.invoices.snapshot();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0]["attempt_count"], 4);
    assert_eq!(invoices[0]["next_payment_attempt"], state.clock.now() + 604_800);
    assert_eq!(
        state.stores.subscriptions.get(&sub_id).unwrap()["status"],
        "past_due"
    );
    assert_eq!(state.stores.charges.count(), 4);

    // past_due subscriptions drop out of eligibility
    assert_eq!(billing::process_billing(&state).await, 0);
    assert_eq!(state.stores.charges.count(), 4);

    // failed payment intents carry the decline details
    let intents = state.stores.payment_intents.snapshot();
    assert_eq!(intents.len(), 4);
    for intent in intents {
        assert_eq!(intent["status"], "requires_payment_method");
        assert_eq!(intent["last_payment_error"]["code"], "card_declined");
        assert_eq!(intent["last_payment_error"]["type"], "card_error");
    }
}

#[tokio::test]
async fn recovery_after_dunning_attempt_pays_the_open_invoice() {
    let (state, _router, cus_id, _sub_id) = billing_fixture().await;
    state
        .chaos
        .simulate_failure(&cus_id, "insufficient_funds")
        .unwrap();
    assert_eq!(billing::process_billing(&state).await, 1);
    let invoice_id = state.stores.invoices.snapshot()[0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    state.chaos.clear_failure(&cus_id);
    assert_eq!(billing::process_billing(&state).await, 1);

    // the same invoice was reused and is now paid
    assert_eq!(state.stores.invoices.count(), 1);
    let invoice = state.stores.invoices.get(&invoice_id).unwrap();
    assert_eq!(invoice["status"], "paid");
    assert_eq!(invoice["amount_remaining"], 0);
}
