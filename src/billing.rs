//! The billing engine: a periodic state machine over active subscriptions.
//!
//! Each sweep selects subscriptions whose period has elapsed on the virtual
//! clock and runs one billing cycle: derive the amount from the first item's
//! price (falling back to the plan), select or create the open invoice,
//! attempt payment through the chaos coordinator, then either advance the
//! subscription period or walk the dunning ladder toward `past_due`.
//!
//! Failures are per-subscription: they are logged and counted, and never
//! abort the sweep for the remaining eligible subscriptions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::chaos::{PaymentOutcome, decline_message};
use crate::clock::ClockMode;
use crate::resources::new_id;
use crate::signals::{Signal, names};
use crate::state::ApiState;

/// Seconds per billing interval unit.
pub fn interval_secs(interval: &str) -> Option<i64> {
    match interval {
        "day" => Some(86_400),
        "week" => Some(604_800),
        "month" => Some(2_592_000),
        "year" => Some(31_536_000),
        _ => None,
    }
}

/// Dunning delay after failed attempt `n` (1-based).
pub fn retry_delay(attempt: i64) -> i64 {
    match attempt {
        1 => 86_400,
        2 => 259_200,
        3 => 432_000,
        _ => 604_800,
    }
}

/// Attempts at which the subscription tips into `past_due`.
const DUNNING_LIMIT: i64 = 4;

/// Processing fee on a successful charge: 2.9% + 30.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::billing::charge_fee;
///
/// assert_eq!(charge_fee(2000), 88);
/// ```
pub fn charge_fee(amount: i64) -> i64 {
    (amount as f64 * 0.029).round() as i64 + 30
}

/// Spawns the 1-second poll worker. Polling is suppressed while the clock is
/// in manual mode (tests drive [`process_billing`] explicitly) and entirely
/// absent when disabled in config.
pub fn spawn(state: Arc<ApiState>) {
    if !state.config.billing_poll {
        return;
    }
    let weak = Arc::downgrade(&state);
    drop(state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let Some(state) = weak.upgrade() else { break };
            if state.clock.mode() == ClockMode::Manual {
                continue;
            }
            process_billing(&state).await;
        }
    });
}

/// Runs one billing sweep; returns how many subscriptions were cycled.
pub async fn process_billing(state: &Arc<ApiState>) -> usize {
    let now = state.clock.now();
    let eligible: Vec<Value> = state
        .stores
        .subscriptions
        .snapshot()
        .into_iter()
        .filter(|sub| {
            sub.get("status").and_then(Value::as_str) == Some("active")
                && sub
                    .get("current_period_end")
                    .and_then(Value::as_i64)
                    .is_some_and(|end| end <= now)
        })
        .collect();

    let mut cycled = 0;
    for subscription in eligible {
        let id = subscription
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<missing id>")
            .to_string();
        match cycle(state, subscription).await {
            Ok(()) => cycled += 1,
            Err(reason) => {
                tracing::warn!(subscription = %id, %reason, "billing cycle skipped");
            }
        }
    }
    cycled
}

struct BillingTerms {
    amount: i64,
    currency: Value,
    interval: String,
    interval_count: i64,
}

/// Prefer the first subscription item's price; fall back to the plan.
fn derive_terms(state: &ApiState, subscription: &Value) -> Result<BillingTerms, String> {
    let first_price = subscription
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("price"))
        .and_then(Value::as_str);

    if let Some(price_id) = first_price {
        let price = state
            .stores
            .prices
            .get(price_id)
            .ok_or_else(|| format!("price {price_id} not found"))?;
        let amount = price
            .get("unit_amount")
            .and_then(Value::as_i64)
            .ok_or_else(|| format!("price {price_id} has no unit_amount"))?;
        let recurring = price.get("recurring");
        let interval = recurring
            .and_then(|r| r.get("interval"))
            .or_else(|| price.get("interval"))
            .and_then(Value::as_str)
            .unwrap_or("month")
            .to_string();
        let interval_count = recurring
            .and_then(|r| r.get("interval_count"))
            .or_else(|| price.get("interval_count"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        return Ok(BillingTerms {
            amount,
            currency: price.get("currency").cloned().unwrap_or(json!("usd")),
            interval,
            interval_count,
        });
    }

    let plan_id = subscription
        .get("plan")
        .and_then(Value::as_str)
        .ok_or_else(|| "subscription has neither items nor a plan".to_string())?;
    let plan = state
        .stores
        .plans
        .get(plan_id)
        .ok_or_else(|| format!("plan {plan_id} not found"))?;
    let amount = plan
        .get("amount")
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("plan {plan_id} has no amount"))?;
    Ok(BillingTerms {
        amount,
        currency: plan.get("currency").cloned().unwrap_or(json!("usd")),
        interval: plan
            .get("interval")
            .and_then(Value::as_str)
            .unwrap_or("month")
            .to_string(),
        interval_count: plan
            .get("interval_count")
            .and_then(Value::as_i64)
            .unwrap_or(1),
    })
}

async fn emit(state: &ApiState, name: &str, snapshot: Value) {
    state.bus.emit(Signal::new(name, snapshot)).await;
}

/// Reuse the subscription's open invoice, else open a fresh one (plus its
/// line item) and announce it.
async fn select_invoice(
    state: &Arc<ApiState>,
    subscription: &Value,
    customer: &str,
    terms: &BillingTerms,
    now: i64,
) -> Value {
    let sub_id = subscription.get("id").and_then(Value::as_str).unwrap_or("");
    let open = state.stores.invoices.snapshot().into_iter().find(|inv| {
        inv.get("subscription").and_then(Value::as_str) == Some(sub_id)
            && inv.get("status").and_then(Value::as_str) == Some("open")
    });
    if let Some(invoice) = open {
        return invoice;
    }

    let invoice_id = new_id("in");
    let invoice = state.stores.invoices.insert(json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": customer,
        "subscription": sub_id,
        "status": "draft",
        "amount_due": terms.amount,
        "amount_paid": 0,
        "amount_remaining": terms.amount,
        "currency": terms.currency,
        "billing_reason": "subscription_cycle",
        "period_start": subscription.get("current_period_start").cloned().unwrap_or(json!(now)),
        "period_end": subscription.get("current_period_end").cloned().unwrap_or(json!(now)),
        "auto_advance": true,
        "collection_method": "charge_automatically",
        "attempt_count": 0,
        "attempted": false,
        "paid": false,
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    state.stores.invoice_items.insert(json!({
        "id": new_id("ii"),
        "object": "invoiceitem",
        "customer": customer,
        "invoice": invoice_id,
        "subscription": sub_id,
        "amount": terms.amount,
        "currency": terms.currency,
        "description": format!("Subscription cycle for {sub_id}"),
        "period": {
            "start": subscription.get("current_period_start").cloned().unwrap_or(json!(now)),
            "end": subscription.get("current_period_end").cloned().unwrap_or(json!(now)),
        },
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    emit(state, names::INVOICE_CREATED, invoice.clone()).await;
    invoice
}

async fn cycle(state: &Arc<ApiState>, subscription: Value) -> Result<(), String> {
    let now = state.clock.now();
    let customer = subscription
        .get("customer")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let terms = derive_terms(state, &subscription)?;
    let invoice = select_invoice(state, &subscription, &customer, &terms, now).await;

    match state.chaos.should_payment_fail(&customer) {
        PaymentOutcome::Ok => {
            charge_succeeded(state, subscription, invoice, &customer, &terms, now).await
        }
        PaymentOutcome::Fail(code) => {
            charge_failed(state, subscription, invoice, &customer, &terms, &code, now).await
        }
    }
}

async fn charge_succeeded(
    state: &Arc<ApiState>,
    subscription: Value,
    invoice: Value,
    customer: &str,
    terms: &BillingTerms,
    now: i64,
) -> Result<(), String> {
    let invoice_id = invoice.get("id").and_then(Value::as_str).unwrap_or("");
    let txn_id = new_id("txn");
    let charge_id = new_id("ch");

    let intent = state.stores.payment_intents.insert(json!({
        "id": new_id("pi"),
        "object": "payment_intent",
        "amount": terms.amount,
        "currency": terms.currency,
        "customer": customer,
        "invoice": invoice_id,
        "status": "succeeded",
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    emit(state, names::PAYMENT_INTENT_CREATED, intent.clone()).await;
    emit(state, names::PAYMENT_INTENT_SUCCEEDED, intent.clone()).await;

    let fee = charge_fee(terms.amount);
    let charge = state.stores.charges.insert(json!({
        "id": charge_id,
        "object": "charge",
        "amount": terms.amount,
        "currency": terms.currency,
        "customer": customer,
        "invoice": invoice_id,
        "payment_intent": intent["id"],
        "status": "succeeded",
        "paid": true,
        "captured": true,
        "refunded": false,
        "amount_refunded": 0,
        "balance_transaction": txn_id,
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    state.stores.balance_transactions.insert(json!({
        "id": txn_id,
        "object": "balance_transaction",
        "amount": terms.amount,
        "currency": terms.currency,
        "fee": fee,
        "net": terms.amount - fee,
        "status": "pending",
        "available_on": now + 172_800,
        "type": "charge",
        "source": charge_id,
        "created": now,
    }));
    emit(state, names::CHARGE_SUCCEEDED, charge.clone()).await;

    let mut paid = invoice.as_object().cloned().unwrap_or_default();
    paid.insert("status".into(), json!("paid"));
    paid.insert("paid".into(), json!(true));
    paid.insert("amount_paid".into(), json!(terms.amount));
    paid.insert("amount_remaining".into(), json!(0));
    paid.insert("attempted".into(), json!(true));
    paid.insert("charge".into(), json!(charge_id));
    paid.insert("payment_intent".into(), intent["id"].clone());
    let paid = state.stores.invoices.update(Value::Object(paid));
    emit(state, names::INVOICE_FINALIZED, paid.clone()).await;
    emit(state, names::INVOICE_PAID, paid.clone()).await;
    emit(state, names::INVOICE_PAYMENT_SUCCEEDED, paid.clone()).await;

    // Advance the billing period.
    let old_end = subscription
        .get("current_period_end")
        .and_then(Value::as_i64)
        .ok_or_else(|| "subscription has no current_period_end".to_string())?;
    let duration = interval_secs(&terms.interval)
        .ok_or_else(|| format!("unknown interval: {}", terms.interval))?;
    let mut advanced = subscription.as_object().cloned().unwrap_or_default();
    advanced.insert("current_period_start".into(), json!(old_end));
    advanced.insert(
        "current_period_end".into(),
        json!(old_end + duration * terms.interval_count.max(1)),
    );
    advanced.insert("latest_invoice".into(), json!(invoice_id));
    let advanced = state.stores.subscriptions.update(Value::Object(advanced));
    emit(state, names::SUBSCRIPTION_UPDATED, advanced).await;
    Ok(())
}

async fn charge_failed(
    state: &Arc<ApiState>,
    subscription: Value,
    invoice: Value,
    customer: &str,
    terms: &BillingTerms,
    code: &str,
    now: i64,
) -> Result<(), String> {
    let invoice_id = invoice.get("id").and_then(Value::as_str).unwrap_or("");
    let message = decline_message(code);

    let intent = state.stores.payment_intents.insert(json!({
        "id": new_id("pi"),
        "object": "payment_intent",
        "amount": terms.amount,
        "currency": terms.currency,
        "customer": customer,
        "invoice": invoice_id,
        "status": "requires_payment_method",
        "last_payment_error": {
            "code": code,
            "message": message,
            "type": "card_error",
        },
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    emit(state, names::PAYMENT_INTENT_CREATED, intent.clone()).await;
    emit(state, names::PAYMENT_INTENT_PAYMENT_FAILED, intent.clone()).await;

    let charge = state.stores.charges.insert(json!({
        "id": new_id("ch"),
        "object": "charge",
        "amount": terms.amount,
        "currency": terms.currency,
        "customer": customer,
        "invoice": invoice_id,
        "payment_intent": intent["id"],
        "status": "failed",
        "paid": false,
        "captured": false,
        "failure_code": code,
        "failure_message": message,
        "created": now,
        "livemode": false,
        "metadata": {},
    }));
    emit(state, names::CHARGE_FAILED, charge.clone()).await;

    let attempts = invoice
        .get("attempt_count")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        + 1;
    let mut open = invoice.as_object().cloned().unwrap_or_default();
    open.insert("status".into(), json!("open"));
    open.insert("attempt_count".into(), json!(attempts));
    open.insert("attempted".into(), json!(true));
    open.insert(
        "next_payment_attempt".into(),
        json!(now + retry_delay(attempts)),
    );
    let open = state.stores.invoices.update(Value::Object(open));
    emit(state, names::INVOICE_PAYMENT_FAILED, open).await;

    if attempts >= DUNNING_LIMIT {
        let mut past_due = subscription.as_object().cloned().unwrap_or_default();
        past_due.insert("status".into(), json!("past_due"));
        let past_due = state.stores.subscriptions.update(Value::Object(past_due));
        emit(state, names::SUBSCRIPTION_UPDATED, past_due).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_arithmetic_matches_the_table() {
        assert_eq!(interval_secs("day"), Some(86_400));
        assert_eq!(interval_secs("week"), Some(604_800));
        assert_eq!(interval_secs("month"), Some(2_592_000));
        assert_eq!(interval_secs("year"), Some(31_536_000));
        assert_eq!(interval_secs("fortnight"), None);
    }

    #[test]
    fn dunning_delays_escalate_then_plateau() {
        assert_eq!(retry_delay(1), 86_400);
        assert_eq!(retry_delay(2), 259_200);
        assert_eq!(retry_delay(3), 432_000);
        assert_eq!(retry_delay(4), 604_800);
        assert_eq!(retry_delay(9), 604_800);
    }

    #[test]
    fn fee_is_two_point_nine_percent_plus_thirty() {
        assert_eq!(charge_fee(2000), 88);
        assert_eq!(charge_fee(0), 30);
        assert_eq!(charge_fee(10_000), 320);
    }
}
