//! The resource catalog: one [`ResourceSpec`] per emulated type, plus the
//! handful of custom transitions that fall outside the CRUD template
//! (payment-method attach/detach, refunds, checkout-session completion).

use std::sync::Arc;

use http::Method;
use serde_json::{Map, Value, json};

use crate::billing::charge_fee;
use crate::chaos::{PaymentOutcome, decline_message};
use crate::error::ApiError;
use crate::hydrator;
use crate::params;
use crate::resources::{self, DeleteBehavior, ResourceSpec, new_id};
use crate::responder::Json;
use crate::router::{PathParams, Router};
use crate::signals::Signal;
use crate::state::ApiState;
use crate::types::Request;

fn customer_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("balance".into(), json!(0));
    record.insert("delinquent".into(), json!(false));
}

fn subscription_defaults(record: &mut Map<String, Value>, now: i64) {
    record.insert("status".into(), json!("active"));
    record.insert("current_period_start".into(), json!(now));
    // month-length default period; callers override with their own window
    record.insert("current_period_end".into(), json!(now + 2_592_000));
    record.insert("cancel_at_period_end".into(), json!(false));
}

fn invoice_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("status".into(), json!("draft"));
    record.insert("paid".into(), json!(false));
    record.insert("attempt_count".into(), json!(0));
    record.insert("amount_paid".into(), json!(0));
    record.insert("auto_advance".into(), json!(true));
    record.insert("collection_method".into(), json!("charge_automatically"));
}

fn payment_intent_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("status".into(), json!("requires_payment_method"));
}

fn product_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("active".into(), json!(true));
}

fn price_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("active".into(), json!(true));
    record.insert("type".into(), json!("recurring"));
}

fn plan_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("active".into(), json!(true));
    record.insert("interval_count".into(), json!(1));
}

fn token_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("type".into(), json!("card"));
    record.insert("used".into(), json!(false));
}

fn webhook_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("status".into(), json!("enabled"));
    record.insert(
        "secret".into(),
        json!(format!("whsec_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])),
    );
}

fn checkout_session_defaults(record: &mut Map<String, Value>, _now: i64) {
    record.insert("status".into(), json!("open"));
    record.insert("payment_status".into(), json!("unpaid"));
    record.insert("mode".into(), json!("payment"));
}

/// Every resource the mock stores, in prefix-table order.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::catalog::CATALOG;
///
/// let customer = CATALOG.iter().find(|s| s.object == "customer").unwrap();
/// assert_eq!(customer.prefix, "cus");
/// assert_eq!(customer.path, "customers");
/// ```
pub static CATALOG: &[ResourceSpec] = &[
    ResourceSpec {
        object: "customer",
        path: "customers",
        prefix: "cus",
        table: "customers",
        required: &[],
        extra_immutable: &[],
        filters: &["email"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(customer_defaults),
    },
    ResourceSpec {
        object: "subscription",
        path: "subscriptions",
        prefix: "sub",
        table: "subscriptions",
        required: &["customer"],
        extra_immutable: &["customer"],
        filters: &["customer", "status"],
        delete: DeleteBehavior::Cancel,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(subscription_defaults),
    },
    ResourceSpec {
        object: "subscription_item",
        path: "subscription_items",
        prefix: "si",
        table: "subscription_items",
        required: &["subscription"],
        extra_immutable: &["subscription"],
        filters: &["subscription"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: None,
    },
    ResourceSpec {
        object: "invoice",
        path: "invoices",
        prefix: "in",
        table: "invoices",
        required: &["customer"],
        extra_immutable: &[],
        filters: &["customer", "subscription", "status"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(invoice_defaults),
    },
    ResourceSpec {
        object: "invoiceitem",
        path: "invoiceitems",
        prefix: "ii",
        table: "invoiceitems",
        required: &["customer"],
        extra_immutable: &[],
        filters: &["customer", "invoice"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: None,
    },
    ResourceSpec {
        object: "payment_method",
        path: "payment_methods",
        prefix: "pm",
        table: "payment_methods",
        required: &["type"],
        extra_immutable: &[],
        filters: &["customer", "type"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: None,
    },
    ResourceSpec {
        object: "payment_intent",
        path: "payment_intents",
        prefix: "pi",
        table: "payment_intents",
        required: &["amount", "currency"],
        extra_immutable: &[],
        filters: &["customer"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(payment_intent_defaults),
    },
    ResourceSpec {
        object: "charge",
        path: "charges",
        prefix: "ch",
        table: "charges",
        required: &["amount", "currency"],
        extra_immutable: &[],
        filters: &["customer"],
        delete: DeleteBehavior::Remove,
        // creation goes through the custom handler below, which consults
        // payment chaos and can decline with a 402
        creatable: false,
        updatable: true,
        deletable: false,
        defaults: None,
    },
    ResourceSpec {
        object: "refund",
        path: "refunds",
        prefix: "re",
        table: "refunds",
        required: &["charge"],
        extra_immutable: &["charge"],
        filters: &["charge"],
        delete: DeleteBehavior::Remove,
        // creation goes through the custom handler below
        creatable: false,
        updatable: true,
        deletable: false,
        defaults: None,
    },
    ResourceSpec {
        object: "product",
        path: "products",
        prefix: "prod",
        table: "products",
        required: &["name"],
        extra_immutable: &[],
        filters: &["active"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(product_defaults),
    },
    ResourceSpec {
        object: "price",
        path: "prices",
        prefix: "price",
        table: "prices",
        required: &["currency"],
        extra_immutable: &[],
        filters: &["product", "active"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(price_defaults),
    },
    ResourceSpec {
        object: "plan",
        path: "plans",
        prefix: "plan",
        table: "plans",
        required: &["amount", "currency", "interval"],
        extra_immutable: &[],
        filters: &["product", "active"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(plan_defaults),
    },
    ResourceSpec {
        object: "token",
        path: "tokens",
        prefix: "tok",
        table: "tokens",
        required: &[],
        extra_immutable: &[],
        filters: &[],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: false,
        deletable: false,
        defaults: Some(token_defaults),
    },
    ResourceSpec {
        object: "balance_transaction",
        path: "balance_transactions",
        prefix: "txn",
        table: "balance_transactions",
        required: &[],
        extra_immutable: &[],
        filters: &["type", "source"],
        delete: DeleteBehavior::Remove,
        creatable: false,
        updatable: false,
        deletable: false,
        defaults: None,
    },
    ResourceSpec {
        object: "event",
        path: "events",
        prefix: "evt",
        table: "events",
        required: &[],
        extra_immutable: &[],
        filters: &["type"],
        delete: DeleteBehavior::Remove,
        creatable: false,
        updatable: false,
        deletable: false,
        defaults: None,
    },
    ResourceSpec {
        object: "webhook_endpoint",
        path: "webhook_endpoints",
        prefix: "we",
        table: "webhook_endpoints",
        required: &["url"],
        extra_immutable: &[],
        filters: &[],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: true,
        defaults: Some(webhook_defaults),
    },
    ResourceSpec {
        object: "checkout.session",
        path: "checkout/sessions",
        prefix: "cs",
        table: "checkout_sessions",
        required: &[],
        extra_immutable: &[],
        filters: &["customer"],
        delete: DeleteBehavior::Remove,
        creatable: true,
        updatable: true,
        deletable: false,
        defaults: Some(checkout_session_defaults),
    },
];

/// Registers the template routes for every catalog entry, then the custom
/// transitions.
///
/// Per entry: `POST /v1/<path>` (when creatable), `GET /v1/<path>`,
/// `GET /v1/<path>/{id}`, `POST /v1/<path>/{id}` (when updatable), and
/// `DELETE /v1/<path>/{id}` (when deletable).
pub fn register_routes(router: &mut Router, state: &Arc<ApiState>) {
    for spec in CATALOG {
        let base = format!("/v1/{}", spec.path);
        let item = format!("/v1/{}/{{id}}", spec.path);

        if spec.creatable {
            let state = state.clone();
            router.route(Method::POST, &base, move |req| {
                resources::create(state.clone(), spec, req)
            });
        }
        {
            let state = state.clone();
            router.route(Method::GET, &base, move |req| {
                resources::list(state.clone(), spec, req)
            });
        }
        {
            let state = state.clone();
            router.route(Method::GET, &item, move |req| {
                resources::retrieve(state.clone(), spec, req)
            });
        }
        if spec.updatable {
            let state = state.clone();
            router.route(Method::POST, &item, move |req| {
                resources::update(state.clone(), spec, req)
            });
        }
        if spec.deletable {
            let state = state.clone();
            router.route(Method::DELETE, &item, move |req| {
                resources::delete(state.clone(), spec, req)
            });
        }
    }

    {
        let state = state.clone();
        router.route(Method::POST, "/v1/payment_methods/{id}/attach", move |req| {
            attach_payment_method(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/v1/payment_methods/{id}/detach", move |req| {
            detach_payment_method(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/v1/charges", move |req| {
            create_charge(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(Method::POST, "/v1/refunds", move |req| {
            create_refund(state.clone(), req)
        });
    }
    {
        let state = state.clone();
        router.route(
            Method::POST,
            "/v1/checkout/sessions/{id}/complete",
            move |req| complete_checkout_session(state.clone(), req),
        );
    }
}

/// `POST /v1/payment_methods/{id}/attach` — binds the method to a customer.
async fn attach_payment_method(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let id = PathParams::get(&req, "id")
        .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))?;
    let body = params::parse_body(&req)?;
    let customer = body
        .get("customer")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ApiError::invalid_request("Missing required param: customer.").with_param("customer")
        })?;
    if state.stores.customers.get(customer).is_none() {
        return Err(ApiError::not_found("customer", customer));
    }
    let method = state
        .stores
        .payment_methods
        .get(&id)
        .ok_or_else(|| ApiError::not_found("payment_method", &id))?;

    let mut record = method.as_object().cloned().unwrap_or_default();
    record.insert("customer".into(), json!(customer));
    let stored = state.stores.payment_methods.update(Value::Object(record));
    state
        .bus
        .emit(Signal::new("payment_method.attached", stored.clone()))
        .await;
    Ok(Json(stored))
}

/// `POST /v1/payment_methods/{id}/detach`
async fn detach_payment_method(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let id = PathParams::get(&req, "id")
        .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))?;
    let method = state
        .stores
        .payment_methods
        .get(&id)
        .ok_or_else(|| ApiError::not_found("payment_method", &id))?;
    let mut record = method.as_object().cloned().unwrap_or_default();
    record.remove("customer");
    let stored = state.stores.payment_methods.update(Value::Object(record));
    state
        .bus
        .emit(Signal::new("payment_method.detached", stored.clone()))
        .await;
    Ok(Json(stored))
}

/// `POST /v1/charges` — attempts a payment through the chaos coordinator.
/// Success writes a captured charge and its balance transaction; a decline
/// records the failed charge and answers 402.
async fn create_charge(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let mut body = params::parse_body(&req)?;
    let expand = params::expand_paths(&req, &mut body);
    for field in ["amount", "currency"] {
        if body.get(field).map_or(true, Value::is_null) {
            return Err(
                ApiError::invalid_request(format!("Missing required param: {field}."))
                    .with_param(field),
            );
        }
    }
    let amount = body
        .get("amount")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::invalid_request("Invalid integer: amount").with_param("amount"))?;
    let currency = body.get("currency").cloned().unwrap_or(json!("usd"));
    let customer = body
        .get("customer")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let now = state.clock.now();
    let charge_id = new_id("ch");

    match state.chaos.should_payment_fail(&customer) {
        PaymentOutcome::Ok => {
            let txn_id = new_id("txn");
            let fee = charge_fee(amount);
            let charge = state.stores.charges.insert(json!({
                "id": charge_id,
                "object": "charge",
                "amount": amount,
                "currency": currency,
                "customer": body.get("customer").cloned().unwrap_or(Value::Null),
                "description": body.get("description").cloned().unwrap_or(Value::Null),
                "source": body.get("source").cloned().unwrap_or(Value::Null),
                "status": "succeeded",
                "paid": true,
                "captured": true,
                "refunded": false,
                "amount_refunded": 0,
                "balance_transaction": txn_id,
                "created": now,
                "livemode": false,
                "metadata": body.get("metadata").cloned().unwrap_or(json!({})),
            }));
            state.stores.balance_transactions.insert(json!({
                "id": txn_id,
                "object": "balance_transaction",
                "amount": amount,
                "currency": currency,
                "fee": fee,
                "net": amount - fee,
                "status": "pending",
                "available_on": now + 172_800,
                "type": "charge",
                "source": charge_id,
                "created": now,
            }));
            state
                .bus
                .emit(Signal::new("charge.succeeded", charge.clone()))
                .await;
            Ok(Json(hydrator::expand(&state, &charge, &expand)))
        }
        PaymentOutcome::Fail(code) => {
            let message = decline_message(&code);
            let charge = state.stores.charges.insert(json!({
                "id": charge_id,
                "object": "charge",
                "amount": amount,
                "currency": currency,
                "customer": body.get("customer").cloned().unwrap_or(Value::Null),
                "status": "failed",
                "paid": false,
                "captured": false,
                "failure_code": code,
                "failure_message": message,
                "created": now,
                "livemode": false,
                "metadata": body.get("metadata").cloned().unwrap_or(json!({})),
            }));
            state
                .bus
                .emit(Signal::new("charge.failed", charge))
                .await;
            Err(ApiError::card(&code, message))
        }
    }
}

/// `POST /v1/refunds` — refunds a charge and writes the reversing balance
/// transaction.
async fn create_refund(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let mut body = params::parse_body(&req)?;
    let expand = params::expand_paths(&req, &mut body);
    let charge_id = body
        .get("charge")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ApiError::invalid_request("Missing required param: charge.").with_param("charge")
        })?
        .to_string();
    let charge = state
        .stores
        .charges
        .get(&charge_id)
        .ok_or_else(|| ApiError::not_found("charge", &charge_id))?;

    let charge_amount = charge.get("amount").and_then(Value::as_i64).unwrap_or(0);
    let already_refunded = charge
        .get("amount_refunded")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let refundable = charge_amount - already_refunded;
    let amount = body
        .get("amount")
        .and_then(Value::as_i64)
        .unwrap_or(refundable);
    if amount <= 0 || amount > refundable {
        return Err(ApiError::invalid_request(format!(
            "Refund amount ({amount}) must be positive and no greater than the unrefunded portion of the charge ({refundable})."
        ))
        .with_param("amount"));
    }

    let now = state.clock.now();
    let refund_id = new_id("re");
    let currency = charge.get("currency").cloned().unwrap_or(json!("usd"));

    // Reverse a proportional share of the original fee.
    let original_fee = charge
        .get("balance_transaction")
        .and_then(Value::as_str)
        .and_then(|txn_id| state.stores.balance_transactions.get(txn_id))
        .and_then(|txn| txn.get("fee").and_then(Value::as_i64))
        .unwrap_or(0);
    let reversed_fee = if charge_amount > 0 {
        -((original_fee as f64 * amount as f64 / charge_amount as f64).round() as i64)
    } else {
        0
    };
    let txn = state.stores.balance_transactions.insert(json!({
        "id": new_id("txn"),
        "object": "balance_transaction",
        "amount": -amount,
        "currency": currency,
        "fee": reversed_fee,
        "net": -amount - reversed_fee,
        "status": "available",
        "available_on": now,
        "type": "refund",
        "source": refund_id,
        "created": now,
    }));

    let refund = state.stores.refunds.insert(json!({
        "id": refund_id,
        "object": "refund",
        "amount": amount,
        "currency": currency,
        "charge": charge_id,
        "balance_transaction": txn["id"],
        "status": "succeeded",
        "reason": body.get("reason").cloned().unwrap_or(Value::Null),
        "metadata": body.get("metadata").cloned().unwrap_or(json!({})),
        "created": now,
        "livemode": false,
    }));

    let mut updated = charge.as_object().cloned().unwrap_or_default();
    let total_refunded = already_refunded + amount;
    updated.insert("amount_refunded".into(), json!(total_refunded));
    updated.insert("refunded".into(), json!(total_refunded >= charge_amount));
    let stored_charge = state.stores.charges.update(Value::Object(updated));

    state
        .bus
        .emit(Signal::new("refund.created", refund.clone()))
        .await;
    state
        .bus
        .emit(Signal::new("charge.refunded", stored_charge))
        .await;

    Ok(Json(hydrator::expand(&state, &refund, &expand)))
}

/// `POST /v1/checkout/sessions/{id}/complete`
async fn complete_checkout_session(state: Arc<ApiState>, req: Request) -> Result<Json, ApiError> {
    let id = PathParams::get(&req, "id")
        .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))?;
    let session = state
        .stores
        .checkout_sessions
        .get(&id)
        .ok_or_else(|| ApiError::not_found("checkout.session", &id))?;
    let mut record = session.as_object().cloned().unwrap_or_default();
    record.insert("status".into(), json!("complete"));
    record.insert("payment_status".into(), json!("paid"));
    let stored = state.stores.checkout_sessions.update(Value::Object(record));
    state
        .bus
        .emit(Signal::new("checkout.session.completed", stored.clone()))
        .await;
    Ok(Json(stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrator::PREFIXES;

    #[test]
    fn every_catalog_prefix_is_in_the_hydrator_table() {
        for spec in CATALOG {
            let entry = PREFIXES.iter().find(|(p, _)| *p == spec.prefix);
            let (_, table) = entry.unwrap_or_else(|| {
                panic!("prefix {} missing from the hydrator table", spec.prefix)
            });
            assert_eq!(*table, spec.table, "table mismatch for {}", spec.prefix);
        }
    }

    #[test]
    fn prefixes_are_unique() {
        let mut prefixes: Vec<&str> = CATALOG.iter().map(|s| s.prefix).collect();
        prefixes.sort();
        let len = prefixes.len();
        prefixes.dedup();
        assert_eq!(prefixes.len(), len);
    }
}
