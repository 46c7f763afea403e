//! Injected-failure coordinator.
//!
//! Central authority for three failure families: payment declines (global
//! rate or per-customer overrides), event delivery chaos (buffering with
//! reorder/duplication), and API-level failures (timeout / rate limit /
//! server error bands). Every decision bumps a statistics counter so tests
//! can assert on what was injected. `reset()` restores defaults and clears
//! overrides and buffers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};

/// The decline codes chaos configs may select, with their user-facing
/// messages. Broader than what live processors return, on purpose.
pub static DECLINE_CODES: &[(&str, &str)] = &[
    ("card_declined", "Your card was declined."),
    ("insufficient_funds", "Your card has insufficient funds."),
    ("expired_card", "Your card has expired."),
    ("incorrect_cvc", "Your card's security code is incorrect."),
    ("incorrect_number", "Your card number is incorrect."),
    ("processing_error", "An error occurred while processing your card. Try again in a little bit."),
    ("lost_card", "Your card was declined."),
    ("stolen_card", "Your card was declined."),
    ("fraudulent", "Your card was declined."),
    ("generic_decline", "Your card was declined."),
];

const GENERIC_DECLINE_MESSAGE: &str = "Your card was declined.";

/// Human-readable message for a decline code, with a generic fallback.
pub fn decline_message(code: &str) -> &'static str {
    DECLINE_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, m)| *m)
        .unwrap_or(GENERIC_DECLINE_MESSAGE)
}

fn known_code(code: &str) -> bool {
    DECLINE_CODES.iter().any(|(c, _)| *c == code)
}

/// Outcome of a payment decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    Ok,
    Fail(String),
}

/// Outcome of an API-level decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiOutcome {
    Ok,
    Timeout(u64),
    RateLimit,
    ServerError,
}

/// Rejected chaos configuration.
#[derive(Debug, Clone)]
pub struct ChaosConfigError(pub String);

impl std::fmt::Display for ChaosConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ChaosConfigError {}

#[derive(Clone)]
struct PaymentChaos {
    failure_rate: f64,
    decline_codes: Vec<String>,
    decline_weights: Option<HashMap<String, f64>>,
    customer_overrides: HashMap<String, String>,
}

impl Default for PaymentChaos {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            decline_codes: vec!["card_declined".to_string()],
            decline_weights: None,
            customer_overrides: HashMap::new(),
        }
    }
}

type DeliverFn = Arc<dyn Fn(Value) + Send + Sync>;

struct BufferedEvent {
    event: Value,
    deliver: DeliverFn,
}

#[derive(Default)]
struct EventChaos {
    out_of_order: bool,
    duplicate_rate: f64,
    buffer_window_ms: u64,
    buffer: Vec<BufferedEvent>,
}

impl EventChaos {
    fn active(&self) -> bool {
        self.out_of_order || self.duplicate_rate > 0.0 || self.buffer_window_ms > 0
    }
}

#[derive(Clone, Default)]
struct ApiChaos {
    timeout_rate: f64,
    rate_limit_rate: f64,
    error_rate: f64,
    timeout_ms: u64,
    endpoint_overrides: HashMap<String, ApiOutcome>,
}

/// Readable snapshot of the decision counters.
#[derive(Default)]
pub struct ChaosStats {
    pub payments_succeeded: AtomicU64,
    pub payments_failed: AtomicU64,
    pub events_reordered: AtomicU64,
    pub events_duplicated: AtomicU64,
    pub api_timeouts: AtomicU64,
    pub api_rate_limits: AtomicU64,
    pub api_errors: AtomicU64,
}

impl ChaosStats {
    pub fn to_value(&self) -> Value {
        json!({
            "payments_succeeded": self.payments_succeeded.load(Ordering::Relaxed),
            "payments_failed": self.payments_failed.load(Ordering::Relaxed),
            "events_reordered": self.events_reordered.load(Ordering::Relaxed),
            "events_duplicated": self.events_duplicated.load(Ordering::Relaxed),
            "api_timeouts": self.api_timeouts.load(Ordering::Relaxed),
            "api_rate_limits": self.api_rate_limits.load(Ordering::Relaxed),
            "api_errors": self.api_errors.load(Ordering::Relaxed),
        })
    }

    fn reset(&self) {
        self.payments_succeeded.store(0, Ordering::Relaxed);
        self.payments_failed.store(0, Ordering::Relaxed);
        self.events_reordered.store(0, Ordering::Relaxed);
        self.events_duplicated.store(0, Ordering::Relaxed);
        self.api_timeouts.store(0, Ordering::Relaxed);
        self.api_rate_limits.store(0, Ordering::Relaxed);
        self.api_errors.store(0, Ordering::Relaxed);
    }
}

struct Inner {
    payment: Mutex<PaymentChaos>,
    event: Mutex<EventChaos>,
    api: Mutex<ApiChaos>,
    stats: ChaosStats,
    /// Guards stale one-shot flush timers from draining a newer buffer cycle.
    flush_epoch: AtomicU64,
}

/// Cheaply cloneable handle to the shared chaos state.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::chaos::{ChaosCoordinator, PaymentOutcome};
///
/// let chaos = ChaosCoordinator::new();
/// chaos.simulate_failure("cus_1", "insufficient_funds").unwrap();
/// assert_eq!(
///     chaos.should_payment_fail("cus_1"),
///     PaymentOutcome::Fail("insufficient_funds".to_string()),
/// );
/// assert_eq!(chaos.should_payment_fail("cus_other"), PaymentOutcome::Ok);
/// ```
#[derive(Clone)]
pub struct ChaosCoordinator {
    inner: Arc<Inner>,
}

impl Default for ChaosCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                payment: Mutex::new(PaymentChaos::default()),
                event: Mutex::new(EventChaos::default()),
                api: Mutex::new(ApiChaos {
                    timeout_ms: 5000,
                    ..ApiChaos::default()
                }),
                stats: ChaosStats::default(),
                flush_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.inner.stats
    }

    // ----- payment chaos -------------------------------------------------

    /// Sets the global payment failure policy. Codes (and weight keys) must
    /// come from [`DECLINE_CODES`].
    pub fn configure_payment(
        &self,
        failure_rate: f64,
        decline_codes: Vec<String>,
        decline_weights: Option<HashMap<String, f64>>,
    ) -> Result<(), ChaosConfigError> {
        for code in &decline_codes {
            if !known_code(code) {
                return Err(ChaosConfigError(format!("unknown decline code: {code}")));
            }
        }
        if let Some(weights) = &decline_weights {
            for code in weights.keys() {
                if !known_code(code) {
                    return Err(ChaosConfigError(format!("unknown decline code: {code}")));
                }
            }
        }
        let mut payment = self.inner.payment.lock();
        payment.failure_rate = failure_rate.clamp(0.0, 1.0);
        if !decline_codes.is_empty() {
            payment.decline_codes = decline_codes;
        }
        payment.decline_weights = decline_weights;
        Ok(())
    }

    /// Forces every payment for a customer to decline with the given code.
    pub fn simulate_failure(&self, customer: &str, code: &str) -> Result<(), ChaosConfigError> {
        if !known_code(code) {
            return Err(ChaosConfigError(format!("unknown decline code: {code}")));
        }
        self.inner
            .payment
            .lock()
            .customer_overrides
            .insert(customer.to_string(), code.to_string());
        Ok(())
    }

    /// Clears a per-customer override.
    pub fn clear_failure(&self, customer: &str) {
        self.inner.payment.lock().customer_overrides.remove(customer);
    }

    /// Decides whether a payment for this customer fails, and with what code.
    pub fn should_payment_fail(&self, customer: &str) -> PaymentOutcome {
        let payment = self.inner.payment.lock();
        if let Some(code) = payment.customer_overrides.get(customer) {
            self.inner.stats.payments_failed.fetch_add(1, Ordering::Relaxed);
            return PaymentOutcome::Fail(code.clone());
        }
        let draw: f64 = rand::thread_rng().r#gen();
        if draw < payment.failure_rate {
            let code = pick_code(&payment);
            self.inner.stats.payments_failed.fetch_add(1, Ordering::Relaxed);
            return PaymentOutcome::Fail(code);
        }
        self.inner
            .stats
            .payments_succeeded
            .fetch_add(1, Ordering::Relaxed);
        PaymentOutcome::Ok
    }

    // ----- event chaos ----------------------------------------------------

    /// Sets the event-delivery chaos policy.
    pub fn configure_events(&self, out_of_order: bool, duplicate_rate: f64, buffer_window_ms: u64) {
        let mut event = self.inner.event.lock();
        event.out_of_order = out_of_order;
        event.duplicate_rate = duplicate_rate.clamp(0.0, 1.0);
        event.buffer_window_ms = buffer_window_ms;
    }

    /// Routes a materialized event toward delivery.
    ///
    /// With no event chaos active the event is handed to `deliver`
    /// immediately. Otherwise it joins the buffer; the first buffered event
    /// of a cycle arms a one-shot flush timer at `buffer_window_ms`.
    pub fn queue_event(&self, event: Value, deliver: DeliverFn) {
        let window_ms = {
            let mut chaos = self.inner.event.lock();
            if !chaos.active() {
                drop(chaos);
                deliver(event);
                return;
            }
            chaos.buffer.push(BufferedEvent { event, deliver });
            if chaos.buffer.len() > 1 {
                return;
            }
            chaos.buffer_window_ms.max(1)
        };
        let epoch = self.inner.flush_epoch.load(Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(window_ms)).await;
            if this.inner.flush_epoch.load(Ordering::SeqCst) == epoch {
                this.flush_events();
            }
        });
    }

    /// Forces the buffered events out: optional shuffle, probabilistic
    /// duplication, then delivery in buffer order.
    pub fn flush_events(&self) {
        self.inner.flush_epoch.fetch_add(1, Ordering::SeqCst);
        let (mut batch, out_of_order, duplicate_rate) = {
            let mut chaos = self.inner.event.lock();
            (
                std::mem::take(&mut chaos.buffer),
                chaos.out_of_order,
                chaos.duplicate_rate,
            )
        };
        if batch.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        if out_of_order && batch.len() > 1 {
            // Fisher-Yates
            for i in (1..batch.len()).rev() {
                let j = rng.gen_range(0..=i);
                batch.swap(i, j);
            }
            self.inner
                .stats
                .events_reordered
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        let mut deliveries: Vec<(Value, DeliverFn)> = Vec::with_capacity(batch.len());
        for entry in batch {
            if duplicate_rate > 0.0 && rng.r#gen::<f64>() < duplicate_rate {
                self.inner
                    .stats
                    .events_duplicated
                    .fetch_add(1, Ordering::Relaxed);
                deliveries.push((entry.event.clone(), entry.deliver.clone()));
            }
            deliveries.push((entry.event, entry.deliver));
        }
        for (event, deliver) in deliveries {
            deliver(event);
        }
    }

    // ----- api chaos ------------------------------------------------------

    /// Sets the API failure bands and simulated timeout duration.
    pub fn configure_api(
        &self,
        timeout_rate: f64,
        rate_limit_rate: f64,
        error_rate: f64,
        timeout_ms: u64,
    ) {
        let mut api = self.inner.api.lock();
        api.timeout_rate = timeout_rate.clamp(0.0, 1.0);
        api.rate_limit_rate = rate_limit_rate.clamp(0.0, 1.0);
        api.error_rate = error_rate.clamp(0.0, 1.0);
        api.timeout_ms = timeout_ms;
    }

    /// Pins a specific outcome for one endpoint path.
    pub fn override_endpoint(&self, path: &str, outcome: ApiOutcome) {
        self.inner
            .api
            .lock()
            .endpoint_overrides
            .insert(path.to_string(), outcome);
    }

    /// Decides whether a request to `path` fails, and how. One uniform draw
    /// maps sequentially through the timeout / rate-limit / error bands.
    pub fn should_api_fail(&self, path: &str) -> ApiOutcome {
        let api = self.inner.api.lock();
        let outcome = if let Some(pinned) = api.endpoint_overrides.get(path) {
            pinned.clone()
        } else {
            let draw: f64 = rand::thread_rng().r#gen();
            if draw < api.timeout_rate {
                ApiOutcome::Timeout(api.timeout_ms)
            } else if draw < api.timeout_rate + api.rate_limit_rate {
                ApiOutcome::RateLimit
            } else if draw < api.timeout_rate + api.rate_limit_rate + api.error_rate {
                ApiOutcome::ServerError
            } else {
                ApiOutcome::Ok
            }
        };
        match &outcome {
            ApiOutcome::Timeout(_) => {
                self.inner.stats.api_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ApiOutcome::RateLimit => {
                self.inner
                    .stats
                    .api_rate_limits
                    .fetch_add(1, Ordering::Relaxed);
            }
            ApiOutcome::ServerError => {
                self.inner.stats.api_errors.fetch_add(1, Ordering::Relaxed);
            }
            ApiOutcome::Ok => {}
        }
        outcome
    }

    /// Restores defaults; clears overrides, buffers, and counters.
    pub fn reset(&self) {
        *self.inner.payment.lock() = PaymentChaos::default();
        {
            let mut event = self.inner.event.lock();
            *event = EventChaos::default();
        }
        self.inner.flush_epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.api.lock() = ApiChaos {
            timeout_ms: 5000,
            ..ApiChaos::default()
        };
        self.inner.stats.reset();
    }
}

fn pick_code(payment: &PaymentChaos) -> String {
    if let Some(weights) = &payment.decline_weights {
        let total: f64 = weights.values().sum();
        if total > 0.0 {
            let mut draw = rand::thread_rng().gen_range(0.0..total);
            for (code, weight) in weights {
                if draw < *weight {
                    return code.clone();
                }
                draw -= weight;
            }
        }
    }
    let codes = &payment.decline_codes;
    if codes.is_empty() {
        return "card_declined".to_string();
    }
    let i = rand::thread_rng().gen_range(0..codes.len());
    codes[i].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn customer_override_beats_global_rate() {
        let chaos = ChaosCoordinator::new();
        chaos.configure_payment(0.0, vec![], None).unwrap();
        chaos.simulate_failure("cus_1", "insufficient_funds").unwrap();
        assert_eq!(
            chaos.should_payment_fail("cus_1"),
            PaymentOutcome::Fail("insufficient_funds".into())
        );
        assert_eq!(chaos.should_payment_fail("cus_2"), PaymentOutcome::Ok);
        chaos.clear_failure("cus_1");
        assert_eq!(chaos.should_payment_fail("cus_1"), PaymentOutcome::Ok);
    }

    #[test]
    fn full_failure_rate_always_declines() {
        let chaos = ChaosCoordinator::new();
        chaos
            .configure_payment(1.0, vec!["expired_card".into()], None)
            .unwrap();
        for _ in 0..20 {
            assert_eq!(
                chaos.should_payment_fail("cus_x"),
                PaymentOutcome::Fail("expired_card".into())
            );
        }
        assert_eq!(chaos.stats().payments_failed.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn unknown_codes_are_rejected_at_config_time() {
        let chaos = ChaosCoordinator::new();
        assert!(chaos.configure_payment(0.5, vec!["bogus".into()], None).is_err());
        assert!(chaos.simulate_failure("cus_1", "nope").is_err());
        let weights = HashMap::from([("not_a_code".to_string(), 1.0)]);
        assert!(chaos.configure_payment(0.5, vec![], Some(weights)).is_err());
    }

    #[test]
    fn weighted_sampling_stays_within_the_declared_set() {
        let chaos = ChaosCoordinator::new();
        let weights = HashMap::from([
            ("card_declined".to_string(), 3.0),
            ("fraudulent".to_string(), 1.0),
        ]);
        chaos.configure_payment(1.0, vec![], Some(weights)).unwrap();
        for _ in 0..50 {
            match chaos.should_payment_fail("cus_w") {
                PaymentOutcome::Fail(code) => {
                    assert!(code == "card_declined" || code == "fraudulent")
                }
                PaymentOutcome::Ok => panic!("rate 1.0 must fail"),
            }
        }
    }

    #[tokio::test]
    async fn buffered_events_flush_on_demand_with_duplicates() {
        let chaos = ChaosCoordinator::new();
        chaos.configure_events(false, 1.0, 60_000);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..3 {
            let sink = seen.clone();
            chaos.queue_event(
                json!({"n": i}),
                Arc::new(move |event| sink.lock().unwrap().push(event["n"].as_i64().unwrap())),
            );
        }
        assert!(seen.lock().unwrap().is_empty());
        chaos.flush_events();
        // duplicate_rate 1.0 doubles every entry
        assert_eq!(seen.lock().unwrap().len(), 6);
        assert_eq!(
            chaos.stats().events_duplicated.load(Ordering::Relaxed),
            3
        );
    }

    #[tokio::test]
    async fn inactive_event_chaos_delivers_inline() {
        let chaos = ChaosCoordinator::new();
        let seen = Arc::new(StdMutex::new(0));
        let sink = seen.clone();
        chaos.queue_event(json!({}), Arc::new(move |_| *sink.lock().unwrap() += 1));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn endpoint_override_wins_over_bands() {
        let chaos = ChaosCoordinator::new();
        chaos.configure_api(0.0, 0.0, 0.0, 5000);
        chaos.override_endpoint("/v1/charges", ApiOutcome::RateLimit);
        assert_eq!(chaos.should_api_fail("/v1/charges"), ApiOutcome::RateLimit);
        assert_eq!(chaos.should_api_fail("/v1/customers"), ApiOutcome::Ok);
        assert_eq!(chaos.stats().api_rate_limits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reset_restores_defaults() {
        let chaos = ChaosCoordinator::new();
        chaos.configure_payment(1.0, vec![], None).unwrap();
        chaos.simulate_failure("cus_1", "card_declined").unwrap();
        chaos.override_endpoint("/v1/x", ApiOutcome::ServerError);
        chaos.reset();
        assert_eq!(chaos.should_payment_fail("cus_1"), PaymentOutcome::Ok);
        assert_eq!(chaos.should_api_fail("/v1/x"), ApiOutcome::Ok);
        assert_eq!(chaos.stats().payments_succeeded.load(Ordering::Relaxed), 1);
    }
}
