//! In-process telemetry bus for resource lifecycle signals.
//!
//! This module defines a small dispatch abstraction for named lifecycle
//! signals emitted within the mock: every successful write path and each
//! billing state transition posts a [`Signal`] carrying a snapshot of the
//! resource as it was at emit time. Handlers register at startup — the event
//! materializer subscribes to everything via [`TelemetryBus::on_any`] — and
//! run to completion before the emitter proceeds, so bus subscribers observe
//! signals in exactly the order they were posted. Slow work (webhook
//! delivery) must be offloaded by the handler, never performed inline.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

/// Signal names fixed by the billing state machine. Resource dispatch builds
/// its names dynamically (`"<object>.created"` and friends).
pub mod names {
    pub const INVOICE_CREATED: &str = "invoice.created";
    pub const INVOICE_FINALIZED: &str = "invoice.finalized";
    pub const INVOICE_PAID: &str = "invoice.paid";
    pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
    pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
    pub const PAYMENT_INTENT_CREATED: &str = "payment_intent.created";
    pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
    pub const PAYMENT_INTENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";
    pub const CHARGE_SUCCEEDED: &str = "charge.succeeded";
    pub const CHARGE_FAILED: &str = "charge.failed";
    pub const SUBSCRIPTION_UPDATED: &str = "subscription.updated";
}

/// A lifecycle signal: a dot-qualified name plus the resource snapshot.
///
/// Signals are identified by the `<object>.<action>` convention
/// (`customer.created`, `invoice.payment_failed`). The snapshot is the
/// resource **as stored at emit time** — never a hydrated copy — which is
/// what ends up in `data.object` of the materialized event.
#[derive(Clone, Debug)]
pub struct Signal {
    /// Dot-qualified signal name, for example `"charge.succeeded"`.
    pub name: String,
    /// Snapshot of the resource the signal describes.
    pub object: Value,
}

impl Signal {
    /// Creates a new signal with the given name and snapshot.
    pub fn new(name: impl Into<String>, object: Value) -> Self {
        Self {
            name: name.into(),
            object,
        }
    }
}

/// Boxed async signal handler.
pub type SignalHandler = Arc<dyn Fn(Signal) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of named and catch-all handlers.
///
/// One bus lives on [`crate::state::ApiState`]; handlers are attached during
/// bootstrap and stay for the life of the process. Registration is cheap and
/// thread-safe, so tests may attach additional recorders at any point.
#[derive(Default)]
pub struct TelemetryBus {
    /// Handlers subscribed to one signal name.
    named: DashMap<String, Vec<SignalHandler>>,
    /// Handlers invoked for every signal, in registration order.
    any: RwLock<Vec<SignalHandler>>,
}

impl TelemetryBus {
    /// Creates a new, empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one signal name.
    ///
    /// Handlers are invoked in registration order whenever a matching signal
    /// is emitted, after any catch-all handlers.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: SignalHandler = Arc::new(move |signal| Box::pin(handler(signal)));
        self.named.entry(name.into()).or_default().push(handler);
    }

    /// Registers a handler invoked for every signal.
    ///
    /// This is how the event materializer sees the full lifecycle stream
    /// without enumerating signal names up front.
    pub fn on_any<F, Fut>(&self, handler: F)
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: SignalHandler = Arc::new(move |signal| Box::pin(handler(signal)));
        self.any.write().push(handler);
    }

    /// Emits a signal, awaiting each handler in registration order.
    ///
    /// Sequential execution is what upholds the bus ordering guarantee:
    /// when `emit` returns, every subscriber has observed the signal, and two
    /// signals emitted back-to-back are observed by all subscribers in that
    /// same order.
    pub async fn emit(&self, signal: Signal) {
        let any: Vec<SignalHandler> = self.any.read().clone();
        for handler in any {
            handler(signal.clone()).await;
        }
        let named: Option<Vec<SignalHandler>> =
            self.named.get(&signal.name).map(|entry| entry.clone());
        if let Some(handlers) = named {
            for handler in handlers {
                handler(signal.clone()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn handlers_observe_emission_order() {
        let bus = TelemetryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_any(move |signal: Signal| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(signal.name);
            }
        });
        bus.emit(Signal::new("a.created", json!({}))).await;
        bus.emit(Signal::new("a.updated", json!({}))).await;
        bus.emit(Signal::new("a.deleted", json!({}))).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a.created", "a.updated", "a.deleted"]
        );
    }

    #[tokio::test]
    async fn named_handlers_only_fire_for_their_signal() {
        let bus = TelemetryBus::new();
        let count = Arc::new(Mutex::new(0u32));
        let sink = count.clone();
        bus.on("invoice.paid", move |_| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() += 1;
            }
        });
        bus.emit(Signal::new("invoice.paid", json!({}))).await;
        bus.emit(Signal::new("invoice.created", json!({}))).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
