//! Shared application state: every store plus the global engine components.
//!
//! One `Arc<ApiState>` is threaded through route closures and background
//! workers. Stores are the only mutable shared surface; the clock, chaos
//! coordinator, idempotency cache, and telemetry bus each own their state
//! privately behind their own synchronization.
//!
//! # Examples
//!
//! ```rust
//! use paper_tiger::config::ServerConfig;
//! use paper_tiger::state::ApiState;
//! use serde_json::json;
//!
//! let state = ApiState::new(ServerConfig::default());
//! state.stores.customers.insert(json!({
//!     "id": "cus_1", "object": "customer", "created": state.clock.now(),
//! }));
//! assert_eq!(state.stores.customers.count(), 1);
//! assert_eq!(state.stores.by_name("customers").unwrap().count(), 1);
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chaos::ChaosCoordinator;
use crate::clock::VirtualClock;
use crate::config::ServerConfig;
use crate::events::DeliveryJob;
use crate::idempotency::IdempotencyCache;
use crate::signals::TelemetryBus;
use crate::store::{GLOBAL_PAYMENT_METHODS, GLOBAL_TOKENS, ResourceStore};

/// All per-resource stores, one field per table.
///
/// Tokens and payment methods carry the shared global fixture namespace
/// (`tok_visa` and friends); everything else starts empty. The struct is
/// deliberately flat — one named field per table — so call sites read like
/// `state.stores.invoices.get(id)`.
pub struct Stores {
    pub customers: ResourceStore,
    pub subscriptions: ResourceStore,
    pub subscription_items: ResourceStore,
    pub invoices: ResourceStore,
    pub invoice_items: ResourceStore,
    pub payment_methods: ResourceStore,
    pub payment_intents: ResourceStore,
    pub charges: ResourceStore,
    pub refunds: ResourceStore,
    pub products: ResourceStore,
    pub prices: ResourceStore,
    pub plans: ResourceStore,
    pub tokens: ResourceStore,
    pub balance_transactions: ResourceStore,
    pub events: ResourceStore,
    pub webhook_endpoints: ResourceStore,
    pub checkout_sessions: ResourceStore,
    pub webhook_deliveries: ResourceStore,
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    pub fn new() -> Self {
        Self {
            customers: ResourceStore::new("customers"),
            subscriptions: ResourceStore::new("subscriptions"),
            subscription_items: ResourceStore::new("subscription_items"),
            invoices: ResourceStore::new("invoices"),
            invoice_items: ResourceStore::new("invoiceitems"),
            payment_methods: ResourceStore::with_global("payment_methods", &GLOBAL_PAYMENT_METHODS),
            payment_intents: ResourceStore::new("payment_intents"),
            charges: ResourceStore::new("charges"),
            refunds: ResourceStore::new("refunds"),
            products: ResourceStore::new("products"),
            prices: ResourceStore::new("prices"),
            plans: ResourceStore::new("plans"),
            tokens: ResourceStore::with_global("tokens", &GLOBAL_TOKENS),
            balance_transactions: ResourceStore::new("balance_transactions"),
            events: ResourceStore::new("events"),
            webhook_endpoints: ResourceStore::new("webhook_endpoints"),
            checkout_sessions: ResourceStore::new("checkout_sessions"),
            webhook_deliveries: ResourceStore::new("webhook_deliveries"),
        }
    }

    pub fn all(&self) -> [&ResourceStore; 18] {
        [
            &self.customers,
            &self.subscriptions,
            &self.subscription_items,
            &self.invoices,
            &self.invoice_items,
            &self.payment_methods,
            &self.payment_intents,
            &self.charges,
            &self.refunds,
            &self.products,
            &self.prices,
            &self.plans,
            &self.tokens,
            &self.balance_transactions,
            &self.events,
            &self.webhook_endpoints,
            &self.checkout_sessions,
            &self.webhook_deliveries,
        ]
    }

    /// Lookup by table name; the hydrator and the generic dispatch handlers
    /// resolve their [`ResourceSpec`](crate::resources::ResourceSpec) /
    /// prefix-table entries through this.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::state::Stores;
    ///
    /// let stores = Stores::new();
    /// assert!(stores.by_name("charges").is_some());
    /// assert!(stores.by_name("not_a_table").is_none());
    /// ```
    pub fn by_name(&self, name: &str) -> Option<&ResourceStore> {
        self.all().into_iter().find(|s| s.table_name() == name)
    }

    /// The `DELETE /_config/data` affordance: empties every table. Global
    /// fixtures survive, since they live outside the per-table namespaces.
    pub fn clear_all(&self) {
        for store in self.all() {
            store.clear();
        }
    }
}

/// Shared engine state.
///
/// Constructed once per server (or per test harness) and passed around as
/// `Arc<ApiState>`. Construction alone wires nothing up — use
/// [`crate::bootstrap`] to also install the event pipeline, the idempotency
/// sweeper, and the billing poll worker.
pub struct ApiState {
    pub config: ServerConfig,
    pub clock: Arc<VirtualClock>,
    pub stores: Stores,
    pub idempotency: Arc<IdempotencyCache>,
    pub chaos: ChaosCoordinator,
    pub bus: TelemetryBus,
    /// Webhook delivery queue; populated by [`crate::events::wire`].
    pub delivery_tx: OnceCell<mpsc::UnboundedSender<DeliveryJob>>,
    /// Deliveries waiting out their backoff, keyed by virtual due-time.
    pub retry_queue: OnceCell<Arc<Mutex<Vec<(i64, DeliveryJob)>>>>,
}

impl ApiState {
    /// Builds the state graph: clock, stores, idempotency cache, chaos
    /// coordinator, and telemetry bus, all sharing one virtual clock.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::config::ServerConfig;
    /// use paper_tiger::state::ApiState;
    ///
    /// let state = ApiState::new(ServerConfig::default());
    /// assert!(state.idempotency.is_empty());
    /// assert_eq!(state.stores.events.count(), 0);
    /// ```
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let clock = Arc::new(VirtualClock::new());
        Arc::new(Self {
            config,
            clock: clock.clone(),
            stores: Stores::new(),
            idempotency: Arc::new(IdempotencyCache::new(clock)),
            chaos: ChaosCoordinator::new(),
            bus: TelemetryBus::new(),
            delivery_tx: OnceCell::new(),
            retry_queue: OnceCell::new(),
        })
    }
}
