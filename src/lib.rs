//! A stateful, Stripe-compatible mock payments API.
//!
//! Paper Tiger terminates HTTP requests that mimic the real payments API wire
//! contract, persists resources in memory, emits lifecycle events, delivers
//! signed webhooks, and advances subscription billing on a controllable
//! clock. It exists so applications can run their payment flows against a
//! local server in tests and development instead of the remote API.
//!
//! # Engine components
//! - [clock] — three-mode virtual clock shared by everything time-dependent
//! - [store] — per-resource concurrent key-value stores with cursor listing
//! - [idempotency] — `Idempotency-Key` response cache with in-flight markers
//! - [params] — bracketed form unflattening and `expand[]` parsing
//! - [resources] / [catalog] — the uniform CRUD handler family
//! - [hydrator] — prefix-keyed reference expansion
//! - [signals] — lifecycle telemetry bus
//! - [events] — event materialization and signed webhook delivery
//! - [chaos] — payment/event/API failure injection
//! - [billing] — the periodic subscription billing state machine
//! - [server] — router composition, admin endpoints, accept loop
//!
//! # Quickstart
//!
//! ```rust,ignore
//! let state = paper_tiger::bootstrap(ServerConfig::default());
//! let router = paper_tiger::server::build_router(state);
//! let listener = paper_tiger::server::bind_listener(&ServerConfig::default()).await?;
//! paper_tiger::server::serve(listener, router).await?;
//! ```

/// API key authentication filter.
pub mod auth;

/// Periodic billing state machine and dunning.
pub mod billing;

/// Per-resource specs and custom transitions.
pub mod catalog;

/// Payment / event / API failure injection.
pub mod chaos;

/// Three-mode virtual clock.
pub mod clock;

/// Environment-driven server configuration.
pub mod config;

/// CORS filter.
pub mod cors;

/// Error taxonomy and wire envelope.
pub mod error;

/// Event materialization and webhook delivery.
pub mod events;

/// Reference expansion for `expand[]`.
pub mod hydrator;

/// Idempotency-Key request de-duplication.
pub mod idempotency;

/// Middleware chain execution.
pub mod middleware;

/// Form/JSON/query parameter parsing.
pub mod params;

/// Generic CRUD handler family.
pub mod resources;

/// Response conversion helpers.
pub mod responder;

/// Routing and dispatch.
pub mod router;

/// HTTP server and admin surface.
pub mod server;

/// Lifecycle telemetry bus.
pub mod signals;

/// Shared application state.
pub mod state;

/// Concurrent resource stores.
pub mod store;

/// Core request/response type aliases.
pub mod types;

pub use http::{Method, StatusCode, header};

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::state::ApiState;

/// Builds a fully wired engine: state, event pipeline, idempotency sweeper,
/// and the billing poll worker. Requires a running tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use paper_tiger::clock::ClockMode;
/// use paper_tiger::config::ServerConfig;
///
/// # async fn example() {
/// let state = paper_tiger::bootstrap(ServerConfig::default());
/// // freeze time so billing only moves when the test says so
/// state.clock.set_mode(ClockMode::Manual, 1);
/// let router = paper_tiger::server::build_router(state.clone());
/// # }
/// ```
pub fn bootstrap(config: ServerConfig) -> Arc<ApiState> {
    let state = ApiState::new(config);
    events::wire(&state);
    idempotency::spawn_sweeper(state.idempotency.clone());
    billing::spawn(state.clone());
    state
}
