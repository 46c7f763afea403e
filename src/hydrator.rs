//! Reference expansion (`expand[]`).
//!
//! Stored records reference each other by id only; at read time, declared
//! dotted paths are hydrated by swapping a string id for the record it names.
//! The id prefix (`cus_`, `in_`, ...) picks the store. Expansion is shallow-
//! copied, best-effort, and idempotent: unresolvable steps and unknown
//! prefixes are left as-is, and already-expanded nodes are traversed without
//! re-fetching.

use serde_json::Value;

use crate::state::ApiState;

/// Prefix-to-table registry; the single source of truth for id shapes.
pub static PREFIXES: &[(&str, &str)] = &[
    ("cus", "customers"),
    ("sub", "subscriptions"),
    ("si", "subscription_items"),
    ("in", "invoices"),
    ("ii", "invoiceitems"),
    ("pm", "payment_methods"),
    ("pi", "payment_intents"),
    ("ch", "charges"),
    ("re", "refunds"),
    ("prod", "products"),
    ("price", "prices"),
    ("plan", "plans"),
    ("tok", "tokens"),
    ("txn", "balance_transactions"),
    ("evt", "events"),
    ("we", "webhook_endpoints"),
    ("cs", "checkout_sessions"),
];

/// Resolves an id to its record via the prefix table. Unknown prefixes and
/// misses return `None`.
pub fn lookup(state: &ApiState, id: &str) -> Option<Value> {
    let prefix = id.split('_').next()?;
    let table = PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, table)| *table)?;
    state.stores.by_name(table)?.get(id)
}

/// Applies every expansion path to a shallow copy of the record.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::config::ServerConfig;
/// use paper_tiger::hydrator::expand;
/// use paper_tiger::state::ApiState;
/// use serde_json::json;
///
/// let state = ApiState::new(ServerConfig::default());
/// state.stores.customers.insert(json!({"id": "cus_1", "object": "customer"}));
///
/// let invoice = json!({"id": "in_1", "customer": "cus_1"});
/// let out = expand(&state, &invoice, &["customer".to_string()]);
/// assert_eq!(out["customer"]["object"], "customer");
/// // the stored record keeps the bare id
/// assert_eq!(invoice["customer"], "cus_1");
/// ```
pub fn expand(state: &ApiState, record: &Value, paths: &[String]) -> Value {
    if paths.is_empty() {
        return record.clone();
    }
    let mut out = record.clone();
    for path in paths {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        expand_path(state, &mut out, &segments);
    }
    out
}

fn expand_path(state: &ApiState, node: &mut Value, segments: &[&str]) {
    let Some((seg, rest)) = segments.split_first() else {
        return;
    };
    let Some(child) = node.get_mut(*seg) else {
        return;
    };
    if let Some(id) = child.as_str() {
        match lookup(state, id) {
            Some(record) => *child = record,
            // unresolvable: leave the remaining path unexpanded
            None => return,
        }
    }
    if child.is_object() {
        expand_path(state, child, rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::json;

    fn state_with_customer() -> std::sync::Arc<ApiState> {
        let state = ApiState::new(ServerConfig::default());
        state.stores.customers.insert(json!({
            "id": "cus_1", "object": "customer", "created": 10,
            "default_source": "pm_card_visa",
        }));
        state
    }

    #[test]
    fn single_segment_path_expands() {
        let state = state_with_customer();
        let invoice = json!({"id": "in_1", "object": "invoice", "customer": "cus_1"});
        let out = expand(&state, &invoice, &["customer".to_string()]);
        assert_eq!(out["customer"]["object"], "customer");
        // original untouched
        assert_eq!(invoice["customer"], "cus_1");
    }

    #[test]
    fn nested_path_expands_through_the_first_hop() {
        let state = state_with_customer();
        let invoice = json!({"id": "in_1", "object": "invoice", "customer": "cus_1"});
        let out = expand(&state, &invoice, &["customer.default_source".to_string()]);
        assert_eq!(out["customer"]["default_source"]["object"], "payment_method");
    }

    #[test]
    fn unknown_prefix_is_left_alone() {
        let state = state_with_customer();
        let record = json!({"id": "in_1", "weird": "zz_123"});
        let out = expand(&state, &record, &["weird".to_string()]);
        assert_eq!(out["weird"], "zz_123");
    }

    #[test]
    fn missing_reference_is_left_alone() {
        let state = state_with_customer();
        let record = json!({"id": "in_1", "customer": "cus_ghost"});
        let out = expand(&state, &record, &["customer".to_string()]);
        assert_eq!(out["customer"], "cus_ghost");
    }

    #[test]
    fn expansion_is_idempotent() {
        let state = state_with_customer();
        let invoice = json!({"id": "in_1", "customer": "cus_1"});
        let paths = vec!["customer".to_string(), "customer.default_source".to_string()];
        let once = expand(&state, &invoice, &paths);
        let twice = expand(&state, &once, &paths);
        assert_eq!(once, twice);
    }
}
