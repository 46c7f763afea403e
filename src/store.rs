//! Per-resource concurrent key-value stores with cursor listing.
//!
//! Every resource type gets one [`ResourceStore`]: a `DashMap` of
//! `id -> serde_json::Value` documents. Reads are lock-free; writes for a
//! single store serialize through a write gate, so per-store write order is
//! total while different stores write in parallel.
//!
//! Tokens and payment methods additionally consult a process-global namespace
//! of pre-seeded test fixtures (`tok_visa`, `pm_card_visa`, ...) after a local
//! miss, so isolated runs share the built-in cards without copying them.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Cursor-listing options, mirroring the wire contract's `limit`,
/// `starting_after`, and `ending_before` query params.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::store::ListOptions;
///
/// let opts = ListOptions {
///     limit: Some(25),
///     starting_after: Some("cus_last_seen".to_string()),
///     ..Default::default()
/// };
/// assert!(opts.ending_before.is_none());
/// ```
pub struct ListOptions {
    pub limit: Option<i64>,
    pub starting_after: Option<String>,
    pub ending_before: Option<String>,
    pub filter: Option<Box<dyn Fn(&Value) -> bool + Send>>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: None,
            starting_after: None,
            ending_before: None,
            filter: None,
        }
    }
}

/// One page of list results.
pub struct ListPage {
    pub data: Vec<Value>,
    pub has_more: bool,
    pub url: String,
}

impl ListPage {
    /// The wire shape: `{object: "list", data, has_more, url}`.
    pub fn to_value(&self) -> Value {
        json!({
            "object": "list",
            "data": self.data,
            "has_more": self.has_more,
            "url": self.url,
        })
    }
}

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

/// Concurrent store for a single resource type.
///
/// Records are plain `serde_json::Value` documents keyed by their string
/// `id`. Reads never block; writes for one store serialize through the
/// write gate so per-store write order is total, while different stores
/// write in parallel.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::store::ResourceStore;
/// use serde_json::json;
///
/// let store = ResourceStore::new("customers");
/// store.insert(json!({"id": "cus_1", "object": "customer", "created": 10}));
/// assert_eq!(store.get("cus_1").unwrap()["object"], "customer");
/// store.delete("cus_1");
/// assert!(store.get("cus_1").is_none());
/// ```
pub struct ResourceStore {
    name: &'static str,
    records: DashMap<String, Value>,
    write_gate: Mutex<()>,
    global: Option<&'static DashMap<String, Value>>,
}

impl ResourceStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: DashMap::new(),
            write_gate: Mutex::new(()),
            global: None,
        }
    }

    /// A store that falls back to a shared fixture namespace on miss.
    pub fn with_global(name: &'static str, global: &'static DashMap<String, Value>) -> Self {
        Self {
            name,
            records: DashMap::new(),
            write_gate: Mutex::new(()),
            global: Some(global),
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.name
    }

    /// Lock-free read. Checks the local namespace, then the global fixtures.
    pub fn get(&self, id: &str) -> Option<Value> {
        if let Some(record) = self.records.get(id) {
            return Some(record.clone());
        }
        self.global
            .and_then(|global| global.get(id).map(|record| record.clone()))
    }

    /// Serialized write; the record must carry a string `id`.
    pub fn insert(&self, record: Value) -> Value {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let _gate = self.write_gate.lock();
        self.records.insert(id, record.clone());
        record
    }

    /// Serialized write. Merge semantics are imposed by callers; the store
    /// replaces whole documents.
    pub fn update(&self, record: Value) -> Value {
        self.insert(record)
    }

    pub fn delete(&self, id: &str) {
        let _gate = self.write_gate.lock();
        self.records.remove(id);
    }

    pub fn clear(&self) {
        let _gate = self.write_gate.lock();
        self.records.clear();
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Snapshot of every local record, unsorted. Global fixtures are not
    /// included; they are lookup-only.
    pub fn snapshot(&self) -> Vec<Value> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Snapshot-then-sort-then-cursor listing.
    ///
    /// Items sort by `created` descending, ties broken by `id` ascending.
    /// `ending_before` wins over `starting_after` when both are present.
    /// `has_more` reports whether items remain beyond the returned page.
    /// The limit defaults to 10 and caps at 100; an explicit 0 is honored
    /// and yields an empty page.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paper_tiger::store::{ListOptions, ResourceStore};
    /// use serde_json::json;
    ///
    /// let store = ResourceStore::new("things");
    /// for i in 0..3 {
    ///     store.insert(json!({"id": format!("th_{i}"), "created": i}));
    /// }
    /// let page = store.list(ListOptions {
    ///     limit: Some(2),
    ///     ..Default::default()
    /// });
    /// assert_eq!(page.data.len(), 2);
    /// assert!(page.has_more);
    /// assert_eq!(page.data[0]["id"], "th_2"); // newest first
    /// ```
    pub fn list(&self, opts: ListOptions) -> ListPage {
        let mut items = self.snapshot();
        if let Some(filter) = &opts.filter {
            items.retain(|item| filter(item));
        }
        items.sort_by(|a, b| {
            let ca = a.get("created").and_then(Value::as_i64).unwrap_or(0);
            let cb = b.get("created").and_then(Value::as_i64).unwrap_or(0);
            cb.cmp(&ca).then_with(|| {
                let ia = a.get("id").and_then(Value::as_str).unwrap_or("");
                let ib = b.get("id").and_then(Value::as_str).unwrap_or("");
                ia.cmp(ib)
            })
        });

        let limit = opts.limit.unwrap_or(DEFAULT_LIMIT).clamp(0, MAX_LIMIT) as usize;
        let url = format!("/v1/{}", self.name);

        let find = |items: &[Value], id: &str| {
            items
                .iter()
                .position(|item| item.get("id").and_then(Value::as_str) == Some(id))
        };

        if let Some(before) = &opts.ending_before {
            // Items strictly before the anchor; the limit trims from the tail
            // of that window, keeping the page adjacent to the anchor.
            let end = find(&items, before).unwrap_or(items.len());
            let window = &items[..end];
            let start = window.len().saturating_sub(limit);
            return ListPage {
                data: window[start..].to_vec(),
                has_more: start > 0,
                url,
            };
        }

        let offset = match &opts.starting_after {
            Some(after) => find(&items, after).map(|i| i + 1).unwrap_or(items.len()),
            None => 0,
        };
        let rest = &items[offset.min(items.len())..];
        let data: Vec<Value> = rest.iter().take(limit).cloned().collect();
        let has_more = rest.len() > data.len();
        ListPage {
            data,
            has_more,
            url,
        }
    }
}

fn card_token(id: &str, brand: &str, last4: &str) -> (String, Value) {
    (
        id.to_string(),
        json!({
            "id": id,
            "object": "token",
            "type": "card",
            "card": {
                "brand": brand,
                "last4": last4,
                "exp_month": 12,
                "exp_year": 2034,
                "funding": "credit",
            },
            "created": 0,
            "livemode": false,
            "used": false,
        }),
    )
}

fn card_payment_method(id: &str, brand: &str, last4: &str) -> (String, Value) {
    (
        id.to_string(),
        json!({
            "id": id,
            "object": "payment_method",
            "type": "card",
            "card": {
                "brand": brand,
                "last4": last4,
                "exp_month": 12,
                "exp_year": 2034,
                "funding": "credit",
            },
            "created": 0,
            "livemode": false,
            "metadata": {},
        }),
    )
}

/// Well-known card tokens every namespace can resolve.
pub static GLOBAL_TOKENS: Lazy<DashMap<String, Value>> = Lazy::new(|| {
    [
        card_token("tok_visa", "visa", "4242"),
        card_token("tok_visa_debit", "visa", "5556"),
        card_token("tok_mastercard", "mastercard", "4444"),
        card_token("tok_amex", "amex", "8431"),
        card_token("tok_discover", "discover", "1117"),
        card_token("tok_unionpay", "unionpay", "0005"),
        card_token("tok_chargeDeclined", "visa", "0002"),
        card_token("tok_chargeDeclinedInsufficientFunds", "visa", "9995"),
    ]
    .into_iter()
    .collect()
});

/// Well-known payment methods mirroring the token fixtures.
pub static GLOBAL_PAYMENT_METHODS: Lazy<DashMap<String, Value>> = Lazy::new(|| {
    [
        card_payment_method("pm_card_visa", "visa", "4242"),
        card_payment_method("pm_card_visa_debit", "visa", "5556"),
        card_payment_method("pm_card_mastercard", "mastercard", "4444"),
        card_payment_method("pm_card_amex", "amex", "8431"),
        card_payment_method("pm_card_discover", "discover", "1117"),
        card_payment_method("pm_card_chargeDeclined", "visa", "0002"),
    ]
    .into_iter()
    .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, created: i64) -> Value {
        json!({"id": id, "object": "thing", "created": created})
    }

    fn seeded(n: usize) -> ResourceStore {
        let store = ResourceStore::new("things");
        for i in 0..n {
            // distinct created values, oldest first
            store.insert(record(&format!("th_{i:03}"), i as i64));
        }
        store
    }

    #[test]
    fn insert_get_delete_round_trip() {
        let store = ResourceStore::new("things");
        store.insert(record("th_1", 5));
        assert_eq!(store.get("th_1").unwrap()["created"], 5);
        assert_eq!(store.count(), 1);
        store.delete("th_1");
        assert!(store.get("th_1").is_none());
    }

    #[test]
    fn list_sorts_created_desc_id_asc() {
        let store = ResourceStore::new("things");
        store.insert(record("th_b", 10));
        store.insert(record("th_a", 10));
        store.insert(record("th_c", 20));
        let page = store.list(ListOptions::default());
        let ids: Vec<&str> = page.data.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["th_c", "th_a", "th_b"]);
    }

    #[test]
    fn cursor_walk_covers_every_item_once() {
        let store = seeded(25);
        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = store.list(ListOptions {
                limit: Some(10),
                starting_after: after.clone(),
                ..Default::default()
            });
            for item in &page.data {
                seen.push(item["id"].as_str().unwrap().to_string());
            }
            if !page.has_more {
                break;
            }
            after = Some(seen.last().unwrap().clone());
        }
        assert_eq!(seen.len(), 25);
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 25);
    }

    #[test]
    fn page_sizes_are_ten_ten_five() {
        let store = seeded(25);
        let first = store.list(ListOptions {
            limit: Some(10),
            ..Default::default()
        });
        assert_eq!(first.data.len(), 10);
        assert!(first.has_more);
        let after = first.data.last().unwrap()["id"].as_str().unwrap().to_string();
        let second = store.list(ListOptions {
            limit: Some(10),
            starting_after: Some(after),
            ..Default::default()
        });
        assert_eq!(second.data.len(), 10);
        assert!(second.has_more);
        let after = second.data.last().unwrap()["id"].as_str().unwrap().to_string();
        let third = store.list(ListOptions {
            limit: Some(10),
            starting_after: Some(after),
            ..Default::default()
        });
        assert_eq!(third.data.len(), 5);
        assert!(!third.has_more);
    }

    #[test]
    fn limit_zero_returns_empty_page() {
        let store = seeded(3);
        let page = store.list(ListOptions {
            limit: Some(0),
            ..Default::default()
        });
        assert!(page.data.is_empty());
        assert!(page.has_more);
    }

    #[test]
    fn limit_caps_at_one_hundred() {
        let store = seeded(150);
        let page = store.list(ListOptions {
            limit: Some(101),
            ..Default::default()
        });
        assert_eq!(page.data.len(), 100);
        assert!(page.has_more);
    }

    #[test]
    fn ending_before_takes_precedence_and_trims_from_tail() {
        let store = seeded(10);
        // Sorted order is th_009 .. th_000. Anchor at th_004 (index 5).
        let page = store.list(ListOptions {
            limit: Some(3),
            starting_after: Some("th_009".into()),
            ending_before: Some("th_004".into()),
            ..Default::default()
        });
        let ids: Vec<&str> = page.data.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["th_007", "th_006", "th_005"]);
        assert!(page.has_more);
    }

    #[test]
    fn filter_applies_before_pagination() {
        let store = seeded(20);
        let page = store.list(ListOptions {
            limit: Some(100),
            filter: Some(Box::new(|v| {
                v["id"].as_str().unwrap().ends_with('0')
            })),
            ..Default::default()
        });
        assert_eq!(page.data.len(), 2); // th_000, th_010
        assert!(!page.has_more);
    }

    #[test]
    fn global_namespace_resolves_after_local_miss() {
        let store = ResourceStore::with_global("tokens", &GLOBAL_TOKENS);
        let tok = store.get("tok_visa").expect("global fixture");
        assert_eq!(tok["card"]["last4"], "4242");
        // local writes shadow, never mutate, the global namespace
        store.insert(json!({"id": "tok_visa", "object": "token", "card": {"last4": "0000"}}));
        assert_eq!(store.get("tok_visa").unwrap()["card"]["last4"], "0000");
        assert_eq!(GLOBAL_TOKENS.get("tok_visa").unwrap()["card"]["last4"], "4242");
        // clearing the namespace keeps fixtures reachable
        store.clear();
        assert_eq!(store.get("tok_visa").unwrap()["card"]["last4"], "4242");
    }
}
