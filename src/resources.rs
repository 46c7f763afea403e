//! The uniform create/retrieve/update/delete/list handler family.
//!
//! Every emulated resource goes through the same five code paths,
//! parameterized by a [`ResourceSpec`]: the object tag, id prefix, backing
//! store, required params, immutable fields, delete behavior, and list
//! filters. Anything a resource does beyond this template is a custom
//! transition registered next to it in the catalog.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::error::ApiError;
use crate::hydrator;
use crate::params;
use crate::responder::Json;
use crate::router::PathParams;
use crate::signals::Signal;
use crate::state::ApiState;
use crate::store::{ListOptions, ResourceStore};
use crate::types::Request;

/// Generates a fresh id: prefix plus 16 lowercase hex chars of v4 entropy.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::resources::new_id;
///
/// let id = new_id("cus");
/// assert!(id.starts_with("cus_"));
/// assert_eq!(id.len(), "cus_".len() + 16);
/// ```
pub fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..16])
}

/// What `DELETE` means for a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Physical removal; responds `{deleted: true, id, object}`.
    Remove,
    /// Subscription-style transition to `canceled`; the object survives.
    Cancel,
}

/// Per-resource parameterization of the generic handlers.
pub struct ResourceSpec {
    pub object: &'static str,
    pub path: &'static str,
    pub prefix: &'static str,
    pub table: &'static str,
    pub required: &'static [&'static str],
    pub extra_immutable: &'static [&'static str],
    pub filters: &'static [&'static str],
    pub delete: DeleteBehavior,
    /// Which of the five template operations this resource exposes.
    /// Retrieve and list are always on; events and balance transactions,
    /// for example, are read-only.
    pub creatable: bool,
    pub updatable: bool,
    pub deletable: bool,
    /// Fields stamped onto new records before caller fields merge in.
    pub defaults: Option<fn(&mut Map<String, Value>, i64)>,
}

/// Fields no update may touch, on any resource.
const IMMUTABLE: &[&str] = &["id", "object", "created", "livemode"];

fn store_of<'a>(state: &'a ApiState, spec: &ResourceSpec) -> Result<&'a ResourceStore, ApiError> {
    state
        .stores
        .by_name(spec.table)
        .ok_or_else(|| ApiError::internal(format!("no store for table {}", spec.table)))
}

fn path_id(req: &Request) -> Result<String, ApiError> {
    PathParams::get(req, "id")
        .ok_or_else(|| ApiError::invalid_request("Missing id in request path"))
}

async fn emit(state: &ApiState, object: &str, action: &str, snapshot: Value) {
    state
        .bus
        .emit(Signal::new(format!("{object}.{action}"), snapshot))
        .await;
}

/// `POST /v1/<resource>`
pub async fn create(
    state: Arc<ApiState>,
    spec: &'static ResourceSpec,
    req: Request,
) -> Result<Json, ApiError> {
    let mut body = params::parse_body(&req)?;
    let expand = params::expand_paths(&req, &mut body);
    let fields = body
        .as_object()
        .cloned()
        .unwrap_or_default();

    for required in spec.required {
        let missing = fields.get(*required).map_or(true, Value::is_null);
        if missing {
            return Err(
                ApiError::invalid_request(format!("Missing required param: {required}."))
                    .with_param(*required),
            );
        }
    }

    let now = state.clock.now();
    let mut record = Map::new();
    if let Some(defaults) = spec.defaults {
        defaults(&mut record, now);
    }
    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| new_id(spec.prefix));
    for (key, value) in fields {
        if IMMUTABLE.contains(&key.as_str()) {
            continue;
        }
        record.insert(key, value);
    }
    record.insert("id".into(), json!(id));
    record.insert("object".into(), json!(spec.object));
    record.insert("created".into(), json!(now));
    record.insert("livemode".into(), json!(false));
    record
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));

    let stored = store_of(&state, spec)?.insert(Value::Object(record));
    emit(&state, spec.object, "created", stored.clone()).await;
    Ok(Json(hydrator::expand(&state, &stored, &expand)))
}

/// `GET /v1/<resource>/:id`
pub async fn retrieve(
    state: Arc<ApiState>,
    spec: &'static ResourceSpec,
    req: Request,
) -> Result<Json, ApiError> {
    let id = path_id(&req)?;
    let record = store_of(&state, spec)?
        .get(&id)
        .ok_or_else(|| ApiError::not_found(spec.object, &id))?;
    let mut empty = json!({});
    let expand = params::expand_paths(&req, &mut empty);
    Ok(Json(hydrator::expand(&state, &record, &expand)))
}

/// `POST /v1/<resource>/:id`
pub async fn update(
    state: Arc<ApiState>,
    spec: &'static ResourceSpec,
    req: Request,
) -> Result<Json, ApiError> {
    let id = path_id(&req)?;
    let store = store_of(&state, spec)?;
    let existing = store
        .get(&id)
        .ok_or_else(|| ApiError::not_found(spec.object, &id))?;

    let mut body = params::parse_body(&req)?;
    let expand = params::expand_paths(&req, &mut body);
    let fields = body.as_object().cloned().unwrap_or_default();

    let mut record = existing.as_object().cloned().unwrap_or_default();
    for (key, value) in fields {
        if IMMUTABLE.contains(&key.as_str()) || spec.extra_immutable.contains(&key.as_str()) {
            continue;
        }
        if value.is_null() {
            record.remove(&key);
        } else {
            record.insert(key, value);
        }
    }

    let stored = store.update(Value::Object(record));
    emit(&state, spec.object, "updated", stored.clone()).await;
    Ok(Json(hydrator::expand(&state, &stored, &expand)))
}

/// `DELETE /v1/<resource>/:id`
pub async fn delete(
    state: Arc<ApiState>,
    spec: &'static ResourceSpec,
    req: Request,
) -> Result<Json, ApiError> {
    let id = path_id(&req)?;
    let store = store_of(&state, spec)?;
    let existing = store
        .get(&id)
        .ok_or_else(|| ApiError::not_found(spec.object, &id))?;

    match spec.delete {
        DeleteBehavior::Remove => {
            store.delete(&id);
            emit(&state, spec.object, "deleted", existing).await;
            Ok(Json(json!({
                "deleted": true,
                "id": id,
                "object": spec.object,
            })))
        }
        DeleteBehavior::Cancel => {
            let mut record = existing.as_object().cloned().unwrap_or_default();
            record.insert("status".into(), json!("canceled"));
            record.insert("canceled_at".into(), json!(state.clock.now()));
            let stored = store.update(Value::Object(record));
            emit(&state, spec.object, "deleted", stored.clone()).await;
            Ok(Json(stored))
        }
    }
}

/// `GET /v1/<resource>`
pub async fn list(
    state: Arc<ApiState>,
    spec: &'static ResourceSpec,
    req: Request,
) -> Result<Json, ApiError> {
    let query = params::query_pairs(&req);
    let lookup = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let limit = match lookup("limit") {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            ApiError::invalid_request(format!("Invalid integer: {raw}")).with_param("limit")
        })?),
        None => None,
    };

    let mut wanted: Vec<(String, String)> = Vec::new();
    for filter in spec.filters {
        if let Some(value) = lookup(filter) {
            wanted.push((filter.to_string(), value));
        }
    }
    let filter: Option<Box<dyn Fn(&Value) -> bool + Send>> = if wanted.is_empty() {
        None
    } else {
        Some(Box::new(move |record: &Value| {
            wanted.iter().all(|(key, value)| match record.get(key) {
                Some(Value::String(s)) => s == value,
                Some(other) => other.to_string() == *value,
                None => false,
            })
        }))
    };

    let page = store_of(&state, spec)?.list(ListOptions {
        limit,
        starting_after: lookup("starting_after"),
        ending_before: lookup("ending_before"),
        filter,
    });
    Ok(Json(page.to_value()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_sixteen_hex_chars() {
        let id = new_id("cus");
        let (prefix, suffix) = id.split_once('_').unwrap();
        assert_eq!(prefix, "cus");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(suffix, suffix.to_lowercase());
        assert_ne!(new_id("cus"), new_id("cus"));
    }
}
