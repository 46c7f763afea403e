//! Request parameter parsing: bracketed form bodies, JSON bodies, query
//! strings, and `expand[]` paths.
//!
//! Form keys use the vendor's bracket notation: `metadata[plan]=pro` nests,
//! `items[0][price]=price_x` builds indexed arrays, `expand[]=customer`
//! appends. The unflattener enforces the structural caps (depth 10, max array
//! index 1000, 1000 params total) and reports violations as 400s.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::error::ApiError;
use crate::types::Request;

const MAX_DEPTH: usize = 10;
const MAX_INDEX: u64 = 1000;
const MAX_PARAMS: usize = 1000;

/// Intermediate tree for bracketed keys; finalized into `serde_json::Value`.
enum Node {
    Leaf(Value),
    Object(BTreeMap<String, Node>),
    /// Integer-indexed entries (`k[0]`, `k[1]`), kept sorted by index.
    Indexed(BTreeMap<u64, Node>),
    /// Appended entries (`k[]`), kept in arrival order.
    Appended(Vec<Node>),
}

impl Node {
    fn finalize(self) -> Value {
        match self {
            Node::Leaf(v) => v,
            Node::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.finalize()))
                    .collect::<Map<String, Value>>(),
            ),
            Node::Indexed(map) => {
                Value::Array(map.into_values().map(Node::finalize).collect())
            }
            Node::Appended(items) => {
                Value::Array(items.into_iter().map(Node::finalize).collect())
            }
        }
    }
}

/// Splits `a[b][0][]` into `["a", "b", "0", ""]`. Malformed brackets error.
fn key_segments(key: &str) -> Result<Vec<String>, ApiError> {
    let bad = || ApiError::invalid_request(format!("Invalid parameter name: {key}")).with_param(key);
    let open = match key.find('[') {
        None => return Ok(vec![key.to_string()]),
        Some(0) => return Err(bad()),
        Some(i) => i,
    };
    let mut segments = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(bad());
        }
        let close = rest.find(']').ok_or_else(bad)?;
        segments.push(rest[1..close].to_string());
        rest = &rest[close + 1..];
    }
    Ok(segments)
}

/// Scalar coercion: integers and booleans come off the wire as strings but
/// must be stored typed so amount arithmetic works downstream.
fn coerce(raw: String) -> Value {
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    let numeric = {
        let digits = raw.strip_prefix('-').unwrap_or(&raw);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    };
    if numeric {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    Value::String(raw)
}

fn insert(node: &mut Node, key: &str, segments: &[String], value: Value) -> Result<(), ApiError> {
    let conflict =
        || ApiError::invalid_request(format!("Conflicting nesting for parameter: {key}"));
    let Some((seg, rest)) = segments.split_first() else {
        return match node {
            // last writer wins for repeated plain keys, as on the real wire
            Node::Leaf(slot) => {
                *slot = value;
                Ok(())
            }
            _ => Err(conflict()),
        };
    };

    if seg.is_empty() {
        // `k[]` append
        let Node::Appended(items) = node else {
            return Err(conflict());
        };
        if rest.is_empty() {
            items.push(Node::Leaf(value));
            return Ok(());
        }
        let mut child = Node::Object(BTreeMap::new());
        insert(&mut child, key, rest, value)?;
        items.push(child);
        return Ok(());
    }

    if let Ok(index) = seg.parse::<u64>() {
        if index > MAX_INDEX {
            return Err(ApiError::invalid_request(format!(
                "Array index {index} exceeds the maximum of {MAX_INDEX}: {key}"
            )));
        }
        let Node::Indexed(map) = node else {
            return Err(conflict());
        };
        let child = map.entry(index).or_insert_with(|| next_node(rest));
        return insert(child, key, rest, value);
    }

    let Node::Object(map) = node else {
        return Err(conflict());
    };
    let child = map
        .entry(seg.clone())
        .or_insert_with(|| next_node(rest));
    insert(child, key, rest, value)
}

fn next_node(rest: &[String]) -> Node {
    match rest.first() {
        None => Node::Leaf(Value::Null),
        Some(seg) if seg.is_empty() => Node::Appended(Vec::new()),
        Some(seg) if seg.parse::<u64>().is_ok() => Node::Indexed(BTreeMap::new()),
        Some(_) => Node::Object(BTreeMap::new()),
    }
}

/// Turns decoded form pairs into a nested JSON object.
///
/// # Examples
///
/// ```rust
/// use paper_tiger::params::unflatten;
/// use serde_json::json;
///
/// let value = unflatten(vec![
///     ("email".to_string(), "a@b.com".to_string()),
///     ("metadata[plan]".to_string(), "pro".to_string()),
///     ("items[0][quantity]".to_string(), "2".to_string()),
/// ])
/// .unwrap();
/// assert_eq!(value, json!({
///     "email": "a@b.com",
///     "metadata": {"plan": "pro"},
///     "items": [{"quantity": 2}],
/// }));
/// ```
pub fn unflatten(pairs: Vec<(String, String)>) -> Result<Value, ApiError> {
    if pairs.len() > MAX_PARAMS {
        return Err(ApiError::invalid_request(format!(
            "Too many parameters: {} exceeds the maximum of {MAX_PARAMS}",
            pairs.len()
        )));
    }
    let mut root = Node::Object(BTreeMap::new());
    for (key, raw) in pairs {
        let segments = key_segments(&key)?;
        if segments.len() > MAX_DEPTH {
            return Err(ApiError::invalid_request(format!(
                "Parameter nesting exceeds {MAX_DEPTH} levels: {key}"
            ))
            .with_param(&key));
        }
        insert(&mut root, &key, &segments, coerce(raw))?;
    }
    Ok(root.finalize())
}

fn decode_pairs(input: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(input).into_owned().collect()
}

/// Parses the request body into a JSON object.
///
/// `application/json` bodies pass through; everything else is treated as a
/// form-encoded body and unflattened. An empty body yields `{}`.
pub fn parse_body(req: &Request) -> Result<Value, ApiError> {
    let body = req.body();
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::invalid_request(format!("Invalid JSON body: {e}")))?;
        if !value.is_object() {
            return Err(ApiError::invalid_request(
                "JSON request body must be an object",
            ));
        }
        return Ok(value);
    }
    unflatten(decode_pairs(body))
}

/// Decoded query-string pairs.
pub fn query_pairs(req: &Request) -> Vec<(String, String)> {
    req.uri()
        .query()
        .map(|q| decode_pairs(q.as_bytes()))
        .unwrap_or_default()
}

/// Collects `expand[]` / `expand` paths from the query string and, if present,
/// removes and collects the `expand` key from a parsed body.
pub fn expand_paths(req: &Request, body: &mut Value) -> Vec<String> {
    let mut paths: Vec<String> = query_pairs(req)
        .into_iter()
        .filter(|(k, _)| k == "expand" || k == "expand[]")
        .map(|(_, v)| v)
        .collect();
    if let Some(obj) = body.as_object_mut() {
        match obj.remove("expand") {
            Some(Value::String(path)) => paths.push(path),
            Some(Value::Array(items)) => {
                paths.extend(items.into_iter().filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                }));
            }
            _ => {}
        }
    }
    paths
}
