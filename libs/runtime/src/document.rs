//! The state document (`spec.md §3`): the handler's input and output shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{ "object": <PR>, "dependents": [ <obj>* ], "references": [ <obj>* ] }`
///
/// Cluster objects travel as schemaless JSON (`spec.md §9`): no per-kind
/// generated bindings. Owner-reference bookkeeping and API calls round-trip
/// through `kube::core::DynamicObject` at the edges (see `dependents.rs`),
/// but the document itself, and everything the handler sees, is plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub object: Value,
    #[serde(default)]
    pub dependents: Vec<Value>,
    #[serde(default)]
    pub references: Vec<Value>,
}

impl StateDocument {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Resolve a dotted path (`spec.md §4.2`: e.g. `spec.configRef.name`) against
/// a JSON tree. Missing intermediate keys and out-of-range array indices
/// yield `None` rather than an error — references are best-effort.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dotted path to its string value, if present and a string.
pub fn resolve_name(value: &Value, path: &str) -> Option<String> {
    resolve_path(value, path)?.as_str().map(str::to_owned)
}
