use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, declarative instruction for a query or a mutation against the
/// store. Recipes live in the reserved `recipes` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Unique across the store's recipes.
    pub name: String,

    /// Groups permitted to use the recipe; empty means open.
    #[serde(default)]
    pub auth: Vec<String>,

    /// Query expression evaluated against the whole store (JSONPath with
    /// `$name` bindings).
    #[serde(default)]
    pub expression: Option<String>,

    /// Target collection for modification.
    #[serde(default)]
    pub collection: Option<String>,

    /// Expression locating the existing record for a bound `$ref`.
    #[serde(default)]
    pub reference: Option<String>,

    /// Primary-key assignment rule for inserts.
    #[serde(default)]
    pub unique: Option<Unique>,

    /// Base record merged under inserts/updates, also the empty-query
    /// fallback.
    #[serde(default)]
    pub defaults: Option<Value>,

    /// Safe-data allowlist applied to records crossing the API boundary.
    #[serde(default)]
    pub filter: Option<Value>,

    /// Positive = head slice, negative = tail slice of array results.
    #[serde(default)]
    pub limit: Option<i64>,

    /// Prepended to array query results.
    #[serde(default)]
    pub header: Option<Value>,
}

/// Primary-key rule: which field to assign and where the value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unique {
    pub key: String,

    #[serde(default)]
    pub mode: UniqueMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UniqueMode {
    /// The bound `ref` becomes the key value.
    #[default]
    Ref,
    /// Highest existing numeric key value plus one.
    Serial,
    /// Random UUID string.
    Uuid,
}

/// Apply a recipe filter tree to a value.
///
/// The tree is an allowlist: `true` leaves pass a field, nested objects
/// recurse, anything absent is dropped. Arrays filter element-wise. A
/// missing or non-object filter passes the value unchanged.
pub fn apply_filter(filter: Option<&Value>, value: &Value) -> Value {
    let Some(filter) = filter else {
        return value.clone();
    };
    let Value::Object(allow) = filter else {
        return value.clone();
    };

    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| apply_filter(Some(filter), v)).collect())
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, rule) in allow {
                let Some(field) = map.get(key) else { continue };
                match rule {
                    Value::Bool(true) => {
                        out.insert(key.clone(), field.clone());
                    }
                    Value::Object(_) => {
                        out.insert(key.clone(), apply_filter(Some(rule), field));
                    }
                    _ => {}
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
