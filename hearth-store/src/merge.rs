use serde_json::Value;

/// Right-wins deep merge, the single merge rule for every update path:
/// objects merge recursively, arrays are replaced wholesale, scalars
/// replace, and an incoming `null` deletes the key it lands on.
pub fn deep_merge(base: &mut Value, incoming: &Value) {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                if value.is_null() {
                    base_map.remove(key);
                } else if let Some(slot) = base_map.get_mut(key) {
                    deep_merge(slot, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (slot, incoming) => {
            *slot = incoming.clone();
        }
    }
}

/// Merge `layers` left to right onto a fresh copy of `base`.
pub fn merged(base: &Value, layers: &[&Value]) -> Value {
    let mut out = base.clone();
    for layer in layers {
        deep_merge(&mut out, layer);
    }
    out
}
