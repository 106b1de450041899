use serde_json::{Map, Value};
use serde_json_path::JsonPath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("expression parse failed: {0}")]
    Parse(String),
}

/// Substitute `$name` bindings into a JSONPath expression source.
///
/// Binding values are inserted as JSON literals (strings quoted and
/// escaped), so `$.users[?(@.username == $ref)]` with `ref = "alice"`
/// becomes `$.users[?(@.username == "alice")]`. The bare root `$` is never
/// touched (`\w` must follow for a token to be considered), and unknown
/// names are left as-is.
pub fn substitute(expression: &str, bindings: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(expression.len());
    let bytes = expression.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            if end > start {
                let name = &expression[start..end];
                if let Some(value) = bindings.get(name) {
                    out.push_str(&value.to_string());
                    i = end;
                    continue;
                }
            }
        }
        let ch = expression[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Evaluate a bound expression against a tree, returning deep copies of
/// every matched node.
pub fn eval(tree: &Value, expression: &str, bindings: &Map<String, Value>) -> Result<Vec<Value>, QueryError> {
    let source = substitute(expression, bindings);
    let path = JsonPath::parse(&source).map_err(|e| QueryError::Parse(e.to_string()))?;
    Ok(path.query(tree).all().into_iter().cloned().collect())
}
