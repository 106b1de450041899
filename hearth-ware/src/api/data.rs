use super::check_recipe_auth;
use hearth_core::user::scrub_credentials;
use hearth_core::HttpError;
use hearth_pipeline::{Context, Outcome};
use hearth_store::recipe::apply_filter;
use hearth_store::{ModifyEntry, Store};
use serde_json::{Map, Value};

/// `$recipe` — GET queries, POST modifications.
pub fn handle(
    ctx: &Context,
    db: &Store,
    recipe_name: &str,
    opts: &[String],
) -> Result<Outcome, HttpError> {
    let recipe = db
        .lookup(recipe_name)
        .ok_or_else(|| HttpError::NotFound(format!("Unknown recipe: {recipe_name}")))?;
    check_recipe_auth(ctx, &recipe.auth)?;

    match ctx.request.verb().as_str() {
        "get" | "head" => {
            let bindings = bindings_from(ctx, opts);
            let mut result = apply_filter(recipe.filter.as_ref(), &db.query(&recipe, &bindings));
            scrub_credentials(&mut result);
            Ok(Outcome::Payload(result))
        }
        "post" => {
            let Some(entries) = ctx.request.body.json().and_then(Value::as_array) else {
                return Err(HttpError::BadRequest("Body must be a list of {ref, record}".into()));
            };
            let mut prepared = Vec::with_capacity(entries.len());
            for raw in entries {
                if !raw.is_object() {
                    return Err(HttpError::BadRequest("Each entry must be an object".into()));
                }
                let mut entry: ModifyEntry = serde_json::from_value(raw.clone())
                    .map_err(|e| HttpError::BadRequest(format!("Bad entry: {e}")))?;
                // The filter tree is the safe-data allowlist on the way in
                // as well as out.
                if let (Some(filter), Some(record)) = (&recipe.filter, &entry.record) {
                    entry.record = Some(apply_filter(Some(filter), record));
                }
                prepared.push(entry);
            }
            let ops = db.modify(&recipe, &prepared)?;
            Ok(Outcome::Payload(Value::Array(ops.iter().map(|op| op.to_value()).collect())))
        }
        _ => Err(HttpError::MethodNotAllowed),
    }
}

/// Bindings come from the query string by name, positional opts by index,
/// and the first opt doubles as `$ref`.
fn bindings_from(ctx: &Context, opts: &[String]) -> Map<String, Value> {
    let mut bindings = Map::new();
    for (key, value) in &ctx.request.url.query {
        bindings.insert(key.clone(), Value::String(value.clone()));
    }
    for (index, opt) in opts.iter().enumerate() {
        bindings.insert(index.to_string(), Value::String(opt.clone()));
    }
    if let Some(first) = opts.first() {
        bindings.entry("ref".to_string()).or_insert(Value::String(first.clone()));
    }
    bindings
}
