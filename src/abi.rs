use crate::model::{JobHandler, WorkerContext};
use serde_json::{Map, Number, Value};

/// Boundary to the sandboxed compute unit hosted inside a worker.
///
/// The compute module only understands two-dimensional string arrays. The
/// host lowers a domain object to `[[key, value-as-string], ...]`, keeping
/// only scalar fields, and lifts the response back by re-parsing each value
/// (integer, then float, then boolean, then plain string).

/// Lower a domain object to key/value string pairs.
///
/// Non-object values lower to an empty table. Fields that are not strings,
/// numbers, or booleans are dropped before crossing the boundary.
pub fn lower(value: &Value) -> Vec<(String, String)> {
    let Value::Object(fields) = value else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(fields.len());
    for (key, field) in fields {
        match field {
            Value::String(s) => out.push((key.clone(), s.clone())),
            Value::Number(n) => out.push((key.clone(), n.to_string())),
            Value::Bool(b) => out.push((key.clone(), b.to_string())),
            _ => {}
        }
    }
    out
}

/// Lift key/value string pairs back into a domain object.
pub fn lift(pairs: Vec<(String, String)>) -> Value {
    let mut fields = Map::with_capacity(pairs.len());
    for (key, raw) in pairs {
        fields.insert(key, coerce(raw));
    }
    Value::Object(fields)
}

/// Parse-coercion rule: integer, then float, then boolean, then string.
pub fn coerce(raw: String) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = Number::from_f64(f)
    {
        return Value::Number(n);
    }
    match raw.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw),
    }
}

/// Hosts a compute function with the string-array signature behind
/// [`JobHandler`], applying the lowering/lifting at each call.
pub struct StringPairHandler<F> {
    func: F,
}

impl<F> StringPairHandler<F>
where
    F: FnMut(&str, Vec<(String, String)>) -> anyhow::Result<Vec<(String, String)>>
        + Send
        + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }

    pub fn boxed(func: F) -> Box<dyn JobHandler> {
        Box::new(Self::new(func))
    }
}

impl<F> JobHandler for StringPairHandler<F>
where
    F: FnMut(&str, Vec<(String, String)>) -> anyhow::Result<Vec<(String, String)>>
        + Send
        + 'static,
{
    fn handle(&mut self, job: &str, data: Value) -> anyhow::Result<Value> {
        let table = lower(&data);
        let reply = (self.func)(job, table)?;
        Ok(lift(reply))
    }
}

/// Convenience factory for pools whose every worker hosts the same compute
/// function.
pub fn string_pair_factory<F>(
    make: impl Fn(&WorkerContext) -> F + Send + Sync + 'static,
) -> impl Fn(&WorkerContext) -> anyhow::Result<Box<dyn JobHandler>> + Send + Sync + 'static
where
    F: FnMut(&str, Vec<(String, String)>) -> anyhow::Result<Vec<(String, String)>>
        + Send
        + 'static,
{
    move |ctx| Ok(StringPairHandler::boxed(make(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lower_keeps_only_scalar_fields() {
        let obj = json!({
            "id": 7,
            "name": "pump",
            "active": true,
            "nested": {"x": 1},
            "tags": ["a", "b"],
            "nothing": null,
        });

        let table = lower(&obj);
        let keys: Vec<&str> = table.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["active", "id", "name"]);
    }

    #[test]
    fn lift_applies_parse_order() {
        let lifted = lift(vec![
            ("count".into(), "42".into()),
            ("ratio".into(), "2.5".into()),
            ("armed".into(), "false".into()),
            ("label".into(), "steady".into()),
        ]);

        assert_eq!(
            lifted,
            json!({"count": 42, "ratio": 2.5, "armed": false, "label": "steady"})
        );
    }

    #[test]
    fn scalar_round_trip_is_stable_after_coercion() {
        let original = json!({
            "id": 12,
            "price": 9.75,
            "open": true,
            "sku": "ab-33",
        });

        let lifted = lift(lower(&original));
        assert_eq!(lifted, original);

        // a second pass through the boundary changes nothing further
        assert_eq!(lift(lower(&lifted)), lifted);
    }

    #[test]
    fn numeric_looking_strings_coerce_on_lift() {
        let original = json!({"code": "0042"});
        let lifted = lift(lower(&original));
        // integer parse wins over the string fallback
        assert_eq!(lifted, json!({"code": 42}));
    }

    #[test]
    fn non_object_lowers_to_empty_table() {
        assert!(lower(&json!([1, 2, 3])).is_empty());
        assert!(lower(&json!("plain")).is_empty());
    }

    #[test]
    fn handler_round_trips_through_compute_call() {
        let mut handler = StringPairHandler::new(|job: &str, mut table: Vec<(String, String)>| {
            assert_eq!(job, "applyDiscount");
            table.push(("discounted".into(), "true".into()));
            Ok(table)
        });

        let reply = handler
            .handle("applyDiscount", json!({"id": 3, "price": 10}))
            .unwrap();
        assert_eq!(reply, json!({"id": 3, "price": 10, "discounted": true}));
    }
}
