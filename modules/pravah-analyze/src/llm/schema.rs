use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A type the model can be asked to produce under a strict JSON schema.
///
/// Strict mode wants `additionalProperties: false` and every property listed in
/// `required` on each object, no `$ref`s, and `anyOf` instead of `oneOf`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn strict_schema() -> Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();

        inline_refs(&mut value);
        fix_object_schemas(&mut value);

        if let Value::Object(map) = &mut value {
            map.remove("definitions");
            map.remove("$schema");
        }
        value
    }

    fn output_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

fn fix_object_schemas(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type") == Some(&Value::String("object".to_string())) {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let keys = props.keys().map(|k| Value::String(k.clone())).collect();
                    map.insert("required".to_string(), Value::Array(keys));
                }
            }
            if let Some(one_of) = map.remove("oneOf") {
                map.insert("anyOf".to_string(), one_of);
            }
            for (_, v) in map.iter_mut() {
                fix_object_schemas(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(fix_object_schemas),
        _ => {}
    }
}

fn inline_refs(value: &mut Value) {
    let definitions = match value {
        Value::Object(map) => map.get("definitions").cloned(),
        _ => None,
    };
    if let Some(defs) = definitions {
        inline_refs_recursive(value, &defs);
    }
}

fn inline_refs_recursive(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(path)) = map.get("$ref").cloned() {
                if let Some(def) = path
                    .strip_prefix("#/definitions/")
                    .and_then(|name| definitions.get(name))
                {
                    *value = def.clone();
                    inline_refs_recursive(value, definitions);
                    return;
                }
            }
            // schemars wraps documented refs as `allOf: [{$ref}]`
            if let Some(Value::Array(all_of)) = map.get("allOf").cloned() {
                if let [only] = all_of.as_slice() {
                    let description = map.get("description").cloned();
                    *value = only.clone();
                    inline_refs_recursive(value, definitions);
                    if let (Some(d), Value::Object(inlined)) = (description, &mut *value) {
                        inlined.insert("description".to_string(), d);
                    }
                    return;
                }
            }
            for (_, v) in map.iter_mut() {
                inline_refs_recursive(v, definitions);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                inline_refs_recursive(item, definitions);
            }
        }
        _ => {}
    }
}
