//! C5: InputRecord coercion + defaults-merge.
//!
//! Given an element's declared input schema and its captured constructor
//! defaults, turns one upstream item into the fully populated record the
//! element body sees. Two steps, run once per item (spec §4.5):
//! coerce the raw item into the declared shape, then merge in constructor
//! defaults for any field the item left unset. Never a deep merge — whole
//! fields are replaced.

use serde_json::{Map, Value};

use crate::schema::FieldSpec;

/// Coerce an upstream item into the shape declared by `schema` (spec §3's
/// InputRecord coercion rules). `None` means the element is unstructured
/// and accepts the raw item verbatim.
pub fn coerce_to_record(item: &Value, schema: Option<&[FieldSpec]>) -> Value {
    let Some(fields) = schema else {
        return item.clone();
    };
    if let Value::Object(map) = item {
        let mut out = Map::new();
        for field in fields {
            if let Some(v) = map.get(&field.name) {
                out.insert(field.name.clone(), v.clone());
            }
        }
        return Value::Object(out);
    }
    if fields.len() == 1 {
        let mut out = Map::new();
        out.insert(fields[0].name.clone(), item.clone());
        return Value::Object(out);
    }
    Value::Object(Map::new())
}

/// Merge ctor-captured defaults `D` into a coerced item record `I`: each
/// field is `I[f]` if present, else `D[f]` if present, else left unset.
pub fn merge_defaults(item_record: &Value, ctor_defaults: &Map<String, Value>) -> Value {
    let Value::Object(mut merged) = item_record.clone() else {
        return item_record.clone();
    };
    for (key, default_value) in ctor_defaults {
        merged.entry(key.clone()).or_insert_with(|| default_value.clone());
    }
    Value::Object(merged)
}

/// Convenience wrapper composing coercion and merge, as the executor invokes
/// it once per item immediately before the element's body sees it.
pub fn coerce_and_default(item: &Value, schema: Option<&[FieldSpec]>, ctor_defaults: &Map<String, Value>) -> Value {
    let record = coerce_to_record(item, schema);
    merge_defaults(&record, ctor_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::optional("a", FieldType::Int),
            FieldSpec::optional("b", FieldType::Int),
        ]
    }

    #[test]
    fn coerces_mapping_by_matching_field_names() {
        let coerced = coerce_to_record(&json!({"a": 1, "extra": 2}), Some(&fields()));
        assert_eq!(coerced, json!({"a": 1}));
    }

    #[test]
    fn binds_scalar_to_sole_declared_field() {
        let single = vec![FieldSpec::optional("x", FieldType::Any)];
        let coerced = coerce_to_record(&json!(42), Some(&single));
        assert_eq!(coerced, json!({"x": 42}));
    }

    #[test]
    fn unstructured_schema_passes_through_verbatim() {
        let item = json!([1, 2, 3]);
        assert_eq!(coerce_to_record(&item, None), item);
    }

    #[test]
    fn item_field_wins_over_default() {
        let mut defaults = Map::new();
        defaults.insert("a".to_string(), json!(99));
        let merged = merge_defaults(&json!({"a": 1}), &defaults);
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn default_fills_absent_field() {
        let mut defaults = Map::new();
        defaults.insert("b".to_string(), json!(7));
        let merged = merge_defaults(&json!({"a": 1}), &defaults);
        assert_eq!(merged, json!({"a": 1, "b": 7}));
    }

    #[test]
    fn merge_never_deep_merges_nested_objects() {
        let mut defaults = Map::new();
        defaults.insert("obj".to_string(), json!({"x": 1, "y": 2}));
        let merged = merge_defaults(&json!({"obj": {"x": 100}}), &defaults);
        assert_eq!(merged, json!({"obj": {"x": 100}}));
    }
}
