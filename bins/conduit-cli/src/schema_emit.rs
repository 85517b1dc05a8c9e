//! Schema emitter (C11): walks the registry and emits one JSON Schema whose
//! `oneOf` branch per element enforces `id` and the union of constructor and
//! input-field keys, typed per the element's declaration (spec §4.11).
//!
//! No direct precedent (the reference runtime has no schema surface); the
//! `schemars` dependency, declared but otherwise unused elsewhere in the
//! workspace, is put to its intended use here, built up as a plain
//! `serde_json::Value` document rather than derived from a Rust type,
//! since the branches are assembled dynamically from registry contents
//! rather than known at compile time.

use conduit_core::registry::Registry;
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldSpec, FieldType};
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde_json::{json, Map, Value};

pub fn emit_schema(registry: &Registry) -> Value {
    let mut descriptors = registry.descriptors();
    descriptors.sort_by(|a, b| a.id.cmp(&b.id));

    let branches: Vec<Value> = descriptors.into_iter().map(element_branch).collect();

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Conduit pipeline stage",
        "oneOf": branches,
    })
}

fn element_branch(descriptor: &ElementDescriptor) -> Value {
    let mut properties = Map::new();
    properties.insert("id".to_string(), const_string_schema(&descriptor.id));

    let mut required = vec!["id".to_string()];

    for param in &descriptor.ctor_params {
        properties.insert(param.name.clone(), ctor_param_schema(param));
        if param.required {
            required.push(param.name.clone());
        }
    }
    for field in descriptor.input_schema.iter().flatten() {
        properties
            .entry(field.name.clone())
            .or_insert_with(|| field_schema(field));
        if field.required && !required.contains(&field.name) {
            required.push(field.name.clone());
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": descriptor.id == conduit_core::spec::FORK_ELEMENT_ID,
    })
}

fn const_string_schema(value: &str) -> Value {
    json!({ "type": "string", "const": value })
}

fn ctor_param_schema(param: &CtorParamSpec) -> Value {
    let mut schema = field_type_schema(param.field_type);
    if let Value::Object(ref mut map) = schema {
        if let Some(default) = &param.default {
            map.insert("default".to_string(), default.clone());
        }
    }
    schema
}

fn field_schema(field: &FieldSpec) -> Value {
    field_type_schema(field.field_type)
}

fn field_type_schema(field_type: FieldType) -> Value {
    let instance = match field_type {
        FieldType::String => InstanceType::String,
        FieldType::Int => InstanceType::Integer,
        FieldType::Float => InstanceType::Number,
        FieldType::Bool => InstanceType::Boolean,
        FieldType::List => InstanceType::Array,
        FieldType::Map => InstanceType::Object,
        FieldType::Any => {
            // `schemars`' `SchemaObject` default (no `instance_type`
            // constraint) is the idiomatic "accepts any JSON value" shape.
            let schema = Schema::Object(SchemaObject::default());
            return serde_json::to_value(schema).expect("schema object always serializes");
        }
    };
    let schema = Schema::Object(SchemaObject {
        instance_type: Some(schemars::schema::SingleOrVec::Single(Box::new(instance))),
        ..Default::default()
    });
    serde_json::to_value(schema).expect("schema object always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::registry::Registry;

    #[test]
    fn emits_one_branch_per_registered_element() {
        let mut registry = Registry::new();
        conduit_elements::register_builtins(&mut registry).unwrap();
        let schema = emit_schema(&registry);
        let branches = schema["oneOf"].as_array().unwrap();
        assert_eq!(branches.len(), registry.descriptors().len());
    }

    #[test]
    fn fork_branch_allows_additional_properties_for_paths() {
        let mut registry = Registry::new();
        conduit_elements::register_builtins(&mut registry).unwrap();
        let schema = emit_schema(&registry);
        let fork_branch = schema["oneOf"]
            .as_array()
            .unwrap()
            .iter()
            .find(|b| b["properties"]["id"]["const"] == "conduit.Fork")
            .unwrap();
        assert_eq!(fork_branch["additionalProperties"], true);
    }
}
