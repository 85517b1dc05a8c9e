//! Element class descriptors: constructor params and input-record shape.
//!
//! Grounded on the reference runtime's `SchemaConfig`/`FieldConfig` pair,
//! generalized from "Arrow field types for one Kafka topic" to "Conduit
//! field types for one element's declared input record".

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    List,
    Map,
    /// Unstructured — the declared field accepts any JSON value.
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            required,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, false)
    }
}

/// A constructor parameter: name, declared type, and an optional default
/// captured at build time into the element's per-item defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtorParamSpec {
    pub name: String,
    pub field_type: FieldType,
    pub default: Option<Value>,
    pub required: bool,
}

impl CtorParamSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        CtorParamSpec {
            name: name.into(),
            field_type,
            default: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType, default: Value) -> Self {
        CtorParamSpec {
            name: name.into(),
            field_type,
            default: Some(default),
            required: false,
        }
    }
}

/// Class-level metadata the registry keeps per dotted element id (C4).
///
/// `input_schema: None` means the element accepts raw items verbatim
/// (unstructured), per spec §3's InputRecord coercion rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub id: String,
    pub ctor_params: Vec<CtorParamSpec>,
    pub input_schema: Option<Vec<FieldSpec>>,
    /// Opaque unless consumed by the schema emitter (C11).
    pub output_shape: Option<String>,
    /// `GroupBy`/`Sort`-style stages that must exhaust upstream before
    /// producing any output (spec §4.9, §5 ordering rules).
    pub buffered: bool,
}

impl ElementDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        ElementDescriptor {
            id: id.into(),
            ctor_params: Vec::new(),
            input_schema: None,
            output_shape: None,
            buffered: false,
        }
    }

    pub fn with_ctor_params(mut self, params: Vec<CtorParamSpec>) -> Self {
        self.ctor_params = params;
        self
    }

    pub fn with_input_schema(mut self, fields: Vec<FieldSpec>) -> Self {
        self.input_schema = Some(fields);
        self
    }

    pub fn buffered(mut self) -> Self {
        self.buffered = true;
        self
    }

    pub fn ctor_param_names(&self) -> impl Iterator<Item = &str> {
        self.ctor_params.iter().map(|p| p.name.as_str())
    }

    pub fn input_field_names(&self) -> Vec<&str> {
        self.input_schema
            .as_deref()
            .map(|fields| fields.iter().map(|f| f.name.as_str()).collect())
            .unwrap_or_default()
    }
}
