//! Parsed pipeline document shape (spec §3's StageDescriptor, §6's YAML
//! syntax). Generalized from the reference `PipelineSpec`'s enum-of-known-
//! variants into one generic mapping-based descriptor, since every element
//! here is data-driven through the registry rather than a fixed Rust enum.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConduitError, ErrorKind, Result};

pub const FORK_ELEMENT_ID: &str = "conduit.Fork";

/// One stage occurrence: a dotted element id plus arbitrary string-keyed
/// parameters. `Fork`'s `paths` value is just another parameter here; the
/// builder interprets it specially when `id == FORK_ELEMENT_ID`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl StageDescriptor {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn is_fork(&self) -> bool {
        self.id == FORK_ELEMENT_ID
    }
}

/// A full pipeline: a non-empty, ordered list of stage descriptors (spec
/// §3's "pipeline descriptor list is non-empty" invariant).
pub type PipelineDescriptor = Vec<StageDescriptor>;

pub fn parse_pipeline(resolved_yaml: &serde_yaml::Value) -> Result<PipelineDescriptor> {
    let json_value = yaml_to_json(resolved_yaml)?;
    let stages: PipelineDescriptor = serde_json::from_value(json_value)
        .map_err(|e| ConduitError::new(ErrorKind::ParseError, format!("invalid pipeline document: {e}")))?;
    if stages.is_empty() {
        return Err(ConduitError::new(ErrorKind::ParseError, "pipeline descriptor list must not be empty"));
    }
    Ok(stages)
}

fn yaml_to_json(value: &serde_yaml::Value) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ConduitError::new(ErrorKind::ParseError, format!("invalid YAML document: {e}")))
}

/// The `paths: {label: [StageDescriptor...]}` mapping on a `Fork` stage,
/// returned as an ordered sequence of `(label, stages)` pairs. Relies on the
/// workspace-wide `serde_json/preserve_order` feature so `Map` iteration
/// order matches the document, which the join's declared-path-order
/// guarantee (spec §4.8) depends on.
pub fn parse_fork_paths(descriptor: &StageDescriptor) -> Result<Vec<(String, PipelineDescriptor)>> {
    let raw = descriptor
        .param("paths")
        .ok_or_else(|| ConduitError::new(ErrorKind::ParseError, "Fork stage is missing `paths`"))?;
    let Value::Object(map) = raw else {
        return Err(ConduitError::new(ErrorKind::ParseError, "Fork `paths` must be a mapping"));
    };
    let mut out = Vec::with_capacity(map.len());
    for (label, stages_value) in map {
        let stages: PipelineDescriptor = serde_json::from_value(stages_value.clone()).map_err(|e| {
            ConduitError::new(ErrorKind::ParseError, format!("invalid Fork path `{label}`: {e}"))
        })?;
        out.push((label.clone(), stages));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s1_hello_pipeline() {
        let yaml = serde_yaml::from_str(
            "- id: conduit.Input\n  data: [{message: \"Hello, Conduit!\"}]\n- id: conduit.Console\n  format: \"{{input.message}}\"\n",
        )
        .unwrap();
        let pipeline = parse_pipeline(&yaml).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[0].id, "conduit.Input");
        assert_eq!(pipeline[1].param("format").unwrap(), "{{input.message}}");
    }

    #[test]
    fn empty_pipeline_is_a_parse_error() {
        let yaml = serde_yaml::from_str("[]").unwrap();
        let err = parse_pipeline(&yaml).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn parses_fork_paths_s4() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            "id: conduit.Fork\npaths:\n  doubled:\n    - id: conduit.Eval\n      expression: \"input.x * 2\"\n  squared:\n    - id: conduit.Eval\n      expression: \"input.x * input.x\"\n",
        )
        .unwrap();
        let json_value = yaml_to_json(&yaml).unwrap();
        let descriptor: StageDescriptor = serde_json::from_value(json_value).unwrap();
        assert!(descriptor.is_fork());
        let paths = parse_fork_paths(&descriptor).unwrap();
        assert_eq!(paths.len(), 2);
        let labels: Vec<&str> = paths.iter().map(|(l, _)| l.as_str()).collect();
        assert!(labels.contains(&"doubled"));
        assert!(labels.contains(&"squared"));
    }
}
