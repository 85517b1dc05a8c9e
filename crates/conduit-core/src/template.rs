//! C1: template evaluator. `{{ expr }}` interpolations and `{{ expr | filter
//! }}` pipes over a per-item context named `input`; no statements, no loops,
//! no imports.
//!
//! Grounded on `slumber`'s `Expression`/`Identifier` AST (attribute/index
//! chains over a root variable), collapsed here to a synchronous,
//! path-only accessor since templates here only ever walk `input`.

use serde_json::Value;

use crate::error::{ConduitError, ErrorKind, Result};

const KNOWN_FILTERS: &[&str] = &[
    "get_filename",
    "get_dirname",
    "get_basename",
    "get_extension",
    "filesizeformat",
    "process",
];

#[derive(Debug, Clone)]
enum Segment {
    Field(String),
    Index(IndexKey),
}

#[derive(Debug, Clone)]
enum IndexKey {
    Str(String),
    Int(usize),
}

#[derive(Debug, Clone)]
struct Accessor {
    segments: Vec<Segment>,
}

impl Accessor {
    fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in &self.segments {
            cur = match (seg, cur) {
                (Segment::Field(name), Value::Object(map)) => map.get(name)?,
                (Segment::Index(IndexKey::Str(key)), Value::Object(map)) => map.get(key)?,
                (Segment::Index(IndexKey::Int(idx)), Value::Array(arr)) => arr.get(*idx)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Interp { accessor: Accessor, filters: Vec<String> },
}

/// A compiled template. Compilation validates filter names; rendering is
/// pure, total, and thread-safe (never fails — unknown fields render empty).
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Template> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or_else(|| {
                ConduitError::new(ErrorKind::TemplateError, "unterminated {{ interpolation")
            })?;
            let body = after_open[..close].trim();
            let mut segments = body.split('|');
            let expr = segments.next().unwrap_or("").trim();
            let filters: Vec<String> = segments
                .map(|f| f.trim().to_string())
                .collect();
            for f in &filters {
                if !KNOWN_FILTERS.contains(&f.as_str()) {
                    return Err(ConduitError::new(
                        ErrorKind::TemplateError,
                        format!("unknown filter: {f}"),
                    ));
                }
            }
            let accessor = parse_accessor(expr)?;
            parts.push(Part::Interp { accessor, filters });
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Template { parts })
    }

    /// Render against the per-item context. Never fails; unresolved paths
    /// and filter application errors both render as the empty string.
    pub fn render(&self, context: &Value) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Interp { accessor, filters } => {
                    let mut value = accessor.resolve(context).cloned().unwrap_or(Value::Null);
                    for filter in filters {
                        value = apply_filter(filter, &value);
                    }
                    out.push_str(&display_value(&value));
                }
            }
        }
        out
    }
}

fn parse_accessor(expr: &str) -> Result<Accessor> {
    let expr = expr.trim();
    if expr == "input" {
        return Ok(Accessor { segments: Vec::new() });
    }
    if !expr.starts_with("input") {
        return Err(ConduitError::new(
            ErrorKind::TemplateError,
            format!("template expressions must start with `input`, got: {expr}"),
        ));
    }
    let rest = expr["input".len()..].as_bytes();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            b'.' => {
                i += 1;
                let start = i;
                while i < rest.len() && (rest[i].is_ascii_alphanumeric() || rest[i] == b'_') {
                    i += 1;
                }
                if i == start {
                    return Err(ConduitError::new(ErrorKind::TemplateError, "expected field name after `.`"));
                }
                segments.push(Segment::Field(String::from_utf8_lossy(&rest[start..i]).into_owned()));
            }
            b'[' => {
                i += 1;
                if i < rest.len() && (rest[i] == b'\'' || rest[i] == b'"') {
                    let quote = rest[i];
                    i += 1;
                    let start = i;
                    while i < rest.len() && rest[i] != quote {
                        i += 1;
                    }
                    let key = String::from_utf8_lossy(&rest[start..i]).into_owned();
                    i += 1;
                    segments.push(Segment::Index(IndexKey::Str(key)));
                } else {
                    let start = i;
                    while i < rest.len() && rest[i].is_ascii_digit() {
                        i += 1;
                    }
                    let idx: usize = std::str::from_utf8(&rest[start..i])
                        .unwrap_or("")
                        .parse()
                        .map_err(|_| ConduitError::new(ErrorKind::TemplateError, "expected index in `[...]`"))?;
                    segments.push(Segment::Index(IndexKey::Int(idx)));
                }
                if i < rest.len() && rest[i] == b']' {
                    i += 1;
                } else {
                    return Err(ConduitError::new(ErrorKind::TemplateError, "unterminated `[`"));
                }
            }
            _ => {
                return Err(ConduitError::new(
                    ErrorKind::TemplateError,
                    format!("unexpected character in template expression: {}", rest[i] as char),
                ))
            }
        }
    }
    Ok(Accessor { segments })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn apply_filter(name: &str, value: &Value) -> Value {
    let as_str = display_value(value);
    match name {
        "process" => value.clone(),
        "get_filename" => Value::String(
            std::path::Path::new(&as_str)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        "get_dirname" => Value::String(
            std::path::Path::new(&as_str)
                .parent()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        "get_basename" => Value::String(
            std::path::Path::new(&as_str)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        "get_extension" => Value::String(
            std::path::Path::new(&as_str)
                .extension()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        "filesizeformat" => as_str
            .parse::<u64>()
            .map(|n| Value::String(bytesize::ByteSize(n).to_string()))
            .unwrap_or(Value::String(String::new())),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_plain_field_access() {
        let tpl = Template::compile("{{input.message}}").unwrap();
        let rendered = tpl.render(&json!({"message": "Hello, Conduit!"}));
        assert_eq!(rendered, "Hello, Conduit!");
    }

    #[test]
    fn renders_literal_and_interpolation_mix() {
        let tpl = Template::compile("n={{input.n}}").unwrap();
        assert_eq!(tpl.render(&json!({"n": 7})), "n=7");
    }

    #[test]
    fn unknown_field_renders_empty() {
        let tpl = Template::compile("[{{input.missing}}]").unwrap();
        assert_eq!(tpl.render(&json!({"a": 1})), "[]");
    }

    #[test]
    fn bracket_index_access() {
        let tpl = Template::compile("{{input['c']}}").unwrap();
        assert_eq!(tpl.render(&json!({"c": "a"})), "a");
    }

    #[test]
    fn unknown_filter_is_a_compile_error() {
        let err = Template::compile("{{input.x | nope}}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateError);
    }

    #[test]
    fn get_filename_filter() {
        let tpl = Template::compile("{{input.path | get_filename}}").unwrap();
        assert_eq!(tpl.render(&json!({"path": "/tmp/foo/bar.csv"})), "bar.csv");
    }

    #[test]
    fn process_filter_is_identity() {
        let tpl = Template::compile("{{input.x | process}}").unwrap();
        assert_eq!(tpl.render(&json!({"x": "unchanged"})), "unchanged");
    }
}
