//! Transform elements: `Filter`, `JsonQuery`, `Extract`, `Format`, `Console`,
//! `Replace` (spec §4.9). All operate on the raw (unstructured) upstream
//! item — their `input_schema` is `None`, so the executor's coercion step
//! is a no-op passthrough and e.g. `Filter`'s `condition: "input.a >= 2"`
//! sees the whole upstream mapping as `input` (spec §4.2).
//!
//! Grounded on `rde-tx/src/lib.rs`'s `Passthrough`/`CleanData` — same
//! "one `process` loop, one `while let Some(v) = input.recv().await`"
//! shape, generalized from Arrow `RecordBatch` rows to one JSON item.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use conduit_core::error::{ConduitError, ErrorKind};
use conduit_core::expr::Expression;
use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldType};
use conduit_core::template::Template;
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

fn str_param(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn item_as_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------- Filter ---

pub struct FilterElement {
    condition: Expression,
    keep_matching: bool,
    ctx: RunContext,
}

#[async_trait]
impl Element for FilterElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let matched = match self.condition.eval_bool(&item) {
                Ok(matched) => matched,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };
            if matched == self.keep_matching {
                output.send(item).await?;
            }
        }
        output.finish().await
    }
}

pub struct FilterFactory(ElementDescriptor);

impl FilterFactory {
    pub fn new() -> Self {
        FilterFactory(
            ElementDescriptor::new("conduit.Filter").with_ctor_params(vec![
                CtorParamSpec::required("condition", FieldType::String),
                CtorParamSpec::optional("keep_matching", FieldType::Bool, json!(true)),
            ]),
        )
    }
}

impl ElementFactory for FilterFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let condition_src = str_param(ctor_args, "condition")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Filter requires `condition`"))?;
        let condition = Expression::compile(&condition_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Filter `condition`: {}", e.message)))?;
        let keep_matching = ctor_args.get("keep_matching").and_then(Value::as_bool).unwrap_or(true);
        Ok(Box::new(FilterElement { condition, keep_matching, ctx: ctx.child() }))
    }
}

pub fn filter_factory() -> Arc<dyn ElementFactory> {
    Arc::new(FilterFactory::new())
}

// ------------------------------------------------------------- JsonQuery ---

/// One segment of a compiled jq-style path: a field name, optionally
/// followed by `[]` to expand the result as a sequence.
struct QuerySegment {
    field: String,
    expand: bool,
}

pub struct JsonQueryElement {
    segments: Vec<QuerySegment>,
}

impl JsonQueryElement {
    fn select(&self, root: &Value) -> Vec<Value> {
        let mut current = vec![root.clone()];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                let field_value = match &value {
                    Value::Object(map) => map.get(&segment.field).cloned(),
                    _ => None,
                };
                let Some(field_value) = field_value else { continue };
                if segment.expand {
                    if let Value::Array(items) = field_value {
                        next.extend(items);
                    }
                } else {
                    next.push(field_value);
                }
            }
            current = next;
        }
        current
    }
}

#[async_trait]
impl Element for JsonQueryElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            for selected in self.select(&item) {
                output.send(selected).await?;
            }
        }
        output.finish().await
    }
}

pub struct JsonQueryFactory(ElementDescriptor);

impl JsonQueryFactory {
    pub fn new() -> Self {
        JsonQueryFactory(
            ElementDescriptor::new("conduit.JsonQuery")
                .with_ctor_params(vec![CtorParamSpec::required("query", FieldType::String)]),
        )
    }
}

fn compile_query(query: &str) -> Result<Vec<QuerySegment>> {
    let mut segments = Vec::new();
    for raw in query.trim_start_matches('.').split('.') {
        if raw.is_empty() {
            continue;
        }
        let (field, expand) = match raw.strip_suffix("[]") {
            Some(field) => (field, true),
            None => (raw, false),
        };
        segments.push(QuerySegment { field: field.to_string(), expand });
    }
    Ok(segments)
}

impl ElementFactory for JsonQueryFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let query = str_param(ctor_args, "query")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "JsonQuery requires `query`"))?;
        let segments = compile_query(&query)?;
        Ok(Box::new(JsonQueryElement { segments }))
    }
}

pub fn json_query_factory() -> Arc<dyn ElementFactory> {
    Arc::new(JsonQueryFactory::new())
}

// --------------------------------------------------------------- Extract ---

pub struct ExtractElement {
    pattern: Regex,
    group: usize,
    all_matches: bool,
}

#[async_trait]
impl Element for ExtractElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let text = item_as_text(&item);
            if self.all_matches {
                for caps in self.pattern.captures_iter(&text) {
                    if let Some(m) = caps.get(self.group) {
                        output.send(Value::String(m.as_str().to_string())).await?;
                    }
                }
            } else if let Some(caps) = self.pattern.captures(&text) {
                if let Some(m) = caps.get(self.group) {
                    output.send(Value::String(m.as_str().to_string())).await?;
                }
            }
        }
        output.finish().await
    }
}

pub struct ExtractFactory(ElementDescriptor);

impl ExtractFactory {
    pub fn new() -> Self {
        ExtractFactory(
            ElementDescriptor::new("conduit.Extract").with_ctor_params(vec![
                CtorParamSpec::required("pattern", FieldType::String),
                CtorParamSpec::optional("group", FieldType::Int, json!(1)),
                CtorParamSpec::optional("all_matches", FieldType::Bool, json!(false)),
            ]),
        )
    }
}

impl ElementFactory for ExtractFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let pattern_src = str_param(ctor_args, "pattern")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Extract requires `pattern`"))?;
        let pattern = Regex::new(&pattern_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Extract `pattern`: {e}")))?;
        let group = ctor_args.get("group").and_then(Value::as_u64).unwrap_or(1) as usize;
        let all_matches = ctor_args.get("all_matches").and_then(Value::as_bool).unwrap_or(false);
        Ok(Box::new(ExtractElement { pattern, group, all_matches }))
    }
}

pub fn extract_factory() -> Arc<dyn ElementFactory> {
    Arc::new(ExtractFactory::new())
}

// ---------------------------------------------------------------- Format ---

pub struct FormatElement {
    template: Template,
}

#[async_trait]
impl Element for FormatElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            output.send(Value::String(self.template.render(&item))).await?;
        }
        output.finish().await
    }
}

pub struct FormatFactory(ElementDescriptor);

impl FormatFactory {
    pub fn new() -> Self {
        FormatFactory(
            ElementDescriptor::new("conduit.Format")
                .with_ctor_params(vec![CtorParamSpec::required("template", FieldType::String)]),
        )
    }
}

impl ElementFactory for FormatFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let template_src = str_param(ctor_args, "template")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Format requires `template`"))?;
        let template = Template::compile(&template_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Format `template`: {}", e.message)))?;
        Ok(Box::new(FormatElement { template }))
    }
}

pub fn format_factory() -> Arc<dyn ElementFactory> {
    Arc::new(FormatFactory::new())
}

// --------------------------------------------------------------- Console ---

/// Renders `format` against each item, pushes the rendered line onto the
/// run's stdout capture buffer, and forwards the *original* item downstream
/// unchanged — both side-effecting and forwarding (DESIGN.md Open Question
/// 3; spec §9(c)).
pub struct ConsoleElement {
    format: Template,
    ctx: RunContext,
}

#[async_trait]
impl Element for ConsoleElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let rendered = self.format.render(&item);
            self.ctx.push_stdout(rendered).await;
            output.send(item).await?;
        }
        output.finish().await
    }
}

pub struct ConsoleFactory(ElementDescriptor);

impl ConsoleFactory {
    pub fn new() -> Self {
        ConsoleFactory(
            ElementDescriptor::new("conduit.Console")
                .with_ctor_params(vec![CtorParamSpec::required("format", FieldType::String)]),
        )
    }
}

impl ElementFactory for ConsoleFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let format_src = str_param(ctor_args, "format")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Console requires `format`"))?;
        let format = Template::compile(&format_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Console `format`: {}", e.message)))?;
        Ok(Box::new(ConsoleElement { format, ctx: ctx.child() }))
    }
}

pub fn console_factory() -> Arc<dyn ElementFactory> {
    Arc::new(ConsoleFactory::new())
}

// --------------------------------------------------------------- Replace ---

pub struct ReplaceElement {
    pattern: Regex,
    replacement: String,
    /// `0` means replace every occurrence, matching Python's `re.sub` count
    /// convention the source element follows.
    count: usize,
}

#[async_trait]
impl Element for ReplaceElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let text = item_as_text(&item);
            let replaced = if self.count == 0 {
                self.pattern.replace_all(&text, self.replacement.as_str()).into_owned()
            } else {
                self.pattern.replacen(&text, self.count, self.replacement.as_str()).into_owned()
            };
            output.send(Value::String(replaced)).await?;
        }
        output.finish().await
    }
}

pub struct ReplaceFactory(ElementDescriptor);

impl ReplaceFactory {
    pub fn new() -> Self {
        ReplaceFactory(
            ElementDescriptor::new("conduit.Replace").with_ctor_params(vec![
                CtorParamSpec::required("pattern", FieldType::String),
                CtorParamSpec::required("replacement", FieldType::String),
                CtorParamSpec::optional("count", FieldType::Int, json!(0)),
            ]),
        )
    }
}

impl ElementFactory for ReplaceFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let pattern_src = str_param(ctor_args, "pattern")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Replace requires `pattern`"))?;
        let pattern = Regex::new(&pattern_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Replace `pattern`: {e}")))?;
        let replacement = str_param(ctor_args, "replacement")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Replace requires `replacement`"))?;
        let count = ctor_args.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
        Ok(Box::new(ReplaceElement { pattern, replacement, count }))
    }
}

pub fn replace_factory() -> Arc<dyn ElementFactory> {
    Arc::new(ReplaceFactory::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_jsonquery_plain_path() {
        let segments = compile_query(".a.b").unwrap();
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].expand);
    }

    #[test]
    fn compiles_jsonquery_expand_marker() {
        let segments = compile_query("items[]").unwrap();
        assert_eq!(segments[0].field, "items");
        assert!(segments[0].expand);
    }

    #[test]
    fn jsonquery_selects_nested_field() {
        let element = JsonQueryElement { segments: compile_query("a.b").unwrap() };
        let selected = element.select(&json!({"a": {"b": 42}}));
        assert_eq!(selected, vec![json!(42)]);
    }

    #[test]
    fn jsonquery_expands_array_field() {
        let element = JsonQueryElement { segments: compile_query("items[]").unwrap() };
        let selected = element.select(&json!({"items": [1, 2, 3]}));
        assert_eq!(selected, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn filter_expression_errors_abort_by_default() {
        // `stop_on_error` defaults to `true`, so `condition`'s own evaluation
        // failures abort the run immediately (spec §7).
        use conduit_core::executor::{StageInput, StageOutput};
        use conduit_core::item::{item_channel, Item};
        use conduit_core::registry::Registry;
        use std::collections::HashMap;
        use std::sync::Arc as StdArc;

        let ctx = RunContext::new(StdArc::new(Registry::new()), HashMap::new());
        let condition = Expression::compile("input.a >= 2").unwrap();
        let mut element = FilterElement { condition, keep_matching: true, ctx: ctx.clone() };

        let (in_tx, in_rx) = item_channel(8);
        let (out_tx, _out_rx) = item_channel(8);
        in_tx.send(Item::Value(json!("not an object"))).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        let err = element.process(input, output, cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
    }

    #[tokio::test]
    async fn filter_expression_errors_skip_item_with_stop_on_error_false() {
        // §4.2: "Errors in evaluation count as per-item errors (see §7)" —
        // with `stop_on_error=false` a bad condition eval is recorded to
        // stderr and the offending item is skipped rather than aborting.
        use conduit_core::executor::{StageInput, StageOutput};
        use conduit_core::item::{item_channel, Item};
        use conduit_core::registry::Registry;
        use std::collections::HashMap;
        use std::sync::Arc as StdArc;

        let ctx = RunContext::new(StdArc::new(Registry::new()), HashMap::new()).with_stop_on_error(false);
        let condition = Expression::compile("input.a >= 2").unwrap();
        let mut element = FilterElement { condition, keep_matching: true, ctx: ctx.clone() };

        let (in_tx, in_rx) = item_channel(8);
        let (out_tx, mut out_rx) = item_channel(8);
        in_tx.send(Item::Value(json!("not an object"))).await.unwrap();
        in_tx.send(Item::Value(json!({"a": 5}))).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        element.process(input, output, cancel).await.unwrap();

        let mut received = Vec::new();
        while let Some(item) = out_rx.recv().await {
            match item {
                Item::Value(v) => received.push(v),
                Item::Eos => break,
            }
        }
        assert_eq!(received, vec![json!({"a": 5})]);
        assert_eq!(ctx.drain_stderr().await.len(), 1);
    }

    #[test]
    fn replace_count_zero_replaces_all() {
        let element = ReplaceElement {
            pattern: Regex::new("a").unwrap(),
            replacement: "X".to_string(),
            count: 0,
        };
        let text = item_as_text(&json!("banana"));
        let replaced = element.pattern.replace_all(&text, element.replacement.as_str());
        assert_eq!(replaced, "bXnXnX");
    }
}
