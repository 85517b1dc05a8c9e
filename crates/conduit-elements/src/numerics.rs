//! Numeric elements: `Numpy`, `Eval` (spec §4.9).
//!
//! `Eval` is the thinnest possible adapter over `conduit_core::expr`:
//! compile once at construction, evaluate once per item. `Numpy` applies a
//! small closed set of elementwise/reduction operations over a declared
//! array field, grounded on `rde-tx`'s numeric transform stages which do
//! the same "match on an operation name captured at construction" shape.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use conduit_core::error::{ConduitError, ErrorKind};
use conduit_core::expr::Expression;
use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldType};
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

fn str_param(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

// ------------------------------------------------------------------ Eval ---

pub struct EvalElement {
    expression: Expression,
    ctx: RunContext,
}

#[async_trait]
impl Element for EvalElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let result = match self.expression.eval(&item) {
                Ok(result) => result,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };
            output.send(result).await?;
        }
        output.finish().await
    }
}

pub struct EvalFactory(ElementDescriptor);

impl EvalFactory {
    pub fn new() -> Self {
        EvalFactory(
            ElementDescriptor::new("conduit.Eval")
                .with_ctor_params(vec![CtorParamSpec::required("expression", FieldType::String)]),
        )
    }
}

impl ElementFactory for EvalFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let source = str_param(ctor_args, "expression")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Eval requires `expression`"))?;
        let expression = Expression::compile(&source)?;
        Ok(Box::new(EvalElement { expression, ctx: ctx.child() }))
    }
}

pub fn eval_factory() -> Arc<dyn ElementFactory> {
    Arc::new(EvalFactory::new())
}

// ----------------------------------------------------------------- Numpy ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumpyOp {
    Sum,
    Mean,
    Min,
    Max,
    StdDev,
    CumSum,
    Sort,
}

fn parse_op(name: &str) -> Result<NumpyOp> {
    match name {
        "sum" => Ok(NumpyOp::Sum),
        "mean" => Ok(NumpyOp::Mean),
        "min" => Ok(NumpyOp::Min),
        "max" => Ok(NumpyOp::Max),
        "std" => Ok(NumpyOp::StdDev),
        "cumsum" => Ok(NumpyOp::CumSum),
        "sort" => Ok(NumpyOp::Sort),
        other => Err(ConduitError::new(ErrorKind::ElementInitError, format!("unknown Numpy operation: {other}"))),
    }
}

pub struct NumpyElement {
    op: NumpyOp,
    field: Option<String>,
    ctx: RunContext,
}

fn as_numbers(value: &Value) -> Result<Vec<f64>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| ConduitError::new(ErrorKind::ItemError, "Numpy requires a numeric array")))
            .collect(),
        _ => Err(ConduitError::new(ErrorKind::ItemError, "Numpy requires an array field")),
    }
}

impl NumpyElement {
    fn apply(&self, numbers: &[f64]) -> Value {
        match self.op {
            NumpyOp::Sum => json!(numbers.iter().sum::<f64>()),
            NumpyOp::Mean => {
                if numbers.is_empty() {
                    Value::Null
                } else {
                    json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            NumpyOp::Min => numbers.iter().cloned().fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.min(x)))).map(|v| json!(v)).unwrap_or(Value::Null),
            NumpyOp::Max => numbers.iter().cloned().fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.max(x)))).map(|v| json!(v)).unwrap_or(Value::Null),
            NumpyOp::StdDev => {
                if numbers.is_empty() {
                    Value::Null
                } else {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    let variance = numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / numbers.len() as f64;
                    json!(variance.sqrt())
                }
            }
            NumpyOp::CumSum => {
                let mut running = 0.0;
                let out: Vec<Value> = numbers
                    .iter()
                    .map(|x| {
                        running += x;
                        json!(running)
                    })
                    .collect();
                Value::Array(out)
            }
            NumpyOp::Sort => {
                let mut sorted = numbers.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                Value::Array(sorted.into_iter().map(|n| json!(n)).collect())
            }
        }
    }
}

#[async_trait]
impl Element for NumpyElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let source = match &self.field {
                Some(field) => item.get(field).cloned().unwrap_or(Value::Null),
                None => item,
            };
            let numbers = match as_numbers(&source) {
                Ok(numbers) => numbers,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };
            output.send(self.apply(&numbers)).await?;
        }
        output.finish().await
    }
}

pub struct NumpyFactory(ElementDescriptor);

impl NumpyFactory {
    pub fn new() -> Self {
        NumpyFactory(
            ElementDescriptor::new("conduit.Numpy").with_ctor_params(vec![
                CtorParamSpec::required("operation", FieldType::String),
                CtorParamSpec::optional("field", FieldType::String, Value::Null),
            ]),
        )
    }
}

impl ElementFactory for NumpyFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let op_name = str_param(ctor_args, "operation")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Numpy requires `operation`"))?;
        let op = parse_op(&op_name)?;
        let field = str_param(ctor_args, "field");
        Ok(Box::new(NumpyElement { op, field, ctx: ctx.child() }))
    }
}

pub fn numpy_factory() -> Arc<dyn ElementFactory> {
    Arc::new(NumpyFactory::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::item::{item_channel, Item};

    fn test_ctx() -> RunContext {
        use conduit_core::registry::Registry;
        use std::sync::Arc as StdArc;
        RunContext::new(StdArc::new(Registry::new()), std::collections::HashMap::new())
    }

    #[tokio::test]
    async fn eval_computes_expression_per_item_s4() {
        let (in_tx, in_rx) = item_channel(4);
        let (out_tx, mut out_rx) = item_channel(4);
        in_tx.send(Item::Value(json!({"x": 10}))).await.unwrap();
        in_tx.send(Item::Eos).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        let mut element = EvalElement { expression: Expression::compile("input.x * 2").unwrap(), ctx: test_ctx() };
        element.process(input, output, cancel).await.unwrap();

        match out_rx.recv().await.unwrap() {
            Item::Value(v) => assert_eq!(v, json!(20)),
            Item::Eos => panic!("expected a value"),
        }
    }

    #[tokio::test]
    async fn eval_with_stop_on_error_false_skips_items_that_fail_evaluation() {
        // §4.2: "Errors in evaluation count as per-item errors (see §7)".
        let ctx = test_ctx().with_stop_on_error(false);
        let (in_tx, in_rx) = item_channel(4);
        let (out_tx, mut out_rx) = item_channel(4);
        in_tx.send(Item::Value(json!({"x": "not a number"}))).await.unwrap();
        in_tx.send(Item::Value(json!({"x": 10}))).await.unwrap();
        in_tx.send(Item::Eos).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        let mut element = EvalElement { expression: Expression::compile("input.x * 2").unwrap(), ctx: ctx.clone() };
        element.process(input, output, cancel).await.unwrap();

        let mut received = Vec::new();
        while let Some(item) = out_rx.recv().await {
            match item {
                Item::Value(v) => received.push(v),
                Item::Eos => break,
            }
        }
        assert_eq!(received, vec![json!(20)]);
        assert_eq!(ctx.drain_stderr().await.len(), 1);
    }

    #[test]
    fn numpy_mean_and_sort() {
        use conduit_core::registry::Registry;
        use std::sync::Arc as StdArc;

        let ctx = RunContext::new(StdArc::new(Registry::new()), std::collections::HashMap::new());
        let mean = NumpyElement { op: NumpyOp::Mean, field: None, ctx: ctx.clone() };
        assert_eq!(mean.apply(&[1.0, 2.0, 3.0]), json!(2.0));
        let sort = NumpyElement { op: NumpyOp::Sort, field: None, ctx };
        assert_eq!(sort.apply(&[3.0, 1.0, 2.0]), json!([1.0, 2.0, 3.0]));
    }

    #[tokio::test]
    async fn numpy_with_stop_on_error_false_skips_non_numeric_items() {
        use conduit_core::registry::Registry;
        use std::sync::Arc as StdArc;

        let ctx = RunContext::new(StdArc::new(Registry::new()), std::collections::HashMap::new()).with_stop_on_error(false);
        let mut element = NumpyElement { op: NumpyOp::Sum, field: None, ctx: ctx.clone() };

        let (in_tx, in_rx) = item_channel(8);
        let (out_tx, mut out_rx) = item_channel(8);
        in_tx.send(Item::Value(json!("not an array"))).await.unwrap();
        in_tx.send(Item::Value(json!([1.0, 2.0]))).await.unwrap();
        in_tx.send(Item::Eos).await.unwrap();
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
        assert_eq!(received, vec![json!(3.0)]);
        assert_eq!(ctx.drain_stderr().await.len(), 1);
    }
}
