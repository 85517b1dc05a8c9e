//! C6 (pipeline builder) + C7 (streaming executor).
//!
//! Grounded on the reference CLI's stage-construction `match` and
//! channel-wiring/spawn loop (`rde-cli/src/main.rs`), generalized from a
//! fixed 3-kind trait dispatch and a hardcoded source→transform*→sink chain
//! into one uniform `Element` trait driven entirely by the registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::defaults::coerce_and_default;
use crate::error::{ConduitError, ErrorKind, Result};
use crate::item::{item_channel, Item, ItemRx, ItemTx, DEFAULT_CHANNEL_CAPACITY};
use crate::metrics::{ElementMetrics, ElementMetricsTracker, RunStats};
use crate::registry::{Element, Registry};
use crate::schema::FieldSpec;
use crate::spec::{parse_fork_paths, StageDescriptor, FORK_ELEMENT_ID};

/// Per-stage input handle. Wraps the raw item channel with coercion +
/// defaults-merge (C5) and races `recv` against the run's cancellation
/// token, so an element body that simply loops on `recv().await` already
/// satisfies spec §5's "observe cancellation between items" requirement.
pub struct StageInput {
    rx: ItemRx,
    schema: Option<Vec<FieldSpec>>,
    ctor_defaults: Map<String, Value>,
    metrics: Arc<Mutex<ElementMetricsTracker>>,
    cancel: CancellationToken,
}

impl StageInput {
    fn new(
        rx: ItemRx,
        schema: Option<Vec<FieldSpec>>,
        ctor_defaults: Map<String, Value>,
        metrics: Arc<Mutex<ElementMetricsTracker>>,
        cancel: CancellationToken,
    ) -> Self {
        StageInput {
            rx,
            schema,
            ctor_defaults,
            metrics,
            cancel,
        }
    }

    /// Builds a `StageInput` directly over a raw item channel, bypassing
    /// the builder — for element-level unit tests in `conduit-elements`
    /// that want to drive one element without wiring a whole pipeline.
    pub fn for_test(rx: ItemRx, schema: Option<Vec<FieldSpec>>, ctor_defaults: Map<String, Value>, cancel: CancellationToken) -> Self {
        StageInput::new(rx, schema, ctor_defaults, Arc::new(Mutex::new(ElementMetricsTracker::new("test"))), cancel)
    }

    /// Pulls the next upstream item, already coerced to this element's
    /// declared input shape and defaults-merged. `None` means end of
    /// stream, whether from a clean `Item::Eos`, a closed channel, or
    /// cancellation — the executor is the one place that distinguishes
    /// them for reporting purposes.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => match item {
                Some(Item::Value(v)) => {
                    self.metrics.lock().unwrap().record_in();
                    Some(coerce_and_default(&v, self.schema.as_deref(), &self.ctor_defaults))
                }
                Some(Item::Eos) | None => None,
            },
        }
    }
}

/// Per-stage output handle: wraps the raw item channel with metrics.
pub struct StageOutput {
    tx: ItemTx,
    metrics: Arc<Mutex<ElementMetricsTracker>>,
}

impl StageOutput {
    fn new(tx: ItemTx, metrics: Arc<Mutex<ElementMetricsTracker>>) -> Self {
        StageOutput { tx, metrics }
    }

    /// Builds a `StageOutput` directly over a raw item channel, paired with
    /// `StageInput::for_test` for element-level unit tests.
    pub fn for_test(tx: ItemTx) -> Self {
        StageOutput::new(tx, Arc::new(Mutex::new(ElementMetricsTracker::new("test"))))
    }

    pub async fn send(&self, value: Value) -> Result<()> {
        self.metrics.lock().unwrap().record_out();
        self.tx
            .send(Item::Value(value))
            .await
            .map_err(|_| ConduitError::new(ErrorKind::InternalError, "downstream stage closed its input channel"))
    }

    /// Records one recovered per-item error against this stage's metrics
    /// (spec §3's `errors` counter). Elements call this from the branch
    /// where `RunContext::recover_or_abort` swallowed rather than re-raised.
    pub fn record_error(&self) {
        self.metrics.lock().unwrap().record_error();
    }

    /// Implementations must call this exactly once before returning from
    /// `process`, even if they produced zero values.
    pub async fn finish(&self) -> Result<()> {
        self.tx
            .send(Item::Eos)
            .await
            .map_err(|_| ConduitError::new(ErrorKind::InternalError, "downstream stage closed its input channel"))
    }
}

pub struct BuiltStage {
    pub id: String,
    pub element: Box<dyn Element>,
    pub input_schema: Option<Vec<FieldSpec>>,
    pub ctor_defaults: Map<String, Value>,
    pub buffered: bool,
}

/// One recursively-built pipeline: the top-level run, or one Fork path.
pub struct BuiltPipeline {
    pub stages: Vec<BuiltStage>,
}

/// C6: turns a resolved `StageDescriptor` list into a `BuiltPipeline`,
/// recursively building `Fork`'s `paths` sub-pipelines.
pub struct Builder<'a> {
    registry: &'a Registry,
    ctx: &'a RunContext,
}

impl<'a> Builder<'a> {
    pub fn new(registry: &'a Registry, ctx: &'a RunContext) -> Self {
        Builder { registry, ctx }
    }

    pub fn build(&self, descriptors: &[StageDescriptor]) -> Result<BuiltPipeline> {
        if descriptors.is_empty() {
            return Err(ConduitError::new(ErrorKind::ParseError, "pipeline descriptor list must not be empty"));
        }
        let mut stages = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            stages.push(self.build_stage(index, descriptor)?);
        }
        Ok(BuiltPipeline { stages })
    }

    fn build_stage(&self, index: usize, descriptor: &StageDescriptor) -> Result<BuiltStage> {
        let factory = self
            .registry
            .lookup(&descriptor.id)
            .map_err(|e| e.with_stage(index, descriptor.id.clone()))?;
        let class_descriptor = factory.descriptor();

        let ctor_param_names: HashSet<&str> = class_descriptor.ctor_param_names().collect();
        let input_field_names: HashSet<&str> = class_descriptor.input_field_names().into_iter().collect();

        let mut ctor_args = Map::new();
        let mut ctor_defaults = Map::new();
        for (key, value) in &descriptor.params {
            if descriptor.is_fork() && key == "paths" {
                continue;
            }
            let is_ctor_param = ctor_param_names.contains(key.as_str());
            let is_input_field = input_field_names.contains(key.as_str());
            if is_ctor_param {
                ctor_args.insert(key.clone(), value.clone());
            }
            if is_input_field {
                ctor_defaults.insert(key.clone(), value.clone());
            }
            if !is_ctor_param && !is_input_field {
                // Spec §4.6: a key matching neither is a build-time warning
                // (configurable to error) — warning by default here.
                warn!(stage_id = %descriptor.id, key = %key, "stage parameter matches neither a constructor arg nor an input-schema field");
            }
        }
        for param in &class_descriptor.ctor_params {
            if !ctor_args.contains_key(&param.name) {
                if let Some(default) = &param.default {
                    ctor_args.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(ConduitError::new(
                        ErrorKind::ElementInitError,
                        format!("missing required constructor parameter `{}`", param.name),
                    )
                    .with_stage(index, descriptor.id.clone()));
                }
            }
        }

        let mut element = factory
            .create(&ctor_args, self.ctx)
            .map_err(|e| e.with_stage(index, descriptor.id.clone()))?;

        if descriptor.is_fork() {
            let raw_paths = parse_fork_paths(descriptor).map_err(|e| e.with_stage(index, descriptor.id.clone()))?;
            // Validate every path's descriptors (catches `UnknownElement`
            // etc. at build time) with a throwaway build; the real
            // sub-pipeline is rebuilt fresh for each input item the Fork
            // sees at runtime (see `fork.rs`'s module doc).
            for (_, sub_descriptors) in &raw_paths {
                self.build(sub_descriptors)?;
            }
            let fork = element.as_any_mut().downcast_mut::<crate::fork::ForkElement>().ok_or_else(|| {
                ConduitError::new(
                    ErrorKind::InternalError,
                    format!("{FORK_ELEMENT_ID} factory produced an unexpected element type"),
                )
                .with_stage(index, descriptor.id.clone())
            })?;
            fork.attach_paths(raw_paths);
        }

        Ok(BuiltStage {
            id: descriptor.id.clone(),
            element,
            input_schema: class_descriptor.input_schema.clone(),
            ctor_defaults,
            buffered: class_descriptor.buffered,
        })
    }
}

pub struct RunOutcome {
    pub results: Vec<Value>,
    pub stats: RunStats,
}

pub struct Executor;

impl Executor {
    /// Drives a built pipeline to completion, seeding the first stage with
    /// the implicit bootstrap item `null` (spec §2/§4.7's top-level run).
    pub async fn run(pipeline: BuiltPipeline, ctx: &RunContext, channel_capacity: usize) -> Result<RunOutcome> {
        Self::run_seeded(pipeline, ctx, channel_capacity, Value::Null).await
    }

    /// Same as `run`, but seeds the first stage with `seed` instead of
    /// `null` — used by `Fork` (spec §4.8), whose sub-pipelines run "with
    /// an input sequence consisting of the single item" being forked.
    pub async fn run_seeded(pipeline: BuiltPipeline, ctx: &RunContext, channel_capacity: usize, seed: Value) -> Result<RunOutcome> {
        let cancel = ctx.cancel.clone();
        let started_at = Instant::now();
        let stage_count = pipeline.stages.len();
        let capacity = if channel_capacity == 0 { DEFAULT_CHANNEL_CAPACITY } else { channel_capacity };

        let mut txs: Vec<ItemTx> = Vec::with_capacity(stage_count + 1);
        let mut rxs: Vec<Option<ItemRx>> = Vec::with_capacity(stage_count + 1);
        for _ in 0..=stage_count {
            let (tx, rx) = item_channel(capacity);
            txs.push(tx);
            rxs.push(Some(rx));
        }

        let bootstrap_tx = txs[0].clone();
        tokio::spawn(async move {
            let _ = bootstrap_tx.send(Item::Value(seed)).await;
            let _ = bootstrap_tx.send(Item::Eos).await;
        });

        let mut handles = Vec::with_capacity(stage_count);
        let mut metrics_handles = Vec::with_capacity(stage_count);

        for (index, mut stage) in pipeline.stages.into_iter().enumerate() {
            let rx = rxs[index].take().expect("each stage consumes exactly one input channel");
            let tx = txs[index + 1].clone();
            let metrics = Arc::new(Mutex::new(ElementMetricsTracker::new(stage.id.clone())));
            metrics_handles.push(Arc::clone(&metrics));
            let stage_cancel = cancel.child_token();
            let stage_id = stage.id.clone();

            let input_schema = stage.input_schema.take();
            let input = StageInput::new(rx, input_schema, stage.ctor_defaults.clone(), Arc::clone(&metrics), stage_cancel.clone());
            let output = StageOutput::new(tx, metrics);

            let handle = tokio::spawn(async move {
                debug!(stage = %stage_id, "opening stage");
                if let Err(open_err) = stage.element.open().await {
                    let _ = stage.element.close().await;
                    return Err(open_err.with_stage(index, stage_id));
                }
                let process_result = stage.element.process(input, output, stage_cancel).await;
                if let Err(close_err) = stage.element.close().await {
                    warn!(stage = %stage_id, error = %close_err.message, "error closing stage");
                }
                process_result.map_err(|e| e.with_stage(index, stage_id))
            });
            handles.push(handle);
        }
        drop(txs);

        let mut final_rx = rxs[stage_count].take().expect("final output channel");
        let drain = async {
            let mut results = Vec::new();
            while let Some(item) = final_rx.recv().await {
                match item {
                    Item::Value(v) => results.push(v),
                    Item::Eos => break,
                }
            }
            results
        };

        let join_all = async {
            let mut outcomes = Vec::with_capacity(handles.len());
            for handle in handles {
                let joined = handle
                    .await
                    .map_err(|e| ConduitError::new(ErrorKind::InternalError, format!("stage task panicked: {e}")));
                outcomes.push(joined.and_then(|r| r));
            }
            outcomes
        };

        let (results, stage_outcomes) = tokio::join!(drain, join_all);

        if cancel.is_cancelled() {
            return Err(ConduitError::cancelled());
        }
        for outcome in &stage_outcomes {
            if let Err(e) = outcome {
                return Err(e.clone());
            }
        }

        // Every stage task has finished (we just joined them above) and
        // dropped its `StageInput`/`StageOutput`, so `metrics_handles` holds
        // the sole remaining reference.
        let element_metrics: Vec<ElementMetrics> = metrics_handles
            .into_iter()
            .map(|tracker| match Arc::try_unwrap(tracker) {
                Ok(mutex) => mutex.into_inner().unwrap().finish(),
                Err(arc) => arc.lock().unwrap().snapshot(),
            })
            .collect();

        let total_items_processed = results.len() as u64;
        let stats = RunStats::finalize(started_at, element_metrics, total_items_processed);
        Ok(RunOutcome { results, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CtorParamSpec, ElementDescriptor, FieldType};
    use serde_json::json;

    struct IdentitySource {
        values: Vec<Value>,
    }

    #[async_trait::async_trait]
    impl Element for IdentitySource {
        async fn process(&mut self, mut input: StageInput, output: StageOutput, _cancel: CancellationToken) -> Result<()> {
            // Drain the bootstrap item first (a pure source ignores it).
            let _ = input.recv().await;
            for v in self.values.drain(..) {
                output.send(v).await?;
            }
            output.finish().await
        }
    }

    struct IdentitySourceFactory(ElementDescriptor);

    impl crate::registry::ElementFactory for IdentitySourceFactory {
        fn descriptor(&self) -> &ElementDescriptor {
            &self.0
        }

        fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
            let values = ctor_args.get("data").cloned().unwrap_or(Value::Array(vec![]));
            let values = match values {
                Value::Array(a) => a,
                other => vec![other],
            };
            Ok(Box::new(IdentitySource { values }))
        }
    }

    struct PassThrough;

    #[async_trait::async_trait]
    impl Element for PassThrough {
        async fn process(&mut self, mut input: StageInput, output: StageOutput, _cancel: CancellationToken) -> Result<()> {
            while let Some(v) = input.recv().await {
                output.send(v).await?;
            }
            output.finish().await
        }
    }

    struct PassThroughFactory(ElementDescriptor);

    impl crate::registry::ElementFactory for PassThroughFactory {
        fn descriptor(&self) -> &ElementDescriptor {
            &self.0
        }

        fn create(&self, _ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
            Ok(Box::new(PassThrough))
        }
    }

    fn registry_with_test_elements() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(IdentitySourceFactory(
                ElementDescriptor::new("test.Input")
                    .with_ctor_params(vec![CtorParamSpec::optional("data", FieldType::List, json!([]))]),
            )))
            .unwrap();
        registry
            .register(Arc::new(PassThroughFactory(
                ElementDescriptor::new("test.Identity").with_input_schema(vec![]),
            )))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn runs_a_linear_chain_and_collects_results() {
        let registry = registry_with_test_elements();
        let ctx = RunContext::new(Arc::new(Registry::new()), std::collections::HashMap::new());
        let descriptors: Vec<StageDescriptor> = serde_json::from_value(json!([
            {"id": "test.Input", "data": [{"a": 1}, {"a": 2}]},
            {"id": "test.Identity"},
        ]))
        .unwrap();
        let pipeline = Builder::new(&registry, &ctx).build(&descriptors).unwrap();
        let outcome = Executor::run(pipeline, &ctx, 1).await.unwrap();
        assert_eq!(outcome.results, vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(outcome.stats.total_items_processed, 2);
    }

    #[tokio::test]
    async fn unknown_element_fails_before_any_stage_opens() {
        let registry = registry_with_test_elements();
        let ctx = RunContext::new(Arc::new(Registry::new()), std::collections::HashMap::new());
        let descriptors: Vec<StageDescriptor> = serde_json::from_value(json!([{"id": "conduit.DoesNotExist"}])).unwrap();
        let err = Builder::new(&registry, &ctx).build(&descriptors).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownElement);
    }

    #[tokio::test]
    async fn cancellation_before_run_reports_cancelled() {
        let registry = registry_with_test_elements();
        let ctx = RunContext::new(Arc::new(Registry::new()), std::collections::HashMap::new());
        let descriptors: Vec<StageDescriptor> = serde_json::from_value(json!([
            {"id": "test.Input", "data": [{"a": 1}]},
            {"id": "test.Identity"},
        ]))
        .unwrap();
        let pipeline = Builder::new(&registry, &ctx).build(&descriptors).unwrap();
        ctx.cancel.cancel();
        let err = Executor::run(pipeline, &ctx, 1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn stage_output_record_error_increments_the_stage_errors_counter() {
        let metrics = Arc::new(Mutex::new(ElementMetricsTracker::new("test.Stage")));
        let (tx, _rx) = item_channel(1);
        let output = StageOutput::new(tx, Arc::clone(&metrics));

        output.record_error();
        output.record_error();

        assert_eq!(metrics.lock().unwrap().snapshot().errors, 2);
    }
}
