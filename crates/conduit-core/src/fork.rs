//! C8: `Fork` — runs one input item through N independently-built
//! sub-pipelines and joins their outputs into one record keyed by path
//! label (spec §4.8).
//!
//! No direct precedent for the join itself; the channel-per-edge wiring
//! each sub-pipeline run uses is the same one `executor.rs` uses for the
//! top-level pipeline, grounded on `rde-cli`'s per-edge channel setup.
//!
//! Each sub-pipeline is rebuilt fresh for every input item rather than
//! reused across items: elements live for one run (spec §3), and a `Fork`
//! may see many input items across the life of one top-level run, so its
//! children need a fresh instance of their elements every time. The
//! descriptors are validated once at build time (`Builder::build_stage`
//! does a throwaway build to surface `UnknownElement` early) and kept
//! around for the repeated rebuild.

use std::any::Any;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::RunContext;
use crate::error::Result;
use crate::executor::{Builder, Executor, StageInput, StageOutput};
use crate::registry::{Element, ElementFactory};
use crate::schema::ElementDescriptor;
use crate::spec::PipelineDescriptor;

/// One declared `paths` entry: its label and the (unbuilt) stage list.
pub struct ForkPath {
    pub label: String,
    pub descriptors: PipelineDescriptor,
}

/// Built by `ForkFactory::create` with no paths; the builder attaches the
/// recursively-resolved `paths` descriptors afterward via `attach_paths`
/// (DESIGN.md Open Question 5 — the one place the `Element` trait is
/// downcast).
pub struct ForkElement {
    paths: Vec<ForkPath>,
    channel_capacity: usize,
    ctx: RunContext,
}

impl ForkElement {
    fn new(ctx: RunContext, channel_capacity: usize) -> Self {
        ForkElement {
            paths: Vec::new(),
            channel_capacity,
            ctx,
        }
    }

    pub fn attach_paths(&mut self, paths: Vec<(String, PipelineDescriptor)>) {
        self.paths = paths
            .into_iter()
            .map(|(label, descriptors)| ForkPath { label, descriptors })
            .collect();
    }

    /// Runs every sub-pipeline against the same seed item concurrently and
    /// joins results into one record: a label whose path produced zero
    /// values is omitted (absent, not `null`), one value yields that value
    /// bare, more than one yields an ordered JSON array (spec §4.8, §9
    /// Open Question 1).
    async fn fork_one(&mut self, item: Value) -> Result<Value> {
        let capacity = self.channel_capacity;
        let mut futures = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let child_ctx = self.ctx.child();
            futures.push(run_path(&self.ctx.registry, &path.descriptors, child_ctx, capacity, item.clone()));
        }
        let outcomes = futures::future::join_all(futures).await;

        let mut joined = Map::new();
        for (path, outcome) in self.paths.iter().zip(outcomes.into_iter()) {
            let mut values = outcome?;
            match values.len() {
                0 => {}
                1 => {
                    joined.insert(path.label.clone(), values.remove(0));
                }
                _ => {
                    joined.insert(path.label.clone(), Value::Array(values));
                }
            }
        }
        Ok(Value::Object(joined))
    }
}

async fn run_path(
    registry: &crate::registry::Registry,
    descriptors: &PipelineDescriptor,
    ctx: RunContext,
    capacity: usize,
    seed: Value,
) -> Result<Vec<Value>> {
    let pipeline = Builder::new(registry, &ctx).build(descriptors)?;
    let outcome = Executor::run_seeded(pipeline, &ctx, capacity, seed).await?;
    Ok(outcome.results)
}

#[async_trait::async_trait]
impl Element for ForkElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = input.recv() => {
                    let Some(value) = item else { break };
                    let joined = self.fork_one(value).await?;
                    output.send(joined).await?;
                }
            }
        }
        output.finish().await
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct ForkFactory {
    descriptor: ElementDescriptor,
    channel_capacity: usize,
}

impl ForkFactory {
    pub fn new(channel_capacity: usize) -> Self {
        ForkFactory {
            descriptor: ElementDescriptor::new(crate::spec::FORK_ELEMENT_ID),
            channel_capacity,
        }
    }
}

impl ElementFactory for ForkFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.descriptor
    }

    fn create(&self, _ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        Ok(Box::new(ForkElement::new(ctx.child(), self.channel_capacity)))
    }
}

pub fn factory(channel_capacity: usize) -> Arc<dyn ElementFactory> {
    Arc::new(ForkFactory::new(channel_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::schema::{CtorParamSpec, FieldType};
    use crate::spec::StageDescriptor;
    use serde_json::json;

    struct DoubleElement;

    #[async_trait::async_trait]
    impl Element for DoubleElement {
        async fn process(&mut self, mut input: StageInput, output: StageOutput, _cancel: tokio_util::sync::CancellationToken) -> Result<()> {
            // Drain the implicit bootstrap item; a real source would ignore
            // it the same way.
            let _ = input.recv().await;
            output.send(json!({ "x": 6.0 })).await?;
            output.finish().await
        }
    }

    struct DoubleFactory(ElementDescriptor);

    impl ElementFactory for DoubleFactory {
        fn descriptor(&self) -> &ElementDescriptor {
            &self.0
        }

        fn create(&self, _ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
            Ok(Box::new(DoubleElement))
        }
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(DoubleFactory(
                ElementDescriptor::new("test.Double")
                    .with_ctor_params(vec![CtorParamSpec::optional("unused", FieldType::Any, json!(null))])
                    .with_input_schema(vec![]),
            )))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn joins_single_values_per_path_label() {
        let registry = Arc::new(test_registry());
        let ctx = RunContext::new(Arc::clone(&registry), std::collections::HashMap::new());
        let doubled: PipelineDescriptor = serde_json::from_value(json!([{"id": "test.Double"}])).unwrap();
        let squared: PipelineDescriptor = serde_json::from_value(json!([{"id": "test.Double"}])).unwrap();

        let mut fork = ForkElement::new(ctx.child(), 1);
        fork.attach_paths(vec![("doubled".to_string(), doubled), ("squared".to_string(), squared)]);

        let joined = fork.fork_one(json!({"x": 3.0})).await.unwrap();
        assert_eq!(joined["doubled"], json!({"x": 6.0}));
        assert_eq!(joined["squared"], json!({"x": 6.0}));
    }

    #[tokio::test]
    async fn fork_can_be_invoked_for_multiple_input_items() {
        let registry = Arc::new(test_registry());
        let ctx = RunContext::new(Arc::clone(&registry), std::collections::HashMap::new());
        let only: PipelineDescriptor = serde_json::from_value(json!([{"id": "test.Double"}])).unwrap();

        let mut fork = ForkElement::new(ctx.child(), 1);
        fork.attach_paths(vec![("only".to_string(), only)]);

        let first = fork.fork_one(json!({"x": 1.0})).await.unwrap();
        let second = fork.fork_one(json!({"x": 2.0})).await.unwrap();
        assert_eq!(first["only"], json!({"x": 6.0}));
        assert_eq!(second["only"], json!({"x": 6.0}));
    }

    #[test]
    fn unknown_element_in_fork_path_is_rejected_at_build() {
        let registry = test_registry();
        let ctx = RunContext::new(Arc::new(Registry::new()), std::collections::HashMap::new());
        let bad: Vec<StageDescriptor> = serde_json::from_value(json!([{"id": "test.DoesNotExist"}])).unwrap();
        let err = Builder::new(&registry, &ctx).build(&bad).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UnknownElement);
    }
}
