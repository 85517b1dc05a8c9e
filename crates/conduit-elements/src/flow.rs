//! Flow-control elements: `Iterate`, `Identity`, `Empty` (spec §4.9).
//! `Fork` lives in `conduit_core::fork` since the executor's builder needs
//! to downcast it directly (DESIGN.md Open Question 5).
//!
//! Grounded on `rde-tx/src/lib.rs`'s `Passthrough`, which is exactly
//! `Identity`'s shape; `Iterate` and `Empty` are thin variations on the
//! same loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::ElementDescriptor;
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

// --------------------------------------------------------------- Iterate ---

/// Expands a sequence item into its members. Non-sequence input passes
/// through unchanged as the single item (spec §9 Open Question b — the
/// source's behavior here is undocumented).
pub struct IterateElement;

#[async_trait]
impl Element for IterateElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match item {
                Value::Array(items) => {
                    for member in items {
                        output.send(member).await?;
                    }
                }
                other => output.send(other).await?,
            }
        }
        output.finish().await
    }
}

pub struct IterateFactory(ElementDescriptor);

impl IterateFactory {
    pub fn new() -> Self {
        IterateFactory(ElementDescriptor::new("conduit.Iterate"))
    }
}

impl ElementFactory for IterateFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, _ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        Ok(Box::new(IterateElement))
    }
}

pub fn iterate_factory() -> Arc<dyn ElementFactory> {
    Arc::new(IterateFactory::new())
}

// -------------------------------------------------------------- Identity ---

pub struct IdentityElement;

#[async_trait]
impl Element for IdentityElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            output.send(item).await?;
        }
        output.finish().await
    }
}

pub struct IdentityFactory(ElementDescriptor);

impl IdentityFactory {
    pub fn new() -> Self {
        IdentityFactory(ElementDescriptor::new("conduit.Identity"))
    }
}

impl ElementFactory for IdentityFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, _ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        Ok(Box::new(IdentityElement))
    }
}

pub fn identity_factory() -> Arc<dyn ElementFactory> {
    Arc::new(IdentityFactory::new())
}

// ----------------------------------------------------------------- Empty ---

/// Consumes every upstream item and yields nothing.
pub struct EmptyElement;

#[async_trait]
impl Element for EmptyElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while input.recv().await.is_some() {
            if cancel.is_cancelled() {
                break;
            }
        }
        output.finish().await
    }
}

pub struct EmptyFactory(ElementDescriptor);

impl EmptyFactory {
    pub fn new() -> Self {
        EmptyFactory(ElementDescriptor::new("conduit.Empty"))
    }
}

impl ElementFactory for EmptyFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, _ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        Ok(Box::new(EmptyElement))
    }
}

pub fn empty_factory() -> Arc<dyn ElementFactory> {
    Arc::new(EmptyFactory::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn iterate_expands_array_members() {
        let (in_tx, in_rx) = conduit_core::item::item_channel(4);
        let (out_tx, mut out_rx) = conduit_core::item::item_channel(4);
        in_tx.send(conduit_core::item::Item::Value(json!([1, 2, 3]))).await.unwrap();
        in_tx.send(conduit_core::item::Item::Eos).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);

        IterateElement.process(input, output, cancel).await.unwrap();
        let mut values = Vec::new();
        while let Some(item) = out_rx.recv().await {
            match item {
                conduit_core::item::Item::Value(v) => values.push(v),
                conduit_core::item::Item::Eos => break,
            }
        }
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }
}
