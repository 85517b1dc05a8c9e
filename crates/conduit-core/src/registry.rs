//! C4: element registry. Maps a dotted id to an `ElementFactory`, discovered
//! from the built-in `conduit.*` namespace plus zero or more
//! `CONDUIT_SEARCH_PATHS` directories.
//!
//! Grounded on `dKNOW video-extract-core`'s `Registry` (`HashMap<String,
//! Arc<dyn Plugin>>`, `register`/`lookup`/`plugin_names`).

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::context::RunContext;
use crate::error::{ConduitError, ErrorKind, Result};
use crate::executor::{StageInput, StageOutput};
use crate::schema::ElementDescriptor;

/// The uniform lifecycle contract every element implements, generalized
/// from the reference runtime's `Operator`/`Source`/`Transform`/`Sink`
/// three-way split into one trait: sources ignore `input`, sinks ignore
/// `output`.
#[async_trait::async_trait]
pub trait Element: Send {
    /// Called once before the first pull. May acquire resources.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Consumes `input` and produces onto `output`, observing `cancel`
    /// between items. `input.recv()` already yields each upstream item
    /// coerced to this element's declared shape and defaults-merged (C5);
    /// implementations loop until it returns `None` and must call
    /// `output.finish()` exactly once before returning.
    async fn process(&mut self, input: StageInput, output: StageOutput, cancel: tokio_util::sync::CancellationToken) -> Result<()>;

    /// Called exactly once after the last pull, success or failure.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Escape hatch used only by the builder to special-case `Fork`'s
    /// recursively-built sub-pipelines (see `crate::executor::Builder`).
    fn as_any_mut(&mut self) -> &mut dyn Any {
        unimplemented!("as_any_mut is only implemented by elements that need builder-side downcasting")
    }
}

/// Builds one instance of a registered element class from its resolved
/// constructor arguments (the `StageDescriptor` keys matching the class's
/// declared ctor params).
pub trait ElementFactory: Send + Sync {
    fn descriptor(&self) -> &ElementDescriptor;

    /// `ctx` gives elements that need it (`Console`'s capture buffers,
    /// anything consulting the `stop_on_error` policy knob) a handle onto
    /// the shared per-run state without threading it through every
    /// `process` call individually.
    fn create(&self, ctor_args: &serde_json::Map<String, serde_json::Value>, ctx: &RunContext) -> Result<Box<dyn Element>>;
}

/// Metadata-only stand-in for an element whose manifest was discovered via
/// `CONDUIT_SEARCH_PATHS` but whose factory hasn't been linked/registered
/// in this process. Lets the schema emitter and pre-run validation see the
/// element; the builder still errors with `UnknownElement` if a pipeline
/// actually tries to instantiate one.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementManifestEntry {
    #[serde(flatten)]
    pub descriptor: ElementDescriptor,
}

pub struct Registry {
    factories: HashMap<String, Arc<dyn ElementFactory>>,
    manifest_only: HashMap<String, ElementDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: HashMap::new(),
            manifest_only: HashMap::new(),
        }
    }

    /// Registers a fully linked element factory. Duplicate dotted ids are a
    /// build-time error (spec §3: "Element ids are globally unique").
    pub fn register(&mut self, factory: Arc<dyn ElementFactory>) -> Result<()> {
        let id = factory.descriptor().id.clone();
        if self.factories.contains_key(&id) {
            return Err(ConduitError::new(
                ErrorKind::ElementInitError,
                format!("duplicate element registration: {id}"),
            ));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    /// Reads one or more `CONDUIT_SEARCH_PATHS` directories, loading every
    /// `*.manifest.yaml` file found directly inside each. Manifest-only
    /// entries supply descriptor metadata without a usable factory; the
    /// providing crate must additionally call `register` at startup to
    /// supply the real `ElementFactory` (see DESIGN.md's Open Question 4).
    pub fn load_search_paths(&mut self, search_paths: &str) -> Result<()> {
        for dir in search_paths.split(':').filter(|s| !s.is_empty()) {
            self.load_manifest_dir(Path::new(dir))?;
        }
        Ok(())
    }

    fn load_manifest_dir(&mut self, dir: &Path) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ConduitError::new(ErrorKind::ResourceError, format!("cannot read search path {}: {e}", dir.display()))
        })?;
        for entry in entries {
            let entry = entry
                .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("cannot read directory entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                ConduitError::new(ErrorKind::ResourceError, format!("cannot read manifest {}: {e}", path.display()))
            })?;
            let entries: Vec<ElementManifestEntry> = serde_yaml::from_str(&contents).map_err(|e| {
                ConduitError::new(ErrorKind::ParseError, format!("invalid manifest {}: {e}", path.display()))
            })?;
            for manifest_entry in entries {
                self.manifest_only
                    .entry(manifest_entry.descriptor.id.clone())
                    .or_insert(manifest_entry.descriptor);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ElementFactory>> {
        self.factories.get(id)
    }

    pub fn lookup(&self, id: &str) -> Result<&Arc<dyn ElementFactory>> {
        self.get(id).ok_or_else(|| ConduitError::unknown_element(id))
    }

    pub fn descriptor(&self, id: &str) -> Option<&ElementDescriptor> {
        self.factories
            .get(id)
            .map(|f| f.descriptor())
            .or_else(|| self.manifest_only.get(id))
    }

    /// All descriptors visible to the schema emitter: linked factories plus
    /// manifest-only entries.
    pub fn descriptors(&self) -> Vec<&ElementDescriptor> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for f in self.factories.values() {
            let d = f.descriptor();
            if seen.insert(d.id.clone()) {
                out.push(d);
            }
        }
        for d in self.manifest_only.values() {
            if seen.insert(d.id.clone()) {
                out.push(d);
            }
        }
        out
    }

    pub fn element_ids(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CtorParamSpec, FieldType};
    use serde_json::{json, Map};

    struct NoopElement;

    #[async_trait::async_trait]
    impl Element for NoopElement {
        async fn process(&mut self, mut input: StageInput, output: StageOutput, _cancel: tokio_util::sync::CancellationToken) -> Result<()> {
            while let Some(value) = input.recv().await {
                let _ = output.send(value).await;
            }
            let _ = output.finish().await;
            Ok(())
        }
    }

    struct NoopFactory(ElementDescriptor);

    impl ElementFactory for NoopFactory {
        fn descriptor(&self) -> &ElementDescriptor {
            &self.0
        }

        fn create(&self, _ctor_args: &Map<String, serde_json::Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
            Ok(Box::new(NoopElement))
        }
    }

    #[test]
    fn register_and_lookup_roundtrip() {
        let mut registry = Registry::new();
        let descriptor = ElementDescriptor::new("conduit.Identity")
            .with_ctor_params(vec![CtorParamSpec::optional("x", FieldType::Any, json!(null))]);
        registry.register(Arc::new(NoopFactory(descriptor))).unwrap();
        assert!(registry.get("conduit.Identity").is_some());
        assert!(registry.lookup("conduit.DoesNotExist").is_err());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = Registry::new();
        let make = || NoopFactory(ElementDescriptor::new("conduit.Identity"));
        registry.register(Arc::new(make())).unwrap();
        let err = registry.register(Arc::new(make())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ElementInitError);
    }

    #[test]
    fn unknown_element_lookup_matches_s6() {
        let registry = Registry::new();
        let err = registry.lookup("conduit.DoesNotExist").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownElement);
    }
}
