//! Sink/system elements: `DownloadFile`, `Cli`, `FileInfo`, `Find`, `Path`
//! (spec §4.9).
//!
//! `DownloadFile`'s `filename` ctor param doubles as a per-item default
//! field (spec §4.6: "a key may belong to both"), so the executor's
//! defaults-merge (C5) picks the item's own `filename` when present and
//! falls back to the constructor-captured one otherwise — the built-in
//! element the merge law is easiest to observe on directly.
//!
//! `Cli`'s subprocess spawn is grounded on `tokio::process::Command`, the
//! same idiom the reference workspace's own binaries (`kafka-producer`,
//! `market-data`) reach for when shelling out; `FileInfo`/`Find` are
//! grounded on `rde-io/src/source_csv.rs`'s `glob`/filesystem-walk usage.

use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use conduit_core::error::{ConduitError, ErrorKind};
use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldSpec, FieldType};
use conduit_core::template::Template;
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

fn str_param(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn item_path(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("path").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

// --------------------------------------------------------- DownloadFile ---

pub struct DownloadFileElement {
    output_dir: PathBuf,
    create_dirs: bool,
    overwrite: bool,
    sequence: u64,
    ctx: RunContext,
}

impl DownloadFileElement {
    fn write_one(&mut self, item: &Value) -> Result<Value> {
        let content = item.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
        let filename = item
            .get("filename")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| {
                self.sequence += 1;
                format!("download_{}", self.sequence)
            });

        if self.create_dirs {
            std::fs::create_dir_all(&self.output_dir).map_err(|e| {
                ConduitError::new(ErrorKind::ResourceError, format!("creating `{}`: {e}", self.output_dir.display()))
            })?;
        }
        let dest = self.output_dir.join(&filename);
        if dest.exists() && !self.overwrite {
            return Err(ConduitError::new(
                ErrorKind::ResourceError,
                format!("`{}` already exists and overwrite is false", dest.display()),
            ));
        }
        std::fs::write(&dest, content.as_bytes())
            .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("writing `{}`: {e}", dest.display())))?;
        Ok(json!(dest.display().to_string()))
    }
}

#[async_trait]
impl Element for DownloadFileElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match self.write_one(&item) {
                Ok(path) => output.send(path).await?,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            }
        }
        output.finish().await
    }
}

pub struct DownloadFileFactory(ElementDescriptor);

impl DownloadFileFactory {
    pub fn new() -> Self {
        DownloadFileFactory(
            ElementDescriptor::new("conduit.DownloadFile")
                .with_ctor_params(vec![
                    CtorParamSpec::required("output_dir", FieldType::String),
                    CtorParamSpec::optional("filename", FieldType::String, Value::Null),
                    CtorParamSpec::optional("create_dirs", FieldType::Bool, json!(true)),
                    CtorParamSpec::optional("overwrite", FieldType::Bool, json!(false)),
                ])
                .with_input_schema(vec![
                    FieldSpec::optional("content", FieldType::Any),
                    FieldSpec::optional("filename", FieldType::String),
                ]),
        )
    }
}

impl ElementFactory for DownloadFileFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let output_dir = str_param(ctor_args, "output_dir")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "DownloadFile requires `output_dir`"))?;
        let create_dirs = ctor_args.get("create_dirs").and_then(Value::as_bool).unwrap_or(true);
        let overwrite = ctor_args.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
        Ok(Box::new(DownloadFileElement {
            output_dir: PathBuf::from(output_dir),
            create_dirs,
            overwrite,
            sequence: 0,
            ctx: ctx.child(),
        }))
    }
}

pub fn download_file_factory() -> Arc<dyn ElementFactory> {
    Arc::new(DownloadFileFactory::new())
}

// ------------------------------------------------------------------- Cli ---

pub struct CliElement {
    command: Template,
    args: Vec<Template>,
    capture_output: bool,
    shell: bool,
    ctx: RunContext,
}

impl CliElement {
    async fn run_one(&self, item: &Value) -> Result<Value> {
        let command_str = self.command.render(item);
        let rendered_args: Vec<String> = self.args.iter().map(|a| a.render(item)).collect();

        let mut cmd = if self.shell {
            let mut c = Command::new("sh");
            let joined = format!("{command_str} {}", rendered_args.join(" "));
            c.arg("-c").arg(joined);
            c
        } else {
            let mut c = Command::new(&command_str);
            c.args(&rendered_args);
            c
        };

        if self.capture_output {
            let out = cmd
                .output()
                .await
                .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("running `{command_str}`: {e}")))?;
            Ok(json!({
                "stdout": String::from_utf8_lossy(&out.stdout),
                "stderr": String::from_utf8_lossy(&out.stderr),
                "exit_code": out.status.code(),
            }))
        } else {
            let status = cmd
                .status()
                .await
                .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("running `{command_str}`: {e}")))?;
            Ok(json!({ "exit_code": status.code() }))
        }
    }
}

#[async_trait]
impl Element for CliElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match self.run_one(&item).await {
                Ok(record) => output.send(record).await?,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            }
        }
        output.finish().await
    }
}

pub struct CliFactory(ElementDescriptor);

impl CliFactory {
    pub fn new() -> Self {
        CliFactory(
            ElementDescriptor::new("conduit.Cli").with_ctor_params(vec![
                CtorParamSpec::required("command", FieldType::String),
                CtorParamSpec::optional("args", FieldType::List, json!([])),
                CtorParamSpec::optional("capture_output", FieldType::Bool, json!(true)),
                CtorParamSpec::optional("shell", FieldType::Bool, json!(false)),
            ]),
        )
    }
}

impl ElementFactory for CliFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let command_src = str_param(ctor_args, "command")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Cli requires `command`"))?;
        let command = Template::compile(&command_src)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Cli `command`: {}", e.message)))?;
        let mut args = Vec::new();
        if let Some(Value::Array(raw_args)) = ctor_args.get("args") {
            for raw in raw_args {
                let raw_str = raw.as_str().unwrap_or_default();
                args.push(
                    Template::compile(raw_str)
                        .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("Cli `args`: {}", e.message)))?,
                );
            }
        }
        let capture_output = ctor_args.get("capture_output").and_then(Value::as_bool).unwrap_or(true);
        let shell = ctor_args.get("shell").and_then(Value::as_bool).unwrap_or(false);
        Ok(Box::new(CliElement { command, args, capture_output, shell, ctx: ctx.child() }))
    }
}

pub fn cli_factory() -> Arc<dyn ElementFactory> {
    Arc::new(CliFactory::new())
}

// -------------------------------------------------------------- FileInfo ---

pub struct FileInfoElement {
    ctx: RunContext,
}

impl FileInfoElement {
    fn stat(item: &Value) -> Result<Value> {
        let path = item_path(item).ok_or_else(|| ConduitError::new(ErrorKind::ItemError, "FileInfo item has no path"))?;
        let metadata = std::fs::metadata(&path)
            .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("stat `{path}`: {e}")))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(json!({
            "path": path,
            "size": metadata.len(),
            "is_dir": metadata.is_dir(),
            "is_file": metadata.is_file(),
            "modified": modified,
        }))
    }
}

#[async_trait]
impl Element for FileInfoElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match Self::stat(&item) {
                Ok(record) => output.send(record).await?,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            }
        }
        output.finish().await
    }
}

pub struct FileInfoFactory(ElementDescriptor);

impl FileInfoFactory {
    pub fn new() -> Self {
        FileInfoFactory(
            ElementDescriptor::new("conduit.FileInfo").with_input_schema(vec![FieldSpec::optional("path", FieldType::String)]),
        )
    }
}

impl ElementFactory for FileInfoFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, _ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        Ok(Box::new(FileInfoElement { ctx: ctx.child() }))
    }
}

pub fn file_info_factory() -> Arc<dyn ElementFactory> {
    Arc::new(FileInfoFactory::new())
}

// ------------------------------------------------------------------ Find ---

pub struct FindElement {
    path: PathBuf,
    name: Option<String>,
    file_type: Option<String>,
    max_depth: Option<usize>,
    ctx: RunContext,
}

#[async_trait]
impl Element for FindElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        let _ = input.recv().await;
        let mut walker = WalkDir::new(&self.path);
        if let Some(depth) = self.max_depth {
            walker = walker.max_depth(depth);
        }
        for entry in walker {
            if cancel.is_cancelled() {
                break;
            }
            let entry = match entry.map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("walking `{}`: {e}", self.path.display()))) {
                Ok(entry) => entry,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };
            if let Some(name) = &self.name {
                let matches = entry.file_name().to_string_lossy().contains(name.as_str());
                if !matches {
                    continue;
                }
            }
            match self.file_type.as_deref() {
                Some("file") if !entry.file_type().is_file() => continue,
                Some("dir") if !entry.file_type().is_dir() => continue,
                _ => {}
            }
            output.send(json!(entry.path().display().to_string())).await?;
        }
        output.finish().await
    }
}

pub struct FindFactory(ElementDescriptor);

impl FindFactory {
    pub fn new() -> Self {
        FindFactory(
            ElementDescriptor::new("conduit.Find").with_ctor_params(vec![
                CtorParamSpec::required("path", FieldType::String),
                CtorParamSpec::optional("name", FieldType::String, Value::Null),
                CtorParamSpec::optional("type", FieldType::String, Value::Null),
                CtorParamSpec::optional("max_depth", FieldType::Int, Value::Null),
            ]),
        )
    }
}

impl ElementFactory for FindFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let path = str_param(ctor_args, "path")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Find requires `path`"))?;
        let name = str_param(ctor_args, "name");
        let file_type = str_param(ctor_args, "type");
        let max_depth = ctor_args.get("max_depth").and_then(Value::as_u64).map(|d| d as usize);
        Ok(Box::new(FindElement { path: PathBuf::from(path), name, file_type, max_depth, ctx: ctx.child() }))
    }
}

pub fn find_factory() -> Arc<dyn ElementFactory> {
    Arc::new(FindFactory::new())
}

// ------------------------------------------------------------------ Path ---

pub struct PathElement {
    operation: String,
    parts: Vec<String>,
}

fn apply_path_operation(operation: &str, path: &str) -> Result<Value> {
    let p = StdPath::new(path);
    let out = match operation {
        "basename" => p.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        "dirname" => p.parent().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        "extension" => p.extension().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        "stem" => p.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        other => {
            return Err(ConduitError::new(ErrorKind::ElementInitError, format!("unknown Path operation: {other}")));
        }
    };
    Ok(Value::String(out))
}

#[async_trait]
impl Element for PathElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            if self.operation == "join" {
                let mut segments = self.parts.clone();
                match &item {
                    Value::String(s) => segments.push(s.clone()),
                    Value::Array(items) => segments.extend(items.iter().filter_map(|v| v.as_str().map(String::from))),
                    _ => {}
                }
                let mut joined = PathBuf::new();
                for segment in segments {
                    joined.push(segment);
                }
                output.send(json!(joined.display().to_string())).await?;
            } else {
                let path = item_path(&item).unwrap_or_default();
                output.send(apply_path_operation(&self.operation, &path)?).await?;
            }
        }
        output.finish().await
    }
}

pub struct PathFactory(ElementDescriptor);

impl PathFactory {
    pub fn new() -> Self {
        PathFactory(
            ElementDescriptor::new("conduit.Path").with_ctor_params(vec![
                CtorParamSpec::required("operation", FieldType::String),
                CtorParamSpec::optional("parts", FieldType::List, json!([])),
            ]),
        )
    }
}

impl ElementFactory for PathFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let operation = str_param(ctor_args, "operation")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Path requires `operation`"))?;
        if !["join", "basename", "dirname", "extension", "stem"].contains(&operation.as_str()) {
            return Err(ConduitError::new(ErrorKind::ElementInitError, format!("unknown Path operation: {operation}")));
        }
        let parts = match ctor_args.get("parts") {
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            _ => Vec::new(),
        };
        Ok(Box::new(PathElement { operation, parts }))
    }
}

pub fn path_factory() -> Arc<dyn ElementFactory> {
    Arc::new(PathFactory::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::item::{item_channel, Item};
    use tempfile::tempdir;

    #[tokio::test]
    async fn download_file_writes_content_and_forwards_path() {
        let dir = tempdir().unwrap();
        let (in_tx, in_rx) = item_channel(2);
        let (out_tx, mut out_rx) = item_channel(2);
        in_tx.send(Item::Value(json!({"content": "hello", "filename": "greeting.txt"}))).await.unwrap();
        in_tx.send(Item::Eos).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        let ctx = RunContext::new(Arc::new(conduit_core::registry::Registry::new()), std::collections::HashMap::new());
        let mut element = DownloadFileElement {
            output_dir: dir.path().to_path_buf(),
            create_dirs: true,
            overwrite: false,
            sequence: 0,
            ctx,
        };
        element.process(input, output, cancel).await.unwrap();

        let written = dir.path().join("greeting.txt");
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "hello");
        match out_rx.recv().await.unwrap() {
            Item::Value(v) => assert_eq!(v, json!(written.display().to_string())),
            Item::Eos => panic!("expected a value before Eos"),
        }
    }

    #[tokio::test]
    async fn download_file_with_stop_on_error_false_skips_existing_files_without_overwrite() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "already here").unwrap();

        let (in_tx, in_rx) = item_channel(2);
        let (out_tx, mut out_rx) = item_channel(2);
        in_tx.send(Item::Value(json!({"content": "hello", "filename": "greeting.txt"}))).await.unwrap();
        in_tx.send(Item::Value(json!({"content": "world", "filename": "other.txt"}))).await.unwrap();
        in_tx.send(Item::Eos).await.unwrap();
        drop(in_tx);

        let cancel = CancellationToken::new();
        let input = StageInput::for_test(in_rx, None, Map::new(), cancel.clone());
        let output = StageOutput::for_test(out_tx);
        let ctx = RunContext::new(Arc::new(conduit_core::registry::Registry::new()), std::collections::HashMap::new())
            .with_stop_on_error(false);
        let mut element = DownloadFileElement {
            output_dir: dir.path().to_path_buf(),
            create_dirs: true,
            overwrite: false,
            sequence: 0,
            ctx: ctx.clone(),
        };
        element.process(input, output, cancel).await.unwrap();

        let mut received = Vec::new();
        while let Some(item) = out_rx.recv().await {
            match item {
                Item::Value(v) => received.push(v),
                Item::Eos => break,
            }
        }
        assert_eq!(received.len(), 1);
        assert_eq!(ctx.drain_stderr().await.len(), 1);
    }

    #[test]
    fn path_operations_extract_parts() {
        assert_eq!(apply_path_operation("basename", "/tmp/foo/bar.csv").unwrap(), json!("bar.csv"));
        assert_eq!(apply_path_operation("extension", "/tmp/foo/bar.csv").unwrap(), json!("csv"));
        assert_eq!(apply_path_operation("stem", "/tmp/foo/bar.csv").unwrap(), json!("bar"));
    }

    #[test]
    fn path_factory_rejects_unknown_operation_at_construction() {
        let factory = PathFactory::new();
        let ctx = RunContext::new(Arc::new(conduit_core::registry::Registry::new()), std::collections::HashMap::new());
        let ctor_args = serde_json::from_value(json!({"operation": "frobnicate"})).unwrap();
        let err = factory.create(&ctor_args, &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ElementInitError);
    }
}
