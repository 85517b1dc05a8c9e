//! Source elements: `Input`, `RestApi`, `Random`, `Glob` (spec §4.9).
//!
//! Sources ignore or only loosely depend on the upstream item: `Input`,
//! `Glob`, and count-seeded `Random` drain the executor's implicit
//! bootstrap item and then produce their own sequence; `RestApi` and
//! item-driven `Random` instead run once per upstream item, grounded on
//! `rde-io`'s `source_csv.rs`/`source_kafka.rs` "one `process` loop pulling
//! `cancel` between units of work" shape.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conduit_core::error::{ConduitError, ErrorKind};
use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldType};
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

fn str_param(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

// ---------------------------------------------------------------- Input ---

pub struct InputElement {
    data: Vec<Value>,
}

#[async_trait]
impl Element for InputElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        // Drain the implicit bootstrap item; `Input` is a pure source.
        let _ = input.recv().await;
        for value in self.data.drain(..) {
            if cancel.is_cancelled() {
                break;
            }
            output.send(value).await?;
        }
        output.finish().await
    }
}

pub struct InputFactory(ElementDescriptor);

impl InputFactory {
    pub fn new() -> Self {
        InputFactory(
            ElementDescriptor::new("conduit.Input")
                .with_ctor_params(vec![CtorParamSpec::optional("data", FieldType::List, json!([]))]),
        )
    }
}

impl ElementFactory for InputFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let data = match ctor_args.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        Ok(Box::new(InputElement { data }))
    }
}

pub fn input_factory() -> Arc<dyn ElementFactory> {
    Arc::new(InputFactory::new())
}

// -------------------------------------------------------------- RestApi ---

pub struct RestApiElement {
    client: reqwest::Client,
    url: conduit_core::template::Template,
    method: reqwest::Method,
    headers: Map<String, Value>,
    response_format: String,
    ctx: RunContext,
}

impl RestApiElement {
    async fn fetch_one(&self, item: &Value) -> Result<Value> {
        let url = self.url.render(item);
        let mut request = self.client.request(self.method.clone(), &url);
        for (key, value) in &self.headers {
            if let Some(v) = value.as_str() {
                request = request.header(key.as_str(), v);
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("RestApi request to {url} failed: {e}")))?;
        if self.response_format == "text" {
            let text = response
                .text()
                .await
                .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("reading response body: {e}")))?;
            Ok(Value::String(text))
        } else {
            response
                .json::<Value>()
                .await
                .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("parsing JSON response: {e}")))
        }
    }
}

#[async_trait]
impl Element for RestApiElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match self.fetch_one(&item).await {
                Ok(body) => output.send(body).await?,
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

pub struct RestApiFactory(ElementDescriptor);

impl RestApiFactory {
    pub fn new() -> Self {
        RestApiFactory(
            ElementDescriptor::new("conduit.RestApi").with_ctor_params(vec![
                CtorParamSpec::required("url", FieldType::String),
                CtorParamSpec::optional("method", FieldType::String, json!("GET")),
                CtorParamSpec::optional("headers", FieldType::Map, json!({})),
                CtorParamSpec::optional("response_format", FieldType::String, json!("json")),
                CtorParamSpec::optional("timeout", FieldType::Int, json!(30)),
            ]),
        )
    }
}

impl ElementFactory for RestApiFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let url_template = str_param(ctor_args, "url")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "RestApi requires `url`"))?;
        let url = conduit_core::template::Template::compile(&url_template)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("RestApi `url`: {}", e.message)))?;
        let method_str = str_param(ctor_args, "method").unwrap_or_else(|| "GET".to_string());
        let method = method_str
            .parse::<reqwest::Method>()
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("invalid HTTP method `{method_str}`: {e}")))?;
        let headers = match ctor_args.get("headers") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let response_format = str_param(ctor_args, "response_format").unwrap_or_else(|| "json".to_string());
        let timeout_secs = ctor_args.get("timeout").and_then(Value::as_u64).unwrap_or(30);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("building HTTP client: {e}")))?;
        Ok(Box::new(RestApiElement {
            client,
            url,
            method,
            headers,
            response_format,
            ctx: ctx.child(),
        }))
    }
}

pub fn rest_api_factory() -> Arc<dyn ElementFactory> {
    Arc::new(RestApiFactory::new())
}

// --------------------------------------------------------------- Random ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum RandomType {
    Int,
    Float,
}

pub struct RandomElement {
    rng: StdRng,
    min: f64,
    max: f64,
    kind: RandomType,
    /// `Some(n)` fires `n` values up front and ignores upstream entirely;
    /// `None` produces one value per upstream item (spec §4.9).
    count: Option<u64>,
}

impl RandomElement {
    fn next_value(&mut self) -> Value {
        let sample = self.rng.gen_range(self.min..=self.max);
        match self.kind {
            RandomType::Int => json!(sample.round() as i64),
            RandomType::Float => json!(sample),
        }
    }
}

#[async_trait]
impl Element for RandomElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        if let Some(count) = self.count {
            let _ = input.recv().await;
            for _ in 0..count {
                if cancel.is_cancelled() {
                    break;
                }
                let value = self.next_value();
                output.send(value).await?;
            }
        } else {
            while let Some(_item) = input.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                let value = self.next_value();
                output.send(value).await?;
            }
        }
        output.finish().await
    }
}

pub struct RandomFactory(ElementDescriptor);

impl RandomFactory {
    pub fn new() -> Self {
        RandomFactory(
            ElementDescriptor::new("conduit.Random").with_ctor_params(vec![
                CtorParamSpec::optional("seed", FieldType::Int, Value::Null),
                CtorParamSpec::optional("min", FieldType::Float, json!(0.0)),
                CtorParamSpec::optional("max", FieldType::Float, json!(1.0)),
                CtorParamSpec::optional("type", FieldType::String, json!("float")),
                CtorParamSpec::optional("count", FieldType::Int, Value::Null),
            ]),
        )
    }
}

impl ElementFactory for RandomFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let seed = ctor_args.get("seed").and_then(Value::as_u64).unwrap_or_else(rand::random);
        let min = ctor_args.get("min").and_then(Value::as_f64).unwrap_or(0.0);
        let max = ctor_args.get("max").and_then(Value::as_f64).unwrap_or(1.0);
        let kind = match str_param(ctor_args, "type").as_deref() {
            Some("int") => RandomType::Int,
            _ => RandomType::Float,
        };
        let count = ctor_args.get("count").and_then(Value::as_u64);
        Ok(Box::new(RandomElement {
            rng: StdRng::seed_from_u64(seed),
            min,
            max,
            kind,
            count,
        }))
    }
}

pub fn random_factory() -> Arc<dyn ElementFactory> {
    Arc::new(RandomFactory::new())
}

// ----------------------------------------------------------------- Glob ---

pub struct GlobElement {
    pattern: String,
}

#[async_trait]
impl Element for GlobElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        let _ = input.recv().await;
        let matches = glob::glob(&self.pattern)
            .map_err(|e| ConduitError::new(ErrorKind::ElementInitError, format!("invalid glob pattern `{}`: {e}", self.pattern)))?;
        for entry in matches {
            if cancel.is_cancelled() {
                break;
            }
            match entry {
                Ok(path) => output.send(json!(path.display().to_string())).await?,
                Err(e) => warn!(error = %e, "glob entry error"),
            }
        }
        output.finish().await
    }
}

pub struct GlobFactory(ElementDescriptor);

impl GlobFactory {
    pub fn new() -> Self {
        GlobFactory(
            ElementDescriptor::new("conduit.Glob").with_ctor_params(vec![
                CtorParamSpec::required("pattern", FieldType::String),
                CtorParamSpec::optional("root_dir", FieldType::String, json!(".")),
                CtorParamSpec::optional("recursive", FieldType::Bool, json!(false)),
            ]),
        )
    }
}

impl ElementFactory for GlobFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, _ctx: &RunContext) -> Result<Box<dyn Element>> {
        let pattern = str_param(ctor_args, "pattern")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "Glob requires `pattern`"))?;
        let root_dir = str_param(ctor_args, "root_dir").unwrap_or_else(|| ".".to_string());
        let recursive = ctor_args.get("recursive").and_then(Value::as_bool).unwrap_or(false);
        let joined = std::path::Path::new(&root_dir).join(&pattern);
        let full_pattern = if recursive && !pattern.contains("**") {
            std::path::Path::new(&root_dir).join("**").join(&pattern).display().to_string()
        } else {
            joined.display().to_string()
        };
        info!(pattern = %full_pattern, "Glob source built");
        Ok(Box::new(GlobElement { pattern: full_pattern }))
    }
}

pub fn glob_factory() -> Arc<dyn ElementFactory> {
    Arc::new(GlobFactory::new())
}
