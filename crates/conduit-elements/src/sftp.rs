//! SFTP elements: `SftpList`, `SftpDownload` (spec §4.9).
//!
//! `ssh2` is a blocking, synchronous API; every call here runs inside
//! `tokio::task::spawn_blocking`, the same boundary `rde-io`'s
//! `sink_iceberg.rs` uses to keep its own blocking Arrow writer off the
//! async executor.
//!
//! `SftpDownload`'s `download_mode` (`memory`/`temp`/`local`) picks how the
//! fetched bytes are materialized: `memory` skips the filesystem entirely
//! and returns base64 content, `temp` writes under the OS temp dir, `local`
//! writes under the configured `output_dir` (the default, matching the
//! spec's implicit prior behavior).

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use ssh2::Session;
use tokio_util::sync::CancellationToken;

use conduit_core::error::{ConduitError, ErrorKind};
use conduit_core::registry::{Element, ElementFactory};
use conduit_core::schema::{CtorParamSpec, ElementDescriptor, FieldType};
use conduit_core::{RunContext, StageInput, StageOutput};

type Result<T> = conduit_core::error::Result<T>;

fn str_param(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[derive(Clone)]
struct SftpConfig {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
}

impl SftpConfig {
    fn from_ctor_args(args: &Map<String, Value>) -> Result<Self> {
        let host = str_param(args, "host")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "SFTP element requires `host`"))?;
        let port = args.get("port").and_then(Value::as_u64).unwrap_or(22) as u16;
        let username = str_param(args, "username")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "SFTP element requires `username`"))?;
        Ok(SftpConfig {
            host,
            port,
            username,
            password: str_param(args, "password"),
            private_key: str_param(args, "private_key"),
        })
    }

    fn connect(&self) -> std::result::Result<Session, String> {
        let tcp = std::net::TcpStream::connect((self.host.as_str(), self.port)).map_err(|e| e.to_string())?;
        let mut session = Session::new().map_err(|e| e.to_string())?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| e.to_string())?;
        if let Some(key_path) = &self.private_key {
            session
                .userauth_pubkey_file(&self.username, None, std::path::Path::new(key_path), None)
                .map_err(|e| e.to_string())?;
        } else {
            let password = self.password.as_deref().unwrap_or_default();
            session.userauth_password(&self.username, password).map_err(|e| e.to_string())?;
        }
        if !session.authenticated() {
            return Err("SFTP authentication failed".to_string());
        }
        Ok(session)
    }
}

// ------------------------------------------------------------- SftpList ---

pub struct SftpListElement {
    config: SftpConfig,
    remote_dir: String,
    ctx: RunContext,
}

#[async_trait]
impl Element for SftpListElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        let _ = input.recv().await;
        let config = self.config.clone();
        let remote_dir = self.remote_dir.clone();
        let entries = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<(String, u64)>, String> {
            let session = config.connect()?;
            let sftp = session.sftp().map_err(|e| e.to_string())?;
            let listing = sftp.readdir(std::path::Path::new(&remote_dir)).map_err(|e| e.to_string())?;
            Ok(listing
                .into_iter()
                .map(|(path, stat)| (path.display().to_string(), stat.size.unwrap_or(0)))
                .collect())
        })
        .await
        .map_err(|e| ConduitError::new(ErrorKind::InternalError, format!("SftpList task panicked: {e}")))?
        .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("SftpList failed: {e}")));

        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                self.ctx.recover_or_abort(e).await?;
                output.record_error();
                return output.finish().await;
            }
        };

        for (path, size) in entries {
            if cancel.is_cancelled() {
                break;
            }
            output.send(json!({"path": path, "size": size})).await?;
        }
        output.finish().await
    }
}

pub struct SftpListFactory(ElementDescriptor);

impl SftpListFactory {
    pub fn new() -> Self {
        SftpListFactory(
            ElementDescriptor::new("conduit.SftpList").with_ctor_params(vec![
                CtorParamSpec::required("host", FieldType::String),
                CtorParamSpec::optional("port", FieldType::Int, json!(22)),
                CtorParamSpec::required("username", FieldType::String),
                CtorParamSpec::optional("password", FieldType::String, Value::Null),
                CtorParamSpec::optional("private_key", FieldType::String, Value::Null),
                CtorParamSpec::required("remote_dir", FieldType::String),
            ]),
        )
    }
}

impl ElementFactory for SftpListFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let config = SftpConfig::from_ctor_args(ctor_args)?;
        let remote_dir = str_param(ctor_args, "remote_dir")
            .ok_or_else(|| ConduitError::new(ErrorKind::ElementInitError, "SftpList requires `remote_dir`"))?;
        Ok(Box::new(SftpListElement { config, remote_dir, ctx: ctx.child() }))
    }
}

pub fn sftp_list_factory() -> Arc<dyn ElementFactory> {
    Arc::new(SftpListFactory::new())
}

// --------------------------------------------------------- SftpDownload ---

/// Where a downloaded file's bytes end up (spec §4.9: "materializes the
/// file per `download_mode ∈ {memory, temp, local}`").
#[derive(Clone, Copy, PartialEq, Eq)]
enum DownloadMode {
    /// Bytes stay in memory; the output record carries them base64-encoded
    /// under `content` rather than a filesystem path.
    Memory,
    /// Written under the OS temp directory; the path is ephemeral but real.
    Temp,
    /// Written under the element's configured `output_dir`.
    Local,
}

impl DownloadMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "memory" => Ok(DownloadMode::Memory),
            "temp" => Ok(DownloadMode::Temp),
            "local" => Ok(DownloadMode::Local),
            other => Err(ConduitError::new(ErrorKind::ElementInitError, format!("unknown SftpDownload `download_mode`: {other}"))),
        }
    }
}

pub struct SftpDownloadElement {
    config: SftpConfig,
    output_dir: PathBuf,
    mode: DownloadMode,
    ctx: RunContext,
}

enum Materialized {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[async_trait]
impl Element for SftpDownloadElement {
    async fn process(&mut self, mut input: StageInput, output: StageOutput, cancel: CancellationToken) -> Result<()> {
        while let Some(item) = input.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let remote_path = match item
                .get("path")
                .and_then(Value::as_str)
                .or_else(|| item.as_str())
                .ok_or_else(|| ConduitError::new(ErrorKind::ItemError, "SftpDownload item has no `path`"))
            {
                Ok(path) => path.to_string(),
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };

            let config = self.config.clone();
            let output_dir = self.output_dir.clone();
            let mode = self.mode;
            let materialized = tokio::task::spawn_blocking(move || -> std::result::Result<Materialized, String> {
                let session = config.connect()?;
                let sftp = session.sftp().map_err(|e| e.to_string())?;
                let mut remote_file = sftp.open(std::path::Path::new(&remote_path)).map_err(|e| e.to_string())?;
                let mut buffer = Vec::new();
                remote_file.read_to_end(&mut buffer).map_err(|e| e.to_string())?;

                let filename = std::path::Path::new(&remote_path)
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "downloaded".to_string());

                match mode {
                    DownloadMode::Memory => Ok(Materialized::Bytes(buffer)),
                    DownloadMode::Temp => {
                        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
                        let local_path = dir.path().join(&filename);
                        std::fs::write(&local_path, &buffer).map_err(|e| e.to_string())?;
                        // Leak the tempdir so the file outlives this call;
                        // callers of `temp` mode own cleanup themselves.
                        std::mem::forget(dir);
                        Ok(Materialized::Path(local_path))
                    }
                    DownloadMode::Local => {
                        std::fs::create_dir_all(&output_dir).map_err(|e| e.to_string())?;
                        let local_path = output_dir.join(&filename);
                        std::fs::write(&local_path, &buffer).map_err(|e| e.to_string())?;
                        Ok(Materialized::Path(local_path))
                    }
                }
            })
            .await
            .map_err(|e| ConduitError::new(ErrorKind::InternalError, format!("SftpDownload task panicked: {e}")))?
            .map_err(|e| ConduitError::new(ErrorKind::ResourceError, format!("SftpDownload failed: {e}")));

            let materialized = match materialized {
                Ok(materialized) => materialized,
                Err(e) => {
                    self.ctx.recover_or_abort(e).await?;
                    output.record_error();
                    continue;
                }
            };

            let record = match materialized {
                Materialized::Path(path) => json!({"path": path.display().to_string()}),
                Materialized::Bytes(bytes) => {
                    json!({"content": base64::engine::general_purpose::STANDARD.encode(bytes)})
                }
            };
            output.send(record).await?;
        }
        output.finish().await
    }
}

pub struct SftpDownloadFactory(ElementDescriptor);

impl SftpDownloadFactory {
    pub fn new() -> Self {
        SftpDownloadFactory(
            ElementDescriptor::new("conduit.SftpDownload")
                .with_ctor_params(vec![
                    CtorParamSpec::required("host", FieldType::String),
                    CtorParamSpec::optional("port", FieldType::Int, json!(22)),
                    CtorParamSpec::required("username", FieldType::String),
                    CtorParamSpec::optional("password", FieldType::String, Value::Null),
                    CtorParamSpec::optional("private_key", FieldType::String, Value::Null),
                    CtorParamSpec::optional("output_dir", FieldType::String, json!(".")),
                    CtorParamSpec::optional("download_mode", FieldType::String, json!("local")),
                ])
                .with_input_schema(vec![conduit_core::schema::FieldSpec::optional("path", FieldType::String)]),
        )
    }
}

impl ElementFactory for SftpDownloadFactory {
    fn descriptor(&self) -> &ElementDescriptor {
        &self.0
    }

    fn create(&self, ctor_args: &Map<String, Value>, ctx: &RunContext) -> Result<Box<dyn Element>> {
        let config = SftpConfig::from_ctor_args(ctor_args)?;
        let output_dir = str_param(ctor_args, "output_dir").unwrap_or_else(|| ".".to_string());
        let mode = match str_param(ctor_args, "download_mode") {
            Some(raw) => DownloadMode::parse(&raw)?,
            None => DownloadMode::Local,
        };
        Ok(Box::new(SftpDownloadElement { config, output_dir: PathBuf::from(output_dir), mode, ctx: ctx.child() }))
    }
}

pub fn sftp_download_factory() -> Arc<dyn ElementFactory> {
    Arc::new(SftpDownloadFactory::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_host_and_username() {
        let args: Map<String, Value> = serde_json::from_value(json!({"username": "alice"})).unwrap();
        let err = SftpConfig::from_ctor_args(&args).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ElementInitError);
    }

    #[test]
    fn config_defaults_port_to_22() {
        let args: Map<String, Value> =
            serde_json::from_value(json!({"host": "example.com", "username": "alice", "password": "secret"})).unwrap();
        let config = SftpConfig::from_ctor_args(&args).unwrap();
        assert_eq!(config.port, 22);
    }

    #[test]
    fn download_mode_parses_the_three_declared_variants() {
        assert!(matches!(DownloadMode::parse("memory").unwrap(), DownloadMode::Memory));
        assert!(matches!(DownloadMode::parse("temp").unwrap(), DownloadMode::Temp));
        assert!(matches!(DownloadMode::parse("local").unwrap(), DownloadMode::Local));
        assert!(DownloadMode::parse("bogus").is_err());
    }
}
