//! Configuration loading and validation.
//!
//! Two YAML documents at fixed relative paths (`conf/inference.yml`,
//! `conf/server.yml`). Every rule violation is fatal: the loader returns a
//! [`ConfError`] naming the offending field and the bootstrap aborts before
//! any socket is opened. The raw document texts are retained for the
//! `/metadata/server` endpoint.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{INFERENCE_CONF_PATH, SERVER_CONF_PATH, URL_ROOT_PATH};

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("server.yml: interface.framework {0:?} not supported")]
    UnsupportedFramework(String),
    #[error("server.yml: invalid interface.host: {0}")]
    InvalidHost(String),
    #[error("server.yml: invalid interface.port {port:?} for framework {framework:?}")]
    InvalidPort { framework: String, port: String },
    #[error("server.yml: http port and rpc port must be different")]
    DuplicatePort,
    #[error("server.yml: {field} not found or invalid")]
    InvalidServerField { field: &'static str },
    #[error("server.yml: max_concurrency must not exceed max_connections")]
    ConcurrencyExceedsConnections,
    #[error("server.yml: customized_predict_http.path is empty")]
    EmptyCustomPath,
    #[error("server.yml: invalid customized path: {0}, cannot use internal path")]
    ReservedCustomPath(String),
    #[error("server.yml: invalid customized path: {0}")]
    MalformedCustomPath(String),
    #[error("server.yml: streaming control mode {0:?} not supported")]
    UnsupportedStreamingCtrlMode(String),
    #[error("server.yml: gpu.{field} invalid: {reason}")]
    InvalidGpuField { field: &'static str, reason: String },
    #[error("server.yml: log.log_dir must be a directory, got a regular file: {0}")]
    LogDirIsFile(String),
    #[error("server.yml: failed to create log.log_dir {path}: {source}")]
    LogDirCreate {
        path: String,
        source: std::io::Error,
    },
    #[error("server.yml: log.log_backup_count must not be less than 1")]
    InvalidLogBackupCount,
    #[error("inference.yml: model {field} not specified")]
    MissingModelField { field: &'static str },
    #[error("inference.yml: model {0} already exists")]
    DuplicateModel(String),
    #[error("inference.yml: inferer_name must be specified when inferer_type is customized")]
    MissingInfererName,
    #[error("inference.yml: converter_name must be specified when converter_type is customized")]
    MissingConverterName,
    #[error("inference.yml: model {model}: inferer_path {path:?} does not exist")]
    MissingInfererPath { model: String, path: String },
    #[error("inference.yml: model {model}: invalid device {device:?}")]
    InvalidDevice { model: String, device: String },
    #[error("inference.yml: model {model}: device `original` requires inp_device")]
    MissingInpDevice { model: String },
    #[error("inference.yml: model {model}: batching.{field} must be a positive integer")]
    InvalidBatching { model: String, field: &'static str },
    #[error("inference.yml: model {model}: inferer_args.streams must be positive")]
    InvalidStreams { model: String },
    #[error("inference.yml: dag.type {0:?} not supported")]
    UnsupportedDagType(String),
    #[error("inference.yml: node {node}: type {kind:?} not supported in sequential dag")]
    UnsupportedNodeType { node: String, kind: String },
    #[error("inference.yml: model {model} not found but bound with {node} node")]
    DanglingNodeModel { node: String, model: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfererType {
    Torch,
    Tensorflow,
    Tensorrt,
    #[default]
    Customized,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterType {
    Torch,
    Tensorflow,
    Tensorrt,
    Customized,
    #[default]
    None,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchingType {
    #[default]
    None,
    Dynamic,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConf {
    #[serde(rename = "type")]
    pub kind: BatchingType,
    pub max_batch_size: i64,
    pub batch_timeout_us: i64,
}

/// Target device of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// `cuda` / `gpu` with an optional ordinal (`cuda:N`).
    Cuda(Option<usize>),
    /// Keep device bindings baked into the module; move inputs to `inp`.
    Original { inp: Option<Box<Device>> },
}

impl Device {
    /// Parse `cpu | cuda | gpu | cuda:N | gpu:N | original`.
    pub fn parse(text: &str) -> Option<Device> {
        let text = text.to_lowercase();
        match text.as_str() {
            "cpu" => return Some(Device::Cpu),
            "cuda" | "gpu" => return Some(Device::Cuda(None)),
            "original" => return Some(Device::Original { inp: None }),
            _ => {}
        }
        let (kind, ordinal) = text.split_once(':')?;
        if !matches!(kind, "cuda" | "gpu") {
            return None;
        }
        ordinal.parse::<usize>().ok().map(|n| Device::Cuda(Some(n)))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConf {
    pub name: String,
    pub version: String,
    pub inferer_type: InfererType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferer_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inp_device: Option<String>,
    pub converter_type: ConverterType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingConf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inferer_args: Option<HashMap<String, serde_yaml::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter_args: Option<HashMap<String, serde_yaml::Value>>,
}

impl ModelConf {
    /// Unique model key, `name-version`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Reserved `inferer_args` key: extra op libraries to load.
    pub fn customized_op_paths(&self) -> Vec<String> {
        self.inferer_args
            .as_ref()
            .and_then(|args| args.get("customized_op_paths"))
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reserved `inferer_args` key: TensorRT execution stream count.
    pub fn streams(&self) -> Option<i64> {
        self.inferer_args
            .as_ref()
            .and_then(|args| args.get("streams"))
            .and_then(|v| v.as_i64())
    }

    pub fn parsed_device(&self) -> Option<Device> {
        self.device.as_deref().and_then(Device::parse)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConf {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DagConf {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub nodes: Vec<NodeConf>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConf {
    pub models: Vec<ModelConf>,
    pub dag: DagConf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingCtrlMode {
    #[default]
    QueryParam,
    HeaderParam,
    BodyParam,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingCtrlConf {
    pub ctrl_mode: Option<String>,
    pub ctrl_key: Option<String>,
    pub res_content_type: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizedPredictHttpConf {
    pub path: String,
    pub customized_body: bool,
    pub streaming_ctrl: Option<StreamingCtrlConf>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConf {
    pub framework: String,
    pub host: String,
    #[serde(deserialize_with = "de_port", default)]
    pub port: String,
    pub customized_predict_http: Option<CustomizedPredictHttpConf>,
}

/// `port` is either a bare number or a comma-separated list.
fn de_port<'de, D: serde::Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Num(i64),
        Text(String),
    }
    Ok(match Port::deserialize(de)? {
        Port::Num(n) => n.to_string(),
        Port::Text(s) => s,
    })
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConf {
    pub mem_manager_type: String,
    pub mem_limit_mib: i64,
    pub mem_gc_enable: bool,
    pub mem_gc_interval: i64,
    pub devices: Vec<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConf {
    pub log_dir: String,
    pub log_backup_count: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    pub interface: InterfaceConf,
    pub max_connections: i64,
    pub max_concurrency: i64,
    pub gpu: Option<GpuConf>,
    pub log: LogConf,
}

/// Which transports to start, with their resolved ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framework {
    Http { http_port: u16 },
    HttpGrpc { http_port: u16, rpc_port: u16 },
}

impl Framework {
    pub fn http_port(&self) -> u16 {
        match self {
            Framework::Http { http_port } | Framework::HttpGrpc { http_port, .. } => *http_port,
        }
    }

    pub fn rpc_port(&self) -> Option<u16> {
        match self {
            Framework::Http { .. } => None,
            Framework::HttpGrpc { rpc_port, .. } => Some(*rpc_port),
        }
    }
}

/// Streaming detection knobs resolved from `customized_predict_http`.
#[derive(Debug, Clone)]
pub struct StreamingCtrl {
    pub mode: StreamingCtrlMode,
    pub key: String,
    pub res_content_type: String,
}

impl Default for StreamingCtrl {
    fn default() -> Self {
        Self {
            mode: StreamingCtrlMode::QueryParam,
            key: "streaming".into(),
            res_content_type: "application/octet-stream".into(),
        }
    }
}

/// Validated view over both configuration documents.
#[derive(Debug, Clone)]
pub struct Conf {
    pub server: ServerConf,
    pub inference: InferenceConf,
    pub framework: Framework,
    pub streaming_ctrl: StreamingCtrl,
    pub server_text: String,
    pub inference_text: String,
}

/// Internal paths a customized predict route may not shadow.
pub fn reserved_paths() -> Vec<String> {
    let mut paths: Vec<String> = [
        "/health/online",
        "/health/offline",
        "/health/live",
        "/health/ready",
        "/infer/predict",
        "/metadata/server",
        "/metadata/model",
        "/monitor/series",
        "/monitor/metrics",
        "/js/jquery_min",
        "/js/flot_min",
        "/",
    ]
    .iter()
    .map(|p| format!("{URL_ROOT_PATH}{p}"))
    .collect();
    paths.push("/".into());
    paths
}

impl Conf {
    /// Load and validate `server.yml` + `inference.yml` under `dir`. Creates
    /// the log directory when absent.
    pub fn load(dir: impl AsRef<Path>) -> Result<Conf, ConfError> {
        let dir = dir.as_ref();
        let server_path = dir.join(
            Path::new(SERVER_CONF_PATH)
                .file_name()
                .unwrap_or_default(),
        );
        let inference_path = dir.join(
            Path::new(INFERENCE_CONF_PATH)
                .file_name()
                .unwrap_or_default(),
        );
        let server_text = read(&server_path)?;
        let inference_text = read(&inference_path)?;
        Conf::from_texts(&server_text, &inference_text)
    }

    /// Parse and validate from raw document texts.
    pub fn from_texts(server_text: &str, inference_text: &str) -> Result<Conf, ConfError> {
        let server: ServerConf =
            serde_yaml::from_str(server_text).map_err(|source| ConfError::Parse {
                path: SERVER_CONF_PATH.into(),
                source,
            })?;
        let inference: InferenceConf =
            serde_yaml::from_str(inference_text).map_err(|source| ConfError::Parse {
                path: INFERENCE_CONF_PATH.into(),
                source,
            })?;

        let framework = validate_interface(&server.interface)?;
        let streaming_ctrl = validate_streaming_ctrl(&server.interface)?;
        validate_limits(&server)?;
        validate_gpu(&server)?;
        validate_log(&server.log)?;
        validate_models(&inference)?;
        validate_dag(&inference)?;

        Ok(Conf {
            server,
            inference,
            framework,
            streaming_ctrl,
            server_text: server_text.to_owned(),
            inference_text: inference_text.to_owned(),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.server.max_connections as usize
    }

    pub fn max_concurrency(&self) -> usize {
        self.server.max_concurrency as usize
    }

    /// Model descriptor by bare model name (not `name-version`).
    pub fn model_by_name(&self, name: &str) -> Option<&ModelConf> {
        self.inference.models.iter().find(|m| m.name == name)
    }
}

fn read(path: &Path) -> Result<String, ConfError> {
    std::fs::read_to_string(path).map_err(|source| ConfError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn validate_interface(interface: &InterfaceConf) -> Result<Framework, ConfError> {
    let host_re = Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("static regex");
    if !host_re.is_match(&interface.host) {
        return Err(ConfError::InvalidHost(interface.host.clone()));
    }

    let port_text = interface.port.replace(' ', "");
    let ports: Vec<&str> = port_text.split(',').collect();
    let parse = |p: &str| -> Option<u16> { p.parse::<u16>().ok().filter(|&p| p != 0) };

    // `http+brpc` is configurable upstream but has never been implemented;
    // it is rejected here instead of accepted and ignored.
    match interface.framework.as_str() {
        "http" => {
            if ports.len() != 1 {
                return Err(ConfError::InvalidPort {
                    framework: interface.framework.clone(),
                    port: interface.port.clone(),
                });
            }
            let http_port = parse(ports[0]).ok_or_else(|| ConfError::InvalidPort {
                framework: interface.framework.clone(),
                port: interface.port.clone(),
            })?;
            Ok(Framework::Http { http_port })
        }
        "http+grpc" => {
            if ports.len() != 2 {
                return Err(ConfError::InvalidPort {
                    framework: interface.framework.clone(),
                    port: interface.port.clone(),
                });
            }
            let http_port = parse(ports[0]);
            let rpc_port = parse(ports[1]);
            let (http_port, rpc_port) = match (http_port, rpc_port) {
                (Some(h), Some(r)) => (h, r),
                _ => {
                    return Err(ConfError::InvalidPort {
                        framework: interface.framework.clone(),
                        port: interface.port.clone(),
                    })
                }
            };
            if http_port == rpc_port {
                return Err(ConfError::DuplicatePort);
            }
            Ok(Framework::HttpGrpc {
                http_port,
                rpc_port,
            })
        }
        other => Err(ConfError::UnsupportedFramework(other.to_owned())),
    }
}

fn validate_streaming_ctrl(interface: &InterfaceConf) -> Result<StreamingCtrl, ConfError> {
    let mut ctrl = StreamingCtrl::default();
    let Some(custom) = &interface.customized_predict_http else {
        return Ok(ctrl);
    };

    if custom.path.is_empty() {
        return Err(ConfError::EmptyCustomPath);
    }
    if reserved_paths().contains(&custom.path) {
        return Err(ConfError::ReservedCustomPath(custom.path.clone()));
    }
    let path_re = Regex::new(r"^/[A-Za-z0-9_\-/]+$").expect("static regex");
    if !path_re.is_match(&custom.path) {
        return Err(ConfError::MalformedCustomPath(custom.path.clone()));
    }

    if let Some(streaming) = &custom.streaming_ctrl {
        if let Some(mode) = streaming.ctrl_mode.as_deref() {
            ctrl.mode = match mode {
                "" | "query_param" => StreamingCtrlMode::QueryParam,
                "header_param" => StreamingCtrlMode::HeaderParam,
                "body_param" => StreamingCtrlMode::BodyParam,
                other => return Err(ConfError::UnsupportedStreamingCtrlMode(other.to_owned())),
            };
        }
        if let Some(key) = streaming.ctrl_key.as_deref() {
            if !key.is_empty() {
                ctrl.key = key.to_owned();
            }
        }
        if let Some(content_type) = streaming.res_content_type.as_deref() {
            if !content_type.is_empty() {
                ctrl.res_content_type = content_type.to_owned();
            }
        }
    }
    Ok(ctrl)
}

fn validate_limits(server: &ServerConf) -> Result<(), ConfError> {
    if server.max_connections <= 0 {
        return Err(ConfError::InvalidServerField {
            field: "max_connections",
        });
    }
    if server.max_concurrency <= 0 {
        return Err(ConfError::InvalidServerField {
            field: "max_concurrency",
        });
    }
    if server.max_concurrency > server.max_connections {
        return Err(ConfError::ConcurrencyExceedsConnections);
    }
    Ok(())
}

fn validate_gpu(server: &ServerConf) -> Result<(), ConfError> {
    let Some(gpu) = &server.gpu else {
        return Ok(());
    };
    let manager_enabled = match gpu.mem_manager_type.as_str() {
        "torch" | "tensorflow" => true,
        "none" => false,
        other => {
            return Err(ConfError::InvalidGpuField {
                field: "mem_manager_type",
                reason: format!("{other:?} not supported"),
            })
        }
    };
    if gpu.devices.is_empty() || gpu.devices.iter().any(|&d| d < 0) {
        return Err(ConfError::InvalidGpuField {
            field: "devices",
            reason: format!("{:?}, should be a non-negative int list", gpu.devices),
        });
    }
    if manager_enabled {
        if gpu.mem_limit_mib <= 0 && gpu.mem_limit_mib != -1 {
            return Err(ConfError::InvalidGpuField {
                field: "mem_limit_mib",
                reason: format!("{}, should be positive or -1 (no limit)", gpu.mem_limit_mib),
            });
        }
        if gpu.mem_gc_enable && gpu.mem_gc_interval < 1 {
            return Err(ConfError::InvalidGpuField {
                field: "mem_gc_interval",
                reason: format!("{}, should not be less than 1", gpu.mem_gc_interval),
            });
        }
    }
    Ok(())
}

fn validate_log(log: &LogConf) -> Result<(), ConfError> {
    if log.log_dir.is_empty() {
        return Err(ConfError::InvalidServerField { field: "log.log_dir" });
    }
    if log.log_backup_count < 1 {
        return Err(ConfError::InvalidLogBackupCount);
    }
    let path = Path::new(&log.log_dir);
    if path.is_file() {
        return Err(ConfError::LogDirIsFile(log.log_dir.clone()));
    }
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|source| ConfError::LogDirCreate {
            path: log.log_dir.clone(),
            source,
        })?;
    }
    Ok(())
}

fn validate_models(inference: &InferenceConf) -> Result<(), ConfError> {
    let mut keys = HashSet::new();
    for model in &inference.models {
        if model.name.is_empty() {
            return Err(ConfError::MissingModelField { field: "name" });
        }
        if model.version.is_empty() {
            return Err(ConfError::MissingModelField { field: "version" });
        }
        if !keys.insert(model.key()) {
            return Err(ConfError::DuplicateModel(model.key()));
        }

        if model.inferer_type == InfererType::Customized
            && model.inferer_name.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfError::MissingInfererName);
        }
        if model.converter_type == ConverterType::Customized
            && model.converter_name.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfError::MissingConverterName);
        }

        if model.inferer_type != InfererType::Customized {
            let path = model.inferer_path.as_deref().unwrap_or("");
            if path.is_empty() || !Path::new(path).exists() {
                return Err(ConfError::MissingInfererPath {
                    model: model.key(),
                    path: path.to_owned(),
                });
            }
            let device_text = model.device.as_deref().unwrap_or("");
            let device = Device::parse(device_text).ok_or_else(|| ConfError::InvalidDevice {
                model: model.key(),
                device: device_text.to_owned(),
            })?;
            if device == (Device::Original { inp: None })
                && model.inferer_type == InfererType::Torch
            {
                let inp = model.inp_device.as_deref().unwrap_or("");
                match Device::parse(inp) {
                    Some(Device::Original { .. }) | None => {
                        return Err(ConfError::MissingInpDevice { model: model.key() })
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(batching) = &model.batching {
            if batching.kind == BatchingType::Dynamic {
                if batching.max_batch_size <= 0 {
                    return Err(ConfError::InvalidBatching {
                        model: model.key(),
                        field: "max_batch_size",
                    });
                }
                if batching.batch_timeout_us <= 0 {
                    return Err(ConfError::InvalidBatching {
                        model: model.key(),
                        field: "batch_timeout_us",
                    });
                }
            }
        }

        if let Some(streams) = model.streams() {
            if streams <= 0 {
                return Err(ConfError::InvalidStreams { model: model.key() });
            }
        }
    }
    Ok(())
}

fn validate_dag(inference: &InferenceConf) -> Result<(), ConfError> {
    if inference.dag.kind != "sequential" {
        return Err(ConfError::UnsupportedDagType(inference.dag.kind.clone()));
    }
    let keys: HashSet<String> = inference.models.iter().map(ModelConf::key).collect();
    for node in &inference.dag.nodes {
        if node.kind != "model" {
            return Err(ConfError::UnsupportedNodeType {
                node: node.name.clone(),
                kind: node.kind.clone(),
            });
        }
        if !keys.contains(&node.model) {
            return Err(ConfError::DanglingNodeModel {
                node: node.name.clone(),
                model: node.model.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SERVER_YML: &str = r#"
interface:
  framework: http
  host: 0.0.0.0
  port: 7080
max_connections: 100
max_concurrency: 10
log:
  log_dir: ./logs
  log_backup_count: 7
"#;

    pub(crate) const INFERENCE_YML: &str = r#"
models:
  - name: your_model
    version: 1.0.0
    device: cpu
    inferer_type: customized
    inferer_name: your_inferer
    converter_type: none
dag:
  type: sequential
  name: your_dag
  nodes:
    - name: node-1
      type: model
      model: your_model-1.0.0
"#;

    #[test]
    fn minimal_documents_validate() {
        let conf = Conf::from_texts(SERVER_YML, INFERENCE_YML).unwrap();
        assert_eq!(conf.framework, Framework::Http { http_port: 7080 });
        assert_eq!(conf.max_connections(), 100);
        assert_eq!(conf.inference.models[0].key(), "your_model-1.0.0");
        assert_eq!(conf.streaming_ctrl.key, "streaming");
    }

    #[test]
    fn http_grpc_needs_two_distinct_ports() {
        let server = SERVER_YML.replace("framework: http", "framework: http+grpc");
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::InvalidPort { .. }), "{err}");

        let server = server.replace("port: 7080", "port: 7080,7080");
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::DuplicatePort), "{err}");

        let server = server.replace("port: 7080,7080", "port: 7080,7081");
        let conf = Conf::from_texts(&server, INFERENCE_YML).unwrap();
        assert_eq!(
            conf.framework,
            Framework::HttpGrpc {
                http_port: 7080,
                rpc_port: 7081
            }
        );
    }

    #[test]
    fn brpc_is_rejected() {
        let server = SERVER_YML.replace("framework: http", "framework: http+brpc");
        let server = server.replace("port: 7080", "port: 7080,7081");
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::UnsupportedFramework(_)), "{err}");
    }

    #[test]
    fn invalid_host_is_rejected() {
        let server = SERVER_YML.replace("host: 0.0.0.0", "host: localhost");
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::InvalidHost(_)), "{err}");
    }

    #[test]
    fn concurrency_cannot_exceed_connections() {
        let server = SERVER_YML.replace("max_concurrency: 10", "max_concurrency: 200");
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::ConcurrencyExceedsConnections));
    }

    #[test]
    fn reserved_custom_path_is_rejected() {
        let server = SERVER_YML.replace(
            "interface:",
            "interface:\n  customized_predict_http:\n    path: /grps/v1/infer/predict",
        );
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        match err {
            ConfError::ReservedCustomPath(path) => assert_eq!(path, "/grps/v1/infer/predict"),
            other => panic!("expected reserved path error, got {other}"),
        }
    }

    #[test]
    fn malformed_custom_path_is_rejected() {
        let server = SERVER_YML.replace(
            "interface:",
            "interface:\n  customized_predict_http:\n    path: /bad path!",
        );
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(err, ConfError::MalformedCustomPath(_)), "{err}");
    }

    #[test]
    fn duplicate_model_key_is_rejected() {
        let inference = r#"
models:
  - name: m
    version: "1"
    inferer_type: customized
    inferer_name: a
    converter_type: none
  - name: m
    version: "1"
    inferer_type: customized
    inferer_name: b
    converter_type: none
dag:
  type: sequential
  nodes:
    - name: node-1
      type: model
      model: m-1
"#;
        let err = Conf::from_texts(SERVER_YML, inference).unwrap_err();
        assert!(matches!(err, ConfError::DuplicateModel(_)), "{err}");
    }

    #[test]
    fn dangling_node_model_is_rejected() {
        let inference = INFERENCE_YML.replace("model: your_model-1.0.0", "model: missing-1.0.0");
        let err = Conf::from_texts(SERVER_YML, &inference).unwrap_err();
        assert!(matches!(err, ConfError::DanglingNodeModel { .. }), "{err}");
    }

    #[test]
    fn batching_bounds_are_checked() {
        let inference = INFERENCE_YML.replace(
            "    converter_type: none",
            "    converter_type: none\n    batching:\n      type: dynamic\n      max_batch_size: 0\n      batch_timeout_us: 1000",
        );
        let err = Conf::from_texts(SERVER_YML, &inference).unwrap_err();
        assert!(matches!(
            err,
            ConfError::InvalidBatching {
                field: "max_batch_size",
                ..
            }
        ));
    }

    #[test]
    fn customized_inferer_requires_name() {
        let inference = INFERENCE_YML.replace("    inferer_name: your_inferer\n", "");
        let err = Conf::from_texts(SERVER_YML, &inference).unwrap_err();
        assert!(matches!(err, ConfError::MissingInfererName));
    }

    #[test]
    fn gpu_block_is_validated() {
        let server = format!(
            "{SERVER_YML}gpu:\n  mem_manager_type: torch\n  mem_limit_mib: 0\n  mem_gc_enable: false\n  mem_gc_interval: 1\n  devices: [0]\n"
        );
        let err = Conf::from_texts(&server, INFERENCE_YML).unwrap_err();
        assert!(matches!(
            err,
            ConfError::InvalidGpuField {
                field: "mem_limit_mib",
                ..
            }
        ));

        let server = server.replace("mem_limit_mib: 0", "mem_limit_mib: -1");
        assert!(Conf::from_texts(&server, INFERENCE_YML).is_ok());
    }

    #[test]
    fn device_strings_parse() {
        assert_eq!(Device::parse("cpu"), Some(Device::Cpu));
        assert_eq!(Device::parse("CUDA"), Some(Device::Cuda(None)));
        assert_eq!(Device::parse("gpu:2"), Some(Device::Cuda(Some(2))));
        assert_eq!(Device::parse("original"), Some(Device::Original { inp: None }));
        assert_eq!(Device::parse("tpu"), None);
        assert_eq!(Device::parse("cuda:x"), None);
    }
}
