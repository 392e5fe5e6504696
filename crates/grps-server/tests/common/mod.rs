//! Shared fixtures: an in-process serving state with test inferers plugged
//! into the registry, no sockets involved.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use grps_core::conf::{Conf, Device};
use grps_core::context::{GrpsContext, HttpResponse};
use grps_core::converter::InferPayload;
use grps_core::error::GrpsError;
use grps_core::executor::{Executor, Registry};
use grps_core::message::GrpsMessage;
use grps_core::model_infer::{InfererArgs, ModelInferer};
use grps_core::monitor::Monitor;
use grps_server::AppState;

/// Echoes the request message back unchanged.
pub struct PassthroughInferer;

#[async_trait]
impl ModelInferer for PassthroughInferer {
    fn init(
        &mut self,
        _path: &str,
        _device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        Ok(())
    }

    async fn infer(
        &self,
        inp: InferPayload,
        _ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        Ok(inp)
    }
}

/// Streams two frames, the second final, then returns.
pub struct StreamingInferer;

#[async_trait]
impl ModelInferer for StreamingInferer {
    fn init(
        &mut self,
        _path: &str,
        _device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        Ok(())
    }

    async fn infer(
        &self,
        _inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        ctx.stream_respond(GrpsMessage::from_str_data("stream data 1"), false)
            .await;
        ctx.stream_respond(GrpsMessage::from_str_data("stream data 2"), true)
            .await;
        Ok(InferPayload::Message(GrpsMessage::default()))
    }
}

/// Always fails with an OOM-looking error.
pub struct OomInferer;

#[async_trait]
impl ModelInferer for OomInferer {
    fn init(
        &mut self,
        _path: &str,
        _device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        Ok(())
    }

    async fn infer(
        &self,
        _inp: InferPayload,
        _ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        Err(GrpsError::Internal("CUDA out of memory".into()))
    }
}

/// Custom-body handler: answers with the raw request body, prefixed.
pub struct CustomBodyInferer;

#[async_trait]
impl ModelInferer for CustomBodyInferer {
    fn init(
        &mut self,
        _path: &str,
        _device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        Ok(())
    }

    async fn infer(
        &self,
        inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        let body = ctx
            .http_request()
            .map(|request| String::from_utf8_lossy(&request.body).into_owned())
            .unwrap_or_default();
        ctx.set_http_response(HttpResponse::text(format!("custom:{body}")));
        inp.into_message().map(InferPayload::Message)
    }
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_inferer("passthrough", || Box::new(PassthroughInferer));
    registry.register_inferer("streaming", || Box::new(StreamingInferer));
    registry.register_inferer("oom", || Box::new(OomInferer));
    registry.register_inferer("custom_body", || Box::new(CustomBodyInferer));
    registry
}

pub const INFERENCE_YML: &str = r#"models:
  - name: pass
    version: 1.0.0
    inferer_type: customized
    inferer_name: passthrough
    converter_type: none
  - name: stream
    version: 1.0.0
    inferer_type: customized
    inferer_name: streaming
    converter_type: none
  - name: oom
    version: 1.0.0
    inferer_type: customized
    inferer_name: oom
    converter_type: none
dag:
  type: sequential
  name: test_dag
  nodes:
    - name: node-1
      type: model
      model: pass-1.0.0
"#;

pub fn server_yml(log_dir: &std::path::Path, custom_http: Option<&str>) -> String {
    let custom = custom_http.unwrap_or("");
    format!(
        r#"interface:
  framework: http
  host: 0.0.0.0
  port: 7080
{custom}max_connections: 100
max_concurrency: 10
log:
  log_dir: {}
  log_backup_count: 7
"#,
        log_dir.display()
    )
}

/// Serving state over the standard test pipeline. Keep the returned TempDir
/// alive for the duration of the test.
pub fn test_state() -> (Arc<AppState>, TempDir) {
    state_with(INFERENCE_YML, None)
}

pub fn state_with(inference_yml: &str, custom_http: Option<&str>) -> (Arc<AppState>, TempDir) {
    let tmp = TempDir::new().expect("temp log dir");
    let conf = Arc::new(
        Conf::from_texts(&server_yml(tmp.path(), custom_http), inference_yml)
            .expect("test conf is valid"),
    );
    let executor = Arc::new(Executor::new(&conf, &registry()).expect("test models load"));
    let monitor = Monitor::start(None);
    (AppState::new(conf, executor, monitor), tmp)
}
