//! gRPC surface: unary and server-streaming predict plus health and
//! metadata, all carrying `GrpsMessage`.

pub mod convert;

pub mod pb {
    tonic::include_proto!("grps.protos");
}

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::time::Instant;
use tonic::{Request, Response, Status};

use grps_core::context::{GrpsContext, StreamFrame};
use grps_core::error::GrpsError;
use grps_core::message::{GrpsMessage, GrpsStatus};

use crate::state::AppState;
use pb::grps_service_server::{GrpsService, GrpsServiceServer};

/// Maximum encode/decode frame size: 1 GiB.
pub const GRPC_MAX_MESSAGE_LENGTH: usize = 1024 * 1024 * 1024;

/// Flips the context's disconnect flag when the client drops the response
/// stream before the terminator.
struct DisconnectGuard(Arc<GrpsContext>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.mark_disconnected();
    }
}

pub struct GrpsServiceImpl {
    state: Arc<AppState>,
}

impl GrpsServiceImpl {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// The fully configured tonic service with its frame caps.
    pub fn server(state: Arc<AppState>) -> GrpsServiceServer<GrpsServiceImpl> {
        GrpsServiceServer::new(GrpsServiceImpl::new(state))
            .max_decoding_message_size(GRPC_MAX_MESSAGE_LENGTH)
            .max_encoding_message_size(GRPC_MAX_MESSAGE_LENGTH)
    }
}

fn ok_message() -> pb::GrpsMessage {
    convert::message_to_pb(GrpsMessage::from_status(GrpsStatus::ok()))
}

fn failure_message(code: i32, msg: impl Into<String>) -> pb::GrpsMessage {
    convert::message_to_pb(GrpsMessage::from_status(GrpsStatus::failure(code, msg)))
}

fn remote_of<T>(request: &Request<T>) -> String {
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

#[tonic::async_trait]
impl GrpsService for GrpsServiceImpl {
    async fn predict(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        let state = self.state.clone();
        state.count_request();
        let begin = Instant::now();
        let remote = remote_of(&request);

        let Ok(_conn) = state.connections.clone().try_acquire_owned() else {
            return Err(Status::resource_exhausted("too many connections"));
        };

        let msg = convert::message_to_native(request.into_inner());
        let model = msg.model.clone();
        let ctx = Arc::new(GrpsContext::for_rpc());

        let response = match state.predict_pool.clone().acquire_owned().await {
            Ok(_permit) => {
                let result = state
                    .executor
                    .infer(msg, &ctx, (!model.is_empty()).then_some(model.as_str()))
                    .await;
                match result {
                    Ok(mut out) if !ctx.has_err() => {
                        state.record_success();
                        out.stamp_ok();
                        convert::message_to_pb(out)
                    }
                    result => {
                        let err = match result {
                            Err(err) => err,
                            Ok(_) => GrpsError::Internal(ctx.err_msg()),
                        };
                        state.record_failure(&err);
                        tracing::error!("Predict error: {err}");
                        failure_message(err.http_code() as i32, err.to_string())
                    }
                }
            }
            Err(_) => failure_message(500, "predict worker pool is closed"),
        };

        state.observe_latency(begin);
        tracing::info!(
            "[Predict] from client: {remote}, latency: {:.2} ms",
            begin.elapsed().as_secs_f64() * 1e3
        );
        Ok(Response::new(response))
    }

    type PredictStreamingStream =
        Pin<Box<dyn Stream<Item = Result<pb::GrpsMessage, Status>> + Send>>;

    async fn predict_streaming(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<Self::PredictStreamingStream>, Status> {
        let state = self.state.clone();
        state.count_request();
        let begin = Instant::now();
        let remote = remote_of(&request);

        let Ok(conn_permit) = state.connections.clone().try_acquire_owned() else {
            return Err(Status::resource_exhausted("too many connections"));
        };

        let msg = convert::message_to_native(request.into_inner());
        let model = msg.model.clone();
        let ctx = Arc::new(GrpsContext::for_rpc());
        ctx.start_rpc_streaming_generator();
        let frames = ctx.rpc_stream_receiver();

        let work = {
            let state = state.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _conn = conn_permit;
                let Ok(_permit) = state.predict_pool.clone().acquire_owned().await else {
                    ctx.set_err_msg("predict worker pool is closed");
                    ctx.stop_rpc_streaming_generator();
                    return;
                };
                let result = state
                    .executor
                    .infer(msg, &ctx, (!model.is_empty()).then_some(model.as_str()))
                    .await;
                if let Err(err) = result {
                    if !ctx.has_err() {
                        ctx.set_err_msg(err.to_string());
                    }
                }
            })
        };

        let stream = async_stream::stream! {
            let _guard = DisconnectGuard(ctx.clone());
            loop {
                match frames.recv_async().await {
                    Ok(Some(StreamFrame::Message(msg))) => {
                        yield Ok(convert::message_to_pb(msg));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = work.await;
            if ctx.has_err() {
                let err = GrpsError::Internal(ctx.err_msg());
                state.record_failure(&err);
                tracing::error!("Predict error: {err}");
                yield Ok(failure_message(500, err.to_string()));
            } else {
                state.record_success();
            }
            state.observe_latency(begin);
            tracing::info!(
                "[Predict] from client: {remote}, latency: {:.2} ms",
                begin.elapsed().as_secs_f64() * 1e3
            );
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn online(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        self.state.set_health(true);
        tracing::info!("[Online] from client: {}", remote_of(&request));
        Ok(Response::new(ok_message()))
    }

    async fn offline(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        self.state.set_health(false);
        tracing::info!("[Offline] from client: {}", remote_of(&request));
        Ok(Response::new(ok_message()))
    }

    async fn check_liveness(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        tracing::info!("[CheckLiveness] from client: {}", remote_of(&request));
        Ok(Response::new(ok_message()))
    }

    async fn check_readiness(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        tracing::info!("[CheckReadiness] from client: {}", remote_of(&request));
        let response = if self.state.healthy() {
            ok_message()
        } else {
            failure_message(403, "Service Unavailable")
        };
        Ok(Response::new(response))
    }

    async fn server_metadata(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        tracing::info!("[ServerMetadata] from client: {}", remote_of(&request));
        let mut msg = GrpsMessage::from_str_data(self.state.server_metadata());
        msg.stamp_ok();
        Ok(Response::new(convert::message_to_pb(msg)))
    }

    async fn model_metadata(
        &self,
        request: Request<pb::GrpsMessage>,
    ) -> Result<Response<pb::GrpsMessage>, Status> {
        tracing::info!("[ModelMetadata] from client: {}", remote_of(&request));
        let name = request.into_inner().str_data;
        if name.is_empty() {
            return Ok(Response::new(failure_message(400, "No model name.")));
        }
        let response = match self.state.model_metadata(&name) {
            Some(descriptor) => {
                let mut msg = GrpsMessage::from_str_data(descriptor);
                msg.stamp_ok();
                convert::message_to_pb(msg)
            }
            None => failure_message(404, "Model not found."),
        };
        Ok(Response::new(response))
    }
}
