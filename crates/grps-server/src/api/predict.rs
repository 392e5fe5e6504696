//! The predict endpoints: standard wire-message predict and the custom-body
//! variant, both unary and streaming.

use std::sync::Arc;

use salvo::http::header::CONTENT_TYPE;
use salvo::http::HeaderValue;
use salvo::prelude::*;
use serde_json::Value;
use tokio::time::Instant;

use grps_core::conf::StreamingCtrlMode;
use grps_core::context::{GrpsContext, HttpRequestParts, HttpResponse, StreamFrame};
use grps_core::error::GrpsError;
use grps_core::message::{DataType, GrpsMessage, GrpsStatus};

use super::ndarray::{json_to_tensor, tensor_to_json};
use super::{render_message, render_status, state_of};
use crate::state::AppState;

enum Outcome {
    /// Unary success; status gets stamped before rendering.
    Message(GrpsMessage),
    /// Unary success shaped by `return-ndarray`.
    Ndarray(Value),
    /// Unary success with raw `bin_data`.
    Binary(Vec<u8>),
    Failure {
        code: u16,
        text: String,
    },
    /// Frames were (or will be) delivered through the streaming queue.
    Streaming,
}

fn truthy(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Streaming detection per the configured control mode.
fn streaming_requested(state: &AppState, req: &Request, body: &[u8]) -> bool {
    let ctrl = &state.conf.streaming_ctrl;
    match ctrl.mode {
        StreamingCtrlMode::QueryParam => truthy(req.query::<String>(&ctrl.key).as_deref()),
        StreamingCtrlMode::HeaderParam => truthy(
            req.headers()
                .get(ctrl.key.as_str())
                .and_then(|v| v.to_str().ok()),
        ),
        StreamingCtrlMode::BodyParam => serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get(&ctrl.key).and_then(Value::as_bool))
            .unwrap_or(false),
    }
}

/// Map one streamed frame onto wire bytes: raw `bin_data` when set, JSON
/// otherwise; custom-body text/bytes frames go out verbatim.
fn frame_bytes(frame: StreamFrame) -> Vec<u8> {
    match frame {
        StreamFrame::Message(msg) => {
            if msg.bin_data.is_empty() {
                serde_json::to_vec(&msg).unwrap_or_default()
            } else {
                msg.bin_data
            }
        }
        StreamFrame::Text(text) => text.into_bytes(),
        StreamFrame::Bytes(bytes) => bytes,
    }
}

fn stream_response(
    state: &AppState,
    res: &mut Response,
    rx: flume::Receiver<Option<StreamFrame>>,
) {
    use futures::StreamExt;
    let content_type = state.conf.streaming_ctrl.res_content_type.clone();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        res.headers_mut().insert(CONTENT_TYPE, value);
    }
    let stream = rx
        .into_stream()
        .take_while(|frame| futures::future::ready(frame.is_some()))
        .map(|frame| {
            Ok::<_, std::io::Error>(frame.map(frame_bytes).unwrap_or_default())
        });
    res.stream(stream);
}

/// Parse the request body per content type. Returns the wire message and the
/// in-body model override, if any.
fn parse_body(
    content_type: &str,
    body: &[u8],
) -> Result<(GrpsMessage, Option<String>), GrpsError> {
    if content_type.starts_with("application/json") {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| GrpsError::BadRequest(format!("invalid json body: {err}")))?;
        let model_override = value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let has = |key: &str| value.get(key).is_some_and(|v| !v.is_null());
        let msg = if has("str_data") || has("gtensors") || has("gmap") {
            serde_json::from_value::<GrpsMessage>(value.clone())
                .map_err(|err| GrpsError::BadRequest(format!("invalid json body: {err}")))?
        } else if has("ndarray") {
            let tensor = json_to_tensor(&value["ndarray"])?;
            GrpsMessage::from_tensors(vec![tensor])
        } else if has("bin_data") {
            return Err(GrpsError::BadRequest(
                "bin_data should use application/octet-stream format.".into(),
            ));
        } else {
            return Err(GrpsError::BadRequest("No legal field in json.".into()));
        };
        Ok((msg, model_override))
    } else if content_type.starts_with("application/octet-stream") {
        Ok((GrpsMessage::from_bin_data(body.to_vec()), None))
    } else {
        Err(GrpsError::BadRequest(format!(
            "Unsupported content type {content_type}."
        )))
    }
}

#[handler]
pub async fn predict(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);

    let Ok(conn_permit) = state.connections.clone().try_acquire_owned() else {
        state.record_failure(&GrpsError::Unavailable);
        render_status(res, 503, "Too many connections.");
        return;
    };

    let Some(content_type) = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        state.record_failure(&GrpsError::BadRequest(String::new()));
        render_status(res, 400, "No content type in headers.");
        return;
    };

    let body = match req.payload().await {
        Ok(body) => body.to_vec(),
        Err(err) => {
            state.record_failure(&GrpsError::BadRequest(String::new()));
            render_status(res, 400, format!("failed to read body: {err}"));
            return;
        }
    };

    let is_streaming = streaming_requested(&state, req, &body);
    let ret_ndarray = truthy(req.query::<String>("return-ndarray").as_deref());
    if is_streaming && ret_ndarray {
        state.record_failure(&GrpsError::BadRequest(String::new()));
        render_status(
            res,
            400,
            "Bad Request, err: Streaming and ret ndarray are not supported at the same time.",
        );
        return;
    }
    if body.is_empty() {
        state.record_failure(&GrpsError::BadRequest(String::new()));
        render_status(res, 400, "The http body is empty.");
        return;
    }

    state.count_request();
    let remote = req.remote_addr().to_string();
    let query_model = req.query::<String>("model");

    let (msg, model_override) = match parse_body(&content_type, &body) {
        Ok(parsed) => parsed,
        Err(err) => {
            state.record_failure(&err);
            render_status(res, err.http_code(), err.to_string());
            return;
        }
    };
    // A top-level `model` in the json body overrides the query parameter.
    let model = model_override.or(query_model);

    let ctx = Arc::new(GrpsContext::new());
    if is_streaming {
        ctx.start_http_streaming_generator();
    }

    let task = {
        let state = state.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _conn = conn_permit;
            predict_task(&state, &ctx, msg, model, is_streaming, ret_ndarray, &remote).await
        })
    };

    if is_streaming {
        stream_response(&state, res, ctx.http_stream_receiver());
        return;
    }

    match task.await {
        Ok(Outcome::Message(mut msg)) => {
            msg.stamp_ok();
            render_message(res, 200, &msg);
        }
        Ok(Outcome::Ndarray(value)) => {
            res.status_code(StatusCode::OK);
            res.render(Json(value));
        }
        Ok(Outcome::Binary(body)) => {
            res.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            res.status_code(StatusCode::OK);
            let _ = res.write_body(body);
        }
        Ok(Outcome::Failure { code, text }) => render_status(res, code, text),
        Ok(Outcome::Streaming) => {}
        Err(err) => {
            let err = GrpsError::internal(err);
            state.record_failure(&err);
            render_status(res, 500, err.to_string());
        }
    }
}

async fn predict_task(
    state: &Arc<AppState>,
    ctx: &Arc<GrpsContext>,
    msg: GrpsMessage,
    model: Option<String>,
    is_streaming: bool,
    ret_ndarray: bool,
    remote: &str,
) -> Outcome {
    let Ok(_permit) = state.predict_pool.clone().acquire_owned().await else {
        return Outcome::Failure {
            code: 500,
            text: "predict worker pool is closed".into(),
        };
    };

    let begin = Instant::now();
    let result = state.executor.infer(msg, ctx, model.as_deref()).await;
    state.observe_latency(begin);
    tracing::info!(
        "[Predict] from client: {remote}, latency: {:.2} ms",
        begin.elapsed().as_secs_f64() * 1e3
    );

    match result {
        Ok(out) if !ctx.has_err() => {
            if is_streaming {
                state.record_success();
                ctx.stop_http_streaming_generator();
                return Outcome::Streaming;
            }
            if !out.bin_data.is_empty() {
                state.record_success();
                return Outcome::Binary(out.bin_data);
            }
            if ret_ndarray {
                return shape_ndarray(state, out);
            }
            state.record_success();
            Outcome::Message(out)
        }
        result => {
            let err = match result {
                Err(err) => err,
                Ok(_) => GrpsError::Internal(ctx.err_msg()),
            };
            state.record_failure(&err);
            tracing::error!("Predict error: {err}");
            if is_streaming {
                ctx.stream_respond(
                    GrpsMessage::from_status(GrpsStatus::failure(
                        err.http_code() as i32,
                        err.to_string(),
                    )),
                    false,
                )
                .await;
                ctx.stop_http_streaming_generator();
                return Outcome::Streaming;
            }
            Outcome::Failure {
                code: err.http_code(),
                text: err.to_string(),
            }
        }
    }
}

/// `return-ndarray` response shaping: the first output tensor must be
/// float32; it replaces `gtensors` as a nested array.
fn shape_ndarray(state: &Arc<AppState>, mut out: GrpsMessage) -> Outcome {
    let Some(first) = out.tensors().first().cloned() else {
        let err = GrpsError::Internal(
            "No float32 tensors in output. Cannot convert to ndarray.".into(),
        );
        state.record_failure(&err);
        return Outcome::Failure {
            code: 500,
            text: err.to_string(),
        };
    };
    if first.dtype != DataType::Float32 {
        let err = GrpsError::Internal(
            "No float32 tensors in output. Cannot convert to ndarray.".into(),
        );
        state.record_failure(&err);
        return Outcome::Failure {
            code: 500,
            text: err.to_string(),
        };
    }

    out.stamp_ok();
    let mut value = match serde_json::to_value(&out) {
        Ok(value) => value,
        Err(err) => {
            let err = GrpsError::internal(err);
            state.record_failure(&err);
            return Outcome::Failure {
                code: 500,
                text: err.to_string(),
            };
        }
    };
    if let Some(object) = value.as_object_mut() {
        object.remove("gtensors");
        object.insert("ndarray".into(), tensor_to_json(&first));
    }
    state.record_success();
    Outcome::Ndarray(value)
}

enum CustomOutcome {
    Response(Option<HttpResponse>),
    Failure(String),
    Streaming,
}

/// Custom-body predict: the executor gets an empty wire message and user
/// code answers through the context.
#[handler]
pub async fn predict_custom_http(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);

    let Ok(conn_permit) = state.connections.clone().try_acquire_owned() else {
        state.record_failure(&GrpsError::Unavailable);
        render_status(res, 503, "Too many connections.");
        return;
    };

    let body = match req.payload().await {
        Ok(body) => body.to_vec(),
        Err(err) => {
            state.record_failure(&GrpsError::BadRequest(String::new()));
            render_status(res, 400, format!("failed to read body: {err}"));
            return;
        }
    };
    let is_streaming = streaming_requested(&state, req, &body);
    let model = req.query::<String>("model");
    let remote = req.remote_addr().to_string();

    let parts = HttpRequestParts {
        method: req.method().to_string(),
        path: req.uri().path().to_owned(),
        query: req
            .queries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        headers: req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_owned()))
            })
            .collect(),
        body,
        remote_addr: remote.clone(),
    };

    let ctx = Arc::new(GrpsContext::for_custom_http(parts));
    if is_streaming {
        ctx.start_http_streaming_generator();
    }
    state.count_request();

    let task = {
        let state = state.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _conn = conn_permit;
            custom_predict_task(&state, &ctx, model, is_streaming, &remote).await
        })
    };

    if is_streaming {
        stream_response(&state, res, ctx.http_stream_receiver());
        return;
    }

    match task.await {
        Ok(CustomOutcome::Response(Some(response))) => {
            res.status_code(
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
            );
            for (name, value) in &response.headers {
                if let (Ok(name), Ok(value)) = (
                    salvo::http::HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    res.headers_mut().insert(name, value);
                }
            }
            let _ = res.write_body(response.body);
        }
        Ok(CustomOutcome::Response(None)) => {
            res.status_code(StatusCode::OK);
            res.render(Text::Plain(""));
        }
        Ok(CustomOutcome::Failure(text)) => {
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Text::Plain(text));
        }
        Ok(CustomOutcome::Streaming) => {}
        Err(err) => {
            let err = GrpsError::internal(err);
            state.record_failure(&err);
            render_status(res, 500, err.to_string());
        }
    }
}

async fn custom_predict_task(
    state: &Arc<AppState>,
    ctx: &Arc<GrpsContext>,
    model: Option<String>,
    is_streaming: bool,
    remote: &str,
) -> CustomOutcome {
    let Ok(_permit) = state.predict_pool.clone().acquire_owned().await else {
        return CustomOutcome::Failure("predict worker pool is closed".into());
    };

    let begin = Instant::now();
    let result = state
        .executor
        .infer(GrpsMessage::default(), ctx, model.as_deref())
        .await;
    state.observe_latency(begin);
    tracing::info!(
        "[Predict] from client: {remote}, latency: {:.2} ms",
        begin.elapsed().as_secs_f64() * 1e3
    );

    match result {
        Ok(_) if !ctx.has_err() => {
            state.record_success();
            if is_streaming {
                ctx.stop_http_streaming_generator();
                return CustomOutcome::Streaming;
            }
            CustomOutcome::Response(ctx.take_http_response())
        }
        result => {
            let err = match result {
                Err(err) => err,
                Ok(_) => GrpsError::Internal(ctx.err_msg()),
            };
            state.record_failure(&err);
            tracing::error!("Predict error: {err}");
            if is_streaming {
                ctx.customized_http_stream_respond(StreamFrame::Text(err.to_string()), true)
                    .await;
                return CustomOutcome::Streaming;
            }
            CustomOutcome::Failure(err.to_string())
        }
    }
}
