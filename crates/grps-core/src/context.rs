//! Per-request state threaded through preprocess, inference and postprocess.
//!
//! A context is created by the inbound handler, carries user data and the
//! error slot across pipeline nodes, and owns the two streaming output
//! queues (HTTP and RPC). Streaming queues are bounded so a runaway producer
//! blocks inside the worker pool instead of growing memory; a pushed `None`
//! is the terminator.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::converter::{Converter, InferPayload};
use crate::error::GrpsError;
use crate::message::{GrpsMessage, GrpsStatus, StatusFlag};
use crate::model_infer::ModelInferer;

/// Depth of each streaming output queue.
const STREAM_QUEUE_DEPTH: usize = 64;

/// One streamed chunk. `Message` frames are serialized by the transport;
/// `Text`/`Bytes` frames come from custom-body predict handlers and go out
/// verbatim.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Message(GrpsMessage),
    Text(String),
    Bytes(Vec<u8>),
}

/// A complete response written by user code on a custom-body route.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into().into_bytes(),
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            body,
            status: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
        }
    }
}

/// Inbound HTTP request parts exposed to custom-body handlers.
#[derive(Debug, Default, Clone)]
pub struct HttpRequestParts {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
}

struct StreamQueue {
    tx: flume::Sender<Option<StreamFrame>>,
    rx: flume::Receiver<Option<StreamFrame>>,
    running: AtomicBool,
}

impl StreamQueue {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(STREAM_QUEUE_DEPTH);
        Self {
            tx,
            rx,
            running: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct ErrState {
    has_err: bool,
    err_msg: String,
}

type CompletionSender = flume::Sender<Option<GrpsMessage>>;

/// The grps request context.
pub struct GrpsContext {
    user_data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    err: Mutex<ErrState>,
    http_response: Mutex<Option<HttpResponse>>,
    http_stream: StreamQueue,
    rpc_stream: StreamQueue,
    batcher_done: Mutex<Option<CompletionSender>>,
    disconnected: AtomicBool,
    http_request: Option<HttpRequestParts>,
    is_rpc: bool,
    converter: Mutex<Option<Arc<dyn Converter>>>,
    inferer: Mutex<Option<Arc<dyn ModelInferer>>>,
}

impl Default for GrpsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpsContext {
    pub fn new() -> Self {
        Self {
            user_data: Mutex::new(HashMap::new()),
            err: Mutex::new(ErrState::default()),
            http_response: Mutex::new(None),
            http_stream: StreamQueue::new(),
            rpc_stream: StreamQueue::new(),
            batcher_done: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            http_request: None,
            is_rpc: false,
            converter: Mutex::new(None),
            inferer: Mutex::new(None),
        }
    }

    /// Context for an RPC call; `if_disconnected` follows the peer state.
    pub fn for_rpc() -> Self {
        Self {
            is_rpc: true,
            ..Self::new()
        }
    }

    /// Context for a custom-body HTTP request, exposing the raw parts.
    pub fn for_custom_http(request: HttpRequestParts) -> Self {
        Self {
            http_request: Some(request),
            ..Self::new()
        }
    }

    // ---------------------------- User data ----------------------------

    pub fn put_user_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.user_data
            .lock()
            .expect("user_data lock poisoned")
            .insert(key.into(), Arc::new(value));
    }

    pub fn get_user_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let data = self.user_data.lock().expect("user_data lock poisoned");
        let value = data.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    // ---------------------------- Error slot ----------------------------

    pub fn has_err(&self) -> bool {
        self.err.lock().expect("err lock poisoned").has_err
    }

    pub fn err_msg(&self) -> String {
        self.err.lock().expect("err lock poisoned").err_msg.clone()
    }

    /// Record an error message; implies `has_err`.
    pub fn set_err_msg(&self, msg: impl Into<String>) {
        let mut err = self.err.lock().expect("err lock poisoned");
        err.has_err = true;
        err.err_msg = msg.into();
    }

    // ---------------------------- Streaming ----------------------------

    pub fn if_streaming(&self) -> bool {
        self.rpc_stream.running.load(Ordering::Acquire)
            || self.http_stream.running.load(Ordering::Acquire)
    }

    /// Push one streaming frame. Frames without a failure status are stamped
    /// `{200, OK, SUCCESS}`. On `final_frame` the active stream is
    /// terminated and a waiting batcher is notified.
    pub async fn stream_respond(&self, mut msg: GrpsMessage, final_frame: bool) {
        match &msg.status {
            Some(status) if status.status == StatusFlag::Failure => {}
            _ => msg.status = Some(GrpsStatus::ok()),
        }

        if self.rpc_stream.running.load(Ordering::Acquire) {
            let _ = self
                .rpc_stream
                .tx
                .send_async(Some(StreamFrame::Message(msg)))
                .await;
            if final_frame {
                self.stop_rpc_streaming_generator();
            }
        } else if self.http_stream.running.load(Ordering::Acquire) {
            let _ = self
                .http_stream
                .tx
                .send_async(Some(StreamFrame::Message(msg)))
                .await;
            if final_frame {
                self.stop_http_streaming_generator();
            }
        }

        if final_frame {
            self.notify_batcher(None);
        }
    }

    /// Run the bound converter's postprocess on an inferer output, then
    /// stream the result. Only valid on models that carry a converter.
    pub async fn stream_respond_with_postprocess(
        self: &Arc<Self>,
        inp: InferPayload,
        final_frame: bool,
    ) -> Result<(), GrpsError> {
        let converter = self.converter().ok_or_else(|| {
            GrpsError::internal(
                "stream_respond_with_postprocess should only be used with a converter",
            )
        })?;
        let msg = converter.postprocess(inp, self).await?;
        self.stream_respond(msg, final_frame).await;
        Ok(())
    }

    /// Streaming respond for custom-body routes: raw text or bytes frames.
    pub async fn customized_http_stream_respond(&self, frame: StreamFrame, final_frame: bool) {
        if self.http_stream.running.load(Ordering::Acquire) {
            let _ = self.http_stream.tx.send_async(Some(frame)).await;
        }
        if final_frame {
            self.stop_http_streaming_generator();
            self.notify_batcher(None);
        }
    }

    /// Receiver half of the HTTP streaming queue. Framework use only.
    pub fn http_stream_receiver(&self) -> flume::Receiver<Option<StreamFrame>> {
        self.http_stream.rx.clone()
    }

    /// Receiver half of the RPC streaming queue. Framework use only.
    pub fn rpc_stream_receiver(&self) -> flume::Receiver<Option<StreamFrame>> {
        self.rpc_stream.rx.clone()
    }

    pub fn start_http_streaming_generator(&self) {
        self.http_stream.running.store(true, Ordering::Release);
    }

    pub fn stop_http_streaming_generator(&self) {
        self.http_stream.running.store(false, Ordering::Release);
        let _ = self.http_stream.tx.try_send(None);
    }

    pub fn start_rpc_streaming_generator(&self) {
        self.rpc_stream.running.store(true, Ordering::Release);
    }

    pub fn stop_rpc_streaming_generator(&self) {
        self.rpc_stream.running.store(false, Ordering::Release);
        let _ = self.rpc_stream.tx.try_send(None);
    }

    pub fn rpc_streaming_running(&self) -> bool {
        self.rpc_stream.running.load(Ordering::Acquire)
    }

    // ---------------------------- Customized HTTP ----------------------------

    pub fn http_request(&self) -> Option<&HttpRequestParts> {
        self.http_request.as_ref()
    }

    pub fn set_http_response(&self, response: HttpResponse) {
        *self
            .http_response
            .lock()
            .expect("http_response lock poisoned") = Some(response);
    }

    pub fn take_http_response(&self) -> Option<HttpResponse> {
        self.http_response
            .lock()
            .expect("http_response lock poisoned")
            .take()
    }

    // ---------------------------- Batching ----------------------------

    /// Install the one-shot completion slot. Framework use only.
    pub fn set_batcher_done(&self, sender: CompletionSender) {
        *self
            .batcher_done
            .lock()
            .expect("batcher_done lock poisoned") = Some(sender);
    }

    /// Complete the batcher future, at most once. Framework use only.
    pub fn notify_batcher(&self, out: Option<GrpsMessage>) {
        let sender = self
            .batcher_done
            .lock()
            .expect("batcher_done lock poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.try_send(out);
        }
    }

    // ---------------------------- Bound model ----------------------------

    /// Bind the current node's converter. Framework use only.
    pub fn set_converter(&self, converter: Arc<dyn Converter>) {
        *self.converter.lock().expect("converter lock poisoned") = Some(converter);
    }

    pub fn converter(&self) -> Option<Arc<dyn Converter>> {
        self.converter
            .lock()
            .expect("converter lock poisoned")
            .clone()
    }

    /// Bind the current node's inferer. Framework use only.
    pub fn set_inferer(&self, inferer: Arc<dyn ModelInferer>) {
        *self.inferer.lock().expect("inferer lock poisoned") = Some(inferer);
    }

    pub fn inferer(&self) -> Option<Arc<dyn ModelInferer>> {
        self.inferer.lock().expect("inferer lock poisoned").clone()
    }

    // ---------------------------- Cancellation ----------------------------

    /// Flipped by the transport when the peer drops. Framework use only.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Whether the client has gone away. Supported for RPC calls; plain
    /// HTTP requests always report `false`.
    pub fn if_disconnected(&self) -> bool {
        self.is_rpc && self.disconnected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trips_typed_values() {
        let ctx = GrpsContext::new();
        ctx.put_user_data("batch_size", 4usize);
        ctx.put_user_data("tag", "abc".to_string());
        assert_eq!(*ctx.get_user_data::<usize>("batch_size").unwrap(), 4);
        assert_eq!(*ctx.get_user_data::<String>("tag").unwrap(), "abc");
        assert!(ctx.get_user_data::<usize>("missing").is_none());
        assert!(ctx.get_user_data::<i64>("batch_size").is_none());
    }

    #[test]
    fn set_err_msg_implies_has_err() {
        let ctx = GrpsContext::new();
        assert!(!ctx.has_err());
        ctx.set_err_msg("boom");
        assert!(ctx.has_err());
        assert_eq!(ctx.err_msg(), "boom");
    }

    #[tokio::test]
    async fn stream_frames_are_ordered_and_terminated_once() {
        let ctx = GrpsContext::new();
        ctx.start_http_streaming_generator();
        ctx.stream_respond(GrpsMessage::from_str_data("stream data 1"), false)
            .await;
        ctx.stream_respond(GrpsMessage::from_str_data("stream data 2"), true)
            .await;

        let rx = ctx.http_stream_receiver();
        let mut texts = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Some(StreamFrame::Message(msg)) => texts.push(msg.str_data),
                Some(_) => panic!("unexpected raw frame"),
                None => break,
            }
        }
        assert_eq!(texts, vec!["stream data 1", "stream data 2"]);
        // terminated exactly once: queue is now empty
        assert!(rx.try_recv().is_err());
        assert!(!ctx.if_streaming());
    }

    #[tokio::test]
    async fn failure_status_is_preserved_on_stream() {
        let ctx = GrpsContext::new();
        ctx.start_rpc_streaming_generator();
        ctx.stream_respond(
            GrpsMessage::from_status(GrpsStatus::failure(500, "bad")),
            true,
        )
        .await;
        match ctx.rpc_stream_receiver().try_recv().unwrap() {
            Some(StreamFrame::Message(msg)) => {
                assert_eq!(msg.status.unwrap().status, StatusFlag::Failure)
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn batcher_notify_fires_once() {
        let ctx = GrpsContext::new();
        let (tx, rx) = flume::bounded(1);
        ctx.set_batcher_done(tx);
        ctx.notify_batcher(Some(GrpsMessage::from_str_data("out")));
        ctx.notify_batcher(None);
        assert_eq!(rx.try_recv().unwrap().unwrap().str_data, "out");
        assert!(rx.try_recv().is_err());
    }
}
