//! TensorRT backend (`tensorrt` feature).
//!
//! Owns a pool of execution workers, one per configured CUDA stream
//! (`inferer_args.streams`). Each worker thread deserializes its own engine
//! and execution context on the configured device; submissions are routed
//! round-robin across worker queues under a submission lock and the caller
//! waits on a per-job completion channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tensorrt_rs::{Engine, ExecutionContext};

use crate::conf::Device;
use crate::context::GrpsContext;
use crate::converter::{Converter, FrameworkKind, InferPayload, TensorConverter, TensorGroup};
use crate::error::GrpsError;
use crate::model_infer::{infer_message_via_bridge, InfererArgs, ModelInferer};
use crate::tensor::TensorValue;

const DEFAULT_STREAMS: usize = 1;

struct Job {
    group: TensorGroup,
    reply: flume::Sender<Result<TensorGroup, GrpsError>>,
}

struct Worker {
    queue: flume::Sender<Job>,
}

fn forward(context: &mut ExecutionContext, engine: &Engine, group: &TensorGroup) -> Result<TensorGroup, GrpsError> {
    let pairs: Vec<(String, &TensorValue)> = match group {
        TensorGroup::Map(pairs) => pairs.iter().map(|(n, t)| (n.clone(), t)).collect(),
        TensorGroup::List(tensors) => tensors
            .iter()
            .enumerate()
            .map(|(idx, t)| {
                let name = engine
                    .binding_name(idx as i32)
                    .unwrap_or_else(|| format!("input_{idx}"));
                (name, t)
            })
            .collect(),
    };

    let mut bindings = engine.allocate_bindings().map_err(GrpsError::internal)?;
    for (name, tensor) in &pairs {
        let shape: Vec<i32> = tensor.shape().iter().map(|&d| d as i32).collect();
        match tensor {
            TensorValue::Float32(a) => bindings
                .set_input(name, a.as_slice().unwrap_or(&[]), &shape)
                .map_err(GrpsError::internal)?,
            other => {
                return Err(GrpsError::internal(format!(
                    "tensorrt inferer: unsupported input dtype {}",
                    other.dtype().as_str()
                )))
            }
        }
    }

    context.enqueue(&mut bindings).map_err(GrpsError::internal)?;

    let mut out = Vec::new();
    for idx in 0..engine.num_bindings() {
        if engine.binding_is_input(idx) {
            continue;
        }
        let name = engine
            .binding_name(idx)
            .unwrap_or_else(|| format!("output_{idx}"));
        let values: Vec<f32> = bindings.get_output(&name).map_err(GrpsError::internal)?;
        let dims: Vec<usize> = bindings
            .output_shape(&name)
            .map_err(GrpsError::internal)?
            .iter()
            .map(|&d| d as usize)
            .collect();
        let array = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&dims), values)
            .map_err(GrpsError::internal)?;
        out.push((name, TensorValue::Float32(array)));
    }
    Ok(TensorGroup::Map(out))
}

fn worker_loop(path: String, device: i32, jobs: flume::Receiver<Job>) {
    unsafe {
        tensorrt_rs::cuda_set_device(device);
    }
    let engine = match Engine::from_file(&path) {
        Ok(engine) => engine,
        Err(err) => {
            // Load failures are detected eagerly in `load`; a worker that
            // still fails here drains its queue with errors.
            while let Ok(job) = jobs.recv() {
                let _ = job.reply.send(Err(GrpsError::internal(format!(
                    "tensorrt worker engine load failed: {err}"
                ))));
            }
            return;
        }
    };
    let mut context = match engine.create_execution_context() {
        Ok(context) => context,
        Err(err) => {
            while let Ok(job) = jobs.recv() {
                let _ = job.reply.send(Err(GrpsError::internal(format!(
                    "tensorrt execution context failed: {err}"
                ))));
            }
            return;
        }
    };

    while let Ok(job) = jobs.recv() {
        let result = forward(&mut context, &engine, &job.group);
        let _ = job.reply.send(result);
    }
}

#[derive(Default)]
pub struct TrtModelInferer {
    path: String,
    device: i32,
    streams: usize,
    workers: Vec<Worker>,
    submit_idx: AtomicUsize,
    bridge: Option<TensorConverter>,
}

impl TrtModelInferer {
    async fn submit(&self, group: TensorGroup) -> Result<TensorGroup, GrpsError> {
        if self.workers.is_empty() {
            return Err(GrpsError::internal("tensorrt inferer: not loaded"));
        }
        let idx = self.submit_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (reply, done) = flume::bounded(1);
        self.workers[idx]
            .queue
            .send(Job { group, reply })
            .map_err(|_| GrpsError::internal("tensorrt worker is gone"))?;
        done.recv_async()
            .await
            .map_err(|_| GrpsError::internal("tensorrt worker dropped the job"))?
    }
}

#[async_trait]
impl ModelInferer for TrtModelInferer {
    fn init(
        &mut self,
        path: &str,
        device: Option<Device>,
        args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        self.path = path.to_owned();
        self.device = match device {
            Some(Device::Cuda(ordinal)) => ordinal.unwrap_or(0) as i32,
            Some(Device::Cpu) | None => 0,
            Some(other) => {
                return Err(GrpsError::ModelLoad(format!(
                    "tensorrt inferer: unsupported device {other:?}"
                )))
            }
        };
        self.streams = args
            .get("streams")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_STREAMS);
        self.bridge = Some(TensorConverter::new(FrameworkKind::TensorRt));
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        // Probe the engine once on the caller so a bad file fails bootstrap.
        Engine::from_file(&self.path).map_err(|err| {
            GrpsError::ModelLoad(format!("tensorrt load {} failed: {err}", self.path))
        })?;

        for stream in 0..self.streams {
            let (tx, rx) = flume::unbounded();
            let path = self.path.clone();
            let device = self.device;
            std::thread::Builder::new()
                .name(format!("trt-worker-{stream}"))
                .spawn(move || worker_loop(path, device, rx))
                .map_err(GrpsError::internal)?;
            self.workers.push(Worker { queue: tx });
        }
        tracing::info!(
            "tensorrt inferer loaded, path: {}, device: cuda:{}, streams: {}",
            self.path,
            self.device,
            self.streams
        );
        Ok(())
    }

    async fn infer(
        &self,
        inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| GrpsError::internal("tensorrt inferer: not initialized"))?;
        infer_message_via_bridge(bridge, inp, ctx, |payload| async {
            let group = payload.into_tensors()?;
            Ok(InferPayload::Tensors(self.submit(group).await?))
        })
        .await
    }

    async fn batch_infer(
        &self,
        inp: InferPayload,
        _ctxs: &[Arc<GrpsContext>],
    ) -> Result<InferPayload, GrpsError> {
        let group = inp.into_tensors()?;
        Ok(InferPayload::Tensors(self.submit(group).await?))
    }
}
