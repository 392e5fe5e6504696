//! TensorFlow SavedModel backend (`tensorflow` feature).

use std::sync::Arc;

use async_trait::async_trait;
use tensorflow::{
    Graph, Operation, SavedModelBundle, SessionOptions, SessionRunArgs, Tensor as TfTensor,
};

use crate::conf::Device;
use crate::context::GrpsContext;
use crate::converter::{Converter, FrameworkKind, InferPayload, TensorConverter, TensorGroup};
use crate::error::GrpsError;
use crate::model_infer::{infer_message_via_bridge, InfererArgs, ModelInferer};
use crate::tensor::TensorValue;

const SERVING_SIGNATURE: &str = "serving_default";

struct Loaded {
    bundle: SavedModelBundle,
    graph: Graph,
}

#[derive(Default)]
pub struct TfModelInferer {
    path: String,
    loaded: Option<Loaded>,
    bridge: Option<TensorConverter>,
}

fn to_tf_tensor_f32(value: &TensorValue) -> Result<TfTensor<f32>, GrpsError> {
    let dims: Vec<u64> = value.shape().iter().map(|&d| d as u64).collect();
    let flat: Vec<f32> = match value {
        TensorValue::Float32(a) => a.iter().copied().collect(),
        TensorValue::Float64(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::Float16(a) => a.iter().map(|v| v.to_f32()).collect(),
        TensorValue::Int32(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::Int64(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::Int16(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::Int8(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::Uint8(a) => a.iter().map(|&v| v as f32).collect(),
        TensorValue::String(_) => {
            return Err(GrpsError::internal(
                "tensorflow inferer: string feed tensors are not supported",
            ))
        }
    };
    TfTensor::new(&dims)
        .with_values(&flat)
        .map_err(GrpsError::internal)
}

fn from_tf_tensor_f32(tensor: &TfTensor<f32>) -> Result<TensorValue, GrpsError> {
    let shape: Vec<usize> = tensor.dims().iter().map(|&d| d as usize).collect();
    let array =
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), tensor.iter().copied().collect())
            .map_err(GrpsError::internal)?;
    Ok(TensorValue::Float32(array))
}

impl TfModelInferer {
    fn signature_io(&self) -> Result<(Vec<(String, Operation, i32)>, Vec<(String, Operation, i32)>), GrpsError> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| GrpsError::internal("tensorflow inferer: model not loaded"))?;
        let signature = loaded
            .bundle
            .meta_graph_def()
            .get_signature(SERVING_SIGNATURE)
            .map_err(GrpsError::internal)?;

        let mut inputs = Vec::new();
        for (name, info) in signature.inputs() {
            let op = loaded
                .graph
                .operation_by_name_required(&info.name().name)
                .map_err(GrpsError::internal)?;
            inputs.push((name.clone(), op, info.name().index));
        }
        let mut outputs = Vec::new();
        for (name, info) in signature.outputs() {
            let op = loaded
                .graph
                .operation_by_name_required(&info.name().name)
                .map_err(GrpsError::internal)?;
            outputs.push((name.clone(), op, info.name().index));
        }
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok((inputs, outputs))
    }

    fn forward_group(&self, group: TensorGroup) -> Result<TensorGroup, GrpsError> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| GrpsError::internal("tensorflow inferer: model not loaded"))?;
        let (inputs, outputs) = self.signature_io()?;

        let feeds: Vec<(usize, TfTensor<f32>)> = match &group {
            TensorGroup::List(tensors) => {
                if tensors.len() != inputs.len() {
                    return Err(GrpsError::internal(format!(
                        "tensorflow inferer: model expects {} inputs, got {}",
                        inputs.len(),
                        tensors.len()
                    )));
                }
                tensors
                    .iter()
                    .enumerate()
                    .map(|(idx, tensor)| Ok((idx, to_tf_tensor_f32(tensor)?)))
                    .collect::<Result<_, GrpsError>>()?
            }
            TensorGroup::Map(pairs) => pairs
                .iter()
                .map(|(name, tensor)| {
                    let idx = inputs
                        .iter()
                        .position(|(input, _, _)| input == name)
                        .ok_or_else(|| {
                            GrpsError::internal(format!(
                                "tensorflow inferer: unknown input name {name}"
                            ))
                        })?;
                    Ok((idx, to_tf_tensor_f32(tensor)?))
                })
                .collect::<Result<_, GrpsError>>()?,
        };

        let mut args = SessionRunArgs::new();
        for (idx, tensor) in &feeds {
            let (_, op, index) = &inputs[*idx];
            args.add_feed(op, *index, tensor);
        }
        let fetches: Vec<_> = outputs
            .iter()
            .map(|(_, op, index)| args.request_fetch(op, *index))
            .collect();
        loaded
            .bundle
            .session
            .run(&mut args)
            .map_err(GrpsError::internal)?;

        let mut out = Vec::with_capacity(outputs.len());
        for ((name, _, _), token) in outputs.iter().zip(fetches) {
            let tensor: TfTensor<f32> = args.fetch(token).map_err(GrpsError::internal)?;
            out.push((name.clone(), from_tf_tensor_f32(&tensor)?));
        }
        Ok(TensorGroup::Map(out))
    }
}

#[async_trait]
impl ModelInferer for TfModelInferer {
    fn init(
        &mut self,
        path: &str,
        _device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        self.path = path.to_owned();
        self.bridge = Some(TensorConverter::new(FrameworkKind::TensorFlow));
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        let mut graph = Graph::new();
        let bundle = SavedModelBundle::load(&SessionOptions::new(), ["serve"], &mut graph, &self.path)
            .map_err(|err| {
                GrpsError::ModelLoad(format!("tensorflow load {} failed: {err}", self.path))
            })?;
        self.loaded = Some(Loaded { bundle, graph });
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
            .ok_or_else(|| GrpsError::internal("tensorflow inferer: not initialized"))?;
        infer_message_via_bridge(bridge, inp, ctx, |payload| async {
            let group = payload.into_tensors()?;
            Ok(InferPayload::Tensors(self.forward_group(group)?))
        })
        .await
    }

    async fn batch_infer(
        &self,
        inp: InferPayload,
        _ctxs: &[Arc<GrpsContext>],
    ) -> Result<InferPayload, GrpsError> {
        let group = inp.into_tensors()?;
        Ok(InferPayload::Tensors(self.forward_group(group)?))
    }
}
