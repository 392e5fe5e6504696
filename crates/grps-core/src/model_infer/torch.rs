//! TorchScript backend (`torch` feature, via `tch`).

use std::sync::Arc;

use async_trait::async_trait;
use tch::{CModule, IValue, Kind, Tensor};

use crate::conf::Device;
use crate::context::GrpsContext;
use crate::converter::{Converter, FrameworkKind, InferPayload, TensorConverter, TensorGroup};
use crate::error::GrpsError;
use crate::model_infer::{infer_message_via_bridge, InfererArgs, ModelInferer};
use crate::tensor::TensorValue;

fn to_tch_device(device: &Device) -> tch::Device {
    match device {
        Device::Cpu => tch::Device::Cpu,
        Device::Cuda(ordinal) => tch::Device::Cuda(ordinal.unwrap_or(0)),
        Device::Original { .. } => tch::Device::Cpu,
    }
}

fn to_tch_tensor(value: &TensorValue) -> Result<Tensor, GrpsError> {
    let shape: Vec<i64> = value.shape().iter().map(|&d| d as i64).collect();
    let tensor = match value {
        TensorValue::Uint8(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Int8(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Int16(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Int32(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Int64(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Float16(a) => {
            let f32s: Vec<f32> = a.iter().map(|v| v.to_f32()).collect();
            Tensor::from_slice(&f32s).to_kind(Kind::Half)
        }
        TensorValue::Float32(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::Float64(a) => Tensor::from_slice(a.as_slice().unwrap_or(&[])),
        TensorValue::String(_) => {
            return Err(GrpsError::internal(
                "torch inferer: string tensors are not supported",
            ))
        }
    };
    Ok(tensor.reshape(shape.as_slice()))
}

fn from_tch_tensor(tensor: &Tensor) -> Result<TensorValue, GrpsError> {
    let tensor = tensor.to_device(tch::Device::Cpu).contiguous();
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let dims = ndarray::IxDyn(&shape);
    macro_rules! pull {
        ($variant:ident, $ty:ty, $kind:expr) => {{
            let flat: Vec<$ty> = Vec::try_from(tensor.reshape([-1]).to_kind($kind))
                .map_err(GrpsError::internal)?;
            TensorValue::$variant(
                ndarray::ArrayD::from_shape_vec(dims, flat).map_err(GrpsError::internal)?,
            )
        }};
    }
    Ok(match tensor.kind() {
        Kind::Uint8 => pull!(Uint8, u8, Kind::Uint8),
        Kind::Int8 => pull!(Int8, i8, Kind::Int8),
        Kind::Int16 => pull!(Int16, i16, Kind::Int16),
        Kind::Int => pull!(Int32, i32, Kind::Int),
        Kind::Int64 => pull!(Int64, i64, Kind::Int64),
        Kind::Half => {
            let flat: Vec<f32> = Vec::try_from(tensor.reshape([-1]).to_kind(Kind::Float))
                .map_err(GrpsError::internal)?;
            TensorValue::Float16(
                ndarray::ArrayD::from_shape_vec(
                    ndarray::IxDyn(&shape),
                    flat.into_iter().map(half::f16::from_f32).collect(),
                )
                .map_err(GrpsError::internal)?,
            )
        }
        Kind::Float => pull!(Float32, f32, Kind::Float),
        Kind::Double => pull!(Float64, f64, Kind::Double),
        other => {
            return Err(GrpsError::internal(format!(
                "torch inferer: unsupported output kind {other:?}"
            )))
        }
    })
}

fn ivalue_to_group(out: IValue) -> Result<TensorGroup, GrpsError> {
    match out {
        IValue::Tensor(tensor) => Ok(TensorGroup::List(vec![from_tch_tensor(&tensor)?])),
        IValue::Tuple(items) | IValue::GenericList(items) => {
            let mut tensors = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    IValue::Tensor(tensor) => tensors.push(from_tch_tensor(&tensor)?),
                    other => {
                        return Err(GrpsError::internal(format!(
                            "torch inferer: non-tensor in output list: {other:?}"
                        )))
                    }
                }
            }
            Ok(TensorGroup::List(tensors))
        }
        IValue::GenericDict(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                match (key, value) {
                    (IValue::String(name), IValue::Tensor(tensor)) => {
                        out.push((name, from_tch_tensor(&tensor)?))
                    }
                    (key, value) => {
                        return Err(GrpsError::internal(format!(
                            "torch inferer: unsupported output map entry ({key:?}, {value:?})"
                        )))
                    }
                }
            }
            Ok(TensorGroup::Map(out))
        }
        other => Err(GrpsError::internal(format!(
            "torch inferer: unsupported output {other:?}"
        ))),
    }
}

pub struct TorchModelInferer {
    path: String,
    device: Device,
    module: Option<CModule>,
    bridge: TensorConverter,
}

impl Default for TorchModelInferer {
    fn default() -> Self {
        Self {
            path: String::new(),
            device: Device::Cpu,
            module: None,
            bridge: TensorConverter::new(FrameworkKind::Torch),
        }
    }
}

impl TorchModelInferer {
    /// Device inputs are moved to before invocation. For `original` this is
    /// the configured `inp_device`; otherwise the model device itself.
    fn input_device(&self) -> tch::Device {
        match &self.device {
            Device::Original { inp: Some(inp) } => to_tch_device(inp),
            other => to_tch_device(other),
        }
    }

    fn forward_group(&self, group: TensorGroup) -> Result<TensorGroup, GrpsError> {
        let module = self
            .module
            .as_ref()
            .ok_or_else(|| GrpsError::internal("torch inferer: model not loaded"))?;
        let input_device = self.input_device();
        match group {
            TensorGroup::List(tensors) => {
                let inputs: Vec<Tensor> = tensors
                    .iter()
                    .map(|t| to_tch_tensor(t).map(|t| t.to_device(input_device)))
                    .collect::<Result<_, _>>()?;
                let out = module.forward_ts(&inputs).map_err(GrpsError::internal)?;
                Ok(TensorGroup::List(vec![from_tch_tensor(&out)?]))
            }
            TensorGroup::Map(pairs) => {
                let dict: Vec<(IValue, IValue)> = pairs
                    .iter()
                    .map(|(name, tensor)| {
                        Ok((
                            IValue::String(name.clone()),
                            IValue::Tensor(to_tch_tensor(tensor)?.to_device(input_device)),
                        ))
                    })
                    .collect::<Result<_, GrpsError>>()?;
                let out = module
                    .forward_is(&[IValue::GenericDict(dict)])
                    .map_err(GrpsError::internal)?;
                ivalue_to_group(out)
            }
        }
    }
}

#[async_trait]
impl ModelInferer for TorchModelInferer {
    fn init(
        &mut self,
        path: &str,
        device: Option<Device>,
        _args: &InfererArgs,
    ) -> Result<(), GrpsError> {
        self.path = path.to_owned();
        self.device = device.unwrap_or(Device::Cpu);
        Ok(())
    }

    fn load(&mut self) -> Result<(), GrpsError> {
        let module = match &self.device {
            // `original` keeps the device bindings baked into the module.
            Device::Original { .. } => CModule::load(&self.path),
            other => CModule::load_on_device(&self.path, to_tch_device(other)),
        }
        .map_err(|err| GrpsError::ModelLoad(format!("torch load {} failed: {err}", self.path)))?;
        self.module = Some(module);
        Ok(())
    }

    async fn infer(
        &self,
        inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        infer_message_via_bridge(&self.bridge, inp, ctx, |payload| async {
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
