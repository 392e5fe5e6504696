//! The built-in tensor bridge.
//!
//! One implementation serves the three framework converter types; they differ
//! only in the dtype domain their runtime accepts once tensors are in neutral
//! form. Naming rules: either every tensor in a request is named (producing a
//! name→tensor mapping) or none is (producing an ordered list); mixing is an
//! error, duplicate names are an error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::GrpsContext;
use crate::converter::{Converter, InferPayload, TensorGroup};
use crate::error::GrpsError;
use crate::message::{DataType, GenericTensor, GrpsMessage};
use crate::tensor::TensorValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkKind {
    Torch,
    TensorFlow,
    TensorRt,
}

impl FrameworkKind {
    pub fn name(&self) -> &'static str {
        match self {
            FrameworkKind::Torch => "torch",
            FrameworkKind::TensorFlow => "tensorflow",
            FrameworkKind::TensorRt => "tensorrt",
        }
    }

    /// Whether this framework's native tensors can carry the dtype.
    pub fn supports(&self, dtype: DataType) -> bool {
        match self {
            FrameworkKind::Torch => dtype != DataType::String,
            FrameworkKind::TensorFlow => true,
            FrameworkKind::TensorRt => !matches!(
                dtype,
                DataType::Int16
                    | DataType::Int64
                    | DataType::Float16
                    | DataType::Float64
                    | DataType::String
            ),
        }
    }
}

pub struct TensorConverter {
    kind: FrameworkKind,
}

impl TensorConverter {
    pub fn new(kind: FrameworkKind) -> Self {
        Self { kind }
    }

    fn decode(&self, gtensor: &GenericTensor) -> Result<TensorValue, GrpsError> {
        if !self.kind.supports(gtensor.dtype) {
            return Err(GrpsError::BadRequest(format!(
                "{} tensor converter: unsupported data type: {}",
                self.kind.name(),
                gtensor.dtype.as_str()
            )));
        }
        TensorValue::from_generic(gtensor)
    }

    fn check_naming(&self, tensors: &[GenericTensor]) -> Result<bool, GrpsError> {
        let has_name = !tensors[0].name.is_empty();
        for tensor in tensors {
            if tensor.name.is_empty() == has_name {
                return Err(GrpsError::BadRequest(format!(
                    "{} tensor converter: gtensors should all have a name or all have no name",
                    self.kind.name()
                )));
            }
        }
        Ok(has_name)
    }

    fn non_empty<'a>(&self, inp: &'a GrpsMessage) -> Result<&'a [GenericTensor], GrpsError> {
        let tensors = inp.tensors();
        if tensors.is_empty() {
            return Err(GrpsError::BadRequest(format!(
                "{} tensor converter: input has no gtensors",
                self.kind.name()
            )));
        }
        Ok(tensors)
    }

    /// Names for the output side: a single tensor is `output`, ordered lists
    /// are `output_0, output_1, ...`, maps keep their keys.
    fn output_names(group: &TensorGroup) -> Vec<String> {
        match group {
            TensorGroup::List(tensors) if tensors.len() == 1 => vec!["output".into()],
            TensorGroup::List(tensors) => (0..tensors.len())
                .map(|idx| format!("output_{idx}"))
                .collect(),
            TensorGroup::Map(pairs) => pairs.iter().map(|(name, _)| name.clone()).collect(),
        }
    }

    fn group_tensors(group: TensorGroup) -> Vec<TensorValue> {
        match group {
            TensorGroup::List(tensors) => tensors,
            TensorGroup::Map(pairs) => pairs.into_iter().map(|(_, tensor)| tensor).collect(),
        }
    }
}

#[async_trait]
impl Converter for TensorConverter {
    async fn preprocess(
        &self,
        inp: &GrpsMessage,
        _ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError> {
        let tensors = self.non_empty(inp)?;
        let has_name = self.check_naming(tensors)?;

        if has_name {
            let mut pairs: Vec<(String, TensorValue)> = Vec::with_capacity(tensors.len());
            for tensor in tensors {
                if pairs.iter().any(|(name, _)| *name == tensor.name) {
                    return Err(GrpsError::BadRequest(format!(
                        "{} tensor converter: duplicated tensor name: {}",
                        self.kind.name(),
                        tensor.name
                    )));
                }
                pairs.push((tensor.name.clone(), self.decode(tensor)?));
            }
            Ok(InferPayload::Tensors(TensorGroup::Map(pairs)))
        } else {
            let mut list = Vec::with_capacity(tensors.len());
            for tensor in tensors {
                list.push(self.decode(tensor)?);
            }
            Ok(InferPayload::Tensors(TensorGroup::List(list)))
        }
    }

    async fn postprocess(
        &self,
        inp: InferPayload,
        _ctx: &Arc<GrpsContext>,
    ) -> Result<GrpsMessage, GrpsError> {
        let group = inp.into_tensors()?;
        let names = Self::output_names(&group);
        let tensors = Self::group_tensors(group);
        for tensor in &tensors {
            if !self.kind.supports(tensor.dtype()) {
                return Err(GrpsError::internal(format!(
                    "{} tensor converter postprocess: unsupported data type: {}",
                    self.kind.name(),
                    tensor.dtype().as_str()
                )));
            }
        }
        let out = tensors
            .into_iter()
            .zip(names)
            .map(|(tensor, name)| tensor.into_generic(name))
            .collect();
        Ok(GrpsMessage::from_tensors(out))
    }

    async fn batch_preprocess(
        &self,
        inps: &[GrpsMessage],
        ctxs: &[Arc<GrpsContext>],
    ) -> Result<InferPayload, GrpsError> {
        if inps.len() != ctxs.len() {
            return Err(GrpsError::internal(format!(
                "{} tensor converter batch preprocess: inputs size not match with contexts",
                self.kind.name()
            )));
        }

        let mut names: Vec<String> = Vec::new();
        let mut dtypes: Vec<DataType> = Vec::new();
        let mut shapes: Vec<Vec<i32>> = Vec::new();
        let mut columns: Vec<Vec<TensorValue>> = Vec::new();
        let mut has_name = false;

        for (i, inp) in inps.iter().enumerate() {
            let tensors = self.non_empty(inp)?;
            has_name = self.check_naming(tensors)?;

            let cur_batch_size = *tensors[0].shape.first().unwrap_or(&0);
            for tensor in tensors {
                if tensor.shape.len() <= 1 {
                    return Err(GrpsError::BadRequest(format!(
                        "{} tensor converter batch preprocess: tensor rank should be greater \
                         than 1",
                        self.kind.name()
                    )));
                }
                if tensor.shape[0] != cur_batch_size {
                    return Err(GrpsError::BadRequest(format!(
                        "{} tensor converter batch preprocess: batch size of each tensor not \
                         match",
                        self.kind.name()
                    )));
                }
            }
            ctxs[i].put_user_data("batch_size", cur_batch_size as usize);

            if i == 0 {
                for tensor in tensors {
                    names.push(if has_name { tensor.name.clone() } else { String::new() });
                    dtypes.push(tensor.dtype);
                    shapes.push(tensor.shape.clone());
                    columns.push(vec![self.decode(tensor)?]);
                }
            } else {
                if tensors.len() != names.len() {
                    return Err(GrpsError::BadRequest(format!(
                        "{} tensor converter batch preprocess: tensor size not match",
                        self.kind.name()
                    )));
                }
                for (j, tensor) in tensors.iter().enumerate() {
                    let name = if has_name { tensor.name.as_str() } else { "" };
                    if names[j] != name {
                        return Err(GrpsError::BadRequest(format!(
                            "{} tensor converter batch preprocess: tensor names not match",
                            self.kind.name()
                        )));
                    }
                    if dtypes[j] != tensor.dtype {
                        return Err(GrpsError::BadRequest(format!(
                            "{} tensor converter batch preprocess: tensor dtypes not match",
                            self.kind.name()
                        )));
                    }
                    if shapes[j].len() != tensor.shape.len()
                        || shapes[j][1..] != tensor.shape[1..]
                    {
                        return Err(GrpsError::BadRequest(format!(
                            "{} tensor converter batch preprocess: tensor shapes not match",
                            self.kind.name()
                        )));
                    }
                    columns[j].push(self.decode(tensor)?);
                }
            }
        }

        let mut batched = Vec::with_capacity(columns.len());
        for column in &columns {
            batched.push(TensorValue::concat_axis0(column)?);
        }

        if has_name {
            Ok(InferPayload::Tensors(TensorGroup::Map(
                names.into_iter().zip(batched).collect(),
            )))
        } else {
            Ok(InferPayload::Tensors(TensorGroup::List(batched)))
        }
    }

    async fn batch_postprocess(
        &self,
        inp: InferPayload,
        ctxs: &[Arc<GrpsContext>],
    ) -> Result<Vec<GrpsMessage>, GrpsError> {
        let group = inp.into_tensors()?;
        let names = Self::output_names(&group);
        let tensors = Self::group_tensors(group);

        let sizes: Vec<usize> = ctxs
            .iter()
            .map(|ctx| {
                ctx.get_user_data::<usize>("batch_size")
                    .map(|size| *size)
                    .ok_or_else(|| {
                        GrpsError::internal(format!(
                            "{} tensor converter batch postprocess: batch_size missing on \
                             context",
                            self.kind.name()
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let mut split_columns = Vec::with_capacity(tensors.len());
        for tensor in &tensors {
            split_columns.push(tensor.split_axis0(&sizes)?);
        }

        let mut outs = Vec::with_capacity(ctxs.len());
        for i in 0..ctxs.len() {
            let tensors = split_columns
                .iter()
                .zip(&names)
                .map(|(column, name)| column[i].clone().into_generic(name.clone()))
                .collect();
            outs.push(GrpsMessage::from_tensors(tensors));
        }
        Ok(outs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GenericTensorList;

    fn ctx() -> Arc<GrpsContext> {
        Arc::new(GrpsContext::new())
    }

    fn f32_tensor(name: &str, shape: Vec<i32>, data: Vec<f32>) -> GenericTensor {
        GenericTensor {
            name: name.into(),
            dtype: DataType::Float32,
            shape,
            flat_float32: data,
            ..Default::default()
        }
    }

    fn msg(tensors: Vec<GenericTensor>) -> GrpsMessage {
        GrpsMessage {
            gtensors: Some(GenericTensorList { tensors }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn named_round_trip_is_identity() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let inp = msg(vec![
            f32_tensor("a", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
            f32_tensor("b", vec![2, 1], vec![5.0, 6.0]),
        ]);
        let pre = conv.preprocess(&inp, &ctx()).await.unwrap();
        let out = conv.postprocess(pre, &ctx()).await.unwrap();
        assert_eq!(out.tensors(), inp.tensors());
    }

    #[tokio::test]
    async fn nameless_single_tensor_is_named_output() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let inp = msg(vec![f32_tensor("", vec![2, 3], (0..6).map(|v| v as f32).collect())]);
        let pre = conv.preprocess(&inp, &ctx()).await.unwrap();
        let out = conv.postprocess(pre, &ctx()).await.unwrap();
        assert_eq!(out.tensors()[0].name, "output");
        assert_eq!(out.tensors()[0].flat_float32, inp.tensors()[0].flat_float32);
    }

    #[tokio::test]
    async fn nameless_list_gets_indexed_names() {
        let conv = TensorConverter::new(FrameworkKind::TensorFlow);
        let inp = msg(vec![
            f32_tensor("", vec![1, 2], vec![1.0, 2.0]),
            f32_tensor("", vec![1, 2], vec![3.0, 4.0]),
        ]);
        let pre = conv.preprocess(&inp, &ctx()).await.unwrap();
        let out = conv.postprocess(pre, &ctx()).await.unwrap();
        assert_eq!(out.tensors()[0].name, "output_0");
        assert_eq!(out.tensors()[1].name, "output_1");
    }

    #[tokio::test]
    async fn mixed_naming_is_rejected() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let inp = msg(vec![
            f32_tensor("a", vec![1, 2], vec![1.0, 2.0]),
            f32_tensor("", vec![1, 2], vec![3.0, 4.0]),
        ]);
        assert!(conv.preprocess(&inp, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let inp = msg(vec![
            f32_tensor("a", vec![1, 2], vec![1.0, 2.0]),
            f32_tensor("a", vec![1, 2], vec![3.0, 4.0]),
        ]);
        assert!(conv.preprocess(&inp, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn tensorrt_rejects_narrow_dtypes() {
        let conv = TensorConverter::new(FrameworkKind::TensorRt);
        for dtype in [
            DataType::Int16,
            DataType::Int64,
            DataType::Float16,
            DataType::Float64,
            DataType::String,
        ] {
            let mut tensor = GenericTensor {
                name: "t".into(),
                dtype,
                shape: vec![1],
                ..Default::default()
            };
            match dtype {
                DataType::Int16 => tensor.flat_int16 = vec![1],
                DataType::Int64 => tensor.flat_int64 = vec![1],
                DataType::Float16 => tensor.flat_float16 = vec![1.0],
                DataType::Float64 => tensor.flat_float64 = vec![1.0],
                DataType::String => tensor.flat_string = vec!["x".into()],
                _ => unreachable!(),
            }
            let err = conv.preprocess(&msg(vec![tensor]), &ctx()).await.unwrap_err();
            assert!(err.to_string().contains("unsupported data type"), "{err}");
        }
    }

    #[tokio::test]
    async fn batch_concat_records_sizes_and_split_restores_order() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let first = msg(vec![f32_tensor("x", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])]);
        let second = msg(vec![f32_tensor("x", vec![1, 2], vec![9.0, 8.0])]);
        let ctxs = vec![ctx(), ctx()];

        let pre = conv
            .batch_preprocess(&[first.clone(), second.clone()], &ctxs)
            .await
            .unwrap();
        assert_eq!(*ctxs[0].get_user_data::<usize>("batch_size").unwrap(), 2);
        assert_eq!(*ctxs[1].get_user_data::<usize>("batch_size").unwrap(), 1);

        match &pre {
            InferPayload::Tensors(TensorGroup::Map(pairs)) => {
                assert_eq!(pairs[0].1.shape(), &[3, 2]);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let outs = conv.batch_postprocess(pre, &ctxs).await.unwrap();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].tensors()[0].flat_float32, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(outs[1].tensors()[0].flat_float32, vec![9.0, 8.0]);
        assert_eq!(outs[0].tensors()[0].name, "x");
    }

    #[tokio::test]
    async fn batch_shape_tail_mismatch_is_rejected() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let first = msg(vec![f32_tensor("x", vec![1, 2], vec![1.0, 2.0])]);
        let second = msg(vec![f32_tensor("x", vec![1, 3], vec![1.0, 2.0, 3.0])]);
        let ctxs = vec![ctx(), ctx()];
        let err = conv
            .batch_preprocess(&[first, second], &ctxs)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shapes not match"), "{err}");
    }

    #[tokio::test]
    async fn batch_rank_one_is_rejected() {
        let conv = TensorConverter::new(FrameworkKind::Torch);
        let inp = msg(vec![f32_tensor("x", vec![2], vec![1.0, 2.0])]);
        let ctxs = vec![ctx()];
        let err = conv.batch_preprocess(&[inp], &ctxs).await.unwrap_err();
        assert!(err.to_string().contains("rank"), "{err}");
    }
}
