//! Converter contract: mapping between wire messages and framework-native
//! tensors, in both single-request and batched form.

mod tensor_converter;

pub use tensor_converter::{FrameworkKind, TensorConverter};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value;

use crate::context::GrpsContext;
use crate::error::GrpsError;
use crate::message::GrpsMessage;
use crate::tensor::TensorValue;

/// Framework-native tensors for one model invocation. `List` spreads as
/// positional arguments, `Map` as named arguments; order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorGroup {
    List(Vec<TensorValue>),
    Map(Vec<(String, TensorValue)>),
}

impl TensorGroup {
    pub fn len(&self) -> usize {
        match self {
            TensorGroup::List(v) => v.len(),
            TensorGroup::Map(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data flowing between converter and inferer. No-converter mode carries raw
/// wire messages; converter mode carries tensors. `Messages` is the batched
/// no-converter form.
#[derive(Debug, Clone)]
pub enum InferPayload {
    Message(GrpsMessage),
    Messages(Vec<GrpsMessage>),
    Tensors(TensorGroup),
}

impl InferPayload {
    pub fn into_message(self) -> Result<GrpsMessage, GrpsError> {
        match self {
            InferPayload::Message(msg) => Ok(msg),
            _ => Err(GrpsError::internal("output type must be GrpsMessage")),
        }
    }

    pub fn into_messages(self) -> Result<Vec<GrpsMessage>, GrpsError> {
        match self {
            InferPayload::Messages(msgs) => Ok(msgs),
            _ => Err(GrpsError::internal("output type must be a GrpsMessage list")),
        }
    }

    pub fn into_tensors(self) -> Result<TensorGroup, GrpsError> {
        match self {
            InferPayload::Tensors(group) => Ok(group),
            _ => Err(GrpsError::internal("payload is not a tensor group")),
        }
    }
}

pub type ConverterArgs = HashMap<String, Value>;

/// Pre/postprocess contract. Customized converters are user code plugged in
/// through the registry; the framework bridges implement the neutral⇄native
/// tensor rules.
#[async_trait]
pub trait Converter: Send + Sync {
    fn init(&mut self, path: &str, args: &ConverterArgs) -> Result<(), GrpsError> {
        let _ = (path, args);
        Ok(())
    }

    async fn preprocess(
        &self,
        inp: &GrpsMessage,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError>;

    async fn postprocess(
        &self,
        inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<GrpsMessage, GrpsError>;

    /// Batched preprocess: one payload concatenated along axis 0 from every
    /// request; records each request's leading-dimension size under the
    /// `batch_size` user-data key of its context.
    async fn batch_preprocess(
        &self,
        inps: &[GrpsMessage],
        ctxs: &[Arc<GrpsContext>],
    ) -> Result<InferPayload, GrpsError>;

    /// Batched postprocess: split along axis 0 by the recorded sizes, one
    /// response per context, in input order.
    async fn batch_postprocess(
        &self,
        inp: InferPayload,
        ctxs: &[Arc<GrpsContext>],
    ) -> Result<Vec<GrpsMessage>, GrpsError>;
}
