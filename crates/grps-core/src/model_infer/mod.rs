//! Model inferer contract: load a model's weights once, run forward passes
//! for the lifetime of the process.
//!
//! Framework backends are optional cargo features, so the default build
//! carries the contract and the customized plug-in path only; configuring a
//! framework model into a binary built without its backend is a fatal model
//! load error.

#[cfg(feature = "tensorflow")]
pub mod tensorflow;
#[cfg(feature = "tensorrt")]
pub mod tensorrt;
#[cfg(feature = "torch")]
pub mod torch;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value;

use crate::conf::{Device, InfererType};
use crate::context::GrpsContext;
use crate::converter::{Converter, InferPayload};
use crate::error::GrpsError;

pub type InfererArgs = HashMap<String, Value>;

/// One loaded model. `infer` may block arbitrarily (GPU work, user code);
/// callers run it inside the bounded predict worker pool.
#[async_trait]
pub trait ModelInferer: Send + Sync {
    /// Remember path/device/args. Called once before `load`.
    fn init(
        &mut self,
        path: &str,
        device: Option<Device>,
        args: &InfererArgs,
    ) -> Result<(), GrpsError>;

    /// Load the model from the initialized path. Failure aborts bootstrap.
    fn load(&mut self) -> Result<(), GrpsError>;

    async fn infer(
        &self,
        inp: InferPayload,
        ctx: &Arc<GrpsContext>,
    ) -> Result<InferPayload, GrpsError>;

    async fn batch_infer(
        &self,
        inp: InferPayload,
        ctxs: &[Arc<GrpsContext>],
    ) -> Result<InferPayload, GrpsError> {
        let _ = (inp, ctxs);
        Err(GrpsError::internal(
            "batch_infer not implemented by this inferer",
        ))
    }
}

/// Construct the built-in inferer for a framework type. `Customized` is
/// resolved through the plugin registry instead.
pub fn framework_inferer(kind: InfererType) -> Result<Box<dyn ModelInferer>, GrpsError> {
    match kind {
        #[cfg(feature = "torch")]
        InfererType::Torch => Ok(Box::new(torch::TorchModelInferer::default())),
        #[cfg(feature = "tensorflow")]
        InfererType::Tensorflow => Ok(Box::new(tensorflow::TfModelInferer::default())),
        #[cfg(feature = "tensorrt")]
        InfererType::Tensorrt => Ok(Box::new(tensorrt::TrtModelInferer::default())),
        InfererType::Customized => Err(GrpsError::internal(
            "customized inferer must come from the registry",
        )),
        #[allow(unreachable_patterns)]
        other => Err(GrpsError::ModelLoad(format!(
            "inferer type {other:?} requires the matching backend feature at build time"
        ))),
    }
}

/// No-converter mode for framework inferers: bridge the raw wire message
/// through the bundled tensor converter around the tensor forward pass.
#[cfg(any(feature = "torch", feature = "tensorflow", feature = "tensorrt"))]
pub(crate) async fn infer_message_via_bridge<F, Fut>(
    bridge: &dyn Converter,
    inp: InferPayload,
    ctx: &Arc<GrpsContext>,
    forward: F,
) -> Result<InferPayload, GrpsError>
where
    F: FnOnce(InferPayload) -> Fut,
    Fut: std::future::Future<Output = Result<InferPayload, GrpsError>>,
{
    match inp {
        InferPayload::Message(msg) => {
            let pre = bridge.preprocess(&msg, ctx).await?;
            let out = forward(pre).await?;
            Ok(InferPayload::Message(bridge.postprocess(out, ctx).await?))
        }
        other => forward(other).await,
    }
}
