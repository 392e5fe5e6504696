//! Inference pipeline: an ordered list of model nodes a request travels
//! through, one-shot per request. `sequential` is the only topology.

use std::sync::Arc;

use tokio::time::Instant;

use crate::batcher::DynamicBatcher;
use crate::context::GrpsContext;
use crate::converter::{Converter, InferPayload};
use crate::error::GrpsError;
use crate::message::GrpsMessage;
use crate::model_infer::ModelInferer;

/// One loaded model with its optional converter and batcher.
#[derive(Clone)]
pub struct ModelEntry {
    pub inferer: Arc<dyn ModelInferer>,
    pub converter: Option<Arc<dyn Converter>>,
    pub batcher: Option<Arc<DynamicBatcher>>,
}

impl ModelEntry {
    /// Run one request through this model: batcher if installed, otherwise
    /// the converter three-step (or a bare infer), short-circuiting on any
    /// context error.
    pub async fn process(
        &self,
        name: &str,
        data: GrpsMessage,
        ctx: &Arc<GrpsContext>,
    ) -> Result<GrpsMessage, GrpsError> {
        if let Some(converter) = &self.converter {
            ctx.set_converter(converter.clone());
        }
        ctx.set_inferer(self.inferer.clone());

        if let Some(batcher) = &self.batcher {
            let out = batcher.infer(data, ctx.clone()).await?;
            return Ok(out.unwrap_or_default());
        }

        let begin = Instant::now();
        match &self.converter {
            None => {
                let infer_out = self
                    .inferer
                    .infer(InferPayload::Message(data), ctx)
                    .await?;
                check_ctx(ctx)?;
                let out = infer_out.into_message()?;
                tracing::info!(
                    "Model({name}), model_infer time: {} us",
                    begin.elapsed().as_micros()
                );
                Ok(out)
            }
            Some(converter) => {
                let infer_input = converter.preprocess(&data, ctx).await?;
                check_ctx(ctx)?;
                let preprocess_time = Instant::now();

                let infer_out = self.inferer.infer(infer_input, ctx).await?;
                check_ctx(ctx)?;
                let infer_time = Instant::now();

                let out = converter.postprocess(infer_out, ctx).await?;
                check_ctx(ctx)?;
                tracing::info!(
                    "Model({name}), preprocess time: {} us, model_infer time: {} us, \
                     postprocess time: {} us",
                    (preprocess_time - begin).as_micros(),
                    (infer_time - preprocess_time).as_micros(),
                    infer_time.elapsed().as_micros()
                );
                Ok(out)
            }
        }
    }
}

fn check_ctx(ctx: &Arc<GrpsContext>) -> Result<(), GrpsError> {
    if ctx.has_err() {
        Err(GrpsError::Internal(ctx.err_msg()))
    } else {
        Ok(())
    }
}

struct ModelNode {
    name: String,
    entry: ModelEntry,
}

/// Models executed in declared order; each node's output feeds the next.
pub struct SequentialDag {
    name: String,
    sequence: Vec<ModelNode>,
}

impl SequentialDag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence: Vec::new(),
        }
    }

    pub fn push_node(&mut self, name: impl Into<String>, entry: ModelEntry) {
        self.sequence.push(ModelNode {
            name: name.into(),
            entry,
        });
    }

    pub fn sequence_names(&self) -> Vec<&str> {
        self.sequence.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn infer(
        &self,
        mut data: GrpsMessage,
        ctx: &Arc<GrpsContext>,
    ) -> Result<GrpsMessage, GrpsError> {
        for node in &self.sequence {
            data = node.entry.process(&node.name, data, ctx).await?;
            check_ctx(ctx)?;
        }
        Ok(data)
    }
}
