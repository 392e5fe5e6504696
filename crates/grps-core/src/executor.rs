//! The executor owns every loaded model and the pipeline, and routes each
//! request through them.
//!
//! Customized inferers and converters are plugged in through an explicit
//! [`Registry`] of factories; every model entry referencing a plugin gets a
//! fresh instance, so two entries sharing one class never share state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::batcher::DynamicBatcher;
use crate::conf::{BatchingType, Conf, ConverterType, InfererType, ModelConf};
use crate::context::GrpsContext;
use crate::converter::{Converter, ConverterArgs, FrameworkKind, TensorConverter};
use crate::dag::{ModelEntry, SequentialDag};
use crate::error::GrpsError;
use crate::message::GrpsMessage;
use crate::model_infer::{framework_inferer, InfererArgs, ModelInferer};

type InfererFactory = Box<dyn Fn() -> Box<dyn ModelInferer> + Send + Sync>;
type ConverterFactory = Box<dyn Fn() -> Box<dyn Converter> + Send + Sync>;

/// Factory map for user-authored inferers and converters.
#[derive(Default)]
pub struct Registry {
    inferers: HashMap<String, InfererFactory>,
    converters: HashMap<String, ConverterFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_inferer(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn ModelInferer> + Send + Sync + 'static,
    ) {
        self.inferers.insert(name.into(), Box::new(factory));
    }

    pub fn register_converter(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Converter> + Send + Sync + 'static,
    ) {
        self.converters.insert(name.into(), Box::new(factory));
    }

    fn new_inferer(&self, name: &str) -> Option<Box<dyn ModelInferer>> {
        self.inferers.get(name).map(|factory| factory())
    }

    fn new_converter(&self, name: &str) -> Option<Box<dyn Converter>> {
        self.converters.get(name).map(|factory| factory())
    }
}

pub struct Executor {
    models: HashMap<String, ModelEntry>,
    dag: SequentialDag,
}

impl Executor {
    /// Load every model, start every batcher and build the pipeline. Any
    /// failure is fatal to bootstrap.
    pub fn new(conf: &Conf, registry: &Registry) -> Result<Executor, GrpsError> {
        let models = init_models(conf, registry)?;
        let dag = init_dag(conf, &models)?;
        Ok(Executor { models, dag })
    }

    pub fn model_keys(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Run one request, through the pipeline or through a single selected
    /// model when `model_name` is non-empty. On exit any still-open RPC
    /// streaming generator is terminated so the RPC handler always sees a
    /// terminator.
    pub async fn infer(
        &self,
        inp: GrpsMessage,
        ctx: &Arc<GrpsContext>,
        model_name: Option<&str>,
    ) -> Result<GrpsMessage, GrpsError> {
        let result = match model_name {
            None | Some("") => self.dag.infer(inp, ctx).await,
            Some(name) => self.infer_with_model_name(inp, ctx, name).await,
        };
        if ctx.rpc_streaming_running() {
            ctx.stop_rpc_streaming_generator();
        }
        result
    }

    /// Pipeline bypass: run exactly one model by `name-version` key.
    pub async fn infer_with_model_name(
        &self,
        inp: GrpsMessage,
        ctx: &Arc<GrpsContext>,
        model_name: &str,
    ) -> Result<GrpsMessage, GrpsError> {
        let entry = self
            .models
            .get(model_name)
            .ok_or_else(|| GrpsError::NotFound(format!("Model {model_name} not found.")))?;
        entry.process(model_name, inp, ctx).await
    }
}

fn build_inferer(
    model: &ModelConf,
    registry: &Registry,
) -> Result<Box<dyn ModelInferer>, GrpsError> {
    match model.inferer_type {
        InfererType::Customized => {
            let name = model.inferer_name.as_deref().unwrap_or_default();
            registry.new_inferer(name).ok_or_else(|| {
                GrpsError::ModelLoad(format!(
                    "inferer name {name} not found, but bound with {} model",
                    model.key()
                ))
            })
        }
        other => framework_inferer(other),
    }
}

fn build_converter(
    model: &ModelConf,
    registry: &Registry,
) -> Result<Option<Box<dyn Converter>>, GrpsError> {
    Ok(match model.converter_type {
        ConverterType::None => None,
        ConverterType::Torch => Some(Box::new(TensorConverter::new(FrameworkKind::Torch))),
        ConverterType::Tensorflow => {
            Some(Box::new(TensorConverter::new(FrameworkKind::TensorFlow)))
        }
        ConverterType::Tensorrt => Some(Box::new(TensorConverter::new(FrameworkKind::TensorRt))),
        ConverterType::Customized => {
            let name = model.converter_name.as_deref().unwrap_or_default();
            Some(registry.new_converter(name).ok_or_else(|| {
                GrpsError::ModelLoad(format!(
                    "converter name {name} not found, but bound with {} model",
                    model.key()
                ))
            })?)
        }
    })
}

fn init_models(
    conf: &Conf,
    registry: &Registry,
) -> Result<HashMap<String, ModelEntry>, GrpsError> {
    tracing::info!("Init models.");
    let mut models = HashMap::new();
    let empty_args: InfererArgs = HashMap::new();

    for model in &conf.inference.models {
        let key = model.key();
        let device = model.parsed_device().map(|device| {
            // `original` carries the separately configured input device.
            match device {
                crate::conf::Device::Original { .. } => crate::conf::Device::Original {
                    inp: model
                        .inp_device
                        .as_deref()
                        .and_then(crate::conf::Device::parse)
                        .map(Box::new),
                },
                other => other,
            }
        });

        let mut inferer = build_inferer(model, registry)?;
        let path = model.inferer_path.as_deref().unwrap_or_default();
        inferer.init(path, device.clone(), model.inferer_args.as_ref().unwrap_or(&empty_args))?;
        tracing::info!(
            "Init model inferer successfully, model: {key}, path: {path}, device: {device:?}"
        );
        inferer
            .load()
            .map_err(|err| GrpsError::ModelLoad(format!("load model {key} failed: {err}")))?;
        tracing::info!("Load model inferer successfully, model: {key}");
        let inferer: Arc<dyn ModelInferer> = Arc::from(inferer);

        let converter: Option<Arc<dyn Converter>> = match build_converter(model, registry)? {
            Some(mut converter) => {
                let converter_path = model.converter_path.as_deref().unwrap_or_default();
                let empty: ConverterArgs = HashMap::new();
                converter.init(
                    converter_path,
                    model.converter_args.as_ref().unwrap_or(&empty),
                )?;
                tracing::info!(
                    "Init converter successfully, model: {key}, path: {converter_path}"
                );
                Some(Arc::from(converter))
            }
            None => None,
        };

        let batcher = match &model.batching {
            Some(batching) if batching.kind == BatchingType::Dynamic => {
                let batcher = DynamicBatcher::start(
                    key.clone(),
                    batching.max_batch_size as usize,
                    batching.batch_timeout_us as u64,
                    converter.clone(),
                    inferer.clone(),
                    conf.max_concurrency(),
                );
                tracing::info!(
                    "Init and start batcher successfully, model: {key}, max batch size: {}, \
                     batch timeout: {} us",
                    batching.max_batch_size,
                    batching.batch_timeout_us
                );
                Some(batcher)
            }
            _ => None,
        };

        tracing::info!("Init model {key} successfully.");
        models.insert(
            key,
            ModelEntry {
                inferer,
                converter,
                batcher,
            },
        );
    }
    Ok(models)
}

fn init_dag(
    conf: &Conf,
    models: &HashMap<String, ModelEntry>,
) -> Result<SequentialDag, GrpsError> {
    tracing::info!("Build sequential dag.");
    let mut dag = SequentialDag::new(conf.inference.dag.name.clone());
    for node in &conf.inference.dag.nodes {
        let entry = models.get(&node.model).ok_or_else(|| {
            GrpsError::internal(format!(
                "model {} not found but bound with {} node",
                node.model, node.name
            ))
        })?;
        dag.push_node(node.name.clone(), entry.clone());
    }
    tracing::info!(
        "Build sequential dag successfully, sequence is {}.",
        dag.sequence_names().join(" -> ")
    );
    Ok(dag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::conf::Device;
    use crate::converter::InferPayload;

    /// Copies `str_data` through, marking it with the instance's visit count
    /// so instance-sharing would be visible.
    struct EchoInferer {
        prefix: String,
    }

    #[async_trait]
    impl ModelInferer for EchoInferer {
        fn init(
            &mut self,
            _path: &str,
            _device: Option<Device>,
            _args: &InfererArgs,
        ) -> Result<(), GrpsError> {
            Ok(())
        }

        fn load(&mut self) -> Result<(), GrpsError> {
            Ok(())
        }

        async fn infer(
            &self,
            inp: InferPayload,
            _ctx: &Arc<GrpsContext>,
        ) -> Result<InferPayload, GrpsError> {
            let msg = inp.into_message()?;
            Ok(InferPayload::Message(GrpsMessage::from_str_data(format!(
                "{}{}",
                self.prefix, msg.str_data
            ))))
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_inferer("echo", || {
            Box::new(EchoInferer {
                prefix: String::new(),
            })
        });
        registry.register_inferer("tag", || {
            Box::new(EchoInferer {
                prefix: "tagged:".into(),
            })
        });
        registry
    }

    fn conf(inference: &str) -> Conf {
        Conf::from_texts(
            r#"
interface:
  framework: http
  host: 0.0.0.0
  port: 7080
max_connections: 100
max_concurrency: 10
log:
  log_dir: ./logs
  log_backup_count: 7
"#,
            inference,
        )
        .unwrap()
    }

    const ECHO_INFERENCE: &str = r#"
models:
  - name: echo
    version: "1.0.0"
    inferer_type: customized
    inferer_name: echo
    converter_type: none
dag:
  type: sequential
  name: echo_dag
  nodes:
    - name: node-1
      type: model
      model: echo-1.0.0
"#;

    #[tokio::test]
    async fn pipeline_echoes_str_data() {
        let conf = conf(ECHO_INFERENCE);
        let executor = Executor::new(&conf, &registry()).unwrap();
        let ctx = Arc::new(GrpsContext::new());
        let out = executor
            .infer(GrpsMessage::from_str_data("hello grps."), &ctx, None)
            .await
            .unwrap();
        assert_eq!(out.str_data, "hello grps.");
    }

    #[tokio::test]
    async fn two_node_sequence_runs_in_order() {
        let inference = r#"
models:
  - name: echo
    version: "1.0.0"
    inferer_type: customized
    inferer_name: echo
    converter_type: none
  - name: tag
    version: "1.0.0"
    inferer_type: customized
    inferer_name: tag
    converter_type: none
dag:
  type: sequential
  name: seq
  nodes:
    - name: node-1
      type: model
      model: echo-1.0.0
    - name: node-2
      type: model
      model: tag-1.0.0
"#;
        let conf = conf(inference);
        let executor = Executor::new(&conf, &registry()).unwrap();
        let ctx = Arc::new(GrpsContext::new());
        let out = executor
            .infer(GrpsMessage::from_str_data("x"), &ctx, None)
            .await
            .unwrap();
        assert_eq!(out.str_data, "tagged:x");
    }

    #[tokio::test]
    async fn model_bypass_selects_one_model() {
        let conf = conf(ECHO_INFERENCE);
        let executor = Executor::new(&conf, &registry()).unwrap();
        let ctx = Arc::new(GrpsContext::new());
        let out = executor
            .infer(GrpsMessage::from_str_data("direct"), &ctx, Some("echo-1.0.0"))
            .await
            .unwrap();
        assert_eq!(out.str_data, "direct");

        let ctx = Arc::new(GrpsContext::new());
        let err = executor
            .infer(GrpsMessage::default(), &ctx, Some("missing-1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, GrpsError::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn unregistered_inferer_fails_load() {
        let inference = ECHO_INFERENCE.replace("inferer_name: echo", "inferer_name: nope");
        let conf = conf(&inference);
        let err = Executor::new(&conf, &registry()).unwrap_err();
        assert!(matches!(err, GrpsError::ModelLoad(_)), "{err}");
    }

    #[tokio::test]
    async fn executor_exit_terminates_rpc_stream() {
        let conf = conf(ECHO_INFERENCE);
        let executor = Executor::new(&conf, &registry()).unwrap();
        let ctx = Arc::new(GrpsContext::for_rpc());
        ctx.start_rpc_streaming_generator();
        executor
            .infer(GrpsMessage::from_str_data("x"), &ctx, None)
            .await
            .unwrap();
        assert!(!ctx.rpc_streaming_running());
        // terminator was pushed
        assert!(ctx.rpc_stream_receiver().try_recv().unwrap().is_none());
    }
}
