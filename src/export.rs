use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use prost::Message;
use serde::Serialize;
use tracing::{debug, info};
use onnx_graph::{build_proto, parameter_bytes, DType, Dimension, GraphOptions, InputTensor, Shape, Tensor, WeightStorageStrategy};
use crate::artifacts::{ArtifactKey, OutputDir};
use crate::config::ExportConfig;
use crate::loader::BlipConfig;
use crate::wrapper::SubgraphWrapper;
use crate::ExportError;

/// `metadata_props` key holding the trace shapes and dynamic axes a graph was exported with.
pub const TRACE_METADATA_KEY: &str = "blip_export_trace";

/// How the values of a synthetic input are generated when a graph is run for validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SyntheticFill {
    /// Uniform random values in `[-1, 1)`.
    Uniform,
    Ones,
}

/// A concrete example input. Its shape drives the trace.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyntheticInput {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub fill: SyntheticFill,
}

impl SyntheticInput {
    pub fn new(name: &str, dtype: DType, shape: Vec<usize>, fill: SyntheticFill) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape,
            fill,
        }
    }
}

/// Which axes of which named tensors stay symbolic in the exported graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DynamicAxisSpec {
    axes: BTreeMap<String, BTreeMap<usize, String>>,
}

impl DynamicAxisSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(mut self, tensor: &str, axis: usize, name: &str) -> Self {
        self.axes.entry(tensor.to_string()).or_default().insert(axis, name.to_string());
        self
    }

    pub fn get(&self, tensor: &str, axis: usize) -> Option<&str> {
        self.axes.get(tensor).and_then(|x| x.get(&axis)).map(|x| x.as_str())
    }

    pub fn tensors(&self) -> impl Iterator<Item = (&str, &BTreeMap<usize, String>)> {
        self.axes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// An output as seen during the trace: its shape at the synthetic input sizes, and the symbolic
/// name of each axis that stays dynamic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TracedOutput {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub dynamic_axes: BTreeMap<usize, String>,
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    stage: &'a str,
    inputs: &'a [SyntheticInput],
    outputs: &'a [TracedOutput],
    dynamic_axes: &'a DynamicAxisSpec,
}

/// A graph written to the output directory.
#[derive(Clone, Debug)]
pub struct ExportedGraph {
    pub stage: &'static str,
    pub artifact: ArtifactKey,
    pub graph_path: PathBuf,
    /// Set when parameters went to a companion file.
    pub weights_path: Option<PathBuf>,
    pub inputs: Vec<SyntheticInput>,
    pub outputs: Vec<TracedOutput>,
    pub dynamic_axes: DynamicAxisSpec,
    pub parameter_bytes: usize,
}

impl ExportedGraph {
    pub fn output(&self, name: &str) -> Option<&TracedOutput> {
        self.outputs.iter().find(|x| x.name == name)
    }
}

/// Graph inputs for `synthetic`. Axes that share a symbolic name share one `Dimension`, so
/// operators can tell they are equal even though their size is unknown.
pub fn build_inputs(synthetic: &[SyntheticInput], axes: &DynamicAxisSpec) -> Result<Vec<Arc<InputTensor>>, ExportError> {
    let mut symbols: HashMap<&str, Arc<Dimension>> = HashMap::new();
    let mut inputs = vec![];
    for input in synthetic {
        let mut dims = vec![];
        for (i, &size) in input.shape.iter().enumerate() {
            let dim = match axes.get(&input.name, i) {
                Some(symbol) => match symbols.get(symbol) {
                    Some(existing) => {
                        if existing.value != Some(size) {
                            return Err(ExportError::DynamicAxis(format!(
                                "{} axis {} is {} but other inputs traced {} as {:?}",
                                input.name, i, size, symbol, existing.value
                            )));
                        }
                        existing.clone()
                    }
                    None => {
                        let dim = Dimension::dynamic(size, symbol);
                        symbols.insert(symbol, dim.clone());
                        dim
                    }
                },
                None => Dimension::fixed(size),
            };
            dims.push(dim);
        }
        inputs.push(InputTensor::new(input.name.clone(), input.dtype, Shape::new(dims)));
    }
    Ok(inputs)
}

fn check_axis_declarations(wrapper: &dyn SubgraphWrapper, synthetic: &[SyntheticInput], axes: &DynamicAxisSpec) -> Result<(), ExportError> {
    let names: Vec<&str> = synthetic.iter().map(|x| x.name.as_str()).collect();
    if names != wrapper.input_names() {
        return Err(ExportError::Trace(onnx_graph::Error::InvalidInputError(format!(
            "{} synthetic inputs {:?} do not match the declared inputs {:?}",
            wrapper.stage(), names, wrapper.input_names()
        ))));
    }
    for (tensor, tensor_axes) in axes.tensors() {
        if wrapper.output_names().contains(&tensor) {
            continue;
        }
        let input = synthetic.iter().find(|x| x.name == tensor)
            .ok_or_else(|| ExportError::DynamicAxis(format!("{tensor} is neither an input nor an output of {}", wrapper.stage())))?;
        if let Some(axis) = tensor_axes.keys().find(|&&axis| axis >= input.shape.len()) {
            return Err(ExportError::DynamicAxis(format!("{tensor} has rank {} but axis {axis} is declared dynamic", input.shape.len())));
        }
    }
    Ok(())
}

/// Runs the wrapper's forward pass over symbolic inputs and checks that each output carries
/// exactly the dynamic axes declared for it.
pub fn trace(wrapper: &dyn SubgraphWrapper, inputs: &[Arc<InputTensor>], axes: &DynamicAxisSpec) -> Result<Vec<(&'static str, Arc<dyn Tensor>)>, ExportError> {
    let input_tensors: Vec<Arc<dyn Tensor>> = inputs.iter().map(|x| x.clone() as Arc<dyn Tensor>).collect();
    let outputs = wrapper.forward(&input_tensors)?;
    if outputs.len() != wrapper.output_names().len() {
        return Err(ExportError::Trace(onnx_graph::Error::InvalidInputError(format!(
            "{} produced {} outputs, expected {}", wrapper.stage(), outputs.len(), wrapper.output_names().len()
        ))));
    }

    let labelled: Vec<(&'static str, Arc<dyn Tensor>)> = wrapper.output_names().iter().copied().zip(outputs).collect();
    for (name, tensor) in &labelled {
        let shape = tensor.shape();
        for i in 0..shape.rank() {
            let traced = shape[i].name.as_deref();
            match (axes.get(name, i), traced) {
                (Some(declared), Some(traced)) if declared == traced => {}
                (None, None) => {}
                (Some(declared), traced) => {
                    return Err(ExportError::DynamicAxis(format!(
                        "output {name} axis {i} is declared {declared} but traced as {}", traced.unwrap_or("a fixed size")
                    )));
                }
                (None, Some(traced)) => {
                    return Err(ExportError::DynamicAxis(format!(
                        "output {name} axis {i} follows {traced} but is not declared dynamic"
                    )));
                }
            }
        }
        if let Some(axis) = axes.tensors().find(|(t, _)| t == name).and_then(|(_, a)| a.keys().find(|&&a| a >= shape.rank())) {
            return Err(ExportError::DynamicAxis(format!("output {name} has rank {} but axis {axis} is declared dynamic", shape.rank())));
        }
    }
    Ok(labelled)
}

/// Traces `wrapper` and writes its graph (and weight companion, when large) to `output_dir`.
///
/// Nothing is written unless the whole trace succeeds.
pub fn export_subgraph(wrapper: &dyn SubgraphWrapper, output_dir: &OutputDir, config: &ExportConfig) -> Result<ExportedGraph, ExportError> {
    let synthetic = wrapper.synthetic_inputs(config);
    let axes = wrapper.dynamic_axes();
    check_axis_declarations(wrapper, &synthetic, &axes)?;

    let inputs = build_inputs(&synthetic, &axes)?;
    let outputs = trace(wrapper, &inputs, &axes)?;
    debug!("Traced {} with inputs {:?}", wrapper.stage(), synthetic);

    let mut traced_outputs = vec![];
    for (name, tensor) in &outputs {
        let shape = tensor.shape();
        traced_outputs.push(TracedOutput {
            name: name.to_string(),
            dtype: tensor.dtype(),
            shape: shape.resolve()?,
            dynamic_axes: (0..shape.rank())
                .filter_map(|i| shape[i].name.clone().map(|n| (i, n)))
                .collect(),
        });
    }

    let output_refs: Vec<(&str, Arc<dyn Tensor>)> = outputs.iter().map(|(name, tensor)| (*name, tensor.clone())).collect();
    let total_parameter_bytes = parameter_bytes(&output_refs);

    let artifact = wrapper.artifact();
    let graph_path = output_dir.path(artifact);
    let companion = artifact.weights_companion();
    let weights_path = match companion {
        Some(companion) if total_parameter_bytes > config.external_data_threshold => Some(output_dir.path(companion)),
        _ => None,
    };
    let storage = match &weights_path {
        Some(path) => WeightStorageStrategy::BinFile(path.clone()),
        None => WeightStorageStrategy::EmbeddedData,
    };

    let record = TraceRecord {
        stage: wrapper.stage(),
        inputs: &synthetic,
        outputs: &traced_outputs,
        dynamic_axes: &axes,
    };
    let options = GraphOptions {
        graph_name: wrapper.stage().to_string(),
        opset_version: config.opset_version,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        metadata_props: vec![(TRACE_METADATA_KEY.to_string(), serde_json::to_string(&record)?)],
        ..Default::default()
    };

    let model = build_proto(&inputs, &output_refs, &storage, &options)?;
    fs::write(&graph_path, model.encode_to_vec())?;
    if weights_path.is_none() {
        if let Some(companion) = companion {
            if output_dir.remove(companion)? {
                debug!("Removed stale {}", companion);
            }
        }
    }
    info!(
        "Wrote {} ({} nodes, {:.1} MB of parameters{})",
        graph_path.display(),
        model.graph.as_ref().map(|x| x.node.len()).unwrap_or(0),
        total_parameter_bytes as f64 / (1024.0 * 1024.0),
        if weights_path.is_some() { ", stored externally" } else { "" }
    );

    Ok(ExportedGraph {
        stage: wrapper.stage(),
        artifact,
        graph_path,
        weights_path,
        inputs: synthetic,
        outputs: traced_outputs,
        dynamic_axes: axes,
        parameter_bytes: total_parameter_bytes,
    })
}

/// The decoder is traced against image features of a size derived from the config. Checks the
/// vision graph really produces that size before the decoder is exported.
pub fn check_stage_coupling(vision: &ExportedGraph, config: &BlipConfig) -> Result<(), ExportError> {
    let expected = config.vision_config.num_image_tokens();
    let expected_width = config.text_config.encoder_hidden_size;
    let features = vision.output("image_features")
        .ok_or_else(|| ExportError::DynamicAxis(format!("{} has no image_features output", vision.stage)))?;
    let (actual, actual_width) = match features.shape.as_slice() {
        [_, tokens, width] => (*tokens, *width),
        _ => (0, 0),
    };
    if actual != expected || actual_width != expected_width {
        return Err(ExportError::StageCoupling { expected, expected_width, actual, actual_width });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use onnx_graph::operators::{Add, Constant, MatMul};
    use onnx_graph::tensor::TensorData;

    /// `y = x @ w + x` over a `[batch, seq, 2]` input.
    struct Affine {
        dynamic_output: bool,
    }

    impl SubgraphWrapper for Affine {
        fn stage(&self) -> &'static str {
            "affine"
        }

        fn artifact(&self) -> ArtifactKey {
            ArtifactKey::VisionGraph
        }

        fn input_names(&self) -> &'static [&'static str] {
            &["x"]
        }

        fn output_names(&self) -> &'static [&'static str] {
            &["y"]
        }

        fn synthetic_inputs(&self, _config: &ExportConfig) -> Vec<SyntheticInput> {
            vec![SyntheticInput::new("x", DType::F32, vec![1, 3, 2], SyntheticFill::Uniform)]
        }

        fn dynamic_axes(&self) -> DynamicAxisSpec {
            let axes = DynamicAxisSpec::new().axis("x", 0, "batch");
            if self.dynamic_output {
                axes.axis("y", 0, "batch")
            } else {
                axes
            }
        }

        fn forward(&self, inputs: &[Arc<dyn Tensor>]) -> Result<Vec<Arc<dyn Tensor>>, onnx_graph::Error> {
            let w = Constant::new(Some("w".to_string()), TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0].into(), Shape::from(vec![2usize, 2]))?);
            let y = MatMul::new(None, inputs[0].clone(), w)?;
            Ok(vec![Add::new(None, y, inputs[0].clone())?])
        }
    }

    fn test_config() -> ExportConfig {
        ExportConfig {
            validate: false,
            ..Default::default()
        }
    }

    #[test]
    fn shared_symbols_share_dimensions() {
        let synthetic = vec![
            SyntheticInput::new("a", DType::I64, vec![2, 5], SyntheticFill::Ones),
            SyntheticInput::new("b", DType::I64, vec![2, 5], SyntheticFill::Ones),
        ];
        let axes = DynamicAxisSpec::new().axis("a", 0, "batch").axis("b", 0, "batch").axis("a", 1, "seq_len");
        let inputs = build_inputs(&synthetic, &axes).unwrap();
        assert!(Arc::ptr_eq(&inputs[0].shape()[0], &inputs[1].shape()[0]));
        assert!(inputs[0].shape()[1].is_dynamic());
        assert!(!inputs[1].shape()[1].is_dynamic());
    }

    #[test]
    fn conflicting_trace_sizes_for_one_symbol() {
        let synthetic = vec![
            SyntheticInput::new("a", DType::I64, vec![2], SyntheticFill::Ones),
            SyntheticInput::new("b", DType::I64, vec![3], SyntheticFill::Ones),
        ];
        let axes = DynamicAxisSpec::new().axis("a", 0, "batch").axis("b", 0, "batch");
        assert!(matches!(build_inputs(&synthetic, &axes), Err(ExportError::DynamicAxis(_))));
    }

    #[test]
    fn export_writes_metadata_and_embeds_small_weights() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(dir.path()).unwrap();
        std::fs::write(out.path(ArtifactKey::VisionWeights), b"stale").unwrap();

        let exported = export_subgraph(&Affine { dynamic_output: true }, &out, &test_config()).unwrap();
        assert!(exported.weights_path.is_none());
        assert!(!out.contains(ArtifactKey::VisionWeights));
        assert_eq!(exported.outputs[0].shape, vec![1, 3, 2]);
        assert_eq!(exported.outputs[0].dynamic_axes.get(&0).map(|x| x.as_str()), Some("batch"));
        assert_eq!(exported.parameter_bytes, 0);

        let bytes = std::fs::read(&exported.graph_path).unwrap();
        let model = onnx_graph::onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        let record = model.metadata_props.iter().find(|x| x.key == TRACE_METADATA_KEY).unwrap();
        let record: serde_json::Value = serde_json::from_str(&record.value).unwrap();
        assert_eq!(record["inputs"][0]["shape"], serde_json::json!([1, 3, 2]));
        assert_eq!(record["dynamic_axes"]["x"]["0"], "batch");
        assert_eq!(model.opset_import[0].version, 17);
    }

    #[test]
    fn undeclared_dynamic_output_axis() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(dir.path()).unwrap();
        let result = export_subgraph(&Affine { dynamic_output: false }, &out, &test_config());
        assert!(matches!(result, Err(ExportError::DynamicAxis(_))));
        assert!(!out.contains(ArtifactKey::VisionGraph));
    }

    #[test]
    fn coupling_mismatch() {
        let config = BlipConfig::default();
        let exported = ExportedGraph {
            stage: "vision_encoder",
            artifact: ArtifactKey::VisionGraph,
            graph_path: PathBuf::new(),
            weights_path: None,
            inputs: vec![],
            outputs: vec![TracedOutput {
                name: "image_features".to_string(),
                dtype: DType::F32,
                shape: vec![1, 197, 768],
                dynamic_axes: BTreeMap::new(),
            }],
            dynamic_axes: DynamicAxisSpec::new(),
            parameter_bytes: 0,
        };
        assert!(matches!(
            check_stage_coupling(&exported, &config),
            Err(ExportError::StageCoupling { expected: 577, actual: 197, .. })
        ));
    }
}
