//! Re-runs exported graphs through ONNX Runtime, an evaluator independent of the graph builder.

use ndarray::{ArrayD, IxDyn};
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use onnx_graph::DType;
use crate::artifacts::ArtifactKey;
use crate::export::{ExportedGraph, SyntheticFill, SyntheticInput};
use crate::ExportError;

/// Shapes seen in one evaluation of an exported graph.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationRun {
    pub inputs: Vec<(String, Vec<usize>)>,
    pub outputs: Vec<(String, Vec<usize>)>,
}

fn validation_error(artifact: ArtifactKey, message: impl ToString) -> ExportError {
    ExportError::Validation {
        artifact: artifact.file_name(),
        message: message.to_string(),
    }
}

/// A value fed to an exported graph.
#[derive(Clone, Debug)]
pub enum GraphInput {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl GraphInput {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            GraphInput::F32(x) => x.shape().to_vec(),
            GraphInput::I64(x) => x.shape().to_vec(),
        }
    }

    fn into_value(self) -> Result<DynValue, ort::Error> {
        Ok(match self {
            GraphInput::F32(x) => Tensor::from_array(x)?.into_dyn(),
            GraphInput::I64(x) => Tensor::from_array(x)?.into_dyn(),
        })
    }
}

/// An exported graph loaded into an ONNX Runtime session. Companion weight files are resolved
/// relative to the graph.
pub struct GraphSession {
    artifact: ArtifactKey,
    output_names: Vec<String>,
    session: Session,
}

impl GraphSession {
    pub fn open(exported: &ExportedGraph) -> Result<Self, ExportError> {
        let builder = Session::builder().map_err(|x| validation_error(exported.artifact, x))?;
        let session = builder.commit_from_file(&exported.graph_path)
            .map_err(|x| validation_error(exported.artifact, x))?;
        Ok(Self {
            artifact: exported.artifact,
            output_names: exported.outputs.iter().map(|x| x.name.clone()).collect(),
            session,
        })
    }

    /// Runs the graph and returns every output, in declaration order, as f32.
    pub fn run(&mut self, inputs: Vec<(String, GraphInput)>) -> Result<Vec<(String, ArrayD<f32>)>, ExportError> {
        let artifact = self.artifact;
        let mut values = vec![];
        for (name, input) in inputs {
            values.push((name, input.into_value().map_err(|x| validation_error(artifact, x))?));
        }
        let outputs = self.session.run(values).map_err(|x| validation_error(artifact, x))?;

        let mut results = vec![];
        for name in &self.output_names {
            let value = outputs.get(name.as_str())
                .ok_or_else(|| validation_error(artifact, format!("no output named {name}")))?;
            let array = value.try_extract_array::<f32>().map_err(|x| validation_error(artifact, x))?;
            results.push((name.clone(), array.to_owned()));
        }
        Ok(results)
    }
}

fn synthetic_input(input: &SyntheticInput, shape: &[usize], rng: &mut StdRng) -> Result<GraphInput, String> {
    let count: usize = shape.iter().product();
    let shape = IxDyn(shape);
    let input = match (input.dtype, input.fill) {
        (DType::F32, SyntheticFill::Uniform) => {
            let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            GraphInput::F32(ArrayD::from_shape_vec(shape, values).map_err(|x| x.to_string())?)
        }
        (DType::F32, SyntheticFill::Ones) => GraphInput::F32(ArrayD::ones(shape)),
        (DType::I64, _) => GraphInput::I64(ArrayD::ones(shape)),
        (dtype, _) => return Err(format!("no synthetic values for {} of type {:?}", input.name, dtype)),
    };
    Ok(input)
}

/// Input shapes with every dynamic axis grown by `grow`.
fn grown_shapes(exported: &ExportedGraph, grow: usize) -> Vec<Vec<usize>> {
    exported.inputs.iter().map(|input| {
        input.shape.iter().enumerate().map(|(i, &size)| {
            if exported.dynamic_axes.get(&input.name, i).is_some() { size + grow } else { size }
        }).collect()
    }).collect()
}

fn run_once(exported: &ExportedGraph, session: &mut GraphSession, grow: usize, rng: &mut StdRng) -> Result<ValidationRun, ExportError> {
    let shapes = grown_shapes(exported, grow);
    let mut inputs = vec![];
    for (input, shape) in exported.inputs.iter().zip(&shapes) {
        let value = synthetic_input(input, shape, rng).map_err(|x| validation_error(exported.artifact, x))?;
        inputs.push((input.name.clone(), value));
    }

    let outputs = session.run(inputs)?;

    let mut output_shapes = vec![];
    for (traced, (name, values)) in exported.outputs.iter().zip(&outputs) {
        let expected: Vec<usize> = traced.shape.iter().enumerate()
            .map(|(i, &size)| if traced.dynamic_axes.contains_key(&i) { size + grow } else { size })
            .collect();
        let actual = values.shape().to_vec();
        if actual != expected {
            return Err(validation_error(exported.artifact, format!("{name} has shape {actual:?}, expected {expected:?}")));
        }
        if let Some(position) = values.iter().position(|x| !x.is_finite()) {
            return Err(validation_error(exported.artifact, format!("{name} has a non-finite value at flat index {position}")));
        }
        output_shapes.push((name.clone(), actual));
    }

    Ok(ValidationRun {
        inputs: exported.inputs.iter().map(|x| x.name.clone()).zip(shapes).collect(),
        outputs: output_shapes,
    })
}

/// Evaluates `exported` at its trace shapes, then with every dynamic axis one larger, and checks
/// the output shapes follow.
pub fn validate_graph(exported: &ExportedGraph, seed: u64) -> Result<Vec<ValidationRun>, ExportError> {
    let mut session = GraphSession::open(exported)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut runs = vec![];
    for grow in [0, 1] {
        let run = run_once(exported, &mut session, grow, &mut rng)?;
        info!("Validated {} with {:?}", exported.artifact, run.inputs);
        runs.push(run);
    }
    Ok(runs)
}
