pub mod operators;
pub mod weights;
pub mod tensor;
mod node;
pub mod pytorch;

pub mod onnx {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tensor::*;
use node::*;
use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightExternalOutputManager};

pub use tensor::{DType, Dimension, InputTensor, Shape, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape error: {0}")]
    InputShapeError(String),
    #[error("DType mismatch: {0} vs {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Unsupported dtype")]
    UnsupportedDTypeError,
    #[error("Name conflict: {0}")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Unresolved dimension")]
    UnresolvedDimensionError,
    #[error("Invalid dtype: {0}")]
    InvalidDTypeError(DType),
    #[error("Cannot resolve data")]
    CannotResolveDataError,
    #[error("Dynamic axis would be frozen by {0}")]
    DynamicAxisFrozen(String),
    #[error("Unbound graph input: {0}")]
    UnboundInputError(String),
    #[error("Safetensors error: {0}")]
    SafeTensorError(#[from] safetensors::SafeTensorError),
    #[error("Candle error: {0}")]
    CandleCoreError(#[from] candle_core::Error),
}

fn elementwise_output_shape(inputs: &[Arc<dyn Tensor>]) -> Result<Shape, Error> {
    let mut shape = inputs[0].shape().clone();
    for input in &inputs[1..] {
        if input.dtype() != inputs[0].dtype() {
            return Err(Error::DTypeMismatchError(inputs[0].dtype(), input.dtype()));
        }
        shape = shape.broadcast(input.shape())?;
    }
    Ok(shape)
}

/// Where parameter tensors end up when a graph is serialized.
#[derive(Clone, Debug, PartialEq)]
pub enum WeightStorageStrategy {
    EmbeddedData,
    BinFile(PathBuf)
}

/// Model-level header fields.
#[derive(Clone, Debug)]
pub struct GraphOptions {
    pub graph_name: String,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub metadata_props: Vec<(String, String)>
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            graph_name: String::new(),
            opset_version: 17,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata_props: vec![]
        }
    }
}

fn collect_initializers<'a>(
    tensors: &[&'a dyn Tensor],
    tensor_names: &HashMap<&'a dyn Tensor, String>,
    data_manager: &mut dyn WeightExternalOutputManager<'a>,
) -> Result<Vec<onnx::TensorProto>, Error> {
    for tensor in tensors.iter().copied() {
        tensor.gather_weights(data_manager)?;
    }
    data_manager.finalize_tensor_data()?;

    let mut initializers = vec![];
    for tensor in tensors.iter().copied() {
        if let Some(initializer) = tensor.get_initializer(tensor_names[&tensor].clone(), data_manager)? {
            initializers.push(initializer);
        }
    }
    Ok(initializers)
}

/// Sum of parameter bytes reachable from `outputs`.
pub fn parameter_bytes(outputs: &[(&str, Arc<dyn Tensor>)]) -> usize {
    let mut walk = GraphWalk::new();
    for (_, tensor) in outputs {
        walk.visit_tensor(tensor.as_ref());
    }
    walk.tensors.iter().map(|x| x.parameter_bytes()).sum()
}

/// Serializes the graph reachable from `outputs`.
///
/// Nodes are emitted in topological order. Tensors keep their requested names (weights keep
/// their checkpoint names, graph outputs take their labels) and the rest are numbered in
/// traversal order, so the same graph always serializes to the same structure.
pub fn build_proto(
    inputs: &[Arc<InputTensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    storage: &WeightStorageStrategy,
    options: &GraphOptions,
) -> Result<onnx::ModelProto, Error> {
    let mut walk = GraphWalk::new();
    for (_, tensor) in outputs {
        walk.visit_tensor(tensor.as_ref());
    }

    // Node names, de-duplicated in emission order
    let mut used_node_names: HashSet<String> = HashSet::new();
    let mut node_names: HashMap<&dyn Node, String> = HashMap::new();
    for node in &walk.nodes {
        if let Some(name) = node.get_name() {
            let mut candidate = name.to_string();
            let mut suffix = 1;
            while used_node_names.contains(&candidate) {
                candidate = format!("{}_{}", name, suffix);
                suffix += 1;
            }
            used_node_names.insert(candidate.clone());
            node_names.insert(*node, candidate);
        }
    }

    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();

    // Output labels first, then requested names
    for (name, tensor) in outputs {
        let name = name.to_string();
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name));
        }
        tensor_names.insert(tensor.as_ref(), name);
    }
    for tensor in &walk.tensors {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            let name = name.to_string();
            if !chosen_names.insert(name.clone()) {
                return Err(Error::NameConflictError(name));
            }
            tensor_names.insert(*tensor, name);
        }
    }
    let mut next_tensor_id = 0;
    for tensor in &walk.tensors {
        if !tensor_names.contains_key(tensor) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(*tensor, name);
        }
    }

    // Inputs must be declared or backed by checkpoint data, checked before anything is written
    for tensor in walk.tensors.iter().copied() {
        let bound = !tensor.is_input()
            || tensor.parameter_bytes() > 0
            || inputs.iter().any(|t| (t.as_ref() as &dyn Tensor) == tensor);
        if !bound {
            return Err(Error::UnboundInputError(tensor_names[&tensor].clone()));
        }
    }

    let initializers = match storage {
        WeightStorageStrategy::EmbeddedData => {
            collect_initializers(&walk.tensors, &tensor_names, &mut EmbeddedOutputManager::new())?
        }
        WeightStorageStrategy::BinFile(path) => {
            collect_initializers(&walk.tensors, &tensor_names, &mut BinOutputManager::new(path)?)?
        }
    };

    let mut graph_inputs = vec![];
    for tensor in inputs {
        let tensor: &dyn Tensor = tensor.as_ref();
        let name = match tensor_names.get(&tensor) {
            Some(name) => name.clone(),
            None => tensor.get_name().map(|x| x.to_string())
                .ok_or_else(|| Error::InvalidInputError("graph input without a name".to_string()))?
        };
        graph_inputs.push(tensor.to_value_info_proto(name));
    }

    let mut nodes = vec![];
    for node in &walk.nodes {
        nodes.push(node.to_node_proto(node_names.get(node).cloned(), &tensor_names)?);
    }

    let graph = onnx::GraphProto {
        name: options.graph_name.clone(),
        node: nodes,
        initializer: initializers,
        input: graph_inputs,
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        .. Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version: onnx::Version::IrVersion2021730 as i64,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version
        }],
        producer_name: options.producer_name.clone(),
        producer_version: options.producer_version.clone(),
        graph: Some(graph),
        metadata_props: options.metadata_props.iter()
            .map(|(key, value)| onnx::StringStringEntryProto { key: key.clone(), value: value.clone() })
            .collect(),
        .. Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Add, Constant, MatMul};

    fn small_graph() -> (Arc<InputTensor>, Arc<dyn Tensor>) {
        let batch = Dimension::dynamic(1, "batch");
        let x = InputTensor::new("x".to_string(), DType::F32, Shape::new(vec![batch, Dimension::fixed(2)]));
        let w = Constant::new(None, TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0].into(), Shape::from(vec![2usize, 2])).unwrap());
        let y = MatMul::new(None, x.clone(), w).unwrap();
        let out = Add::new(None, y, x.clone()).unwrap();
        (x, out)
    }

    #[test]
    fn nodes_are_topologically_ordered() {
        let (x, out) = small_graph();
        let proto = build_proto(&[x], &[("y", out)], &WeightStorageStrategy::EmbeddedData, &GraphOptions::default()).unwrap();
        let graph = proto.graph.unwrap();
        let ops: Vec<&str> = graph.node.iter().map(|x| x.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Constant", "MatMul", "Add"]);
        assert_eq!(graph.node[2].output, vec!["y".to_string()]);
        assert_eq!(graph.input[0].name, "x");
        assert_eq!(proto.opset_import[0].version, 17);
    }

    #[test]
    fn repeated_builds_are_identical() {
        let (x, out) = small_graph();
        let a = build_proto(&[x.clone()], &[("y", out.clone())], &WeightStorageStrategy::EmbeddedData, &GraphOptions::default()).unwrap();
        let b = build_proto(&[x], &[("y", out)], &WeightStorageStrategy::EmbeddedData, &GraphOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unbound_input_is_rejected() {
        let (_, out) = small_graph();
        let result = build_proto(&[], &[("y", out)], &WeightStorageStrategy::EmbeddedData, &GraphOptions::default());
        assert!(matches!(result, Err(Error::UnboundInputError(_))));
    }

    #[test]
    fn metadata_is_written() {
        let (x, out) = small_graph();
        let options = GraphOptions {
            metadata_props: vec![("trace".to_string(), "{}".to_string())],
            .. GraphOptions::default()
        };
        let proto = build_proto(&[x], &[("y", out)], &WeightStorageStrategy::EmbeddedData, &options).unwrap();
        assert_eq!(proto.metadata_props[0].key, "trace");
        assert_eq!(proto.ir_version, 8);
    }
}
