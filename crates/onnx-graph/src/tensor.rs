use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightExternalOutputManager;
use core::fmt;

/// One axis of a tensor shape.
///
/// `value` is the size observed while tracing. An axis that also carries a `name` is
/// dynamic: it is written to the graph as a symbolic `dim_param` and may take any size at
/// inference time. Axes without a name are frozen to `value`.
#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn fixed(value: usize) -> Arc<Self> {
        Self::new(Some(value), None, None)
    }

    pub fn dynamic(trace_value: usize, name: &str) -> Arc<Self> {
        Self::new(Some(trace_value), Some(name.to_string()), None)
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }

    pub fn is_dynamic(&self) -> bool {
        self.name.is_some()
    }

    /// Size 1 that may be broadcast. Dynamic axes never broadcast, even if the trace saw 1.
    pub(crate) fn is_broadcastable_one(&self) -> bool {
        !self.is_dynamic() && self.value == Some(1)
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match &value.name {
                Some(name) => Some(onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone())),
                None => value.value.map(|value| onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        if core::ptr::eq(*self, *other) {
            return true;
        }
        if self.name.is_some() || other.name.is_some() {
            return self.name == other.name && self.value == other.value;
        }
        matches!((self.value, other.value), (Some(a), Some(b)) if a == b)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.value) {
            (Some(name), Some(value)) => write!(f, "{}={}", name, value),
            (Some(name), None) => write!(f, "{}", name),
            (None, Some(value)) => write!(f, "{}", value),
            (None, None) => write!(f, "?"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        let mut res = vec![];
        for dim in &self.dims {
            res.push(dim.resolve()?);
        }
        Ok(res)
    }

    pub fn transpose(&self) -> Self {
        Self {
            dims: self.dims.iter().rev().cloned().collect()
        }
    }

    pub fn normalize_axis(&self, axis: i64) -> Result<usize, Error> {
        let rank = self.rank() as i64;
        let normalized = if axis < 0 { rank + axis } else { axis };
        if normalized < 0 || normalized >= rank {
            return Err(Error::InvalidInputError(format!("axis {} out of range for rank {}", axis, rank)));
        }
        Ok(normalized as usize)
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        let rank = self.rank();
        let index = if index < 0 {
            rank - (-index) as usize
        }
        else {
            index as usize
        };
        &self.dims[index]
    }

    pub fn unsqueeze(&self, axis: isize) -> Self {
        let rank = self.rank();
        let axis = if axis < 0 {
            rank + 1 - (-axis) as usize
        }
        else {
            axis as usize
        };
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::fixed(1));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }

    pub fn has_dynamic_dims(&self) -> bool {
        self.dims.iter().any(|dim| dim.is_dynamic())
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape, Error> {
        let rank = self.rank().max(other.rank());
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let a = (i + self.rank()).checked_sub(rank).map(|x| &self.dims[x]);
            let b = (i + other.rank()).checked_sub(rank).map(|x| &other.dims[x]);
            let dim = match (a, b) {
                (Some(a), None) => a.clone(),
                (None, Some(b)) => b.clone(),
                (Some(a), Some(b)) => {
                    if a.as_ref() == b.as_ref() {
                        if b.is_dynamic() && !a.is_dynamic() { b.clone() } else { a.clone() }
                    }
                    else if a.is_broadcastable_one() {
                        b.clone()
                    }
                    else if b.is_broadcastable_one() {
                        a.clone()
                    }
                    else {
                        return Err(Error::InputShapeError(format!("cannot broadcast {} with {}", self, other)));
                    }
                }
                (None, None) => unreachable!(),
            };
            dims.push(dim);
        }
        Ok(Shape::new(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("x"))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl Shape {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::fixed(*x)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    U16,
    I32,
    I64
}

impl DType {
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, Error> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::U16 => Ok(DType::U16),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::U16 => 2,
            DType::I64 => 8,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::U16 => onnx::tensor_proto::DataType::Uint16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered traversal state used when serializing a graph.
///
/// Nodes are recorded in post-order, so every node appears after the producers of its inputs.
#[derive(Default)]
pub struct GraphWalk<'a> {
    pub nodes: Vec<&'a dyn Node>,
    pub tensors: Vec<&'a dyn Tensor>,
    seen_nodes: HashSet<&'a dyn Node>,
    seen_tensors: HashSet<&'a dyn Tensor>,
}

impl<'a> GraphWalk<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit_tensor(&mut self, tensor: &'a dyn Tensor) {
        if !self.seen_tensors.insert(tensor) {
            return;
        }
        if let Some(node) = tensor.get_node() {
            self.visit_node(node);
        }
        self.tensors.push(tensor);
    }

    fn visit_node(&mut self, node: &'a dyn Node) {
        if !self.seen_nodes.insert(node) {
            return;
        }
        for input in node.get_input_tensors() {
            self.visit_tensor(input);
        }
        self.nodes.push(node);
    }
}

pub trait Tensor  {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// The node producing this tensor, if any.
    fn get_node(&self) -> Option<&dyn Node> {
        None
    }

    fn gather_weights<'a>(&'a self, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        Ok(())
    }

    fn get_initializer<'a>(&'a self, _name: String, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<onnx::TensorProto>, Error> {
        Ok(None)
    }

    /// Bytes of parameter data this tensor contributes to the serialized model.
    fn parameter_bytes(&self) -> usize {
        0
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}


impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn get_node(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn is_input(&self) -> bool {
        false
    }
}

/// A named graph input.
pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        if data.len() % dtype.size_in_bytes() != 0 {
            return Err(Error::InvalidInputError(format!("{} bytes is not a whole number of {} elements", data.len(), dtype)));
        }
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(data.chunks_exact(4).map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]])).collect()),
            DType::F16 => TensorDataValue::F16(data.chunks_exact(2).map(|x| half::f16::from_le_bytes([x[0], x[1]])).collect()),
            DType::BF16 => TensorDataValue::BF16(data.chunks_exact(2).map(|x| half::bf16::from_le_bytes([x[0], x[1]])).collect()),
            DType::I32 => TensorDataValue::I32(data.chunks_exact(4).map(|x| i32::from_le_bytes([x[0], x[1], x[2], x[3]])).collect()),
            DType::I64 => TensorDataValue::I64(data.chunks_exact(8).map(|x| i64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])).collect()),
            DType::U16 => Err(Error::UnsupportedDTypeError)?
        })
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<half::bf16>> for TensorDataValue {
    fn from(value: Vec<half::bf16>) -> Self {
        TensorDataValue::BF16(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError(format!("{} values do not fill shape {}", value.len(), shape)));
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    /// 1-D tensor holding `values`.
    pub fn vector<T>(values: Vec<T>) -> Result<Self, Error>
    where
        TensorDataValue: From<Vec<T>>,
    {
        let shape = Shape::from(vec![values.len()]);
        Self::new(TensorDataValue::from(values), shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(Error::UnsupportedDTypeError),
        }
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            _ => return Err(Error::UnsupportedDTypeError),
        };
        Self::new(value, shape)
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }

    pub fn from_safetensors_view(tensor: safetensors::tensor::TensorView) -> Result<Self, Error> {
        let dtype = DType::from_safetensors(tensor.dtype())?;
        let shape = Shape::from(tensor.shape());
        let value = TensorDataValue::from_raw_encoding(dtype, tensor.data())?;
        Self::new(value, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_dimension_is_written_as_param() {
        let batch = Dimension::dynamic(1, "batch");
        let proto = onnx::tensor_shape_proto::Dimension::from(batch.as_ref());
        assert_eq!(proto.value, Some(onnx::tensor_shape_proto::dimension::Value::DimParam("batch".to_string())));

        let width = Dimension::fixed(768);
        let proto = onnx::tensor_shape_proto::Dimension::from(width.as_ref());
        assert_eq!(proto.value, Some(onnx::tensor_shape_proto::dimension::Value::DimValue(768)));
    }

    #[test]
    fn broadcast_keeps_dynamic_axes() {
        let batch = Dimension::dynamic(1, "batch");
        let seq = Dimension::dynamic(10, "seq_len");
        let a = Shape::new(vec![batch.clone(), seq.clone(), Dimension::fixed(8)]);
        let b = Shape::new(vec![seq.clone(), Dimension::fixed(8)]);
        let out = a.broadcast(&b).unwrap();
        assert_eq!(out.rank(), 3);
        assert_eq!(out[0].name.as_deref(), Some("batch"));
        assert_eq!(out[1].name.as_deref(), Some("seq_len"));
        assert_eq!(out[2].value, Some(8));
    }

    #[test]
    fn broadcast_expands_static_ones() {
        let a = Shape::from(vec![2usize, 1, 4]);
        let b = Shape::from(vec![3usize, 1]);
        let out = a.broadcast(&b).unwrap();
        assert_eq!(out.resolve().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn dynamic_axis_traced_as_one_does_not_broadcast() {
        let a = Shape::new(vec![Dimension::dynamic(1, "batch"), Dimension::fixed(4)]);
        let b = Shape::from(vec![3usize, 4]);
        assert!(matches!(a.broadcast(&b), Err(Error::InputShapeError(_))));
    }

    #[test]
    fn raw_encoding_round_trips_through_dtype() {
        let value = TensorDataValue::from(vec![1.5f32, -2.0, 0.25]);
        let decoded = TensorDataValue::from_raw_encoding(DType::F32, &value.get_raw_encoding()).unwrap();
        match decoded {
            TensorDataValue::F32(v) => assert_eq!(v, vec![1.5, -2.0, 0.25]),
            other => panic!("unexpected value {:?}", other),
        }
        assert!(TensorDataValue::from_raw_encoding(DType::F32, &[0u8; 3]).is_err());
    }

    #[test]
    fn tensor_data_rejects_mismatched_shape() {
        let shape = Shape::from(vec![2usize, 2]);
        assert!(TensorData::new(vec![1i64, 2, 3].into(), shape).is_err());
    }
}
