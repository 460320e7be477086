use std::sync::Arc;
use crate::{elementwise_output_shape, onnx, Error};
use crate::node::{attr_float, attr_int, attr_ints, attr_tensor, Node, SingleOutputNode};
use crate::onnx::AttributeProto;
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorData};

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if dtype != DType::I32 && dtype != DType::I64 {
        Err(Error::InvalidDTypeError(dtype))?;
    }
    Ok(())
}

fn resolve_int_data(tensor: &dyn Tensor) -> Result<Vec<i64>, Error> {
    tensor.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()
}

macro_rules! elementwise_binary_op {
    ($name:ident, $onnx_type:literal) => {
        pub struct $name {
            name: Option<String>,
            a: Arc<dyn Tensor>,
            b: Arc<dyn Tensor>,
            output_shape: Shape
        }

        impl $name {
            pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
                let output_shape = elementwise_output_shape(&[a.clone(), b.clone()])?;
                Ok(Arc::new(Self { name, a, b, output_shape }))
            }
        }

        impl Node for $name {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.a.as_ref(), self.b.as_ref()]
            }
            fn get_output_tensors(&self) -> Vec<&dyn Tensor> { vec![self] }
            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }
            fn get_onnx_type(&self) -> &str {
                $onnx_type
            }
        }

        impl SingleOutputNode for $name {
            fn get_output_shape(&self) -> &Shape {
                &self.output_shape
            }
            fn get_output_dtype(&self) -> DType {
                self.a.dtype()
            }
        }
    };
}

elementwise_binary_op!(Add, "Add");
elementwise_binary_op!(Sub, "Sub");
elementwise_binary_op!(Mul, "Mul");

pub struct Erf {
    name: Option<String>,
    input: Arc<dyn Tensor>
}

impl Erf {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Erf> {
        Arc::new(Erf {
            name,
            input
        })
    }
}

impl Node for Erf {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Erf"
    }
}

impl SingleOutputNode for Erf {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape,
    dtype: DType
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        validate_index_dtype(indices.dtype())?;
        let data_shape = data.shape();
        let axis_index = data_shape.normalize_axis(axis)?;

        let mut output_dims = vec![];
        output_dims.extend_from_slice(&data_shape.dims[..axis_index]);
        output_dims.extend_from_slice(&indices.shape().dims);
        output_dims.extend_from_slice(&data_shape.dims[axis_index + 1..]);

        let dtype = data.dtype();
        Ok(Arc::new(Self {
            name,
            data,
            indices,
            axis,
            output_shape: Shape::new(output_dims),
            dtype
        }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Gather"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct LayerNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    axis: i64,
    epsilon: f32,
    stash_type: i64
}

impl SingleOutputNode for LayerNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

impl LayerNormalization {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, axis: i64, epsilon: f32, stash_type: i64) -> Result<Arc<Self>, Error> {
        if input.dtype() != scale.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), scale.dtype()));
        }
        let axis_index = input.shape().normalize_axis(axis)?;
        let normalized = Shape::new(input.shape().dims[axis_index..].to_vec());
        if &normalized != scale.shape() {
            return Err(Error::InputShapeError(format!("layer norm scale {} does not match normalized shape {}", scale.shape(), normalized)));
        }
        if let Some(bias) = &bias {
            if bias.shape() != scale.shape() {
                return Err(Error::InputShapeError(format!("layer norm bias {} does not match scale {}", bias.shape(), scale.shape())));
            }
        }
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            bias,
            axis,
            epsilon,
            stash_type
        }))
    }
}

impl Node for LayerNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.scale.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "LayerNormalization"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![
            attr_int("axis", self.axis),
            attr_float("epsilon", self.epsilon),
            attr_int("stash_type", self.stash_type),
        ])
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_dtype: DType,
    output_shape: Shape
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            Err(Error::DTypeMismatchError(a.dtype(), b.dtype()))?
        }
        let a_shape = if a.rank() == 1 {
            a.shape().unsqueeze(0)
        } else {
            a.shape().clone()
        };

        let b_shape = if b.rank() == 1 {
            b.shape().unsqueeze(1)
        } else {
            b.shape().clone()
        };

        if a_shape.dim(-1).as_ref() != b_shape.dim(-2).as_ref() {
            Err(Error::InputShapeError(format!("matmul {} x {}: inner dimensions differ", a.shape(), b.shape())))?
        }

        // Leading (batch) dimensions broadcast against each other
        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = a_batch.broadcast(&b_batch)?.dims;

        if a.rank() != 1 {
            output_dims.push(a_shape.dim(-2).clone());
        }
        if b.rank() != 1 {
            output_dims.push(b_shape.dim(-1).clone());
        }

        let output_dtype = a.dtype();
        let output_shape = Shape::new(output_dims);
        Ok(Arc::new(MatMul {
            name,
            a,
            b,
            output_dtype,
            output_shape
        }))
    }
}


impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel_shape: Vec<i64>,
    strides: Vec<i64>,
    pads: Vec<i64>,
    output_shape: Shape
}

impl Conv {
    /// 2-D convolution without dilation or grouping.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, strides: [usize; 2], pads: [usize; 2]) -> Result<Arc<Self>, Error> {
        if input.dtype() != weight.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), weight.dtype()));
        }
        if input.rank() != 4 || weight.rank() != 4 {
            return Err(Error::InputShapeError(format!("conv expects rank 4 input and weight, got {} and {}", input.shape(), weight.shape())));
        }
        let input_shape = input.shape();
        let weight_shape = weight.shape();
        if input_shape[1].as_ref() != weight_shape[1].as_ref() {
            return Err(Error::InputShapeError(format!("conv input {} has a different channel count than weight {}", input_shape, weight_shape)));
        }
        if let Some(bias) = &bias {
            if bias.rank() != 1 || bias.shape()[0].as_ref() != weight_shape[0].as_ref() {
                return Err(Error::InputShapeError(format!("conv bias {} does not match weight {}", bias.shape(), weight_shape)));
            }
        }

        let mut output_dims = vec![input_shape[0].clone(), weight_shape[0].clone()];
        let mut kernel_shape = vec![];
        for i in 0..2 {
            let spatial = &input_shape[2 + i];
            if spatial.is_dynamic() {
                return Err(Error::DynamicAxisFrozen(format!("conv spatial axis {} of {}", 2 + i, input_shape)));
            }
            let size = spatial.resolve()?;
            let kernel = weight_shape[2 + i].resolve()?;
            let padded = size + 2 * pads[i];
            if padded < kernel || strides[i] == 0 {
                return Err(Error::InputShapeError(format!("conv kernel {} does not fit input {}", weight_shape, input_shape)));
            }
            output_dims.push(Dimension::fixed((padded - kernel) / strides[i] + 1));
            kernel_shape.push(kernel as i64);
        }

        Ok(Arc::new(Self {
            name,
            input,
            weight,
            bias,
            kernel_shape,
            strides: strides.iter().map(|x| *x as i64).collect(),
            pads: pads.iter().chain(pads.iter()).map(|x| *x as i64).collect(),
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![
            attr_ints("kernel_shape", &self.kernel_shape),
            attr_ints("strides", &self.strides),
            attr_ints("pads", &self.pads),
            attr_ints("dilations", &[1, 1]),
            attr_int("group", 1),
        ])
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Concat {
    name: Option<String>,
    inputs: Vec<Arc<dyn Tensor>>,
    axis: i64,
    output_shape: Shape,
    output_dtype: DType
}

impl Concat {
    pub fn new(name: Option<String>, inputs: Vec<Arc<dyn Tensor>>, axis: i64) -> Result<Arc<Self>, Error> {
        if inputs.is_empty() {
            Err(Error::InvalidInputError("concat of zero tensors".to_string()))?;
        }
        for input in &inputs {
            if input.dtype() != inputs[0].dtype() {
                Err(Error::DTypeMismatchError(inputs[0].dtype(), input.dtype()))?;
            }
            if input.rank() != inputs[0].rank() {
                Err(Error::InputShapeError(format!("concat of {} and {}", inputs[0].shape(), input.shape())))?;
            }
        }
        let u_axis = inputs[0].shape().normalize_axis(axis)?;

        let output_dtype = inputs[0].dtype();
        let mut output_dims = vec![];
        for i in 0..inputs[0].rank() {
            if i == u_axis {
                let mut v = 0;
                for input in &inputs {
                    let dim = &input.shape()[i];
                    if dim.is_dynamic() {
                        Err(Error::DynamicAxisFrozen(format!("concat along axis {} of {}", i, input.shape())))?;
                    }
                    v += dim.resolve()?;
                }
                output_dims.push(Dimension::fixed(v));
            }
            else {
                for input in &inputs {
                    if input.shape()[i].as_ref() != inputs[0].shape()[i].as_ref() {
                        Err(Error::InputShapeError(format!("concat of {} and {}", inputs[0].shape(), input.shape())))?;
                    }
                }
                output_dims.push(inputs[0].shape()[i].clone());
            }
        }
        let output_shape = Shape::new(output_dims);
        Ok(Arc::new(Self {
            name,
            inputs,
            axis,
            output_dtype,
            output_shape
        }))
    }
}

impl Node for Concat {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        self.inputs.iter().map(|x| x.as_ref()).collect()
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Concat"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Concat {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: i64) -> Arc<Softmax> {
        Arc::new(Softmax {
            name,
            input,
            axis
        })
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Vec<i64>,
    output_shape: Shape
}

impl Transpose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<i64>>) -> Result<Arc<Transpose>, Error> {
        let rank = input.rank();
        let perm = perm.unwrap_or_else(|| (0..rank as i64).rev().collect());
        let mut seen = vec![false; rank];
        let mut output_dims = vec![];
        for axis in &perm {
            let axis = input.shape().normalize_axis(*axis)?;
            if seen[axis] {
                return Err(Error::InvalidInputError(format!("transpose permutation {:?} repeats axis {}", perm, axis)));
            }
            seen[axis] = true;
            output_dims.push(input.shape()[axis].clone());
        }
        if perm.len() != rank {
            return Err(Error::InvalidInputError(format!("transpose permutation {:?} does not cover rank {}", perm, rank)));
        }
        Ok(Arc::new(Transpose {
            name,
            input,
            perm,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_ints("perm", &self.perm)])
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    /// `shape` must resolve at trace time. `0` copies the input axis at the same position
    /// and `-1` is inferred. Dynamic input axes can only pass through a `0`.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Reshape>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(shape.dtype()))?
        }
        let requested = resolve_int_data(shape.as_ref())?;
        let input_shape = input.shape();

        for (i, dim) in input_shape.dims.iter().enumerate() {
            if dim.is_dynamic() && requested.get(i) != Some(&0) {
                Err(Error::DynamicAxisFrozen(format!("reshape of {} to {:?}", input_shape, requested)))?
            }
        }

        let mut output_dims: Vec<Option<Arc<Dimension>>> = vec![];
        let mut known_elements = 1usize;
        let mut infer_index = None;
        for (i, value) in requested.iter().enumerate() {
            match *value {
                0 => {
                    let dim = input_shape.dims.get(i).ok_or_else(|| Error::InvalidInputError(format!("reshape copies missing axis {} of {}", i, input_shape)))?;
                    known_elements *= dim.resolve()?;
                    output_dims.push(Some(dim.clone()));
                }
                -1 => {
                    if infer_index.replace(i).is_some() {
                        Err(Error::InvalidInputError(format!("reshape to {:?} infers more than one axis", requested)))?
                    }
                    output_dims.push(None);
                }
                v if v > 0 => {
                    known_elements *= v as usize;
                    output_dims.push(Some(Dimension::fixed(v as usize)));
                }
                v => Err(Error::InvalidInputError(format!("invalid reshape extent {}", v)))?
            }
        }

        let total = input_shape.num_elements()?;
        if let Some(index) = infer_index {
            if known_elements == 0 || total % known_elements != 0 {
                Err(Error::InputShapeError(format!("cannot reshape {} to {:?}", input_shape, requested)))?
            }
            output_dims[index] = Some(Dimension::fixed(total / known_elements));
        }
        else if known_elements != total {
            Err(Error::InputShapeError(format!("cannot reshape {} to {:?}", input_shape, requested)))?
        }

        let output_shape = Shape::new(output_dims.into_iter().flatten().collect());
        Ok(Arc::new(Reshape {
            name,
            input,
            shape,
            output_shape
        }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Unsqueeze {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Unsqueeze {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: Arc<dyn Tensor>) -> Result<Arc<Unsqueeze>, Error> {
        if axes.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(axes.dtype()))?
        }
        let output_rank = input.rank() + axes.shape().num_elements()?;
        let mut inserted = vec![];
        for axis in resolve_int_data(axes.as_ref())? {
            let axis = if axis < 0 { axis + output_rank as i64 } else { axis };
            if axis < 0 || axis >= output_rank as i64 {
                Err(Error::InvalidInputError(format!("unsqueeze axis {} out of range", axis)))?
            }
            inserted.push(axis as usize);
        }
        let mut input_dims = input.shape().dims.iter();
        let mut output_dims = vec![];
        for i in 0..output_rank {
            if inserted.contains(&i) {
                output_dims.push(Dimension::fixed(1));
            }
            else {
                output_dims.push(input_dims.next().ok_or(Error::InvalidInputError("unsqueeze axes repeat".to_string()))?.clone());
            }
        }
        Ok(Arc::new(Unsqueeze {
            name,
            input,
            axes,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Unsqueeze {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.axes.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Unsqueeze"
    }
}

impl SingleOutputNode for Unsqueeze {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Runtime shape of a tensor as a 1-D int64 tensor.
pub struct ShapeOp {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    output_shape: Shape
}

impl ShapeOp {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<ShapeOp> {
        let output_shape = Shape::from(vec![input.rank()]);
        Arc::new(ShapeOp {
            name,
            input,
            output_shape
        })
    }
}

impl Node for ShapeOp {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Shape"
    }
}

impl SingleOutputNode for ShapeOp {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        DType::I64
    }

    fn resolve_output_data(&self) -> Option<TensorData> {
        // Trace-time values only; dynamic axes differ at inference time
        if self.input.shape().has_dynamic_dims() {
            return None;
        }
        let dims = self.input.shape().resolve().ok()?;
        TensorData::vector(dims.into_iter().map(|x| x as i64).collect::<Vec<_>>()).ok()
    }
}

pub struct Slice {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    starts: Arc<dyn Tensor>,
    ends: Arc<dyn Tensor>,
    axes: Option<Arc<dyn Tensor>>,
    output_shape: Shape
}

impl Slice {
    /// Slice whose bounds are only known at runtime. `output_shape` describes the result for
    /// the traced inputs and must fit inside the input on every axis.
    pub fn new_with_output_shape(name: Option<String>, input: Arc<dyn Tensor>, starts: Arc<dyn Tensor>, ends: Arc<dyn Tensor>, axes: Option<Arc<dyn Tensor>>, output_shape: Shape) -> Result<Arc<Slice>, Error> {
        validate_index_dtype(starts.dtype())?;
        validate_index_dtype(ends.dtype())?;
        if let Some(axes) = &axes {
            validate_index_dtype(axes.dtype())?;
        }
        if output_shape.rank() != input.rank() {
            Err(Error::InputShapeError(format!("slice of {} cannot produce {}", input.shape(), output_shape)))?
        }
        for (out, inp) in output_shape.dims.iter().zip(input.shape().dims.iter()) {
            if out.resolve()? > inp.resolve()? {
                Err(Error::InputShapeError(format!("slice of {} cannot produce {}", input.shape(), output_shape)))?
            }
        }
        Ok(Arc::new(Slice {
            name,
            input,
            starts,
            ends,
            axes,
            output_shape
        }))
    }
}

impl Node for Slice {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.starts.as_ref(), self.ends.as_ref()];
        if let Some(axes) = &self.axes {
            inputs.push(axes.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Slice"
    }
}

impl SingleOutputNode for Slice {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Expand {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Expand {
    /// Broadcast `input` to a runtime shape. `output_shape` is that shape for the traced inputs.
    pub fn new_with_output_shape(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>, output_shape: Shape) -> Result<Arc<Expand>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(shape.dtype()))?
        }
        if shape.rank() != 1 || shape.shape()[0].resolve()? != output_shape.rank() {
            Err(Error::InputShapeError(format!("expand shape tensor {} does not describe {}", shape.shape(), output_shape)))?
        }
        if input.shape().broadcast(&output_shape)? != output_shape {
            Err(Error::InputShapeError(format!("cannot expand {} to {}", input.shape(), output_shape)))?
        }
        Ok(Arc::new(Expand {
            name,
            input,
            shape,
            output_shape
        }))
    }
}

impl Node for Expand {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Expand"
    }
}

impl SingleOutputNode for Expand {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct ConstantOfShape {
    name: Option<String>,
    shape: Arc<dyn Tensor>,
    value: TensorData,
    output_shape: Shape
}

impl ConstantOfShape {
    pub fn new_with_output_shape(name: Option<String>, shape: Arc<dyn Tensor>, value: TensorData, output_shape: Shape) -> Result<Arc<ConstantOfShape>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(shape.dtype()))?
        }
        if value.shape().num_elements()? != 1 {
            Err(Error::InvalidInputError(format!("fill value must hold one element, got {}", value.shape())))?
        }
        if shape.rank() != 1 || shape.shape()[0].resolve()? != output_shape.rank() {
            Err(Error::InputShapeError(format!("shape tensor {} does not describe {}", shape.shape(), output_shape)))?
        }
        Ok(Arc::new(ConstantOfShape {
            name,
            shape,
            value,
            output_shape
        }))
    }
}

impl Node for ConstantOfShape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "ConstantOfShape"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_tensor("value", &self.value)?])
    }
}

impl SingleOutputNode for ConstantOfShape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.value.dtype()
    }
}

pub struct Trilu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    upper: bool
}

impl Trilu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, upper: bool) -> Result<Arc<Trilu>, Error> {
        if input.rank() < 2 {
            Err(Error::InputShapeError(format!("trilu needs at least rank 2, got {}", input.shape())))?
        }
        Ok(Arc::new(Trilu {
            name,
            input,
            upper
        }))
    }
}

impl Node for Trilu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Trilu"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("upper", self.upper as i64)])
    }
}

impl SingleOutputNode for Trilu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_tensor("value", &self.data)?])
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("to", onnx::tensor_proto::DataType::from(self.to) as i64)])
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::InputTensor;

    fn input(name: &str, dims: Vec<Arc<Dimension>>) -> Arc<dyn Tensor> {
        InputTensor::new(name.to_string(), DType::F32, Shape::new(dims))
    }

    fn int_constant(values: Vec<i64>) -> Arc<dyn Tensor> {
        Constant::new(None, TensorData::vector(values).unwrap())
    }

    #[test]
    fn matmul_broadcasts_batch_dims() {
        let batch = Dimension::dynamic(1, "batch");
        let a = input("a", vec![batch.clone(), Dimension::fixed(4), Dimension::fixed(10), Dimension::fixed(8)]);
        let b = input("b", vec![Dimension::fixed(8), Dimension::fixed(3)]);
        let out = MatMul::new(None, a, b).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![1, 4, 10, 3]);
        assert!(out.shape()[0].is_dynamic());
    }

    #[test]
    fn matmul_rejects_inner_mismatch() {
        let a = input("a", vec![Dimension::fixed(2), Dimension::fixed(769)]);
        let b = input("b", vec![Dimension::fixed(768), Dimension::fixed(768)]);
        assert!(matches!(MatMul::new(None, a, b), Err(Error::InputShapeError(_))));
    }

    #[test]
    fn reshape_copies_and_infers() {
        let batch = Dimension::dynamic(1, "batch");
        let x = input("x", vec![batch, Dimension::fixed(6), Dimension::fixed(2), Dimension::fixed(2)]);
        let out = Reshape::new(None, x, int_constant(vec![0, 0, -1])).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![1, 6, 4]);
        assert_eq!(out.shape()[0].name.as_deref(), Some("batch"));
    }

    #[test]
    fn reshape_refuses_to_fold_dynamic_axis() {
        let batch = Dimension::dynamic(2, "batch");
        let x = input("x", vec![batch, Dimension::fixed(6)]);
        assert!(matches!(Reshape::new(None, x, int_constant(vec![-1])), Err(Error::DynamicAxisFrozen(_))));
    }

    #[test]
    fn conv_computes_patch_grid() {
        let batch = Dimension::dynamic(1, "batch");
        let pixels = input("pixel_values", vec![batch, Dimension::fixed(3), Dimension::fixed(384), Dimension::fixed(384)]);
        let weight = input("w", vec![Dimension::fixed(768), Dimension::fixed(3), Dimension::fixed(16), Dimension::fixed(16)]);
        let out = Conv::new(None, pixels, weight, None, [16, 16], [0, 0]).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![1, 768, 24, 24]);
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let pixels = input("pixel_values", vec![Dimension::fixed(1), Dimension::fixed(4), Dimension::fixed(32), Dimension::fixed(32)]);
        let weight = input("w", vec![Dimension::fixed(8), Dimension::fixed(3), Dimension::fixed(16), Dimension::fixed(16)]);
        assert!(Conv::new(None, pixels, weight, None, [16, 16], [0, 0]).is_err());
    }

    #[test]
    fn gather_embeds_token_ids() {
        let ids = InputTensor::new("input_ids".to_string(), DType::I64, Shape::new(vec![Dimension::dynamic(1, "batch"), Dimension::dynamic(10, "seq_len")]));
        let table = input("table", vec![Dimension::fixed(30), Dimension::fixed(8)]);
        let out = Gather::new(None, table, ids, 0).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![1, 10, 8]);
        assert!(out.shape()[1].is_dynamic());
    }

    #[test]
    fn unsqueeze_inserts_unit_axes() {
        let x = input("x", vec![Dimension::dynamic(1, "batch"), Dimension::dynamic(10, "seq_len")]);
        let out = Unsqueeze::new(None, x, int_constant(vec![1, 2])).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![1, 1, 1, 10]);
        assert!(out.shape()[3].is_dynamic());
    }

    #[test]
    fn expand_checks_target_shape() {
        let batch = Dimension::dynamic(3, "batch");
        let x = input("x", vec![Dimension::fixed(1), Dimension::fixed(1), Dimension::fixed(8)]);
        let target = Shape::new(vec![batch, Dimension::fixed(1), Dimension::fixed(8)]);
        let out = Expand::new_with_output_shape(None, x.clone(), int_constant(vec![3, 1, 8]), target).unwrap();
        assert!(out.shape()[0].is_dynamic());

        let wrong = Shape::from(vec![3usize, 1, 9]);
        assert!(Expand::new_with_output_shape(None, x, int_constant(vec![3, 1, 9]), wrong).is_err());
    }
}
