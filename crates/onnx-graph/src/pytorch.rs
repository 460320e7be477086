//! Building blocks that mirror the PyTorch layers checkpoints are usually saved from.

use std::sync::Arc;
use crate::{operators, Error};
use crate::operators::LayerNormalization;
use crate::tensor::{DType, Shape, Tensor, TensorData, TensorDataValue};
use crate::weights::WeightManager;

/// `nn.Linear`: `input @ weight^T + bias`, with the weight stored as `[out_features, in_features]`.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    linear_from_tensors(
        weight_manager.get_prefix().map(|x| x.to_string()),
        weight_manager.get_tensor("weight")?,
        weight_manager.get_optional_tensor("bias")?,
        input
    )
}

/// `linear` over tensors that do not come from a single prefix, such as tied embeddings.
pub fn linear_from_tensors(name: Option<String>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let dtype = input.dtype();
    let weight_t = operators::Transpose::new(name.as_ref().map(|x| format!("{}.weight_t", x)), cast(weight, dtype), Some(vec![1, 0]))?;
    let mat_out = operators::MatMul::new(name.clone(), input, weight_t)?;

    if let Some(bias) = bias {
        Ok(operators::Add::new(name.map(|x| format!("{}.bias_add", x)), mat_out, cast(bias, dtype))?)
    } else {
        Ok(mat_out)
    }
}

pub fn layer_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<LayerNormalization>, Error> {
    let dtype = input.dtype();
    LayerNormalization::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        cast(weight_manager.get_tensor("weight")?, dtype),
        weight_manager.get_optional_tensor("bias")?.map(|x| cast(x, dtype)),
        -1,
        epsilon,
        1
    )
}

/// Casts `input` unless it already has `dtype`.
pub fn cast(input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
    if input.dtype() == dtype {
        input
    } else {
        operators::Cast::new(None, input, dtype)
    }
}

pub fn constant_i64(values: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Constant::new(None, TensorData::vector(values)?))
}

/// Rank-0 constant with the same dtype as `like`.
pub fn scalar_like(like: &dyn Tensor, value: f32) -> Result<Arc<dyn Tensor>, Error> {
    let value = match like.dtype() {
        DType::F32 => TensorDataValue::F32(vec![value]),
        DType::F16 => TensorDataValue::F16(vec![half::f16::from_f32(value)]),
        DType::BF16 => TensorDataValue::BF16(vec![half::bf16::from_f32(value)]),
        DType::I32 => TensorDataValue::I32(vec![value as i32]),
        DType::I64 => TensorDataValue::I64(vec![value as i64]),
        DType::U16 => Err(Error::UnsupportedDTypeError)?,
    };
    Ok(operators::Constant::new(None, TensorData::new(value, Shape::new(vec![]))?))
}

pub fn mul_scalar(input: Arc<dyn Tensor>, value: f32) -> Result<Arc<dyn Tensor>, Error> {
    let scalar = scalar_like(input.as_ref(), value)?;
    Ok(operators::Mul::new(None, input, scalar)?)
}

pub fn add_scalar(input: Arc<dyn Tensor>, value: f32) -> Result<Arc<dyn Tensor>, Error> {
    let scalar = scalar_like(input.as_ref(), value)?;
    Ok(operators::Add::new(None, input, scalar)?)
}

/// `value - input`
pub fn rsub_scalar(input: Arc<dyn Tensor>, value: f32) -> Result<Arc<dyn Tensor>, Error> {
    let scalar = scalar_like(input.as_ref(), value)?;
    Ok(operators::Sub::new(None, scalar, input)?)
}

pub fn reshape(input: Arc<dyn Tensor>, dims: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Reshape::new(None, input, constant_i64(dims)?)?)
}

pub fn unsqueeze(input: Arc<dyn Tensor>, axes: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Unsqueeze::new(None, input, constant_i64(axes)?)?)
}

pub fn transpose(input: Arc<dyn Tensor>, perm: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Transpose::new(None, input, Some(perm))?)
}

/// Runtime size of one axis, as an int64 tensor of shape `[1]`.
pub fn dim_size(input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<dyn Tensor>, Error> {
    let axis = input.shape().normalize_axis(axis)? as i64;
    let shape = operators::ShapeOp::new(None, input);
    Ok(operators::Gather::new(None, shape, constant_i64(vec![axis])?, 0)?)
}

/// Exact (erf based) GELU: `0.5 * x * (1 + erf(x / sqrt(2)))`.
pub fn gelu(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let scaled = mul_scalar(input.clone(), std::f32::consts::FRAC_1_SQRT_2)?;
    let erf = operators::Erf::new(None, scaled);
    let shifted = add_scalar(erf, 1.0)?;
    let product = operators::Mul::new(None, input, shifted)?;
    mul_scalar(product, 0.5)
}
