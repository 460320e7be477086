use std::sync::Arc;
use onnx_graph::operators::{Add, Concat, Constant, Conv, Expand, Gather, MatMul, Softmax};
use onnx_graph::pytorch::{cast, constant_i64, dim_size, gelu, layer_norm, linear, mul_scalar, reshape, transpose};
use onnx_graph::tensor::TensorData;
use onnx_graph::weights::WeightManager;
use onnx_graph::{DType, Shape, Tensor};
use crate::artifacts::ArtifactKey;
use crate::config::ExportConfig;
use crate::export::{DynamicAxisSpec, SyntheticFill, SyntheticInput};
use crate::loader::{BlipVisionConfig, CheckpointWeights, CompositeModel};
use crate::wrapper::SubgraphWrapper;

/// `pixel_values` -> `image_features`: the last hidden state of the BLIP vision transformer.
pub struct VisionEncoderWrapper {
    weights: CheckpointWeights,
    config: BlipVisionConfig,
}

impl VisionEncoderWrapper {
    pub fn new(model: &CompositeModel) -> Self {
        Self {
            weights: model.vision_model(),
            config: model.config.vision_config.clone(),
        }
    }

    fn embeddings(&self, pixel_values: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let weights = self.weights.prefix("embeddings");
        let patch_weights = weights.prefix("patch_embedding");
        let patch = self.config.patch_size;
        let dtype = pixel_values.dtype();

        let patches = Conv::new(
            Some("vision_model.embeddings.patch_embedding".to_string()),
            pixel_values.clone(),
            cast(patch_weights.get_tensor("weight")?, dtype),
            patch_weights.get_optional_tensor("bias")?.map(|x| cast(x, dtype)),
            [patch, patch],
            [0, 0],
        )?;
        // [batch, hidden, grid, grid] -> [batch, patches, hidden]
        let patches = reshape(patches, vec![0, 0, self.config.num_patches() as i64])?;
        let patches = transpose(patches, vec![0, 2, 1])?;

        // The class token is shared across the batch, so it is broadcast to the runtime batch size
        let class_embedding = cast(weights.get_tensor("class_embedding")?, dtype);
        let batch = pixel_values.shape()[0].clone();
        let hidden = class_embedding.shape()[2].clone();
        let expand_shape = Concat::new(None, vec![dim_size(pixel_values, 0)?, constant_i64(vec![1, hidden.resolve()? as i64])?], 0)?;
        let class_tokens: Arc<dyn Tensor> = Expand::new_with_output_shape(
            Some("vision_model.embeddings.class_embedding_expand".to_string()),
            class_embedding.clone(),
            expand_shape,
            Shape::new(vec![batch, class_embedding.shape()[1].clone(), hidden]),
        )?;

        let tokens = Concat::new(None, vec![class_tokens, patches], 1)?;
        let positions = cast(weights.get_tensor("position_embedding")?, dtype);
        Ok(Add::new(Some("vision_model.embeddings.add_positions".to_string()), tokens, positions)?)
    }

    fn attention(&self, weights: &CheckpointWeights, hidden_states: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let heads = self.config.num_attention_heads as i64;
        let head_dim = self.config.head_dim() as i64;

        // Fused projection: [batch, tokens, 3 * hidden] -> [3, batch, heads, tokens, head_dim]
        let qkv = linear(&weights.prefix("qkv"), hidden_states)?;
        let qkv = reshape(qkv, vec![0, 0, 3, heads, head_dim])?;
        let qkv = transpose(qkv, vec![2, 0, 3, 1, 4])?;

        let select = |index: i64| -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
            let index = Constant::new(None, TensorData::new(vec![index].into(), Shape::new(vec![]))?);
            Ok(Gather::new(None, qkv.clone(), index, 0)?)
        };
        let query = select(0)?;
        let key = select(1)?;
        let value = select(2)?;

        let scores = MatMul::new(None, query, transpose(key, vec![0, 1, 3, 2])?)?;
        let scores = mul_scalar(scores, 1.0 / (head_dim as f32).sqrt())?;
        let probs = Softmax::new(None, scores, -1);
        let context = MatMul::new(None, probs, value)?;

        let context = transpose(context, vec![0, 2, 1, 3])?;
        let context = reshape(context, vec![0, 0, self.config.hidden_size as i64])?;
        linear(&weights.prefix("projection"), context)
    }

    fn encoder_layer(&self, weights: &CheckpointWeights, hidden_states: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let eps = self.config.layer_norm_eps as f32;

        let residual = hidden_states.clone();
        let x = layer_norm(&weights.prefix("layer_norm1"), hidden_states, eps)?;
        let x = self.attention(&weights.prefix("self_attn"), x)?;
        let hidden_states: Arc<dyn Tensor> = Add::new(None, residual, x)?;

        let residual = hidden_states.clone();
        let x = layer_norm(&weights.prefix("layer_norm2"), hidden_states, eps)?;
        let mlp = weights.prefix("mlp");
        let x = linear(&mlp.prefix("fc1"), x)?;
        let x = gelu(x)?;
        let x = linear(&mlp.prefix("fc2"), x)?;
        Ok(Add::new(None, residual, x)?)
    }
}

impl SubgraphWrapper for VisionEncoderWrapper {
    fn stage(&self) -> &'static str {
        "vision_encoder"
    }

    fn artifact(&self) -> ArtifactKey {
        ArtifactKey::VisionGraph
    }

    fn input_names(&self) -> &'static [&'static str] {
        &["pixel_values"]
    }

    fn output_names(&self) -> &'static [&'static str] {
        &["image_features"]
    }

    fn synthetic_inputs(&self, config: &ExportConfig) -> Vec<SyntheticInput> {
        vec![SyntheticInput::new(
            "pixel_values",
            DType::F32,
            vec![config.trace_batch_size, self.config.num_channels, self.config.image_size, self.config.image_size],
            SyntheticFill::Uniform,
        )]
    }

    fn dynamic_axes(&self) -> DynamicAxisSpec {
        DynamicAxisSpec::new()
            .axis("pixel_values", 0, "batch")
            .axis("image_features", 0, "batch")
    }

    fn forward(&self, inputs: &[Arc<dyn Tensor>]) -> Result<Vec<Arc<dyn Tensor>>, onnx_graph::Error> {
        let [pixel_values] = inputs else {
            return Err(onnx_graph::Error::InvalidInputError(format!("vision encoder takes 1 input, got {}", inputs.len())));
        };
        let mut hidden_states = self.embeddings(pixel_values.clone())?;

        let layers = self.weights.prefix("encoder");
        for i in 0..self.config.num_hidden_layers {
            hidden_states = self.encoder_layer(&layers.prefix(&format!("layers.{i}")), hidden_states)?;
        }

        let output: Arc<dyn Tensor> = layer_norm(&self.weights.prefix("post_layernorm"), hidden_states, self.config.layer_norm_eps as f32)?;
        Ok(vec![output])
    }
}
