use std::sync::Arc;
use onnx_graph::operators::{Add, Cast, Concat, ConstantOfShape, Gather, MatMul, Mul, Slice, Softmax, Trilu};
use onnx_graph::pytorch::{cast, constant_i64, dim_size, gelu, layer_norm, linear, linear_from_tensors, mul_scalar, reshape, rsub_scalar, transpose, unsqueeze};
use onnx_graph::tensor::TensorData;
use onnx_graph::weights::WeightManager;
use onnx_graph::{DType, Shape, Tensor};
use crate::artifacts::ArtifactKey;
use crate::config::ExportConfig;
use crate::export::{DynamicAxisSpec, SyntheticFill, SyntheticInput};
use crate::loader::{BlipTextConfig, CheckpointWeights, CompositeModel};
use crate::wrapper::SubgraphWrapper;

/// `input_ids`, `attention_mask`, `encoder_hidden_states` -> `logits`.
///
/// The BLIP text decoder (a causal BERT with cross attention over the image features) and its
/// language modelling head. Every call scores the whole sequence; there is no key/value cache.
pub struct TextDecoderWrapper {
    weights: CheckpointWeights,
    config: BlipTextConfig,
    num_image_tokens: usize,
}

impl TextDecoderWrapper {
    pub fn new(model: &CompositeModel) -> Self {
        Self {
            weights: model.text_decoder(),
            config: model.config.text_config.clone(),
            num_image_tokens: model.config.vision_config.num_image_tokens(),
        }
    }

    /// Additive attention bias of shape `[batch, 1, seq, seq]`: 0 where a query may attend to a
    /// key (causal and not padding), the lowest f32 otherwise.
    fn causal_attention_bias(&self, input_ids: &Arc<dyn Tensor>, attention_mask: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let seq = input_ids.shape()[1].clone();
        let seq_len = dim_size(input_ids.clone(), 1)?;
        let square = Concat::new(None, vec![seq_len.clone(), seq_len], 0)?;
        let ones = ConstantOfShape::new_with_output_shape(
            None,
            square,
            TensorData::vector(vec![1.0f32])?,
            Shape::new(vec![seq.clone(), seq]),
        )?;
        let causal = Trilu::new(Some("text_decoder.causal_mask".to_string()), ones, false)?;

        let padding = Cast::new(None, attention_mask, DType::F32);
        let padding = unsqueeze(padding, vec![1, 2])?;
        let allowed = Mul::new(None, padding, causal)?;
        let blocked = rsub_scalar(allowed, 1.0)?;
        mul_scalar(blocked, f32::MIN)
    }

    fn split_heads(&self, x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let x = reshape(x, vec![0, 0, self.config.num_attention_heads as i64, self.config.head_dim() as i64])?;
        transpose(x, vec![0, 2, 1, 3])
    }

    /// BERT attention block: multi-head attention, output projection, residual and LayerNorm.
    /// `context` is the key/value source: the hidden states themselves, or the image features
    /// for cross attention.
    fn attention(&self, weights: &CheckpointWeights, hidden_states: Arc<dyn Tensor>, context: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let self_weights = weights.prefix("self");
        let query = self.split_heads(linear(&self_weights.prefix("query"), hidden_states.clone())?)?;
        let key = self.split_heads(linear(&self_weights.prefix("key"), context.clone())?)?;
        let value = self.split_heads(linear(&self_weights.prefix("value"), context)?)?;

        let scores = MatMul::new(None, query, transpose(key, vec![0, 1, 3, 2])?)?;
        let mut scores = mul_scalar(scores, 1.0 / (self.config.head_dim() as f32).sqrt())?;
        if let Some(bias) = bias {
            scores = Add::new(None, scores, bias)?;
        }
        let probs = Softmax::new(None, scores, -1);
        let attended = MatMul::new(None, probs, value)?;
        let attended = transpose(attended, vec![0, 2, 1, 3])?;
        let attended = reshape(attended, vec![0, 0, self.config.hidden_size as i64])?;

        let output_weights = weights.prefix("output");
        let projected = linear(&output_weights.prefix("dense"), attended)?;
        let summed = Add::new(None, projected, hidden_states)?;
        Ok(layer_norm(&output_weights.prefix("LayerNorm"), summed, self.config.layer_norm_eps as f32)?)
    }

    fn decoder_layer(&self, weights: &CheckpointWeights, hidden_states: Arc<dyn Tensor>, encoder_hidden_states: &Arc<dyn Tensor>, bias: &Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let x = self.attention(&weights.prefix("attention"), hidden_states.clone(), hidden_states, Some(bias.clone()))?;
        let x = self.attention(&weights.prefix("crossattention"), x, encoder_hidden_states.clone(), None)?;

        let intermediate = linear(&weights.prefix("intermediate").prefix("dense"), x.clone())?;
        let intermediate = gelu(intermediate)?;
        let output_weights = weights.prefix("output");
        let output = linear(&output_weights.prefix("dense"), intermediate)?;
        let summed = Add::new(None, output, x)?;
        Ok(layer_norm(&output_weights.prefix("LayerNorm"), summed, self.config.layer_norm_eps as f32)?)
    }
}

impl SubgraphWrapper for TextDecoderWrapper {
    fn stage(&self) -> &'static str {
        "text_decoder"
    }

    fn artifact(&self) -> ArtifactKey {
        ArtifactKey::DecoderGraph
    }

    fn input_names(&self) -> &'static [&'static str] {
        &["input_ids", "attention_mask", "encoder_hidden_states"]
    }

    fn output_names(&self) -> &'static [&'static str] {
        &["logits"]
    }

    fn synthetic_inputs(&self, config: &ExportConfig) -> Vec<SyntheticInput> {
        let batch = config.trace_batch_size;
        let seq = config.trace_sequence_length;
        vec![
            SyntheticInput::new("input_ids", DType::I64, vec![batch, seq], SyntheticFill::Ones),
            SyntheticInput::new("attention_mask", DType::I64, vec![batch, seq], SyntheticFill::Ones),
            SyntheticInput::new(
                "encoder_hidden_states",
                DType::F32,
                vec![batch, self.num_image_tokens, self.config.encoder_hidden_size],
                SyntheticFill::Uniform,
            ),
        ]
    }

    fn dynamic_axes(&self) -> DynamicAxisSpec {
        DynamicAxisSpec::new()
            .axis("input_ids", 0, "batch")
            .axis("input_ids", 1, "seq_len")
            .axis("attention_mask", 0, "batch")
            .axis("attention_mask", 1, "seq_len")
            .axis("encoder_hidden_states", 0, "batch")
            .axis("logits", 0, "batch")
            .axis("logits", 1, "seq_len")
    }

    fn forward(&self, inputs: &[Arc<dyn Tensor>]) -> Result<Vec<Arc<dyn Tensor>>, onnx_graph::Error> {
        let [input_ids, attention_mask, encoder_hidden_states] = inputs else {
            return Err(onnx_graph::Error::InvalidInputError(format!("text decoder takes 3 inputs, got {}", inputs.len())));
        };
        let eps = self.config.layer_norm_eps as f32;
        let bert = self.weights.prefix("bert");
        let embeddings = bert.prefix("embeddings");

        // Fetched once: the vocabulary projection may be tied to it
        let word_embeddings = embeddings.get_tensor("word_embeddings.weight")?;
        let words = Gather::new(Some("text_decoder.bert.embeddings.word_embeddings".to_string()), word_embeddings.clone(), input_ids.clone(), 0)?;

        // Absolute positions 0..seq_len, cut from the table at runtime
        let position_table = embeddings.get_tensor("position_embeddings.weight")?;
        let positions = Slice::new_with_output_shape(
            Some("text_decoder.bert.embeddings.position_embeddings".to_string()),
            position_table.clone(),
            constant_i64(vec![0])?,
            dim_size(input_ids.clone(), 1)?,
            Some(constant_i64(vec![0])?),
            Shape::new(vec![input_ids.shape()[1].clone(), position_table.shape()[1].clone()]),
        )?;
        let x = Add::new(None, words, cast(positions, word_embeddings.dtype()))?;
        let mut hidden_states: Arc<dyn Tensor> = layer_norm(&embeddings.prefix("LayerNorm"), x, eps)?;

        let encoder_hidden_states = cast(encoder_hidden_states.clone(), hidden_states.dtype());
        let bias = self.causal_attention_bias(input_ids, attention_mask.clone())?;
        let bias = cast(bias, hidden_states.dtype());

        let layers = bert.prefix("encoder");
        for i in 0..self.config.num_hidden_layers {
            hidden_states = self.decoder_layer(&layers.prefix(&format!("layer.{i}")), hidden_states, &encoder_hidden_states, &bias)?;
        }

        let predictions = self.weights.prefix("cls").prefix("predictions");
        let transform = predictions.prefix("transform");
        let x = linear(&transform.prefix("dense"), hidden_states)?;
        let x = gelu(x)?;
        let x = layer_norm(&transform.prefix("LayerNorm"), x, eps)?;

        let decoder_weight = match predictions.get_optional_tensor("decoder.weight")? {
            Some(weight) => weight,
            None => word_embeddings,
        };
        let decoder_bias = match predictions.get_optional_tensor("decoder.bias")? {
            Some(bias) => Some(bias),
            None => predictions.get_optional_tensor("bias")?,
        };
        let logits = linear_from_tensors(Some("text_decoder.cls.predictions.decoder".to_string()), decoder_weight, decoder_bias, x)?;
        Ok(vec![logits])
    }
}
