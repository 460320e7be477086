#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use safetensors::tensor::TensorView;
use tempfile::TempDir;
use blip_onnx_export::ExportConfig;

pub const HIDDEN: usize = 16;
pub const INTERMEDIATE: usize = 32;
pub const LAYERS: usize = 2;
pub const HEADS: usize = 2;
pub const IMAGE_SIZE: usize = 32;
pub const PATCH_SIZE: usize = 16;
/// Four patches and the class token.
pub const IMAGE_TOKENS: usize = 5;
pub const MAX_POSITIONS: usize = 32;
pub const TOKENS: [&str; 8] = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[DEC]", "a", "photo", "##s"];
pub const VOCAB: usize = TOKENS.len();

/// Options for the generated checkpoint.
#[derive(Clone, Debug)]
pub struct TinyOptions {
    /// Ship `cls.predictions.decoder.weight`; otherwise the head reuses the word embeddings.
    pub untied_decoder: bool,
    /// WordPiece tokenizer (writes its own vocab.txt) or WordLevel (needs the source vocab.txt).
    pub wordpiece: bool,
    pub ship_vocab: bool,
    pub ship_tokenizer: bool,
    pub encoder_hidden_size: usize,
    pub preprocessor_size: usize,
}

impl Default for TinyOptions {
    fn default() -> Self {
        Self {
            untied_decoder: true,
            wordpiece: true,
            ship_vocab: true,
            ship_tokenizer: true,
            encoder_hidden_size: HIDDEN,
            preprocessor_size: IMAGE_SIZE,
        }
    }
}

/// A BLIP shaped checkpoint with small widths, laid out like a hub snapshot.
pub struct TinyCheckpoint {
    pub dir: TempDir,
}

impl TinyCheckpoint {
    pub fn new() -> Self {
        Self::with_options(TinyOptions::default())
    }

    pub fn with_options(options: TinyOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("blip-tiny");
        fs::create_dir(&model_dir).unwrap();
        write_config(&model_dir, &options);
        write_weights(&model_dir, &options);
        write_tokenizer(&model_dir, &options);
        Self { dir }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.dir.path().join("blip-tiny")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("models")
    }

    pub fn config(&self) -> ExportConfig {
        ExportConfig {
            model_id: self.model_dir().to_string_lossy().to_string(),
            output_dir: self.output_dir(),
            validate: false,
            ..Default::default()
        }
    }
}

fn write_config(dir: &Path, options: &TinyOptions) {
    let config = serde_json::json!({
        "architectures": ["BlipForConditionalGeneration"],
        "vision_config": {
            "hidden_size": HIDDEN,
            "intermediate_size": INTERMEDIATE,
            "num_hidden_layers": LAYERS,
            "num_attention_heads": HEADS,
            "image_size": IMAGE_SIZE,
            "patch_size": PATCH_SIZE,
            "layer_norm_eps": 1e-5,
            "hidden_act": "gelu"
        },
        "text_config": {
            "vocab_size": VOCAB,
            "hidden_size": HIDDEN,
            "encoder_hidden_size": options.encoder_hidden_size,
            "intermediate_size": INTERMEDIATE,
            "num_hidden_layers": LAYERS,
            "num_attention_heads": HEADS,
            "max_position_embeddings": MAX_POSITIONS,
            "layer_norm_eps": 1e-12,
            "hidden_act": "gelu"
        }
    });
    fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let preprocessor = serde_json::json!({
        "do_normalize": true,
        "image_mean": [0.48145466, 0.4578275, 0.40821073],
        "image_std": [0.26862954, 0.26130258, 0.27577711],
        "size": {"height": options.preprocessor_size, "width": options.preprocessor_size}
    });
    fs::write(dir.join("preprocessor_config.json"), serde_json::to_string_pretty(&preprocessor).unwrap()).unwrap();
}

struct WeightWriter {
    tensors: Vec<(String, Vec<usize>, Vec<u8>)>,
    counter: usize,
}

impl WeightWriter {
    /// Small deterministic values, varied enough that every layer does something.
    fn add(&mut self, name: String, shape: Vec<usize>) {
        let count: usize = shape.iter().product();
        let bytes = (0..count)
            .map(|i| {
                let x = ((i * 37 + self.counter * 11) % 23) as f32 / 23.0 - 0.5;
                x * 0.2
            })
            .flat_map(|x| x.to_le_bytes())
            .collect();
        self.counter += 1;
        self.tensors.push((name, shape, bytes));
    }

    fn fill(&mut self, name: String, shape: Vec<usize>, value: f32) {
        let count: usize = shape.iter().product();
        let bytes = std::iter::repeat_n(value, count).flat_map(|x| x.to_le_bytes()).collect();
        self.tensors.push((name, shape, bytes));
    }

    fn linear(&mut self, prefix: &str, out_features: usize, in_features: usize) {
        self.add(format!("{prefix}.weight"), vec![out_features, in_features]);
        self.add(format!("{prefix}.bias"), vec![out_features]);
    }

    fn layer_norm(&mut self, prefix: &str, width: usize) {
        self.fill(format!("{prefix}.weight"), vec![width], 1.0);
        self.fill(format!("{prefix}.bias"), vec![width], 0.0);
    }

    fn write(&self, path: &Path) {
        let views: Vec<(String, TensorView)> = self.tensors.iter()
            .map(|(name, shape, bytes)| (name.clone(), TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap()))
            .collect();
        safetensors::tensor::serialize_to_file(views, &None, path).unwrap();
    }
}

fn write_weights(dir: &Path, options: &TinyOptions) {
    let mut w = WeightWriter { tensors: vec![], counter: 0 };

    let v = "vision_model";
    w.add(format!("{v}.embeddings.class_embedding"), vec![1, 1, HIDDEN]);
    w.add(format!("{v}.embeddings.patch_embedding.weight"), vec![HIDDEN, 3, PATCH_SIZE, PATCH_SIZE]);
    w.add(format!("{v}.embeddings.patch_embedding.bias"), vec![HIDDEN]);
    w.add(format!("{v}.embeddings.position_embedding"), vec![1, IMAGE_TOKENS, HIDDEN]);
    for i in 0..LAYERS {
        let layer = format!("{v}.encoder.layers.{i}");
        w.layer_norm(&format!("{layer}.layer_norm1"), HIDDEN);
        w.linear(&format!("{layer}.self_attn.qkv"), 3 * HIDDEN, HIDDEN);
        w.linear(&format!("{layer}.self_attn.projection"), HIDDEN, HIDDEN);
        w.layer_norm(&format!("{layer}.layer_norm2"), HIDDEN);
        w.linear(&format!("{layer}.mlp.fc1"), INTERMEDIATE, HIDDEN);
        w.linear(&format!("{layer}.mlp.fc2"), HIDDEN, INTERMEDIATE);
    }
    w.layer_norm(&format!("{v}.post_layernorm"), HIDDEN);

    let t = "text_decoder";
    w.add(format!("{t}.bert.embeddings.word_embeddings.weight"), vec![VOCAB, HIDDEN]);
    w.add(format!("{t}.bert.embeddings.position_embeddings.weight"), vec![MAX_POSITIONS, HIDDEN]);
    w.layer_norm(&format!("{t}.bert.embeddings.LayerNorm"), HIDDEN);
    for i in 0..LAYERS {
        let layer = format!("{t}.bert.encoder.layer.{i}");
        for (block, context_width) in [("attention", HIDDEN), ("crossattention", options.encoder_hidden_size)] {
            w.linear(&format!("{layer}.{block}.self.query"), HIDDEN, HIDDEN);
            w.linear(&format!("{layer}.{block}.self.key"), HIDDEN, context_width);
            w.linear(&format!("{layer}.{block}.self.value"), HIDDEN, context_width);
            w.linear(&format!("{layer}.{block}.output.dense"), HIDDEN, HIDDEN);
            w.layer_norm(&format!("{layer}.{block}.output.LayerNorm"), HIDDEN);
        }
        w.linear(&format!("{layer}.intermediate.dense"), INTERMEDIATE, HIDDEN);
        w.linear(&format!("{layer}.output.dense"), HIDDEN, INTERMEDIATE);
        w.layer_norm(&format!("{layer}.output.LayerNorm"), HIDDEN);
    }
    w.linear(&format!("{t}.cls.predictions.transform.dense"), HIDDEN, HIDDEN);
    w.layer_norm(&format!("{t}.cls.predictions.transform.LayerNorm"), HIDDEN);
    if options.untied_decoder {
        w.add(format!("{t}.cls.predictions.decoder.weight"), vec![VOCAB, HIDDEN]);
    }
    w.add(format!("{t}.cls.predictions.bias"), vec![VOCAB]);

    w.write(&dir.join("model.safetensors"));
}

fn write_tokenizer(dir: &Path, options: &TinyOptions) {
    let vocab: serde_json::Map<String, serde_json::Value> = TOKENS.iter().enumerate()
        .map(|(i, token)| (token.to_string(), serde_json::json!(i)))
        .collect();
    let model = if options.wordpiece {
        serde_json::json!({
            "type": "WordPiece",
            "unk_token": "[UNK]",
            "continuing_subword_prefix": "##",
            "max_input_chars_per_word": 100,
            "vocab": vocab
        })
    } else {
        serde_json::json!({
            "type": "WordLevel",
            "unk_token": "[UNK]",
            "vocab": vocab
        })
    };
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": null,
        "model": model,
        "post_processor": null,
        "decoder": null
    });
    if options.ship_tokenizer {
        fs::write(dir.join("tokenizer.json"), serde_json::to_string(&tokenizer).unwrap()).unwrap();
    }
    fs::write(dir.join("tokenizer_config.json"), r#"{"do_lower_case": true, "model_max_length": 512}"#).unwrap();
    fs::write(dir.join("special_tokens_map.json"), r#"{"pad_token": "[PAD]", "unk_token": "[UNK]", "sep_token": "[SEP]", "cls_token": "[CLS]"}"#).unwrap();
    if options.ship_vocab {
        fs::write(dir.join("vocab.txt"), TOKENS.join("\n") + "\n").unwrap();
    }
}
