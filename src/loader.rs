use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use onnx_graph::weights::{PthWeightManager, SafetensorsWeightManager, WeightManager};
use onnx_graph::Tensor;
use crate::ExportError;

pub const VISION_PREFIX: &str = "vision_model";
pub const TEXT_DECODER_PREFIX: &str = "text_decoder";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlipVisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: String,
}

impl Default for BlipVisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            num_channels: 3,
            image_size: 384,
            patch_size: 16,
            layer_norm_eps: 1e-5,
            hidden_act: "gelu".to_string(),
        }
    }
}

impl BlipVisionConfig {
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Patch tokens plus the class token: the sequence length of `image_features`.
    pub fn num_image_tokens(&self) -> usize {
        self.num_patches() + 1
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlipTextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub encoder_hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: String,
}

impl Default for BlipTextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30524,
            hidden_size: 768,
            encoder_hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 512,
            layer_norm_eps: 1e-12,
            hidden_act: "gelu".to_string(),
        }
    }
}

impl BlipTextConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// `config.json` of a BLIP captioning checkpoint. Missing entries take the BLIP-base values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlipConfig {
    pub vision_config: BlipVisionConfig,
    pub text_config: BlipTextConfig,
}

impl BlipConfig {
    pub fn from_file(path: &Path) -> Result<Self, ExportError> {
        let config: Self = serde_json::from_reader(File::open(path)?)
            .map_err(|x| ExportError::Config(format!("{}: {}", path.display(), x)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        let vision = &self.vision_config;
        let text = &self.text_config;
        for (section, act) in [("vision_config", &vision.hidden_act), ("text_config", &text.hidden_act)] {
            if act != "gelu" {
                return Err(ExportError::Config(format!("{section}.hidden_act = {act} is not supported")));
            }
        }
        if vision.patch_size == 0 || vision.image_size % vision.patch_size != 0 {
            return Err(ExportError::Config(format!("image_size {} is not a multiple of patch_size {}", vision.image_size, vision.patch_size)));
        }
        for (section, width, heads) in [("vision_config", vision.hidden_size, vision.num_attention_heads), ("text_config", text.hidden_size, text.num_attention_heads)] {
            if heads == 0 || width % heads != 0 {
                return Err(ExportError::Config(format!("{section}.hidden_size {width} is not divisible by {heads} heads")));
            }
        }
        if text.encoder_hidden_size != vision.hidden_size {
            return Err(ExportError::Inconsistent(format!(
                "text_config.encoder_hidden_size is {} but vision_config.hidden_size is {}",
                text.encoder_hidden_size, vision.hidden_size
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Square(usize),
    Dims { height: usize, width: usize },
}

#[derive(Deserialize)]
struct RawPreprocessorConfig {
    size: Option<SizeSpec>,
    image_size: Option<usize>,
    #[serde(default)]
    image_mean: Vec<f32>,
    #[serde(default)]
    image_std: Vec<f32>,
}

/// Image preprocessing settings shipped with the checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PreprocessorConfig {
    pub height: usize,
    pub width: usize,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
}

impl PreprocessorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ExportError> {
        let raw: RawPreprocessorConfig = serde_json::from_reader(File::open(path)?)
            .map_err(|x| ExportError::Config(format!("{}: {}", path.display(), x)))?;
        let (height, width) = match (raw.size, raw.image_size) {
            (Some(SizeSpec::Square(size)), _) => (size, size),
            (Some(SizeSpec::Dims { height, width }), _) => (height, width),
            (None, Some(size)) => (size, size),
            (None, None) => return Err(ExportError::Config(format!("{} has no target size", path.display()))),
        };
        Ok(Self {
            height,
            width,
            image_mean: raw.image_mean,
            image_std: raw.image_std,
        })
    }
}

/// Tokenizer files found next to the checkpoint.
#[derive(Clone, Debug)]
pub struct TokenizerSource {
    pub tokenizer_json: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub special_tokens_map: Option<PathBuf>,
    pub vocab: Option<PathBuf>,
}

/// Parameters of the checkpoint, in whichever format it ships.
pub enum CheckpointWeights {
    Safetensors(SafetensorsWeightManager),
    Pth(PthWeightManager),
}

impl WeightManager for CheckpointWeights {
    fn prefix(&self, name: &str) -> Self {
        match self {
            CheckpointWeights::Safetensors(x) => CheckpointWeights::Safetensors(x.prefix(name)),
            CheckpointWeights::Pth(x) => CheckpointWeights::Pth(x.prefix(name)),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        match self {
            CheckpointWeights::Safetensors(x) => x.get_tensor(name),
            CheckpointWeights::Pth(x) => x.get_tensor(name),
        }
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        match self {
            CheckpointWeights::Safetensors(x) => x.get_prefix_tail(),
            CheckpointWeights::Pth(x) => x.get_prefix_tail(),
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        match self {
            CheckpointWeights::Safetensors(x) => x.get_prefix(),
            CheckpointWeights::Pth(x) => x.get_prefix(),
        }
    }

    fn get_tensor_names(&self) -> Vec<String> {
        match self {
            CheckpointWeights::Safetensors(x) => x.get_tensor_names(),
            CheckpointWeights::Pth(x) => x.get_tensor_names(),
        }
    }
}

enum ModelSource {
    Local(PathBuf),
    Hub(hf_hub::api::sync::ApiRepo),
}

impl ModelSource {
    fn open(model_id: &str) -> Result<Self, ExportError> {
        let path = Path::new(model_id);
        if path.is_dir() {
            info!("Reading checkpoint from local directory {}", path.display());
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_progress(true)
            .build()
            .map_err(|x| ExportError::Resolution {
                model_id: model_id.to_string(),
                file: "hub client".to_string(),
                reason: x.to_string(),
            })?;
        Ok(ModelSource::Hub(api.model(model_id.to_string())))
    }

    fn fetch(&self, file: &str) -> Result<PathBuf, String> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(format!("{} does not exist", path.display()))
                }
            }
            ModelSource::Hub(repo) => repo.get(file).map_err(|x| x.to_string()),
        }
    }

    fn required(&self, model_id: &str, file: &str) -> Result<PathBuf, ExportError> {
        self.fetch(file).map_err(|reason| ExportError::Resolution {
            model_id: model_id.to_string(),
            file: file.to_string(),
            reason,
        })
    }

    fn optional(&self, file: &str) -> Option<PathBuf> {
        match self.fetch(file) {
            Ok(path) => Some(path),
            Err(reason) => {
                debug!("Optional file {file} unavailable: {reason}");
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

fn load_weights(source: &ModelSource, model_id: &str) -> Result<CheckpointWeights, ExportError> {
    let load_error = |file: &str, err: onnx_graph::Error| ExportError::Resolution {
        model_id: model_id.to_string(),
        file: file.to_string(),
        reason: err.to_string(),
    };

    if let Some(path) = source.optional("model.safetensors") {
        info!("Loading weights from {}", path.display());
        let manager = SafetensorsWeightManager::open(&[path]).map_err(|x| load_error("model.safetensors", x))?;
        return Ok(CheckpointWeights::Safetensors(manager));
    }
    if let Some(index_path) = source.optional("model.safetensors.index.json") {
        let index: SafetensorsIndex = serde_json::from_reader(File::open(&index_path)?)?;
        let shards: BTreeSet<String> = index.weight_map.into_values().collect();
        let mut paths = vec![];
        for shard in &shards {
            paths.push(source.required(model_id, shard)?);
        }
        info!("Loading weights from {} safetensors shards", paths.len());
        let manager = SafetensorsWeightManager::open(&paths).map_err(|x| load_error("model.safetensors.index.json", x))?;
        return Ok(CheckpointWeights::Safetensors(manager));
    }
    let path = source.required(model_id, "pytorch_model.bin")?;
    info!("Loading weights from {}", path.display());
    let manager = PthWeightManager::open(&path).map_err(|x| load_error("pytorch_model.bin", x))?;
    Ok(CheckpointWeights::Pth(manager))
}

fn expect_shape(weights: &CheckpointWeights, name: &str, expected: &[usize]) -> Result<(), ExportError> {
    let tensor = weights.get_optional_tensor(name)?
        .ok_or_else(|| ExportError::Inconsistent(format!("checkpoint has no tensor {}", weights.full_name(name))))?;
    let shape = tensor.shape().resolve()?;
    if shape != expected {
        return Err(ExportError::Inconsistent(format!(
            "{} has shape {:?}, config implies {:?}", weights.full_name(name), shape, expected
        )));
    }
    Ok(())
}

/// A loaded captioning checkpoint: configuration, weights and the files needed to preprocess
/// images and tokenize text for it.
pub struct CompositeModel {
    pub model_id: String,
    pub config: BlipConfig,
    pub preprocessor: Option<PreprocessorConfig>,
    pub tokenizer_source: TokenizerSource,
    weights: CheckpointWeights,
}

impl CompositeModel {
    pub fn load(model_id: &str) -> Result<Self, ExportError> {
        let source = ModelSource::open(model_id)?;

        let config = BlipConfig::from_file(&source.required(model_id, "config.json")?)?;
        debug!("Checkpoint config: {:?}", config);

        let preprocessor = match source.optional("preprocessor_config.json") {
            Some(path) => Some(PreprocessorConfig::from_file(&path)?),
            None => {
                warn!("No preprocessor_config.json, input resolution taken from config.json");
                None
            }
        };

        let tokenizer_source = TokenizerSource {
            tokenizer_json: source.required(model_id, "tokenizer.json")?,
            tokenizer_config: source.optional("tokenizer_config.json"),
            special_tokens_map: source.optional("special_tokens_map.json"),
            vocab: source.optional("vocab.txt"),
        };

        let weights = load_weights(&source, model_id)?;

        let model = Self {
            model_id: model_id.to_string(),
            config,
            preprocessor,
            tokenizer_source,
            weights,
        };
        model.check_consistency()?;
        Ok(model)
    }

    pub fn weights(&self) -> &CheckpointWeights {
        &self.weights
    }

    pub fn vision_model(&self) -> CheckpointWeights {
        self.weights.prefix(VISION_PREFIX)
    }

    pub fn text_decoder(&self) -> CheckpointWeights {
        self.weights.prefix(TEXT_DECODER_PREFIX)
    }

    /// Cross-checks the configuration, the preprocessing settings and the parameter shapes.
    fn check_consistency(&self) -> Result<(), ExportError> {
        let vision = &self.config.vision_config;
        let text = &self.config.text_config;

        if let Some(preprocessor) = &self.preprocessor {
            if preprocessor.height != vision.image_size || preprocessor.width != vision.image_size {
                return Err(ExportError::Inconsistent(format!(
                    "preprocessor resizes to {}x{} but the vision encoder expects {}x{}",
                    preprocessor.height, preprocessor.width, vision.image_size, vision.image_size
                )));
            }
        }

        let vision_weights = self.vision_model();
        expect_shape(&vision_weights, "embeddings.patch_embedding.weight", &[vision.hidden_size, vision.num_channels, vision.patch_size, vision.patch_size])?;
        expect_shape(&vision_weights, "embeddings.class_embedding", &[1, 1, vision.hidden_size])?;
        expect_shape(&vision_weights, "embeddings.position_embedding", &[1, vision.num_image_tokens(), vision.hidden_size])?;
        if vision.num_hidden_layers > 0 {
            let last = format!("encoder.layers.{}.self_attn.qkv.weight", vision.num_hidden_layers - 1);
            expect_shape(&vision_weights, &last, &[3 * vision.hidden_size, vision.hidden_size])?;
        }

        let bert = self.text_decoder().prefix("bert");
        expect_shape(&bert, "embeddings.word_embeddings.weight", &[text.vocab_size, text.hidden_size])?;
        expect_shape(&bert, "embeddings.position_embeddings.weight", &[text.max_position_embeddings, text.hidden_size])?;
        if text.num_hidden_layers > 0 {
            let last = format!("encoder.layer.{}.crossattention.self.key.weight", text.num_hidden_layers - 1);
            expect_shape(&bert, &last, &[text.hidden_size, text.encoder_hidden_size])?;
        }
        Ok(())
    }
}
