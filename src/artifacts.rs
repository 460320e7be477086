use std::fs;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;
use crate::ExportError;

/// Files the export writes, keyed by role. The file names are what the device app expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, strum_macros::EnumIter, strum_macros::Display, strum_macros::EnumString)]
pub enum ArtifactKey {
    #[strum(serialize = "blip_vision_encoder.onnx")]
    VisionGraph,
    #[strum(serialize = "blip_vision_encoder.onnx.data")]
    VisionWeights,
    #[strum(serialize = "blip_text_decoder.onnx")]
    DecoderGraph,
    #[strum(serialize = "blip_text_decoder.onnx.data")]
    DecoderWeights,
    #[strum(serialize = "tokenizer.json")]
    Tokenizer,
    #[strum(serialize = "tokenizer_config.json")]
    TokenizerConfig,
    #[strum(serialize = "special_tokens_map.json")]
    SpecialTokensMap,
    #[strum(serialize = "vocab.txt")]
    Vocabulary,
}

impl ArtifactKey {
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    /// The weight companion of a graph artifact.
    pub fn weights_companion(&self) -> Option<Self> {
        match self {
            ArtifactKey::VisionGraph => Some(ArtifactKey::VisionWeights),
            ArtifactKey::DecoderGraph => Some(ArtifactKey::DecoderWeights),
            _ => None
        }
    }

    pub fn is_graph(&self) -> bool {
        self.weights_companion().is_some()
    }

    pub fn is_weights(&self) -> bool {
        ArtifactKey::iter().any(|x| x.weights_companion() == Some(*self))
    }
}

/// The directory artifacts are written into. Passed explicitly to every stage.
#[derive(Clone, Debug)]
pub struct OutputDir {
    root: PathBuf
}

impl OutputDir {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: ArtifactKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub fn contains(&self, key: ArtifactKey) -> bool {
        self.path(key).is_file()
    }

    /// Removes `key` if present. Returns whether a file was removed.
    pub fn remove(&self, key: ArtifactKey) -> Result<bool, ExportError> {
        let path = self.path(key);
        if path.is_file() {
            fs::remove_file(&path)?;
            Ok(true)
        }
        else {
            Ok(false)
        }
    }

    /// Every regular file in the directory, sorted by name.
    pub fn list(&self) -> Result<Vec<ExportedArtifact>, ExportError> {
        let mut out = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            out.push(ExportedArtifact {
                key: ArtifactKey::from_file_name(&file_name),
                file_name,
                size_bytes: metadata.len()
            });
        }
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportedArtifact {
    pub key: Option<ArtifactKey>,
    pub file_name: String,
    pub size_bytes: u64
}
