use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Cannot resolve {file} for {model_id}: {reason}")]
    Resolution {
        model_id: String,
        file: String,
        reason: String
    },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Inconsistent checkpoint: {0}")]
    Inconsistent(String),
    #[error("Trace failed: {0}")]
    Trace(#[from] onnx_graph::Error),
    #[error("Dynamic axis error: {0}")]
    DynamicAxis(String),
    #[error("Vision encoder emits {actual} tokens of width {actual_width}, text decoder expects {expected} tokens of width {expected_width}")]
    StageCoupling {
        expected: usize,
        expected_width: usize,
        actual: usize,
        actual_width: usize
    },
    #[error("vocab.txt is missing from the output and the tokenizer source has none ({0})")]
    VocabularyUnavailable(String),
    #[error("{path} lists {lines} tokens but the tokenizer vocabulary has {expected}")]
    VocabularyMismatch {
        path: PathBuf,
        lines: usize,
        expected: usize
    },
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Validation of {artifact} failed: {message}")]
    Validation {
        artifact: String,
        message: String
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokenizers::Error> for ExportError {
    fn from(value: tokenizers::Error) -> Self {
        ExportError::Tokenizer(value.to_string())
    }
}
