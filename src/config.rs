use std::path::PathBuf;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";

/// Everything the export run needs to know. There is no command line: the binary runs with
/// `ExportConfig::default()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Hub repo id, or a local directory laid out like a hub snapshot.
    pub model_id: String,
    pub output_dir: PathBuf,
    pub opset_version: i64,
    /// Batch size of the synthetic trace inputs.
    pub trace_batch_size: usize,
    /// Token count of the synthetic decoder inputs.
    pub trace_sequence_length: usize,
    /// Graphs whose parameters exceed this many bytes store them in a `.data` companion file.
    pub external_data_threshold: usize,
    pub device_push_path: String,
    /// Re-run each exported graph through ONNX Runtime (requires the `ort` feature).
    pub validate: bool,
    pub seed: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            output_dir: PathBuf::from("models"),
            opset_version: 17,
            trace_batch_size: 1,
            trace_sequence_length: 10,
            external_data_threshold: 64 * 1024 * 1024,
            device_push_path: "/sdcard/Android/data/com.example.offlinecaptioning/files/".to_string(),
            validate: cfg!(feature = "ort"),
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ExportConfig = serde_json::from_str(r#"{"output_dir": "out", "trace_sequence_length": 4}"#).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.trace_sequence_length, 4);
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.opset_version, 17);
    }
}
