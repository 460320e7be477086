//! Exports a BLIP image captioning checkpoint as two ONNX graphs (vision encoder and text
//! decoder) plus the tokenizer files a device runtime needs to caption images offline.

pub mod artifacts;
pub mod config;
mod error;
pub mod export;
pub mod loader;
pub mod pipeline;
pub mod report;
pub mod text;
pub mod tokenizer;
pub mod vision;
pub mod wrapper;

#[cfg(feature = "ort")]
pub mod validate;

pub use config::ExportConfig;
pub use error::ExportError;
pub use pipeline::run;
pub use report::ExportReport;
