use std::sync::Arc;
use onnx_graph::Tensor;
use crate::artifacts::ArtifactKey;
use crate::config::ExportConfig;
use crate::export::{DynamicAxisSpec, SyntheticInput};

/// One independently exportable computation of the composite model.
///
/// A wrapper owns a handle on exactly one sub-module and exposes it through a fixed, named
/// signature. `forward` receives the graph inputs in `input_names` order and returns the
/// outputs in `output_names` order.
pub trait SubgraphWrapper {
    /// Stage name used in logs and trace metadata.
    fn stage(&self) -> &'static str;

    fn artifact(&self) -> ArtifactKey;

    fn input_names(&self) -> &'static [&'static str];

    fn output_names(&self) -> &'static [&'static str];

    /// Inputs whose shapes drive the trace.
    fn synthetic_inputs(&self, config: &ExportConfig) -> Vec<SyntheticInput>;

    fn dynamic_axes(&self) -> DynamicAxisSpec;

    fn forward(&self, inputs: &[Arc<dyn Tensor>]) -> Result<Vec<Arc<dyn Tensor>>, onnx_graph::Error>;
}
