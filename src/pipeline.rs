use tracing::info;
use crate::artifacts::OutputDir;
use crate::config::ExportConfig;
use crate::export::{check_stage_coupling, export_subgraph, ExportedGraph};
use crate::loader::CompositeModel;
use crate::report::ExportReport;
use crate::text::TextDecoderWrapper;
use crate::tokenizer::write_tokenizer_artifacts;
use crate::vision::VisionEncoderWrapper;
use crate::wrapper::SubgraphWrapper;
use crate::ExportError;

#[cfg(feature = "ort")]
fn validate(exported: &ExportedGraph, config: &ExportConfig) -> Result<(), ExportError> {
    if config.validate {
        crate::validate::validate_graph(exported, config.seed)?;
    }
    Ok(())
}

#[cfg(not(feature = "ort"))]
fn validate(exported: &ExportedGraph, config: &ExportConfig) -> Result<(), ExportError> {
    if config.validate {
        tracing::warn!("Validation of {} skipped: built without the ort feature", exported.artifact);
    }
    Ok(())
}

fn export_stage(wrapper: &dyn SubgraphWrapper, output_dir: &OutputDir, config: &ExportConfig) -> Result<ExportedGraph, ExportError> {
    let exported = export_subgraph(wrapper, output_dir, config)?;
    validate(&exported, config)?;
    println!("    {} exported.", wrapper.stage());
    Ok(exported)
}

/// Loads the checkpoint named by `config`, exports both graphs and the tokenizer files into
/// `config.output_dir`, and returns the resulting file listing.
pub fn run(config: &ExportConfig) -> Result<ExportReport, ExportError> {
    let output_dir = OutputDir::create(&config.output_dir)?;

    println!("[1/5] Loading BLIP model from {}...", config.model_id);
    let model = CompositeModel::load(&config.model_id)?;
    info!(
        "Vision: {} layers, {} image tokens of width {}; text: {} layers, vocabulary {}",
        model.config.vision_config.num_hidden_layers,
        model.config.vision_config.num_image_tokens(),
        model.config.vision_config.hidden_size,
        model.config.text_config.num_hidden_layers,
        model.config.text_config.vocab_size
    );

    println!("[2/5] Exporting vision encoder to ONNX...");
    let vision = export_stage(&VisionEncoderWrapper::new(&model), &output_dir, config)?;
    check_stage_coupling(&vision, &model.config)?;

    println!("[3/5] Exporting text decoder to ONNX...");
    export_stage(&TextDecoderWrapper::new(&model), &output_dir, config)?;

    println!("[4/5] Saving tokenizer files...");
    write_tokenizer_artifacts(&model.tokenizer_source, &output_dir)?;
    println!("    Tokenizer files saved.");

    println!();
    println!("[5/5] Export complete! Generated files:");
    let report = ExportReport::collect(&output_dir, &config.device_push_path)?;
    println!("{report}");
    Ok(report)
}
