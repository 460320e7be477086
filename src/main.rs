use tracing_subscriber::EnvFilter;
use blip_onnx_export::ExportConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    blip_onnx_export::run(&ExportConfig::default())?;
    Ok(())
}
