use std::fmt;
use std::path::PathBuf;
use crate::artifacts::{ArtifactKey, ExportedArtifact, OutputDir};
use crate::ExportError;

/// The files in the output directory after a run, and where they go on the device.
#[derive(Clone, Debug)]
pub struct ExportReport {
    pub output_dir: PathBuf,
    pub artifacts: Vec<ExportedArtifact>,
    pub device_push_path: String,
}

impl ExportReport {
    pub fn collect(output_dir: &OutputDir, device_push_path: &str) -> Result<Self, ExportError> {
        Ok(Self {
            output_dir: output_dir.root().to_path_buf(),
            artifacts: output_dir.list()?,
            device_push_path: device_push_path.to_string(),
        })
    }

    pub fn get(&self, key: ArtifactKey) -> Option<&ExportedArtifact> {
        self.artifacts.iter().find(|x| x.key == Some(key))
    }

    pub fn count(&self, predicate: impl Fn(ArtifactKey) -> bool) -> usize {
        self.artifacts.iter().filter(|x| x.key.is_some_and(&predicate)).count()
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for artifact in &self.artifacts {
            let size_mb = artifact.size_bytes as f64 / (1024.0 * 1024.0);
            writeln!(f, "    {:<45} {:>8.1} MB", artifact.file_name, size_mb)?;
        }
        writeln!(f)?;
        writeln!(f, "Next step: push the models to the device")?;
        write!(f, "    adb push {}/ {}", self.output_dir.display(), self.device_push_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_with_sizes_and_push_hint() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(dir.path().join("models")).unwrap();
        std::fs::write(out.path(ArtifactKey::VisionGraph), vec![0u8; 3 * 1024 * 1024]).unwrap();
        std::fs::write(out.path(ArtifactKey::Vocabulary), "[PAD]\n").unwrap();

        let report = ExportReport::collect(&out, "/sdcard/models/").unwrap();
        assert_eq!(report.count(|x| x.is_graph()), 1);
        assert_eq!(report.get(ArtifactKey::VisionGraph).map(|x| x.size_bytes), Some(3 * 1024 * 1024));

        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("    blip_vision_encoder.onnx"));
        assert!(lines[0].ends_with("     3.0 MB"));
        assert!(lines[1].starts_with("    vocab.txt"));
        assert!(text.ends_with(&format!("adb push {}/ /sdcard/models/", out.root().display())));
    }
}
