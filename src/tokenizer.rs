use std::fs;
use std::path::Path;
use tokenizers::models::ModelWrapper;
use tracing::{debug, info, warn};
use crate::artifacts::{ArtifactKey, OutputDir};
use crate::loader::TokenizerSource;
use crate::ExportError;

/// Where `vocab.txt` came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VocabularyOrigin {
    /// Written from the tokenizer's own WordPiece vocabulary.
    Serialized,
    /// Copied from the checkpoint's `vocab.txt`.
    Copied,
}

#[derive(Clone, Debug)]
pub struct TokenizerArtifacts {
    pub written: Vec<ArtifactKey>,
    pub vocab_size: usize,
    pub vocab_origin: VocabularyOrigin,
}

/// Tokens ordered by id, if the model is WordPiece and its ids are exactly `0..n`.
fn wordpiece_vocabulary(tokenizer: &tokenizers::Tokenizer) -> Option<Vec<String>> {
    if !matches!(tokenizer.get_model(), ModelWrapper::WordPiece(_)) {
        return None;
    }
    let vocab = tokenizer.get_vocab(false);
    let mut tokens: Vec<Option<String>> = vec![None; vocab.len()];
    for (token, id) in vocab {
        let slot = tokens.get_mut(id as usize)?;
        if slot.is_some() {
            return None;
        }
        *slot = Some(token);
    }
    tokens.into_iter().collect()
}

fn copy_optional(source: Option<&Path>, output_dir: &OutputDir, key: ArtifactKey, written: &mut Vec<ArtifactKey>) -> Result<(), ExportError> {
    match source {
        Some(path) => {
            fs::copy(path, output_dir.path(key))?;
            written.push(key);
        }
        None => debug!("Tokenizer source has no {}", key),
    }
    Ok(())
}

/// Writes the tokenizer definition and guarantees a `vocab.txt` whose line count equals the
/// tokenizer's base vocabulary size.
pub fn write_tokenizer_artifacts(source: &TokenizerSource, output_dir: &OutputDir) -> Result<TokenizerArtifacts, ExportError> {
    let tokenizer = tokenizers::Tokenizer::from_file(&source.tokenizer_json)?;
    let mut written = vec![];

    tokenizer.save(output_dir.path(ArtifactKey::Tokenizer), false)?;
    written.push(ArtifactKey::Tokenizer);
    copy_optional(source.tokenizer_config.as_deref(), output_dir, ArtifactKey::TokenizerConfig, &mut written)?;
    copy_optional(source.special_tokens_map.as_deref(), output_dir, ArtifactKey::SpecialTokensMap, &mut written)?;

    // Only this run's output counts as already packaged
    output_dir.remove(ArtifactKey::Vocabulary)?;
    let vocab_path = output_dir.path(ArtifactKey::Vocabulary);
    let vocab_origin = match wordpiece_vocabulary(&tokenizer) {
        Some(tokens) => {
            let mut contents = tokens.join("\n");
            contents.push('\n');
            fs::write(&vocab_path, contents)?;
            VocabularyOrigin::Serialized
        }
        None => {
            let Some(fallback) = &source.vocab else {
                return Err(ExportError::VocabularyUnavailable(format!(
                    "{} has no WordPiece vocabulary", source.tokenizer_json.display()
                )));
            };
            warn!("Tokenizer did not produce vocab.txt, copying {}", fallback.display());
            fs::copy(fallback, &vocab_path)?;
            VocabularyOrigin::Copied
        }
    };
    written.push(ArtifactKey::Vocabulary);

    let expected = tokenizer.get_vocab_size(false);
    let lines = fs::read_to_string(&vocab_path)?.lines().count();
    if lines == 0 || lines != expected {
        return Err(ExportError::VocabularyMismatch { path: vocab_path, lines, expected });
    }
    info!("Tokenizer vocabulary: {} tokens ({:?})", lines, vocab_origin);

    Ok(TokenizerArtifacts {
        written,
        vocab_size: lines,
        vocab_origin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENS: [&str; 6] = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "a", "photo"];

    fn vocab_json() -> String {
        let entries: Vec<String> = TOKENS.iter().enumerate().map(|(i, t)| format!("\"{t}\": {i}")).collect();
        format!("{{{}}}", entries.join(", "))
    }

    fn tokenizer_definition(model: &str) -> String {
        format!(
            r#"{{"version": "1.0", "truncation": null, "padding": null, "added_tokens": [], "normalizer": null, "pre_tokenizer": null, "model": {model}, "post_processor": null, "decoder": null}}"#
        )
    }

    fn write_source(dir: &Path, model: &str, vocab: Option<&str>) -> TokenizerSource {
        let tokenizer_json = dir.join("tokenizer.json");
        fs::write(&tokenizer_json, tokenizer_definition(model)).unwrap();
        let config = dir.join("tokenizer_config.json");
        fs::write(&config, r#"{"do_lower_case": true}"#).unwrap();
        let vocab = vocab.map(|contents| {
            let path = dir.join("vocab.txt");
            fs::write(&path, contents).unwrap();
            path
        });
        TokenizerSource {
            tokenizer_json,
            tokenizer_config: Some(config),
            special_tokens_map: None,
            vocab,
        }
    }

    fn wordpiece() -> String {
        format!(r###"{{"type": "WordPiece", "unk_token": "[UNK]", "continuing_subword_prefix": "##", "max_input_chars_per_word": 100, "vocab": {}}}"###, vocab_json())
    }

    fn wordlevel() -> String {
        format!(r#"{{"type": "WordLevel", "unk_token": "[UNK]", "vocab": {}}}"#, vocab_json())
    }

    fn output(dir: &Path) -> OutputDir {
        OutputDir::create(dir.join("out")).unwrap()
    }

    #[test]
    fn wordpiece_vocabulary_is_written_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), &wordpiece(), None);
        let out = output(dir.path());

        let artifacts = write_tokenizer_artifacts(&source, &out).unwrap();
        assert_eq!(artifacts.vocab_origin, VocabularyOrigin::Serialized);
        assert_eq!(artifacts.vocab_size, TOKENS.len());
        assert_eq!(artifacts.written, vec![ArtifactKey::Tokenizer, ArtifactKey::TokenizerConfig, ArtifactKey::Vocabulary]);

        let written = fs::read_to_string(out.path(ArtifactKey::Vocabulary)).unwrap();
        assert_eq!(written.lines().collect::<Vec<_>>(), TOKENS.to_vec());
        assert!(tokenizers::Tokenizer::from_file(out.path(ArtifactKey::Tokenizer)).is_ok());
    }

    #[test]
    fn falls_back_to_source_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = TOKENS.join("\n") + "\n";
        let source = write_source(dir.path(), &wordlevel(), Some(vocab.as_str()));
        let out = output(dir.path());

        let artifacts = write_tokenizer_artifacts(&source, &out).unwrap();
        assert_eq!(artifacts.vocab_origin, VocabularyOrigin::Copied);
        assert_eq!(artifacts.vocab_size, TOKENS.len());
    }

    #[test]
    fn missing_vocabulary_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), &wordlevel(), None);
        let out = output(dir.path());
        assert!(matches!(write_tokenizer_artifacts(&source, &out), Err(ExportError::VocabularyUnavailable(_))));
    }

    #[test]
    fn short_vocabulary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), &wordlevel(), Some("[PAD]\n[UNK]\n"));
        let out = output(dir.path());
        match write_tokenizer_artifacts(&source, &out) {
            Err(ExportError::VocabularyMismatch { path, lines, expected }) => {
                assert_eq!(path, out.path(ArtifactKey::Vocabulary));
                assert_eq!((lines, expected), (2, TOKENS.len()));
            }
            other => panic!("unexpected result {:?}", other.map(|x| x.vocab_size)),
        }
    }
}
