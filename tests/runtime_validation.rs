#![cfg(feature = "ort")]

mod common;

use ndarray::{ArrayD, Axis, IxDyn};
use blip_onnx_export::artifacts::OutputDir;
use blip_onnx_export::config::ExportConfig;
use blip_onnx_export::export::{export_subgraph, ExportedGraph};
use blip_onnx_export::loader::CompositeModel;
use blip_onnx_export::text::TextDecoderWrapper;
use blip_onnx_export::validate::{validate_graph, GraphInput, GraphSession, ValidationRun};
use blip_onnx_export::vision::VisionEncoderWrapper;
use blip_onnx_export::ExportError;
use common::{TinyCheckpoint, HIDDEN, IMAGE_SIZE, IMAGE_TOKENS, VOCAB};

fn shapes(runs: &[ValidationRun], index: usize) -> Vec<Vec<usize>> {
    runs[index].outputs.iter().map(|(_, shape)| shape.clone()).collect()
}

fn export_decoder(checkpoint: &TinyCheckpoint) -> ExportedGraph {
    let config = checkpoint.config();
    let model = CompositeModel::load(&config.model_id).unwrap();
    let out = OutputDir::create(checkpoint.output_dir()).unwrap();
    export_subgraph(&TextDecoderWrapper::new(&model), &out, &config).unwrap()
}

fn image_features(width: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(&[1, IMAGE_TOKENS, width]), |index| {
        ((index[1] * 7 + index[2] * 3) % 11) as f32 / 11.0 - 0.5
    })
}

fn decoder_inputs(ids: &[i64], mask: &[i64], features: ArrayD<f32>) -> Vec<(String, GraphInput)> {
    let row = |values: &[i64]| ArrayD::from_shape_vec(IxDyn(&[1, values.len()]), values.to_vec()).unwrap();
    vec![
        ("input_ids".to_string(), GraphInput::I64(row(ids))),
        ("attention_mask".to_string(), GraphInput::I64(row(mask))),
        ("encoder_hidden_states".to_string(), GraphInput::F32(features)),
    ]
}

fn logits(session: &mut GraphSession, ids: &[i64], mask: &[i64]) -> ArrayD<f32> {
    let mut outputs = session.run(decoder_inputs(ids, mask, image_features(HIDDEN))).unwrap();
    assert_eq!(outputs.len(), 1);
    outputs.remove(0).1
}

/// Largest absolute difference between the logits of two runs at one position.
fn position_diff(a: &ArrayD<f32>, b: &ArrayD<f32>, position: usize) -> f32 {
    let a = a.index_axis(Axis(1), position);
    let b = b.index_axis(Axis(1), position);
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn vision_graph_reproduces_the_traced_shape_for_any_batch() {
    let checkpoint = TinyCheckpoint::new();
    let config = checkpoint.config();
    let model = CompositeModel::load(&config.model_id).unwrap();
    let out = OutputDir::create(checkpoint.output_dir()).unwrap();

    let exported = export_subgraph(&VisionEncoderWrapper::new(&model), &out, &config).unwrap();
    let runs = validate_graph(&exported, 0).unwrap();
    assert_eq!(runs[0].inputs[0].1, vec![1, 3, IMAGE_SIZE, IMAGE_SIZE]);
    assert_eq!(shapes(&runs, 0), vec![vec![1, IMAGE_TOKENS, HIDDEN]]);
    assert_eq!(runs[1].inputs[0].1, vec![2, 3, IMAGE_SIZE, IMAGE_SIZE]);
    assert_eq!(shapes(&runs, 1), vec![vec![2, IMAGE_TOKENS, HIDDEN]]);
}

#[test]
fn decoder_logits_follow_batch_and_length() {
    let checkpoint = TinyCheckpoint::new();
    let config = ExportConfig {
        trace_sequence_length: 4,
        ..checkpoint.config()
    };
    let model = CompositeModel::load(&config.model_id).unwrap();
    let out = OutputDir::create(checkpoint.output_dir()).unwrap();

    let exported = export_subgraph(&TextDecoderWrapper::new(&model), &out, &config).unwrap();
    let runs = validate_graph(&exported, 7).unwrap();
    assert_eq!(shapes(&runs, 0), vec![vec![1, 4, VOCAB]]);
    assert_eq!(shapes(&runs, 1), vec![vec![2, 5, VOCAB]]);
    assert_eq!(runs[1].inputs[2].1, vec![2, IMAGE_TOKENS, HIDDEN]);
}

#[test]
fn later_tokens_do_not_change_earlier_logits() {
    let checkpoint = TinyCheckpoint::new();
    let mut session = GraphSession::open(&export_decoder(&checkpoint)).unwrap();

    let mask = [1, 1, 1, 1];
    let a = logits(&mut session, &[2, 5, 6, 7], &mask);
    let b = logits(&mut session, &[2, 5, 6, 5], &mask);
    assert_eq!(a.shape(), &[1, 4, VOCAB]);
    for position in 0..3 {
        assert!(position_diff(&a, &b, position) < 1e-5, "position {position} saw a later token");
    }
    assert!(position_diff(&a, &b, 3) > 1e-4);
}

#[test]
fn padded_tokens_are_not_attended() {
    let checkpoint = TinyCheckpoint::new();
    let mut session = GraphSession::open(&export_decoder(&checkpoint)).unwrap();

    let mask = [1, 1, 0, 1];
    let a = logits(&mut session, &[2, 5, 6, 7], &mask);
    let b = logits(&mut session, &[2, 5, 3, 7], &mask);
    for position in [0, 1, 3] {
        assert!(position_diff(&a, &b, position) < 1e-5, "position {position} attended a padded token");
    }
}

#[test]
fn decoder_rejects_features_of_the_wrong_width() {
    let checkpoint = TinyCheckpoint::new();
    let mut session = GraphSession::open(&export_decoder(&checkpoint)).unwrap();

    let result = session.run(decoder_inputs(&[2, 5], &[1, 1], image_features(HIDDEN / 2)));
    assert!(matches!(result, Err(ExportError::Validation { .. })));
}

#[test]
fn external_weights_are_loaded_back() {
    let checkpoint = TinyCheckpoint::new();
    let config = ExportConfig {
        external_data_threshold: 0,
        ..checkpoint.config()
    };
    let model = CompositeModel::load(&config.model_id).unwrap();
    let out = OutputDir::create(checkpoint.output_dir()).unwrap();

    let exported = export_subgraph(&VisionEncoderWrapper::new(&model), &out, &config).unwrap();
    assert!(exported.weights_path.is_some());
    let runs = validate_graph(&exported, 0).unwrap();
    assert_eq!(shapes(&runs, 0), vec![vec![1, IMAGE_TOKENS, HIDDEN]]);
}

#[test]
fn full_run_validates_both_graphs() {
    let checkpoint = TinyCheckpoint::new();
    let config = ExportConfig {
        validate: true,
        ..checkpoint.config()
    };
    let report = blip_onnx_export::run(&config).unwrap();
    assert_eq!(report.count(|x| x.is_graph()), 2);
}
