use crate::config::ExperimentConfig;
use crate::data::{DataNormalizers, read_events, targets};
use crate::error::{DeepOnetError, Result};
use crate::loss::denormalized_error;
use crate::output::write_predictions;
use burn::backend::NdArray;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

type MyBackend = NdArray<f32>;

/// `infer`サブコマンドを実行します。
///
/// 保存済みのチェックポイントと正規化器を読み込み、イベント表の可視エネルギーを予測して書き出します。
pub fn run(
    checkpoint: &Path,
    normalizers: &Path,
    input: &Path,
    config: &ExperimentConfig,
) -> Result<PathBuf> {
    let device = Default::default();

    for (what, path) in [("checkpoint", checkpoint), ("normalizer file", normalizers)] {
        if !path.exists() {
            return Err(DeepOnetError::config(format!(
                "{what} '{}' not found; run the 'train' command first",
                path.display()
            )));
        }
    }

    info!(backend = "NdArray (CPU)", "starting inference");
    let inference_start = Instant::now();

    info!(path = %checkpoint.display(), "loading model");
    let model = config.model.init::<MyBackend>(&device)?.load_file(
        checkpoint.to_path_buf(),
        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        &device,
    )?;
    let normalizers = DataNormalizers::load(normalizers)?;

    let records = read_events(input)?;
    let (branch, trunk) = normalizers.encode_inputs::<MyBackend>(&records, &device)?;
    let predictions = model.try_forward(branch, trunk)?;
    info!(
        events = records.len(),
        shape = ?predictions.dims(),
        elapsed = ?inference_start.elapsed(),
        "inference complete"
    );

    if records.iter().all(|r| r.evis > 0.0) {
        let error = denormalized_error(predictions.clone(), targets(&records, &device));
        info!(error, "denormalized error against evis column");
    }

    write_predictions(&config.paths.log_dir, predictions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            &dir.path().join("missing.mpk"),
            &dir.path().join("missing.json"),
            &dir.path().join("events.csv"),
            &ExperimentConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing.mpk"));
    }
}
