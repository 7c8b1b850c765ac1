use crate::config::ExperimentConfig;
use crate::data::{PreparedData, read_labelled_events};
use crate::error::Result;
use crate::operator::OperatorModel;
use crate::output::{plot_history, write_predictions};
use burn::backend::{Autodiff, NdArray};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

type MyBackend = Autodiff<NdArray<f32>>;

/// 学習の成果物の置き場所。
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub checkpoint: PathBuf,
    pub normalizers: PathBuf,
    pub predictions: PathBuf,
    pub best_test_l2: Option<f64>,
}

/// `train`サブコマンドを実行します。
///
/// 学習、最良モデルによるテストデータの予測、チェックポイントと正規化器の保存、損失グラフの描画を行います。
pub fn run(train_csv: &Path, test_csv: &Path, config: &ExperimentConfig) -> Result<TrainSummary> {
    let device = Default::default();

    // --- データセットの準備 ---
    let train_records = read_labelled_events(train_csv)?;
    let test_records = read_labelled_events(test_csv)?;
    let data = PreparedData::<MyBackend>::from_records(&train_records, &test_records, &device)?;

    // --- モデルの初期化と学習 ---
    let mut model = OperatorModel::<MyBackend>::from_config(&config.model, &device)?;
    info!(backend = "NdArray (CPU)", "starting training");
    let training_start = Instant::now();
    let history = model.run(&data.train, &data.test, &config.training, &device)?;
    info!(elapsed = ?training_start.elapsed(), "training complete");

    // --- 結果の保存と描画 ---
    let predictions = model.predict(data.test.branch().clone(), data.test.trunk().clone())?;
    let predictions = write_predictions(&config.paths.log_dir, predictions)?;

    let checkpoint = model.save(&config.paths.checkpoint_prefix)?;
    let normalizers = checkpoint.with_extension("normalizers.json");
    data.normalizers.save(&normalizers)?;
    info!(path = %normalizers.display(), "normalizers saved");

    if let Err(e) = plot_history(&config.paths.loss_plot, &history) {
        warn!(error = %e, "failed to draw the loss graph");
    } else {
        info!(path = %config.paths.loss_plot.display(), "loss graph saved");
    }

    Ok(TrainSummary {
        checkpoint,
        normalizers,
        predictions,
        best_test_l2: history.best_test_l2(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference;
    use crate::loss::LossKind;

    fn write_events(path: &Path, n: usize, offset: f32) {
        let mut text = String::from("x,y,z,pe_total,ek,evis\n");
        for i in 0..n {
            let t = i as f32 + offset;
            let evis = 1.0 + 0.1 * t;
            text.push_str(&format!(
                "{},{},{},{},{},{}\n",
                t.sin(),
                t.cos(),
                0.5 * t,
                1000.0 * evis,
                evis,
                evis
            ));
        }
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn train_then_infer_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let train_csv = dir.path().join("train.csv");
        let test_csv = dir.path().join("test.csv");
        write_events(&train_csv, 8, 0.0);
        write_events(&test_csv, 4, 20.0);

        let mut config = ExperimentConfig::default();
        config.model.branch = vec![3, 16, 16].into();
        config.model.trunk_layers = vec![1, 16, 16];
        config.training.batch_size = 4;
        config.training.iterations = 2;
        config.training.loss = LossKind::Mse;
        config.paths.log_dir = dir.path().join("log");
        config.paths.checkpoint_prefix = dir.path().join("ckpt_").display().to_string();
        config.paths.loss_plot = dir.path().join("loss.png");

        let summary = run(&train_csv, &test_csv, &config).unwrap();
        assert!(summary.checkpoint.exists());
        assert!(summary.normalizers.exists());
        assert!(summary.best_test_l2.is_some());
        let rows = std::fs::read_to_string(&summary.predictions).unwrap();
        assert_eq!(rows.lines().count(), 4);

        let out = inference::run(&summary.checkpoint, &summary.normalizers, &test_csv, &config)
            .unwrap();
        let rows = std::fs::read_to_string(out).unwrap();
        assert_eq!(rows.lines().count(), 4);
    }
}
