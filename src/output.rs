use crate::error::{DeepOnetError, Result};
use crate::operator::TrainingHistory;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};

/// 出力ファイル名に使う `YYYY-MM-DD_HH-MM-SS` 形式の時刻（UTC）。
pub fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(format_description!(
        "[year]-[month]-[day]_[hour]-[minute]-[second]"
    ))
    .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// 予測値を1行1サンプルのテキスト表として `{log_dir}/{timestamp}.txt` に書き出します。
pub fn write_predictions<B: Backend>(log_dir: &Path, predictions: Tensor<B, 2>) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("{}.txt", timestamp()));
    std::fs::write(&path, format_table(predictions)?)?;
    info!(path = %path.display(), "predictions written");
    Ok(path)
}

fn format_table<B: Backend>(predictions: Tensor<B, 2>) -> Result<String> {
    let [_, cols] = predictions.dims();
    let values: Vec<f32> = predictions
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| DeepOnetError::shape("predictions", format!("{e:?}")))?;
    let mut out = String::new();
    for row in values.chunks(cols.max(1)) {
        let line = row
            .iter()
            .map(|v| format!("{:.18e}", v))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// 学習・テストの相対 L2 損失の推移を PNG に描画します。
pub fn plot_history(path: &Path, history: &TrainingHistory) -> Result<()> {
    if history.is_empty() {
        warn!("no epochs to plot");
        return Ok(());
    }
    let train: Vec<f64> = history.epochs.iter().map(|e| e.train_l2).collect();
    let test: Vec<f64> = history.epochs.iter().map(|e| e.test_l2).collect();
    draw_loss_curves(path, &train, &test).map_err(|e| DeepOnetError::Plot(e.to_string()))
}

fn draw_loss_curves(
    path: &Path,
    train_hist: &[f64],
    test_hist: &[f64],
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let logs = train_hist
        .iter()
        .chain(test_hist)
        .filter(|v| **v > 0.0)
        .map(|v| v.log10());
    let (lo, hi) = logs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let (lo, hi) = if lo.is_finite() { (lo - 0.5, hi + 0.5) } else { (-6.0, 1.0) };

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Relative L2 History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..train_hist.len(), lo..hi)?;
    chart
        .configure_mesh()
        .y_desc("Relative L2 (log10 scale)")
        .x_desc("Epoch")
        .draw()?;
    chart
        .draw_series(LineSeries::new(
            train_hist
                .iter()
                .enumerate()
                .map(|(i, &val)| (i, val.log10())),
            &RED,
        ))?
        .label("Train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(
            test_hist
                .iter()
                .enumerate()
                .map(|(i, &val)| (i, val.log10())),
            &BLUE,
        ))?
        .label("Test")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}
