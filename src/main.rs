//! # DeepONet 可視エネルギー回帰プログラム
//!
//! `clap` クレートを利用して、コマンドラインから`train`（学習）と`infer`（推論）の
//! 機能を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --train data_train.csv --test data_test.csv
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer --checkpoint ckpt.mpk --normalizers ckpt.normalizers.json --input data_test.csv
//! ```

use anyhow::Context;
use clap::Parser;
use deeponet::cli::{Cli, Commands, apply_overrides};
use deeponet::config::ExperimentConfig;
use deeponet::{inference, training};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`train`または`infer`の処理に振り分けます。
fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            train,
            test,
            config,
            loss,
            iterations,
            batch_size,
        } => {
            let mut experiment = ExperimentConfig::load_or_default(config.as_deref())
                .context("failed to load experiment config")?;
            apply_overrides(&mut experiment, loss, iterations, batch_size);
            let summary = training::run(&train, &test, &experiment).context("training failed")?;
            tracing::info!(
                checkpoint = %summary.checkpoint.display(),
                predictions = %summary.predictions.display(),
                best_test_l2 = ?summary.best_test_l2,
                "done"
            );
        }
        Commands::Infer {
            checkpoint,
            normalizers,
            input,
            config,
        } => {
            let experiment = ExperimentConfig::load_or_default(config.as_deref())
                .context("failed to load experiment config")?;
            let out = inference::run(&checkpoint, &normalizers, &input, &experiment)
                .context("inference failed")?;
            tracing::info!(predictions = %out.display(), "done");
        }
    }
    Ok(())
}
