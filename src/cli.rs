use crate::config::ExperimentConfig;
use crate::loss::LossKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "DeepONet visible-energy regression with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// DeepONetを学習し、予測・チェックポイント・正規化器を保存します
    Train {
        /// 学習用イベント表 (CSV)
        #[arg(long)]
        train: PathBuf,
        /// テスト用イベント表 (CSV)
        #[arg(long)]
        test: PathBuf,
        /// 実験設定 (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        loss: Option<LossKind>,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// 保存されたチェックポイントで推論を実行します
    Infer {
        #[arg(long)]
        checkpoint: PathBuf,
        /// 学習時に保存した正規化器 (JSON)
        #[arg(long)]
        normalizers: PathBuf,
        /// 予測対象のイベント表 (CSV)
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// コマンドラインで指定された値で設定ファイルの値を上書きします。
pub fn apply_overrides(
    config: &mut ExperimentConfig,
    loss: Option<LossKind>,
    iterations: Option<usize>,
    batch_size: Option<usize>,
) {
    if let Some(loss) = loss {
        config.training.loss = loss;
    }
    if let Some(iterations) = iterations {
        config.training.iterations = iterations;
    }
    if let Some(batch_size) = batch_size {
        config.training.batch_size = batch_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_train_arguments() {
        let cli = Cli::parse_from([
            "deeponet",
            "train",
            "--train",
            "a.csv",
            "--test",
            "b.csv",
            "--loss",
            "mse",
            "--batch-size",
            "100",
        ]);
        let Commands::Train {
            loss,
            batch_size,
            iterations,
            ..
        } = cli.command
        else {
            panic!("expected train");
        };
        let mut config = ExperimentConfig::default();
        apply_overrides(&mut config, loss, iterations, batch_size);
        assert_eq!(config.training.loss, LossKind::Mse);
        assert_eq!(config.training.batch_size, 100);
        assert_eq!(config.training.iterations, 50);
    }

    #[test]
    fn rejects_unknown_loss() {
        let parsed = Cli::try_parse_from([
            "deeponet", "train", "--train", "a.csv", "--test", "b.csv", "--loss", "huber",
        ]);
        assert!(parsed.is_err());
    }
}
