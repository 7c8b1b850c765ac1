use crate::error::Result;
use crate::model::DeepOnetConfig;
use crate::operator::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 出力先の設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// 予測結果を書き出すディレクトリ
    pub log_dir: PathBuf,
    /// チェックポイントのパスの前半部分（後ろに時刻と拡張子が付きます）
    pub checkpoint_prefix: String,
    pub loss_plot: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./log"),
            checkpoint_prefix: String::from("./checkpoints/deeponet_"),
            loss_plot: PathBuf::from("loss_graph.png"),
        }
    }
}

/// TOML で記述する実験設定。省略した項目は既定値になります。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: DeepOnetConfig,
    pub training: TrainingConfig,
    pub paths: PathsConfig,
}

impl ExperimentConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// 指定があればファイルから、なければ既定値。
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
