use thiserror::Error;

/// クレート全体で使うエラー型。
#[derive(Debug, Error)]
pub enum DeepOnetError {
    /// 層構成・学習設定など、構築時に検出できる設定の誤り
    #[error("configuration error: {0}")]
    Configuration(String),
    /// テンソルの階数・次元の不一致
    #[error("shape error in {tensor}: {detail}")]
    Shape { tensor: &'static str, detail: String },
    /// 1エポックも完了していない状態での predict / save
    #[error("no completed epoch yet: call run() before predict() or save()")]
    UninitializedBestModel,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("recorder error: {0}")]
    Recorder(#[from] burn::record::RecorderError),
    #[error("plot error: {0}")]
    Plot(String),
}

impl DeepOnetError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(tensor: &'static str, detail: impl Into<String>) -> Self {
        Self::Shape {
            tensor,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeepOnetError>;
