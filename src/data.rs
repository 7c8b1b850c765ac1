//! イベント表の読み込みと、DeepONet 用テンソルへの変換。

use crate::error::{DeepOnetError, Result};
use crate::normalizer::{Normalizer, NormalizerKind};
use crate::operator::OperatorData;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// CSV の1行。`x,y,z,pe_total,ek,evis`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// 総光電子数
    pub pe_total: f32,
    /// 運動エネルギー（学習には使いません）
    #[serde(default)]
    pub ek: f32,
    /// 可視エネルギー（予測対象）
    #[serde(default)]
    pub evis: f32,
}

/// 推論用のイベント表を読み込みます。`ek` と `evis` の列は省略できます。
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    read_table(path, false)
}

/// 学習・テスト用のイベント表を読み込みます。目標値の `evis` 列が必須です。
pub fn read_labelled_events(path: &Path) -> Result<Vec<EventRecord>> {
    read_table(path, true)
}

fn read_table(path: &Path, require_evis: bool) -> Result<Vec<EventRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    if require_evis && !reader.headers()?.iter().any(|h| h == "evis") {
        return Err(DeepOnetError::config(format!(
            "{} has no evis column to train against",
            path.display()
        )));
    }
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<EventRecord>, _>>()?;
    if records.is_empty() {
        return Err(DeepOnetError::config(format!(
            "{} contains no events",
            path.display()
        )));
    }
    info!(path = %path.display(), events = records.len(), "events loaded");
    Ok(records)
}

/// 物理量ごとの正規化器。学習データだけから求めます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNormalizers {
    pub x: Normalizer,
    pub y: Normalizer,
    pub z: Normalizer,
    pub pe_total: Normalizer,
}

impl DataNormalizers {
    pub fn fit(records: &[EventRecord]) -> Result<Self> {
        let fit = |f: fn(&EventRecord) -> f32| {
            let values: Vec<f32> = records.iter().map(f).collect();
            Normalizer::fit(&values, 1, NormalizerKind::Gaussian)
        };
        Ok(Self {
            x: fit(|r| r.x)?,
            y: fit(|r| r.y)?,
            z: fit(|r| r.z)?,
            pe_total: fit(|r| r.pe_total)?,
        })
    }

    /// `[N, 3]` のブランチ入力（正規化済み x, y, z）と `[N, 1, 1]` のトランク入力（正規化済み総光電子数）。
    pub fn encode_inputs<B: Backend>(
        &self,
        records: &[EventRecord],
        device: &B::Device,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 3>)> {
        let n = records.len();
        let column = |f: fn(&EventRecord) -> f32| {
            let values: Vec<f32> = records.iter().map(f).collect();
            Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([n, 1])
        };
        let branch = Tensor::cat(
            vec![
                self.x.encode(column(|r| r.x))?,
                self.y.encode(column(|r| r.y))?,
                self.z.encode(column(|r| r.z))?,
            ],
            1,
        );
        let trunk = self
            .pe_total
            .encode(column(|r| r.pe_total).reshape([n, 1, 1]))?;
        Ok((branch, trunk))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// 可視エネルギーを `[N, 1]` の目標値テンソルにします（正規化しません）。
pub fn targets<B: Backend>(records: &[EventRecord], device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f32> = records.iter().map(|r| r.evis).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([records.len(), 1])
}

/// 正規化器と学習・テスト用のテンソル一式。
pub struct PreparedData<B: Backend> {
    pub normalizers: DataNormalizers,
    pub train: OperatorData<B>,
    pub test: OperatorData<B>,
}

impl<B: Backend> PreparedData<B> {
    pub fn from_records(
        train: &[EventRecord],
        test: &[EventRecord],
        device: &B::Device,
    ) -> Result<Self> {
        let normalizers = DataNormalizers::fit(train)?;
        let train = operator_data(&normalizers, train, device)?;
        let test = operator_data(&normalizers, test, device)?;
        Ok(Self {
            normalizers,
            train,
            test,
        })
    }
}

fn operator_data<B: Backend>(
    normalizers: &DataNormalizers,
    records: &[EventRecord],
    device: &B::Device,
) -> Result<OperatorData<B>> {
    if records.is_empty() {
        return Err(DeepOnetError::config("event table is empty"));
    }
    let (branch, trunk) = normalizers.encode_inputs(records, device)?;
    OperatorData::new(branch, trunk, targets(records, device))
}
