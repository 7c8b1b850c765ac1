use crate::error::{DeepOnetError, Result};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// これより小さいスケールは定数特徴量とみなし、1.0 に置き換えます。
pub const SCALE_EPSILON: f32 = 1e-6;

/// 正規化の方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizerKind {
    /// 平均と標準偏差による標準化
    #[default]
    Gaussian,
    /// 最小値と値域による [0, 1] への写像
    MinMax,
}

/// 1つの物理量に対するアフィン正規化。
///
/// 学習データから一度だけ統計量を求め、以降は学習・テスト双方のエンコードと
/// 予測値のデコードに読み取り専用で使います。物理量ごとに独立したインスタンスを持ちます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    kind: NormalizerKind,
    center: Vec<f32>,
    scale: Vec<f32>,
}

impl Normalizer {
    /// 行優先 `[N, features]` の配列から特徴量ごとの統計量を求めます。
    pub fn fit(values: &[f32], features: usize, kind: NormalizerKind) -> Result<Self> {
        if features == 0 {
            return Err(DeepOnetError::config("normalizer needs at least one feature"));
        }
        if values.is_empty() || values.len() % features != 0 {
            return Err(DeepOnetError::config(format!(
                "normalizer input of length {} is not a non-empty multiple of {} features",
                values.len(),
                features
            )));
        }
        let rows = values.len() / features;
        let column = move |f: usize| values.iter().skip(f).step_by(features).map(|v| *v as f64);

        let mut center = Vec::with_capacity(features);
        let mut scale = Vec::with_capacity(features);
        for f in 0..features {
            let (c, s) = match kind {
                NormalizerKind::Gaussian => {
                    let mean = column(f).sum::<f64>() / rows as f64;
                    let var = column(f).map(|v| (v - mean).powi(2)).sum::<f64>() / rows as f64;
                    (mean, var.sqrt())
                }
                NormalizerKind::MinMax => {
                    let min = column(f).fold(f64::INFINITY, f64::min);
                    let max = column(f).fold(f64::NEG_INFINITY, f64::max);
                    (min, max - min)
                }
            };
            let s = s as f32;
            if !(s >= SCALE_EPSILON) {
                warn!(feature = f, scale = s, "degenerate feature scale, falling back to 1.0");
                scale.push(1.0);
            } else {
                scale.push(s);
            }
            center.push(c as f32);
        }

        Ok(Self {
            kind,
            center,
            scale,
        })
    }

    pub fn kind(&self) -> NormalizerKind {
        self.kind
    }

    pub fn features(&self) -> usize {
        self.center.len()
    }

    pub fn center(&self) -> &[f32] {
        &self.center
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    /// `(x - center) / scale` を最後の次元に沿ってブロードキャストして計算します。
    pub fn encode<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let (center, scale) = self.broadcast_stats(&input)?;
        Ok((input - center) / scale)
    }

    /// `x * scale + center`
    pub fn decode<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let (center, scale) = self.broadcast_stats(&input)?;
        Ok(input * scale + center)
    }

    pub fn encode_values(&self, values: &[f32]) -> Result<Vec<f32>> {
        self.check_len(values.len())?;
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let f = i % self.features();
                (v - self.center[f]) / self.scale[f]
            })
            .collect())
    }

    pub fn decode_values(&self, values: &[f32]) -> Result<Vec<f32>> {
        self.check_len(values.len())?;
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let f = i % self.features();
                v * self.scale[f] + self.center[f]
            })
            .collect())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len % self.features() != 0 {
            return Err(DeepOnetError::shape(
                "normalizer input",
                format!("length {} is not a multiple of {} features", len, self.features()),
            ));
        }
        Ok(())
    }

    fn broadcast_stats<B: Backend, const D: usize>(
        &self,
        input: &Tensor<B, D>,
    ) -> Result<(Tensor<B, D>, Tensor<B, D>)> {
        let dims = input.dims();
        if D == 0 || dims[D - 1] != self.features() {
            return Err(DeepOnetError::shape(
                "normalizer input",
                format!(
                    "last dimension of {:?} must equal the {} fitted features",
                    dims,
                    self.features()
                ),
            ));
        }
        let device = input.device();
        let mut shape = [1usize; D];
        shape[D - 1] = self.features();
        let center = Tensor::<B, 1>::from_floats(self.center.as_slice(), &device).reshape(shape);
        let scale = Tensor::<B, 1>::from_floats(self.scale.as_slice(), &device).reshape(shape);
        Ok((center, scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn gaussian_statistics_are_per_feature() {
        let values = [1.0, 10.0, 3.0, 30.0];
        let n = Normalizer::fit(&values, 2, NormalizerKind::Gaussian).unwrap();
        assert_eq!(n.center(), &[2.0, 20.0]);
        assert_eq!(n.scale(), &[1.0, 10.0]);
    }

    #[test]
    fn min_max_statistics() {
        let values = [2.0, 4.0, 6.0];
        let n = Normalizer::fit(&values, 1, NormalizerKind::MinMax).unwrap();
        assert_eq!(n.center(), &[2.0]);
        assert_eq!(n.scale(), &[4.0]);
        assert_eq!(n.encode_values(&values).unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn tensor_round_trip() {
        let device = Default::default();
        let raw = [0.5f32, -3.0, 12.0, 7.25, 100.0, -0.125];
        let n = Normalizer::fit(&raw, 3, NormalizerKind::Gaussian).unwrap();
        let x = Tensor::<TestBackend, 1>::from_floats(raw.as_slice(), &device).reshape([2, 3]);
        let back = n.decode(n.encode(x).unwrap()).unwrap();
        let back: Vec<f32> = back.into_data().to_vec().unwrap();
        for (a, b) in raw.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1e-5 * a.abs().max(1.0), "{a} vs {b}");
        }
    }

    #[test]
    fn encode_broadcasts_over_rank_three() {
        let device = Default::default();
        let n = Normalizer::fit(&[1.0, 3.0], 1, NormalizerKind::Gaussian).unwrap();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0f32, 3.0].as_slice(), &device).reshape([2, 1, 1]);
        let encoded: Vec<f32> = n.encode(x).unwrap().into_data().to_vec().unwrap();
        assert_eq!(encoded, vec![-1.0, 1.0]);
    }

    #[test]
    fn constant_feature_never_produces_nan() {
        let device = Default::default();
        let raw = [4.0f32; 8];
        let n = Normalizer::fit(&raw, 2, NormalizerKind::Gaussian).unwrap();
        let x = Tensor::<TestBackend, 1>::from_floats(raw.as_slice(), &device).reshape([4, 2]);
        let encoded: Vec<f32> = n.encode(x).unwrap().into_data().to_vec().unwrap();
        assert!(encoded.iter().all(|v| v.is_finite()));
        assert!(encoded.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn feature_mismatch_is_a_shape_error() {
        let device = Default::default();
        let n = Normalizer::fit(&[1.0, 2.0, 3.0], 3, NormalizerKind::Gaussian).unwrap();
        let x = Tensor::<TestBackend, 2>::zeros([4, 2], &device);
        assert!(matches!(n.encode(x), Err(DeepOnetError::Shape { .. })));
    }

    #[test]
    fn rejects_ragged_input() {
        assert!(Normalizer::fit(&[1.0, 2.0, 3.0], 2, NormalizerKind::Gaussian).is_err());
        assert!(Normalizer::fit(&[], 1, NormalizerKind::Gaussian).is_err());
    }
}
