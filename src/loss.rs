use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 相対誤差の分母に使う目標値の下限
pub const TARGET_EPSILON: f32 = 1e-6;

/// 最適化に使う損失関数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    /// 要素ごとの二乗誤差の平均
    Mse,
    /// バッチ内で合計した相対 L2 誤差
    #[default]
    #[serde(alias = "l2")]
    #[value(alias = "l2")]
    RelativeL2,
}

impl LossKind {
    pub fn compute<B: Backend>(&self, pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        match self {
            LossKind::Mse => mse(pred, target),
            LossKind::RelativeL2 => relative_l2(pred, target),
        }
    }
}

pub fn mse<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    MseLoss::new().forward(pred, target, Reduction::Mean)
}

/// 各行について `‖pred - target‖₂ / ‖target‖₂` を求め、バッチ全体で合計します。
///
/// 平均ではなく合計なので、エポックの集計ではサンプル数で割ると1例あたりの値になります。
/// `‖target‖₂` は `TARGET_EPSILON` 以上に切り上げ、該当する行があれば警告を出します。
pub fn relative_l2<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let diff_norm = (pred - target.clone()).powf_scalar(2.0).sum_dim(1).sqrt();
    let target_norm = target.powf_scalar(2.0).sum_dim(1).sqrt();
    let degenerate = target_norm
        .clone()
        .lower_equal_elem(TARGET_EPSILON)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    if degenerate > 0 {
        warn!(
            count = degenerate,
            "near-zero target rows clamped in relative L2"
        );
    }
    (diff_norm / target_norm.clamp_min(TARGET_EPSILON)).sum()
}

/// 物理単位での誤差指標 `sqrt(mean(((pred - target) / sqrt(target))^2))`。
///
/// 目標値は `TARGET_EPSILON` 以上に切り上げ、該当があれば警告を出します。
pub fn denormalized_error<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> f64 {
    let non_positive = target
        .clone()
        .lower_equal_elem(TARGET_EPSILON)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    if non_positive > 0 {
        warn!(
            count = non_positive,
            "non-positive targets clamped in denormalized error"
        );
    }
    let denom = target.clone().clamp_min(TARGET_EPSILON).sqrt();
    ((pred - target) / denom)
        .powf_scalar(2.0)
        .mean()
        .sqrt()
        .into_scalar()
        .elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(shape)
    }

    #[test]
    fn mse_is_plain_mean() {
        let pred = tensor(&[1.0, 2.0, 3.0, 4.0], [2, 2]);
        let target = tensor(&[1.0, 0.0, 3.0, 0.0], [2, 2]);
        let value: f32 = mse(pred, target).into_scalar();
        assert!((value - 5.0).abs() < 1e-6);
    }

    #[test]
    fn relative_l2_sums_over_batch() {
        let pred = tensor(&[6.0, 8.0, 1.0, 1.0], [2, 2]);
        let target = tensor(&[3.0, 4.0, 1.0, 1.0], [2, 2]);
        // row 0: |(3,4)| / |(3,4)| = 1, row 1: 0
        let value: f32 = relative_l2(pred, target).into_scalar();
        assert!((value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn relative_l2_of_identical_rows_is_batch_sum() {
        let pred = tensor(&[2.0, 2.0, 2.0], [3, 1]);
        let target = tensor(&[1.0, 1.0, 1.0], [3, 1]);
        let value: f32 = relative_l2(pred, target).into_scalar();
        assert!((value - 3.0).abs() < 1e-6);
    }

    #[test]
    fn relative_l2_stays_finite_for_zero_target_rows() {
        let pred = tensor(&[1.0, 2.0, 0.0], [3, 1]);
        let target = tensor(&[0.0, 2.0, 0.0], [3, 1]);
        // row 0: 1 / eps, row 1: 0, row 2: 0 / eps
        let value: f32 = relative_l2(pred, target).into_scalar();
        assert!(value.is_finite());
        let expected = 1.0 / TARGET_EPSILON;
        assert!((value - expected).abs() <= 1e-3 * expected);
    }

    #[test]
    fn denormalized_error_uses_sqrt_target() {
        let pred = tensor(&[6.0, 4.0], [2, 1]);
        let target = tensor(&[4.0, 4.0], [2, 1]);
        // ((2/2)^2 + 0) / 2 = 0.5
        let value = denormalized_error(pred, target);
        assert!((value - 0.5f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn denormalized_error_stays_finite_for_zero_targets() {
        let pred = tensor(&[1.0, 0.0], [2, 1]);
        let target = tensor(&[0.0, -1.0], [2, 1]);
        assert!(denormalized_error(pred, target).is_finite());
    }

    #[test]
    fn loss_kind_names() {
        assert_eq!(LossKind::from_str("mse", true).unwrap(), LossKind::Mse);
        assert_eq!(LossKind::from_str("relative-l2", true).unwrap(), LossKind::RelativeL2);
        assert_eq!(LossKind::from_str("l2", true).unwrap(), LossKind::RelativeL2);
        assert!(LossKind::from_str("huber", true).is_err());
    }
}
