use crate::error::{DeepOnetError, Result};
use burn::module::{Ignored, Module, Param};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Tensor, activation};
use serde::{Deserialize, Serialize};

/// 層間に挿入する活性化関数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Tanh,
    Relu,
    Gelu,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Tanh => activation::tanh(x),
            Activation::Relu => activation::relu(x),
            Activation::Gelu => activation::gelu(x),
        }
    }
}

/// 多層パーセプトロンの構成。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// 入力から出力までの各層の幅（2つ以上）
    pub layer_sizes: Vec<usize>,
    #[serde(default)]
    pub activation: Activation,
    /// 最終層の後にも活性化関数を適用するか
    #[serde(default)]
    pub activate_last: bool,
}

impl MlpConfig {
    pub fn new(layer_sizes: Vec<usize>) -> Self {
        Self {
            layer_sizes,
            activation: Activation::default(),
            activate_last: false,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_activate_last(mut self, activate_last: bool) -> Self {
        self.activate_last = activate_last;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer_sizes.len() < 2 {
            return Err(DeepOnetError::config(format!(
                "an MLP needs at least 2 layer widths, got {:?}",
                self.layer_sizes
            )));
        }
        if self.layer_sizes.contains(&0) {
            return Err(DeepOnetError::config(format!(
                "MLP layer widths must be positive, got {:?}",
                self.layer_sizes
            )));
        }
        Ok(())
    }

    /// 重みを Xavier 正規分布、バイアスをゼロで初期化したモデルを作ります。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Mlp<B>> {
        self.validate()?;
        let linears = self
            .layer_sizes
            .windows(2)
            .map(|pair| {
                let mut linear = LinearConfig::new(pair[0], pair[1])
                    .with_initializer(Initializer::XavierNormal { gain: 1.0 })
                    .init(device);
                linear.bias = Some(Param::from_tensor(Tensor::zeros([pair[1]], device)));
                linear
            })
            .collect();
        Ok(Mlp {
            linears,
            activation: Ignored(self.activation),
            activate_last: self.activate_last,
        })
    }
}

/// 全結合層と活性化関数を交互に積み重ねたネットワーク。
///
/// ブランチネット・トランクネットの両方に使います。
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Ignored<Activation>,
    activate_last: bool,
}

impl<B: Backend> Mlp<B> {
    /// 順伝播。最後の次元が `layer_sizes[0]` であれば階数は問いません。
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let last = self.linears.len() - 1;
        let mut x = input;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last || self.activate_last {
                x = self.activation.apply(x);
            }
        }
        x
    }

    pub fn in_features(&self) -> usize {
        self.linears[0].weight.val().dims()[0]
    }

    pub fn out_features(&self) -> usize {
        self.linears[self.linears.len() - 1].weight.val().dims()[1]
    }

    pub fn num_layers(&self) -> usize {
        self.linears.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn shapes_follow_layer_sizes() {
        let device = Default::default();
        let mlp = MlpConfig::new(vec![3, 16, 8, 5]).init::<TestBackend>(&device).unwrap();
        assert_eq!(mlp.num_layers(), 3);
        assert_eq!(mlp.in_features(), 3);
        assert_eq!(mlp.out_features(), 5);

        let out = mlp.forward(Tensor::<TestBackend, 2>::ones([7, 3], &device));
        assert_eq!(out.dims(), [7, 5]);
        let out = mlp.forward(Tensor::<TestBackend, 3>::ones([2, 4, 3], &device));
        assert_eq!(out.dims(), [2, 4, 5]);
    }

    #[test]
    fn biases_start_at_zero() {
        let device = Default::default();
        let mlp = MlpConfig::new(vec![2, 32, 1]).init::<TestBackend>(&device).unwrap();
        for linear in &mlp.linears {
            let bias = linear.bias.as_ref().unwrap().val();
            let total: f32 = bias.abs().sum().into_scalar();
            assert_eq!(total, 0.0);
        }
    }

    #[test]
    fn trailing_activation_bounds_output() {
        let device = Default::default();
        let mlp = MlpConfig::new(vec![4, 64, 64])
            .with_activation(Activation::Relu)
            .with_activate_last(true)
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 2>::random(
            [32, 4],
            burn::tensor::Distribution::Normal(0.0, 3.0),
            &device,
        );
        let min: f32 = mlp.forward(input).min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn tanh_output_is_bounded_when_activated_last() {
        let device = Default::default();
        let mlp = MlpConfig::new(vec![1, 8])
            .with_activate_last(true)
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 2>::ones([3, 1], &device).mul_scalar(50.0);
        let max: f32 = mlp.forward(input).abs().max().into_scalar();
        assert!(max <= 1.0);
    }

    #[test]
    fn rejects_too_few_widths() {
        let device = Default::default();
        let err = MlpConfig::new(vec![3]).init::<TestBackend>(&device).unwrap_err();
        assert!(matches!(err, DeepOnetError::Configuration(_)));
        assert!(MlpConfig::new(vec![3, 0, 1]).init::<TestBackend>(&device).is_err());
    }
}
