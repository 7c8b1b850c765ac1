use crate::error::{DeepOnetError, Result};
use crate::mlp::{Activation, Mlp, MlpConfig};
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Tensor, activation::relu};
use serde::{Deserialize, Serialize};

/// ブランチネットとして振る舞える部品。
///
/// `[batch, in_features]` の条件入力を `[batch, out_features]` の埋め込みに写します。
pub trait BranchNet<B: Backend> {
    fn embed(&self, input: Tensor<B, 2>) -> Tensor<B, 2>;
    fn in_features(&self) -> usize;
    fn out_features(&self) -> usize;
}

impl<B: Backend> BranchNet<B> for Mlp<B> {
    fn embed(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(input)
    }

    fn in_features(&self) -> usize {
        Mlp::in_features(self)
    }

    fn out_features(&self) -> usize {
        Mlp::out_features(self)
    }
}

/// 座標列を1チャネルの系列とみなして畳み込む小さなエンコーダ。
///
/// conv(1→16, k=2) → relu → conv(16→32, k=2) → relu → flatten → linear → relu
#[derive(Module, Debug)]
pub struct Conv1dEncoder<B: Backend> {
    conv1: Conv1d<B>,
    conv2: Conv1d<B>,
    head: Linear<B>,
    in_features: usize,
    out_features: usize,
}

const CONV1_CHANNELS: usize = 16;
const CONV2_CHANNELS: usize = 32;
const KERNEL_SIZE: usize = 2;

impl<B: Backend> Conv1dEncoder<B> {
    pub fn new(in_features: usize, embedding_dim: usize, device: &B::Device) -> Result<Self> {
        if in_features < 2 * (KERNEL_SIZE - 1) + 1 {
            return Err(DeepOnetError::config(format!(
                "conv1d branch needs at least 3 input features, got {in_features}"
            )));
        }
        if embedding_dim == 0 {
            return Err(DeepOnetError::config("conv1d branch embedding width must be positive"));
        }
        let flat = CONV2_CHANNELS * (in_features - 2 * (KERNEL_SIZE - 1));
        Ok(Self {
            conv1: Conv1dConfig::new(1, CONV1_CHANNELS, KERNEL_SIZE).init(device),
            conv2: Conv1dConfig::new(CONV1_CHANNELS, CONV2_CHANNELS, KERNEL_SIZE).init(device),
            head: LinearConfig::new(flat, embedding_dim).init(device),
            in_features,
            out_features: embedding_dim,
        })
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = input.dims();
        // [batch, len] -> [batch, 1, len]
        let x = input.unsqueeze_dim::<3>(1);
        let x = relu(self.conv1.forward(x));
        let x = relu(self.conv2.forward(x));
        let [_, channels, len] = x.dims();
        let x = x.reshape([batch, channels * len]);
        relu(self.head.forward(x))
    }
}

impl<B: Backend> BranchNet<B> for Conv1dEncoder<B> {
    fn embed(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(input)
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }
}

/// 設定ファイルから選べるブランチネット。
#[derive(Module, Debug)]
pub enum Branch<B: Backend> {
    Mlp(Mlp<B>),
    Conv1d(Conv1dEncoder<B>),
}

impl<B: Backend> BranchNet<B> for Branch<B> {
    fn embed(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Branch::Mlp(net) => net.embed(input),
            Branch::Conv1d(net) => net.embed(input),
        }
    }

    fn in_features(&self) -> usize {
        match self {
            Branch::Mlp(net) => BranchNet::in_features(net),
            Branch::Conv1d(net) => net.in_features(),
        }
    }

    fn out_features(&self) -> usize {
        match self {
            Branch::Mlp(net) => BranchNet::out_features(net),
            Branch::Conv1d(net) => net.out_features(),
        }
    }
}

/// 設定ファイルから組み立てるブランチネットの記述。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchSpec {
    /// relu・最終層の活性化なしの MLP
    Mlp { layers: Vec<usize> },
    Conv1d {
        in_features: usize,
        embedding_dim: usize,
    },
}

impl BranchSpec {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Branch<B>> {
        match self {
            BranchSpec::Mlp { layers } => {
                let mlp = MlpConfig::new(layers.clone())
                    .with_activation(Activation::Relu)
                    .with_activate_last(false)
                    .init(device)?;
                Ok(Branch::Mlp(mlp))
            }
            BranchSpec::Conv1d {
                in_features,
                embedding_dim,
            } => Ok(Branch::Conv1d(Conv1dEncoder::new(
                *in_features,
                *embedding_dim,
                device,
            )?)),
        }
    }
}

impl From<Vec<usize>> for BranchSpec {
    fn from(layers: Vec<usize>) -> Self {
        BranchSpec::Mlp { layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn mlp_branch_embeds_to_last_width() {
        let device = Default::default();
        let branch = BranchSpec::from(vec![3, 32, 128]).init::<TestBackend>(&device).unwrap();
        assert_eq!(branch.in_features(), 3);
        assert_eq!(branch.out_features(), 128);
        let out = branch.embed(Tensor::ones([5, 3], &device));
        assert_eq!(out.dims(), [5, 128]);
    }

    #[test]
    fn conv_branch_embeds_coordinates() {
        let device = Default::default();
        let spec = BranchSpec::Conv1d {
            in_features: 3,
            embedding_dim: 128,
        };
        let branch = spec.init::<TestBackend>(&device).unwrap();
        assert_eq!(branch.out_features(), 128);
        let out = branch.embed(Tensor::ones([4, 3], &device));
        assert_eq!(out.dims(), [4, 128]);
        let min: f32 = out.min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn conv_branch_handles_longer_inputs() {
        let device = Default::default();
        let encoder = Conv1dEncoder::<TestBackend>::new(6, 10, &device).unwrap();
        let out = encoder.embed(Tensor::ones([2, 6], &device));
        assert_eq!(out.dims(), [2, 10]);
    }

    #[test]
    fn conv_branch_rejects_short_inputs() {
        let device = Default::default();
        assert!(Conv1dEncoder::<TestBackend>::new(2, 8, &device).is_err());
    }

    #[test]
    fn spec_parses_from_toml() {
        let spec: BranchSpec = toml::from_str("kind = \"mlp\"\nlayers = [3, 64, 64]").unwrap();
        assert_eq!(spec, BranchSpec::Mlp { layers: vec![3, 64, 64] });
        let spec: BranchSpec =
            toml::from_str("kind = \"conv1d\"\nin_features = 3\nembedding_dim = 128").unwrap();
        assert!(matches!(spec, BranchSpec::Conv1d { embedding_dim: 128, .. }));
    }
}
