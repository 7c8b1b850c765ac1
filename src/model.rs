use crate::branch::{Branch, BranchNet, BranchSpec};
use crate::error::{DeepOnetError, Result};
use crate::mlp::{Activation, Mlp, MlpConfig};
use burn::module::{Module, Param};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// DeepONet の構成。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepOnetConfig {
    pub branch: BranchSpec,
    /// トランクネットの層幅（relu・最終層の後にも活性化）
    pub trunk_layers: Vec<usize>,
}

impl Default for DeepOnetConfig {
    fn default() -> Self {
        Self {
            branch: BranchSpec::Mlp {
                layers: vec![3, 128, 128, 128],
            },
            trunk_layers: vec![1, 128, 128, 128],
        }
    }
}

impl DeepOnetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DeepOnet<B, Branch<B>>> {
        let branch = self.branch.init(device)?;
        DeepOnet::from_parts(branch, &self.trunk_layers, device)
    }
}

/// ブランチネットとトランクネットの埋め込みを内積で結合する作用素学習モデル。
///
/// 出力は `out[b, j] = Σ_i branch[b, i] * trunk[b, j, i] + bias` です。
/// ブランチネット `N` は [`BranchNet`] を実装した任意のモジュールで、設定ファイルから
/// 組み立てる場合は [`Branch`] になります。
#[derive(Module, Debug)]
pub struct DeepOnet<B: Backend, N: Module<B>> {
    branch: N,
    trunk: Mlp<B>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend, N: Module<B> + BranchNet<B>> DeepOnet<B, N> {
    /// 構築済みのブランチネットとトランクネットの層幅からモデルを組み立てます。
    pub fn from_parts(branch: N, trunk_layers: &[usize], device: &B::Device) -> Result<Self> {
        let trunk = MlpConfig::new(trunk_layers.to_vec())
            .with_activation(Activation::Relu)
            .with_activate_last(true)
            .init(device)?;
        if branch.out_features() != trunk.out_features() {
            return Err(DeepOnetError::config(format!(
                "branch embedding width {} does not match trunk embedding width {}",
                branch.out_features(),
                trunk.out_features()
            )));
        }
        Ok(Self {
            branch,
            trunk,
            bias: Param::from_tensor(Tensor::zeros([1], device)),
        })
    }

    /// 順伝播。`branch: [batch, D_b]`, `trunk: [batch, T, D_t]` から `[batch, T]` を返します。
    pub fn forward(&self, branch: Tensor<B, 2>, trunk: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, points, _] = trunk.dims();
        let branch_emb = self.branch.embed(branch);
        let trunk_emb = self.trunk.forward(trunk);
        // [batch, T, P] x [batch, P, 1] -> [batch, T, 1]
        let out = trunk_emb.matmul(branch_emb.unsqueeze_dim::<3>(2));
        out.reshape([batch, points]) + self.bias.val().unsqueeze::<2>()
    }

    /// 入力の形状を検査してから順伝播します。
    pub fn try_forward(&self, branch: Tensor<B, 2>, trunk: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
        self.check_inputs(branch.dims(), trunk.dims())?;
        Ok(self.forward(branch, trunk))
    }

    pub fn check_inputs(&self, branch: [usize; 2], trunk: [usize; 3]) -> Result<()> {
        if branch[1] != self.branch.in_features() {
            return Err(DeepOnetError::shape(
                "branch input",
                format!(
                    "dimension 1 is {}, the branch network expects {}",
                    branch[1],
                    self.branch.in_features()
                ),
            ));
        }
        if trunk[0] != branch[0] {
            return Err(DeepOnetError::shape(
                "trunk input",
                format!(
                    "dimension 0 (batch) is {}, the branch input has {}",
                    trunk[0], branch[0]
                ),
            ));
        }
        if trunk[1] == 0 {
            return Err(DeepOnetError::shape("trunk input", "dimension 1 (points) is empty"));
        }
        if trunk[2] != self.trunk.in_features() {
            return Err(DeepOnetError::shape(
                "trunk input",
                format!(
                    "dimension 2 is {}, the trunk network expects {}",
                    trunk[2],
                    self.trunk.in_features()
                ),
            ));
        }
        Ok(())
    }

    pub fn branch(&self) -> &N {
        &self.branch
    }

    pub fn trunk(&self) -> &Mlp<B> {
        &self.trunk
    }

    pub fn bias(&self) -> Tensor<B, 1> {
        self.bias.val()
    }

    pub fn embedding_dim(&self) -> usize {
        self.trunk.out_features()
    }
}
