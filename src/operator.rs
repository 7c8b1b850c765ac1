use crate::branch::{Branch, BranchNet};
use crate::error::{DeepOnetError, Result};
use crate::loss::{LossKind, denormalized_error, relative_l2};
use crate::model::{DeepOnet, DeepOnetConfig};
use crate::output::timestamp;
use burn::module::{AutodiffModule, Module, ModuleDisplay};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// ブランチ入力・トランク入力・目標値の組。
///
/// `branch: [N, D_b]`, `trunk: [N, T, D_t]`, `target: [N, T]`
#[derive(Debug, Clone)]
pub struct OperatorData<B: Backend> {
    branch: Tensor<B, 2>,
    trunk: Tensor<B, 3>,
    target: Tensor<B, 2>,
}

impl<B: Backend> OperatorData<B> {
    pub fn new(branch: Tensor<B, 2>, trunk: Tensor<B, 3>, target: Tensor<B, 2>) -> Result<Self> {
        let [n, _] = branch.dims();
        let [n_trunk, points, _] = trunk.dims();
        let [n_target, target_points] = target.dims();
        if n == 0 {
            return Err(DeepOnetError::shape("branch input", "dimension 0 (examples) is empty"));
        }
        if n_trunk != n {
            return Err(DeepOnetError::shape(
                "trunk input",
                format!("dimension 0 is {n_trunk}, the branch input has {n} examples"),
            ));
        }
        if n_target != n {
            return Err(DeepOnetError::shape(
                "target",
                format!("dimension 0 is {n_target}, the branch input has {n} examples"),
            ));
        }
        if target_points != points {
            return Err(DeepOnetError::shape(
                "target",
                format!("dimension 1 is {target_points}, the trunk input has {points} points"),
            ));
        }
        Ok(Self {
            branch,
            trunk,
            target,
        })
    }

    pub fn len(&self) -> usize {
        self.branch.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn branch(&self) -> &Tensor<B, 2> {
        &self.branch
    }

    pub fn trunk(&self) -> &Tensor<B, 3> {
        &self.trunk
    }

    pub fn target(&self) -> &Tensor<B, 2> {
        &self.target
    }

    /// 指定した行だけを取り出します。
    pub fn select(&self, indices: &[usize]) -> Self {
        let device = self.branch.device();
        let ids = indices.iter().map(|&i| i as i64).collect::<Vec<_>>();
        let ids = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [indices.len()]), &device);
        Self {
            branch: self.branch.clone().select(0, ids.clone()),
            trunk: self.trunk.clone().select(0, ids.clone()),
            target: self.target.clone().select(0, ids),
        }
    }

    pub fn to_device(&self, device: &B::Device) -> Self {
        Self {
            branch: self.branch.clone().to_device(device),
            trunk: self.trunk.clone().to_device(device),
            target: self.target.clone().to_device(device),
        }
    }
}

impl<B: AutodiffBackend> OperatorData<B> {
    /// 勾配を追跡しないバックエンドのテンソルに変換します。
    pub fn inner(&self) -> OperatorData<B::InnerBackend> {
        OperatorData {
            branch: self.branch.clone().inner(),
            trunk: self.trunk.clone().inner(),
            target: self.target.clone().inner(),
        }
    }
}

/// 学習ループの設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// 学習・テストのサンプル数を割り切る必要があります
    pub batch_size: usize,
    pub loss: LossKind,
    pub iterations: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    /// `iterations / 10` エポックごとに学習率へ掛ける係数（小数の周期も可）
    pub lr_gamma: f64,
    /// ミニバッチのシャッフルに使う乱数の種
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            loss: LossKind::RelativeL2,
            iterations: 50,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            lr_gamma: 0.5,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self, n_train: usize, n_test: usize) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeepOnetError::config("batch_size must be positive"));
        }
        if self.iterations == 0 {
            return Err(DeepOnetError::config("iterations must be positive"));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(DeepOnetError::config("learning_rate must be positive"));
        }
        if !(self.weight_decay >= 0.0) || !self.weight_decay.is_finite() {
            return Err(DeepOnetError::config(format!(
                "weight_decay must be a non-negative number, got {}",
                self.weight_decay
            )));
        }
        if !(self.lr_gamma > 0.0 && self.lr_gamma <= 1.0) {
            return Err(DeepOnetError::config(format!(
                "lr_gamma must lie in (0, 1], got {}",
                self.lr_gamma
            )));
        }
        for (name, n) in [("training", n_train), ("test", n_test)] {
            if n % self.batch_size != 0 {
                return Err(DeepOnetError::config(format!(
                    "batch_size {} does not evenly divide the {} {} examples",
                    self.batch_size, n, name
                )));
            }
        }
        Ok(())
    }

    /// ステップ減衰させた `epoch` 番目の学習率。
    ///
    /// 周期 `iterations / 10` は小数のまま扱い、`k % step == 0` となるエポック `k`
    /// (1 ≤ k ≤ epoch) ごとに `lr_gamma` を掛けます。周期が 1 未満なら減衰しません。
    pub fn learning_rate_at(&self, epoch: usize) -> f64 {
        let step = self.iterations as f64 / 10.0;
        let decays = (1..=epoch).filter(|&k| k as f64 % step == 0.0).count();
        self.learning_rate * self.lr_gamma.powi(decays as i32)
    }
}

/// ミニバッチに分ける添字の並び。
///
/// 学習側は毎エポック `shuffle` し、評価側は入力順のまま使います。
#[derive(Debug, Clone)]
struct MiniBatches {
    order: Vec<usize>,
    batch_size: usize,
}

impl MiniBatches {
    fn new(len: usize, batch_size: usize) -> Self {
        Self {
            order: (0..len).collect(),
            batch_size,
        }
    }

    fn shuffle(&mut self, rng: &mut StdRng) {
        self.order.shuffle(rng);
    }

    fn iter(&self) -> std::slice::Chunks<'_, usize> {
        self.order.chunks(self.batch_size)
    }
}

/// 1エポック分の集計値。損失はサンプル数で割った1例あたりの値です。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub duration: Duration,
    pub learning_rate: f64,
    /// 最適化に使った損失
    pub train_loss: f64,
    pub train_l2: f64,
    pub test_l2: f64,
    /// このエポックまでの最良テスト損失
    pub best_test_l2: f64,
    /// テストデータ全体での `sqrt(mean(((pred - y) / sqrt(y))^2))`
    pub denormalized_error: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochReport>,
}

impl TrainingHistory {
    pub fn best_test_l2(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.best_test_l2)
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// テスト損失が最小だったエポックのモデルの凍結コピー。
#[derive(Debug, Clone)]
pub struct BestModel<B: Backend, N: Module<B> + ModuleDisplay> {
    pub model: DeepOnet<B, N>,
    pub test_l2: f64,
    pub epoch: usize,
}

/// DeepONet の学習・評価・推論・保存をまとめたもの。
///
/// ブランチネット `N` は既定では設定ファイルから組み立てる [`Branch`] です。
pub struct OperatorModel<B: AutodiffBackend, N: AutodiffModule<B> = Branch<B>>
where
    N::InnerModule: ModuleDisplay,
{
    model: DeepOnet<B, N>,
    best: Option<BestModel<B::InnerBackend, N::InnerModule>>,
}

impl<B: AutodiffBackend> OperatorModel<B> {
    pub fn from_config(config: &DeepOnetConfig, device: &B::Device) -> Result<Self> {
        Ok(Self::new(config.init(device)?))
    }
}

impl<B, N> OperatorModel<B, N>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + BranchNet<B> + ModuleDisplay,
    N::InnerModule: BranchNet<B::InnerBackend> + ModuleDisplay,
{
    pub fn new(model: DeepOnet<B, N>) -> Self {
        Self { model, best: None }
    }

    /// 学習対象のネットワークを差し替えます。記録済みの最良モデルは破棄されます。
    pub fn replace_model(&mut self, model: DeepOnet<B, N>) {
        self.model = model;
        self.best = None;
    }

    pub fn model(&self) -> &DeepOnet<B, N> {
        &self.model
    }

    pub fn into_model(self) -> DeepOnet<B, N> {
        self.model
    }

    pub fn best(&self) -> Option<&BestModel<B::InnerBackend, N::InnerModule>> {
        self.best.as_ref()
    }

    pub fn run(
        &mut self,
        train: &OperatorData<B>,
        test: &OperatorData<B>,
        config: &TrainingConfig,
        device: &B::Device,
    ) -> Result<TrainingHistory> {
        self.run_with_cancel(train, test, config, device, None)
    }

    /// 学習ループ本体。`cancel` はエポックの境目でだけ確認します。
    pub fn run_with_cancel(
        &mut self,
        train: &OperatorData<B>,
        test: &OperatorData<B>,
        config: &TrainingConfig,
        device: &B::Device,
        cancel: Option<&AtomicBool>,
    ) -> Result<TrainingHistory> {
        let n_train = train.len();
        let n_test = test.len();
        config.validate(n_train, n_test)?;
        self.model.check_inputs(train.branch.dims(), train.trunk.dims())?;
        self.model.check_inputs(test.branch.dims(), test.trunk.dims())?;

        let train = train.to_device(device);
        let test = test.to_device(device).inner();
        let mut model = self.model.clone().fork(device);
        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
            .init();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut train_batches = MiniBatches::new(n_train, config.batch_size);
        let test_batches = MiniBatches::new(n_test, config.batch_size);
        let mut history = TrainingHistory::default();
        self.best = None;

        info!(
            n_train,
            n_test,
            batch_size = config.batch_size,
            iterations = config.iterations,
            loss = ?config.loss,
            "training started"
        );

        for epoch in 0..config.iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                warn!(epoch, "training cancelled");
                break;
            }
            let epoch_start = Instant::now();
            let learning_rate = config.learning_rate_at(epoch);

            train_batches.shuffle(&mut rng);
            let mut train_loss = 0.0;
            let mut train_l2 = 0.0;
            for chunk in train_batches.iter() {
                let batch = train.select(chunk);
                let out = model.forward(batch.branch, batch.trunk);
                let loss = config.loss.compute(out.clone(), batch.target.clone());
                let l2 = relative_l2(out.inner(), batch.target.inner());
                train_loss += loss.clone().into_scalar().elem::<f64>();
                train_l2 += l2.into_scalar().elem::<f64>();

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(learning_rate, model, grads);
            }

            let valid = model.valid();
            let mut test_l2 = 0.0;
            for chunk in test_batches.iter() {
                let batch = test.select(chunk);
                let out = valid.forward(batch.branch, batch.trunk);
                test_l2 += relative_l2(out, batch.target).into_scalar().elem::<f64>();
            }

            train_loss /= n_train as f64;
            train_l2 /= n_train as f64;
            test_l2 /= n_test as f64;
            let duration = epoch_start.elapsed();

            if test_l2 < self.best.as_ref().map_or(f64::MAX, |b| b.test_l2) {
                debug!(epoch, test_l2, "new best model");
                self.best = Some(BestModel {
                    model: valid.clone(),
                    test_l2,
                    epoch,
                });
            }
            let best_test_l2 = self.best.as_ref().map_or(test_l2, |b| b.test_l2);

            let error = denormalized_error(
                valid.forward(test.branch.clone(), test.trunk.clone()),
                test.target.clone(),
            );
            info!(
                epoch,
                time = duration.as_secs_f64(),
                train_loss,
                train_l2,
                test_l2,
                error,
                "epoch finished"
            );

            history.epochs.push(EpochReport {
                epoch,
                duration,
                learning_rate,
                train_loss,
                train_l2,
                test_l2,
                best_test_l2,
                denormalized_error: error,
            });
        }

        self.model = model;
        if let Some(best) = &self.best {
            info!(epoch = best.epoch, test_l2 = best.test_l2, "training finished");
        }
        Ok(history)
    }

    /// 最良モデルで推論し、`[N, T]` の予測を返します。
    pub fn predict(
        &self,
        branch: Tensor<B, 2>,
        trunk: Tensor<B, 3>,
    ) -> Result<Tensor<B::InnerBackend, 2>> {
        let best = self.best.as_ref().ok_or(DeepOnetError::UninitializedBestModel)?;
        best.model.try_forward(branch.inner(), trunk.inner())
    }

    /// 学習中のモデルのパラメータを `{prefix}{YYYY-MM-DD_HH-MM-SS}.mpk` に保存します。
    pub fn save(&self, prefix: &str) -> Result<PathBuf> {
        if self.best.is_none() {
            return Err(DeepOnetError::UninitializedBestModel);
        }
        let path = PathBuf::from(format!("{prefix}{}.mpk", timestamp()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.model.clone().save_file(
            path.clone(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        )?;
        info!(path = %path.display(), "model saved");
        Ok(path)
    }
}
