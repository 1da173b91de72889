pub mod loss;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::augment::{apply_batch_augmentations, apply_batch_color_remap, collate_grids};
use crate::config::Config;
use crate::data::ArcDataset;
use crate::model::DynOnnModel;
use crate::observer::{Observer, StepReport};
use crate::sampling::{augmented_score, generate_candidates, SamplingStrategy};
use crate::tokenizer::PAD_TOKEN_ID;
use loss::{
    gating_loss, masked_cross_entropy, mean_expert_grad_norm, mean_predictive_entropy, pi_score,
    token_and_grid_accuracy,
};

/// Sidecar written next to every checkpoint's tensor file.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    epoch: usize,
    global_step: usize,
}

/// Rescale all gradients in place so their global L2 norm does not exceed
/// `max_norm`. Returns the pre-clip norm.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sum_sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let scaled = (grad * scale)?;
                grads.insert(var, scaled);
            }
        }
    }
    Ok(norm)
}

pub struct Trainer {
    model: DynOnnModel,
    optimizer: AdamW,
    config: Config,
    device: Device,
    rng: StdRng,
    observer: Observer,
    strategy: SamplingStrategy,
    global_step: usize,
    start_epoch: usize,
}

impl Trainer {
    pub fn new(
        model: DynOnnModel,
        config: Config,
        device: Device,
        strategy: SamplingStrategy,
    ) -> Result<Self> {
        let optimizer = AdamW::new(
            model.all_vars(),
            ParamsAdamW {
                lr: config.training.learning_rate,
                weight_decay: config.training.weight_decay,
                ..Default::default()
            },
        )?;
        let rng = StdRng::seed_from_u64(config.training.seed);
        let mut trainer = Self {
            model,
            optimizer,
            config,
            device,
            rng,
            observer: Observer::new(),
            strategy,
            global_step: 0,
            start_epoch: 0,
        };
        trainer.try_resume()?;
        Ok(trainer)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Full training run: epochs of steps, a regeneration sweep and a
    /// checkpoint at every epoch boundary.
    pub fn run(&mut self, train_data: &ArcDataset, eval_data: &ArcDataset) -> Result<()> {
        info!(
            "training on {} pairs, evaluating on {} pairs, starting at epoch {}",
            train_data.len(),
            eval_data.len(),
            self.start_epoch
        );
        for epoch in self.start_epoch..self.config.training.epochs {
            self.train_one_epoch(train_data, eval_data, epoch)?;
            self.handle_expert_regeneration();
            self.save_checkpoint(epoch + 1)?;
        }
        Ok(())
    }

    /// One pass over the shuffled training pairs.
    ///
    /// Every batch is color-remapped, then a geometrically augmented copy is
    /// made; both run through the model and the augmented branch enters the
    /// objective through the consistency weight. Batches with a non-finite
    /// total loss are skipped before any optimizer state is touched.
    pub fn train_one_epoch(
        &mut self,
        train_data: &ArcDataset,
        eval_data: &ArcDataset,
        epoch: usize,
    ) -> Result<()> {
        let batches = train_data.batches(self.config.training.batch_size, true, &mut self.rng);
        let all_vars = self.model.all_vars();
        let expert_vars = self.model.expert_vars();

        let mut window_start = Instant::now();
        let mut window_items = 0usize;
        for batch in &batches {
            let (inputs, targets) = batch.to_tensors(&self.device)?;
            let (inputs, targets) = apply_batch_color_remap(&inputs, &targets, &mut self.rng)?;
            let (aug_inputs, aug_targets) =
                apply_batch_augmentations(&inputs, &targets, &mut self.rng)?;

            let (logits, mut caches) = self.model.forward(&inputs, Some(&targets), None, true)?;
            let (aug_logits, aug_caches) =
                self.model
                    .forward(&aug_inputs, Some(&aug_targets), None, true)?;
            caches.extend(aug_caches);

            let main_ce = masked_cross_entropy(&logits, &targets, PAD_TOKEN_ID)?;
            let aug_ce = masked_cross_entropy(&aug_logits, &aug_targets, PAD_TOKEN_ID)?;
            let (gate_loss, gate_summary) = gating_loss(&caches, &self.config)?;
            let total =
                ((&main_ce + (&aug_ce * self.config.loss.consistency)?)? + &gate_loss)?;

            let total_value = total.to_scalar::<f32>()? as f64;
            // Skipped batches do not count as steps, so the log/eval/checkpoint
            // cadence stays aligned with optimizer updates.
            if !total_value.is_finite() {
                warn!(
                    "skipping batch at step {}: non-finite loss {total_value}",
                    self.global_step
                );
                continue;
            }

            let mut grads = total.backward()?;
            clip_grad_norm(&mut grads, &all_vars, self.config.training.clip_grad_norm)?;
            let surprise = mean_expert_grad_norm(&grads, &expert_vars)?;
            self.optimizer.step(&grads)?;

            window_items += batch.len();
            self.global_step += 1;

            if self.global_step % self.config.training.log_interval == 0 {
                let (token_acc, grid_acc) =
                    token_and_grid_accuracy(&logits, &targets, PAD_TOKEN_ID)?;
                let entropy = mean_predictive_entropy(&logits)?;
                let main_value = main_ce.to_scalar::<f32>()? as f64;
                let elapsed = window_start.elapsed().as_secs_f64().max(1e-9);
                self.observer.log_step(&StepReport {
                    epoch,
                    step: self.global_step,
                    main_loss: main_value,
                    consistency_loss: aug_ce.to_scalar::<f32>()? as f64,
                    gating_loss: gate_loss.to_scalar::<f32>()? as f64,
                    token_accuracy: token_acc,
                    grid_accuracy: grid_acc,
                    pi: pi_score(
                        main_value,
                        entropy,
                        surprise,
                        self.config.loss.pi_alpha,
                        self.config.loss.pi_gamma,
                    ),
                    attn_mean_active: gate_summary.attn_mean_active,
                    moe_mean_active: gate_summary.moe_mean_active,
                    items_per_sec: window_items as f64 / elapsed,
                });
                window_start = Instant::now();
                window_items = 0;
            }

            if self.global_step % self.config.training.eval_interval == 0 {
                self.run_evaluation(eval_data, epoch)?;
            }
        }
        Ok(())
    }

    /// Pick the best of several sampled candidates per pair by test-time
    /// augmentation voting and report the exact-match rate.
    pub fn run_evaluation(&mut self, eval_data: &ArcDataset, epoch: usize) -> Result<()> {
        let batches = eval_data.batches(self.config.training.batch_size, false, &mut self.rng);
        let mut exact = 0usize;
        let mut seen = 0usize;
        let mut shown = 0usize;

        for batch in batches.iter().take(self.config.training.eval_batches) {
            for (input, target) in batch.inputs.iter().zip(&batch.outputs) {
                let input_tensor =
                    collate_grids(std::slice::from_ref(input), PAD_TOKEN_ID, &self.device)?;
                let target_hw = (target.len(), target[0].len());
                let candidates = generate_candidates(
                    &self.model,
                    &input_tensor,
                    target_hw,
                    self.strategy,
                    &self.config.sampling,
                    &mut self.rng,
                )?;

                let mut best = None;
                for candidate in candidates {
                    let score = augmented_score(
                        &self.model,
                        input,
                        &candidate,
                        self.config.sampling.num_augmentations,
                        &self.device,
                        &mut self.rng,
                    )?;
                    match &best {
                        Some((best_score, _)) if *best_score >= score => {}
                        _ => best = Some((score, candidate)),
                    }
                }

                if let Some((_, prediction)) = best {
                    seen += 1;
                    if &prediction == target {
                        exact += 1;
                    }
                    if shown < 2 {
                        self.observer.show_sample(input, target, &prediction);
                        shown += 1;
                    }
                }
            }
        }

        self.observer.log_eval(
            epoch,
            self.global_step,
            if seen == 0 {
                0.0
            } else {
                exact as f64 / seen as f64
            },
            seen,
        );
        Ok(())
    }

    /// Epoch-boundary maintenance: reinitialize every expert slot that never
    /// activated since the last sweep. Runs strictly between train steps so
    /// the in-place parameter writes never race a backward pass.
    pub fn handle_expert_regeneration(&self) {
        match self.model.regenerate_dead_experts() {
            Ok(report) => {
                let mut total = 0usize;
                for (layer, count) in &report {
                    let pool = if layer.ends_with(".moe") {
                        self.config.gating.moe.max_experts
                    } else {
                        self.config.gating.attention.max_experts
                    };
                    self.observer.log_regeneration(layer, *count, pool);
                    total += count;
                }
                if total > 0 {
                    info!("regeneration sweep reinitialized {total} expert slots");
                }
            }
            Err(err) => warn!("regeneration sweep failed: {err}"),
        }
    }

    fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.training.checkpoint_dir)
    }

    fn checkpoint_paths(step: usize, dir: &Path) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("checkpoint-{step:08}.safetensors")),
            dir.join(format!("checkpoint-{step:08}.json")),
        )
    }

    pub fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let dir = self.checkpoint_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint directory {dir:?}"))?;
        let (tensor_path, meta_path) = Self::checkpoint_paths(self.global_step, &dir);

        candle_core::safetensors::save(&self.model.export_tensors(), &tensor_path)?;
        let meta = CheckpointMeta {
            epoch,
            global_step: self.global_step,
        };
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
        info!("saved checkpoint {tensor_path:?}");

        self.rotate_checkpoints(&dir)?;
        Ok(())
    }

    fn rotate_checkpoints(&self, dir: &Path) -> Result<()> {
        let mut steps = Self::list_checkpoint_steps(dir)?;
        steps.sort_unstable();
        while steps.len() > self.config.training.max_checkpoints {
            let oldest = steps.remove(0);
            let (tensor_path, meta_path) = Self::checkpoint_paths(oldest, dir);
            std::fs::remove_file(&tensor_path).ok();
            std::fs::remove_file(&meta_path).ok();
        }
        Ok(())
    }

    fn list_checkpoint_steps(dir: &Path) -> Result<Vec<usize>> {
        let mut steps = Vec::new();
        if !dir.exists() {
            return Ok(steps);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(step) = name
                .strip_prefix("checkpoint-")
                .and_then(|rest| rest.strip_suffix(".safetensors"))
                .and_then(|digits| digits.parse::<usize>().ok())
            {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    fn try_resume(&mut self) -> Result<()> {
        let dir = self.checkpoint_dir();
        let Some(&latest) = Self::list_checkpoint_steps(&dir)?.iter().max() else {
            return Ok(());
        };
        let (tensor_path, meta_path) = Self::checkpoint_paths(latest, &dir);

        let tensors = candle_core::safetensors::load(&tensor_path, &self.device)?;
        self.model.import_tensors(&tensors)?;
        let meta: CheckpointMeta = serde_json::from_str(
            &std::fs::read_to_string(&meta_path)
                .with_context(|| format!("reading checkpoint sidecar {meta_path:?}"))?,
        )?;
        self.global_step = meta.global_step;
        self.start_epoch = meta.epoch;
        info!(
            "resumed from {tensor_path:?} at epoch {} step {}",
            meta.epoch, meta.global_step
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::GridPair;
    use crate::tokenizer::ArcTokenizer;
    use candle_core::Tensor;

    fn tiny_config(checkpoint_dir: &Path) -> Config {
        let mut config = Config::default();
        config.model.hidden_size = 16;
        config.model.num_hidden_layers = 2;
        config.model.head_dim = 8;
        config.model.intermediate_size = 8;
        config.model.max_grid_size = 6;
        config.model.use_object_finder = false;
        config.gating.attention.max_experts = 4;
        config.gating.attention.min_experts = 1;
        config.gating.attention.fallback_k = 2;
        config.gating.moe.max_experts = 4;
        config.gating.moe.min_experts = 1;
        config.gating.moe.fallback_k = 2;
        config.training.batch_size = 2;
        config.training.log_interval = 1;
        config.training.eval_interval = 1_000_000;
        config.training.max_checkpoints = 2;
        config.training.checkpoint_dir = checkpoint_dir.to_string_lossy().into_owned();
        config.sampling.num_candidates = 2;
        config.sampling.num_augmentations = 2;
        config
    }

    fn tiny_trainer(checkpoint_dir: &Path) -> Trainer {
        let config = tiny_config(checkpoint_dir);
        let model = DynOnnModel::new(
            &config.model,
            &config.gating,
            ArcTokenizer::new().vocab_size(),
            &Device::Cpu,
        )
        .unwrap();
        Trainer::new(model, config, Device::Cpu, SamplingStrategy::Greedy).unwrap()
    }

    fn tiny_dataset() -> ArcDataset {
        ArcDataset::from_pairs(vec![
            GridPair {
                input: vec![vec![1, 2], vec![3, 4]],
                output: vec![vec![4, 3], vec![2, 1]],
            },
            GridPair {
                input: vec![vec![5, 6], vec![7, 8]],
                output: vec![vec![8, 7], vec![6, 5]],
            },
        ])
    }

    #[test]
    fn clipping_caps_the_global_gradient_norm() -> Result<()> {
        let var = Var::from_tensor(&Tensor::from_vec(
            vec![3f32, 4.0],
            2,
            &Device::Cpu,
        )?)?;
        let loss = (var.as_tensor().sqr()?.sum_all()? * 50.0)?;
        let mut grads = loss.backward()?;
        let vars = vec![var.clone()];

        let pre_norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!(pre_norm > 1.0);

        let post_norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!(post_norm <= 1.0 + 1e-4);
        Ok(())
    }

    #[test]
    fn one_epoch_advances_the_step_counter() -> Result<()> {
        let dir = std::env::temp_dir().join("dynonn_trainer_step_test");
        std::fs::remove_dir_all(&dir).ok();
        let mut trainer = tiny_trainer(&dir);
        let data = tiny_dataset();

        trainer.train_one_epoch(&data, &data, 0)?;
        assert_eq!(trainer.global_step(), 1);
        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn non_finite_batches_do_not_advance_the_step_counter() -> Result<()> {
        let dir = std::env::temp_dir().join("dynonn_trainer_nan_test");
        std::fs::remove_dir_all(&dir).ok();
        let mut trainer = tiny_trainer(&dir);

        // Poison one parameter so every forward yields a non-finite loss.
        let poisoned = trainer
            .model
            .named_parameters()
            .into_iter()
            .find(|(name, _)| name == "encoder.tok_embed.weight")
            .map(|(_, var)| var)
            .unwrap();
        poisoned.set(&(poisoned.as_tensor() * f64::NAN)?)?;

        let data = tiny_dataset();
        trainer.train_one_epoch(&data, &data, 0)?;
        assert_eq!(trainer.global_step(), 0, "skipped batches are not steps");

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn checkpoints_rotate_and_resume() -> Result<()> {
        let dir = std::env::temp_dir().join("dynonn_trainer_ckpt_test");
        std::fs::remove_dir_all(&dir).ok();

        let mut trainer = tiny_trainer(&dir);
        for step in [1, 2, 3] {
            trainer.global_step = step;
            trainer.save_checkpoint(step)?;
        }
        // max_checkpoints = 2: the oldest file is gone.
        let steps = Trainer::list_checkpoint_steps(&dir)?;
        assert_eq!(steps.len(), 2);
        assert!(!steps.contains(&1));

        let resumed = tiny_trainer(&dir);
        assert_eq!(resumed.global_step(), 3);
        assert_eq!(resumed.start_epoch(), 3);

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
