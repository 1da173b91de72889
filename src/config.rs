use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::model::ExpertKind;

/// Top-level hyperparameters. Loaded from TOML when a config file exists,
/// otherwise the defaults below (tuned for ARC-AGI-2 grids) are used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelKnobs,
    pub gating: GatingKnobs,
    pub loss: LossKnobs,
    pub training: TrainingKnobs,
    pub sampling: SamplingKnobs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelKnobs {
    pub hidden_size: usize,       // e.g., 128
    pub num_hidden_layers: usize, // encoder depth; decoder uses half
    pub head_dim: usize,          // e.g., 32
    pub intermediate_size: usize, // per-expert FFN width
    pub max_grid_size: usize,     // 30 for ARC-AGI-2
    pub use_object_finder: bool,  // extra gated self-attention stage on the embedded input
}

/// One expert pool: fixed capacity, a target floor, and the forced-activation
/// width used when no expert clears its threshold for a token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExpertPoolKnobs {
    pub max_experts: usize,
    pub min_experts: usize,
    pub fallback_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingKnobs {
    pub attention: ExpertPoolKnobs,
    pub moe: ExpertPoolKnobs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossKnobs {
    pub attn_diversity: f64,
    pub attn_sparsity: f64,
    pub moe_diversity: f64,
    pub moe_sparsity: f64,
    pub consistency: f64,
    pub pi_alpha: f64, // observation only
    pub pi_gamma: f64, // observation only
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingKnobs {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub clip_grad_norm: f64,
    pub epochs: usize,
    pub log_interval: usize,
    pub eval_interval: usize,
    pub eval_batches: usize,
    pub max_checkpoints: usize,
    pub checkpoint_dir: String,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingKnobs {
    pub temperature: f64,
    pub top_p: f64,
    pub num_candidates: usize,
    pub num_augmentations: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelKnobs {
                hidden_size: 128,
                num_hidden_layers: 16,
                head_dim: 32,
                intermediate_size: 32,
                max_grid_size: 30,
                use_object_finder: true,
            },
            gating: GatingKnobs {
                attention: ExpertPoolKnobs {
                    max_experts: 16,
                    min_experts: 4,
                    fallback_k: 16,
                },
                moe: ExpertPoolKnobs {
                    max_experts: 16,
                    min_experts: 4,
                    fallback_k: 16,
                },
            },
            loss: LossKnobs {
                attn_diversity: 0.1,
                attn_sparsity: 0.1,
                moe_diversity: 0.1,
                moe_sparsity: 0.1,
                consistency: 1.0,
                pi_alpha: 16.0,
                pi_gamma: 0.5,
            },
            training: TrainingKnobs {
                batch_size: 8,
                learning_rate: 1e-3,
                weight_decay: 0.01,
                clip_grad_norm: 1.0,
                epochs: 1000,
                log_interval: 10,
                eval_interval: 100,
                eval_batches: 1,
                max_checkpoints: 3,
                checkpoint_dir: "checkpoints".to_string(),
                seed: 42,
            },
            sampling: SamplingKnobs {
                temperature: 0.7,
                top_p: 0.3,
                num_candidates: 8,
                num_augmentations: 8,
            },
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn pool(&self, kind: ExpertKind) -> ExpertPoolKnobs {
        match kind {
            ExpertKind::Attention => self.gating.attention,
            ExpertKind::FeedForward => self.gating.moe,
        }
    }

    pub fn diversity_weight(&self, kind: ExpertKind) -> f64 {
        match kind {
            ExpertKind::Attention => self.loss.attn_diversity,
            ExpertKind::FeedForward => self.loss.moe_diversity,
        }
    }

    pub fn sparsity_weight(&self, kind: ExpertKind) -> f64 {
        match kind {
            ExpertKind::Attention => self.loss.attn_sparsity,
            ExpertKind::FeedForward => self.loss.moe_sparsity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pools_are_consistent() {
        let config = Config::default();
        assert!(config.gating.attention.min_experts <= config.gating.attention.max_experts);
        assert!(config.gating.moe.min_experts <= config.gating.moe.max_experts);
        assert!(config.gating.attention.fallback_k <= config.gating.attention.max_experts);
    }

    #[test]
    fn kind_accessors_pick_the_right_pool() {
        let mut config = Config::default();
        config.gating.attention.max_experts = 7;
        config.gating.moe.max_experts = 9;
        assert_eq!(config.pool(ExpertKind::Attention).max_experts, 7);
        assert_eq!(config.pool(ExpertKind::FeedForward).max_experts, 9);
    }
}
