use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::ops::{log_softmax, softmax};

use crate::config::Config;
use crate::model::gating::l2_normalize;
use crate::model::{ExpertKind, GateCache};

/// Per-step view of the gate behaviour, averaged over all caches of one pass.
#[derive(Debug, Clone, Default)]
pub struct GatingSummary {
    /// Mean number of active experts per token, self/cross attention gates.
    pub attn_mean_active: f64,
    /// Mean number of active experts per token, feed-forward gates.
    pub moe_mean_active: f64,
    /// Unweighted sparsity penalty, summed over caches.
    pub sparsity: f64,
    /// Unweighted diversity penalty, summed over caches.
    pub diversity: f64,
}

/// Cross-entropy over the grid cells, ignoring pad positions. `logits` is
/// `[batch, h, w, vocab]`, `targets` is `[batch, h, w]` symbol ids.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (b, h, w, v) = logits.dims4()?;
    let n = b * h * w;
    let flat_logits = logits.reshape((n, v))?;
    let flat_targets = targets.reshape(n)?;

    let log_probs = log_softmax(&flat_logits, D::Minus1)?;
    let picked = log_probs
        .gather(&flat_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let mask = flat_targets.ne(pad_id)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()? as f64;
    if count == 0.0 {
        return Tensor::zeros((), DType::F32, logits.device());
    }
    let nll = (picked.neg()? * mask)?.sum_all()?;
    nll / count
}

/// Auxiliary gate loss over every cache of a forward pass.
///
/// Each gate contributes a sparsity term, the squared gap between its mean
/// active-expert count and the pool's target floor, and a diversity term, the
/// Frobenius norm of its normalized-prototype Gram matrix minus identity.
/// Both flow gradients: sparsity through the straight-through mask, diversity
/// through the live prototype handle in the cache.
pub fn gating_loss(caches: &[GateCache], config: &Config) -> Result<(Tensor, GatingSummary)> {
    let mut summary = GatingSummary::default();
    let Some(first) = caches.first() else {
        return Ok((
            Tensor::zeros((), DType::F32, &candle_core::Device::Cpu)?,
            summary,
        ));
    };
    let device = first.raw_logits.device().clone();
    let mut total = Tensor::zeros((), DType::F32, &device)?;

    let mut attn_active = (0f64, 0usize);
    let mut moe_active = (0f64, 0usize);
    for cache in caches {
        let pool = config.pool(cache.kind);
        let avg_k = cache.activation_mask.sum(D::Minus1)?.mean_all()?;
        let sparsity = (avg_k.clone() - pool.min_experts as f64)?.sqr()?;

        let normed = l2_normalize(&cache.prototypes, 0)?;
        let gram = normed.t()?.matmul(&normed)?;
        let e = gram.dim(0)?;
        let eye = Tensor::eye(e, DType::F32, &device)?;
        let diversity = (gram - eye)?.sqr()?.sum_all()?.sqrt()?;

        summary.sparsity += sparsity.to_scalar::<f32>()? as f64;
        summary.diversity += diversity.to_scalar::<f32>()? as f64;
        let mean_active = avg_k.to_scalar::<f32>()? as f64;
        match cache.kind {
            ExpertKind::Attention => {
                attn_active.0 += mean_active;
                attn_active.1 += 1;
            }
            ExpertKind::FeedForward => {
                moe_active.0 += mean_active;
                moe_active.1 += 1;
            }
        }

        let weighted = ((sparsity * config.sparsity_weight(cache.kind))?
            + (diversity * config.diversity_weight(cache.kind))?)?;
        total = (total + weighted)?;
    }

    if attn_active.1 > 0 {
        summary.attn_mean_active = attn_active.0 / attn_active.1 as f64;
    }
    if moe_active.1 > 0 {
        summary.moe_mean_active = moe_active.0 / moe_active.1 as f64;
    }
    Ok((total, summary))
}

/// Token accuracy over non-pad cells and the fraction of grids whose non-pad
/// cells are all correct. Scoring runs over the target shape; predicted grids
/// smaller than the target are treated as pad-filled beyond their bounds, so
/// missing cells count as wrong.
pub fn token_and_grid_accuracy(
    logits: &Tensor,
    targets: &Tensor,
    pad_id: u32,
) -> Result<(f64, f64)> {
    let predictions = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec3::<u32>()?;
    let targets = targets.to_vec3::<u32>()?;

    let mut correct = 0u64;
    let mut total = 0u64;
    let mut exact_grids = 0u64;
    for (pred_grid, target_grid) in predictions.iter().zip(&targets) {
        let mut grid_correct = true;
        for (y, target_row) in target_grid.iter().enumerate() {
            for (x, &t) in target_row.iter().enumerate() {
                if t == pad_id {
                    continue;
                }
                let p = pred_grid
                    .get(y)
                    .and_then(|row| row.get(x))
                    .copied()
                    .unwrap_or(pad_id);
                total += 1;
                if p == t {
                    correct += 1;
                } else {
                    grid_correct = false;
                }
            }
        }
        if grid_correct {
            exact_grids += 1;
        }
    }

    let token_acc = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };
    let grid_acc = exact_grids as f64 / targets.len().max(1) as f64;
    Ok((token_acc, grid_acc))
}

/// Mean entropy of the predictive distribution over all cells. Used as the
/// temperature in the pi score, so confident models are held to a tighter
/// loss standard.
pub fn mean_predictive_entropy(logits: &Tensor) -> Result<f64> {
    let (b, h, w, v) = logits.dims4()?;
    let flat = logits.reshape((b * h * w, v))?;
    let probs = softmax(&flat, D::Minus1)?;
    let log_probs = log_softmax(&flat, D::Minus1)?;
    let entropy = (probs * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()?;
    Ok(entropy.to_scalar::<f32>()? as f64)
}

/// Mean L2 gradient norm over the expert parameters, a cheap proxy for how
/// surprised the expert pools were by the batch.
pub fn mean_expert_grad_norm(grads: &GradStore, expert_vars: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    let mut n = 0usize;
    for var in expert_vars {
        if let Some(grad) = grads.get(var) {
            total += (grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64).sqrt();
            n += 1;
        }
    }
    Ok(if n == 0 { 0.0 } else { total / n as f64 })
}

/// Scalar health score in (0, 1]: decays with entropy-normalized loss and
/// with expert surprise. Observation only, never part of the objective.
pub fn pi_score(loss: f64, entropy: f64, surprise: f64, alpha: f64, gamma: f64) -> f64 {
    let tau = entropy.max(1e-6);
    (-alpha * (loss / tau + gamma * surprise)).exp()
}
