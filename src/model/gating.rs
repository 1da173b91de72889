use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::ops::softmax;
use std::cell::RefCell;

use crate::model::ste::straight_through_step;

/// Which flavor of dynamic expert layer produced a gate decision. Carried in
/// the gate cache so loss-weight lookups never depend on the calling module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpertKind {
    Attention,
    FeedForward,
}

impl ExpertKind {
    /// Short tag used as a metric-name prefix.
    pub fn tag(&self) -> &'static str {
        match self {
            ExpertKind::Attention => "attn",
            ExpertKind::FeedForward => "moe",
        }
    }
}

/// Ephemeral per-forward gate decision, consumed once by the auxiliary loss.
///
/// `prototypes` is a handle to the gating network's live prototype matrix: it
/// shares the autodiff id of the underlying `Var`, so the diversity loss
/// computed from a cache still back-propagates into the gate parameters.
pub struct GateCache {
    pub kind: ExpertKind,
    /// Similarity-minus-threshold scores, pre-ReLU. `[tokens, max_experts]`.
    pub raw_logits: Tensor,
    /// Binary activation mask after the fallback override. `[tokens, max_experts]`.
    pub activation_mask: Tensor,
    /// `[hidden, max_experts]` prototype matrix of the originating gate.
    pub prototypes: Tensor,
    /// Raw per-expert outputs of the owning layer, for observability.
    pub expert_outputs: Option<Tensor>,
}

/// Normalize along `dim` to unit L2 norm.
pub(crate) fn l2_normalize(t: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(dim)?.sqrt()?;
    t.broadcast_div(&(norm + 1e-12)?)
}

/// Similarity-threshold gate over a fixed pool of expert slots.
///
/// Activation counters are owned mutable state local to this instance,
/// incremented only during training-mode forwards and zeroed exactly once per
/// regeneration cycle via [`GatingNetwork::reset_counts`]. Single-threaded by
/// design; no forward runs concurrently with regeneration.
pub struct GatingNetwork {
    kind: ExpertKind,
    max_experts: usize,
    /// `[hidden, max_experts]`; normalized columns are expert directions.
    prototypes: Var,
    /// One learned activation threshold per expert slot.
    thresholds: Var,
    activation_counts: RefCell<Vec<u64>>,
}

impl GatingNetwork {
    pub fn new(
        kind: ExpertKind,
        hidden_size: usize,
        max_experts: usize,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let prototypes = Var::from_tensor(&Tensor::randn(
            0f32,
            1f32,
            (hidden_size, max_experts),
            device,
        )?)?;
        let thresholds =
            Var::from_tensor(&Tensor::zeros(max_experts, DType::F32, device)?)?;
        Ok(Self {
            kind,
            max_experts,
            prototypes,
            thresholds,
            activation_counts: RefCell::new(vec![0; max_experts]),
        })
    }

    pub fn kind(&self) -> ExpertKind {
        self.kind
    }

    pub fn max_experts(&self) -> usize {
        self.max_experts
    }

    pub fn prototypes(&self) -> &Var {
        &self.prototypes
    }

    pub fn thresholds(&self) -> &Var {
        &self.thresholds
    }

    /// Route every token of `hidden` (`[batch, tokens, hidden]`) to a
    /// variable-size subset of experts.
    ///
    /// Returns softmax routing weights `[batch*tokens, max_experts]` that are
    /// non-zero only on the active set, plus the gate cache. Tokens for which
    /// no similarity clears its threshold get their top-`fallback_k` raw
    /// logits forced active, so every token routes to at least one expert.
    pub fn forward(
        &self,
        hidden: &Tensor,
        fallback_k: usize,
        train: bool,
    ) -> Result<(Tensor, GateCache)> {
        if fallback_k == 0 || fallback_k > self.max_experts {
            candle_core::bail!(
                "fallback_k {} out of range for pool of {} experts",
                fallback_k,
                self.max_experts
            );
        }
        let (b, t, c) = hidden.dims3()?;
        let n_tokens = b * t;
        let flat = hidden.reshape((n_tokens, c))?;

        // Cosine similarity against the expert directions, shifted by the
        // per-expert learned threshold.
        let similarity =
            l2_normalize(&flat, 1)?.matmul(&l2_normalize(self.prototypes.as_tensor(), 0)?)?;
        let raw_logits = similarity.broadcast_sub(self.thresholds.as_tensor())?;

        let gated_logits = raw_logits.relu()?;
        let mut activation_mask = straight_through_step(&gated_logits)?;

        // Fallback: tokens with an empty active set take their top-k raw
        // logits instead. The override rows carry no gradient, same as the
        // in-place scatter of the reference design.
        let row_sums = activation_mask.sum(1)?.to_vec1::<f32>()?;
        if row_sums.iter().any(|&s| s == 0.0) {
            let logits_host = raw_logits.to_vec2::<f32>()?;
            let e = self.max_experts;
            let mut fallback = vec![0f32; n_tokens * e];
            let mut inactive = vec![0u8; n_tokens * e];
            for (row, &sum) in row_sums.iter().enumerate() {
                if sum != 0.0 {
                    continue;
                }
                let mut order: Vec<usize> = (0..e).collect();
                order.sort_by(|&a, &b| {
                    logits_host[row][b]
                        .partial_cmp(&logits_host[row][a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &idx in order.iter().take(fallback_k) {
                    fallback[row * e + idx] = 1.0;
                }
                for slot in inactive.iter_mut().skip(row * e).take(e) {
                    *slot = 1;
                }
            }
            let fallback = Tensor::from_vec(fallback, (n_tokens, e), hidden.device())?;
            let inactive = Tensor::from_vec(inactive, (n_tokens, e), hidden.device())?;
            activation_mask = inactive.where_cond(&fallback, &activation_mask)?;
        }

        // Softmax over the active set only.
        let neg_inf = Tensor::full(
            f32::NEG_INFINITY,
            (n_tokens, self.max_experts),
            hidden.device(),
        )?;
        let active = activation_mask.to_dtype(DType::U8)?;
        let masked_logits = active.where_cond(&gated_logits, &neg_inf)?;
        let routing_weights = softmax(&masked_logits, D::Minus1)?;

        if train {
            let per_expert = activation_mask.sum(0)?.to_vec1::<f32>()?;
            let mut counts = self.activation_counts.borrow_mut();
            for (count, activated) in counts.iter_mut().zip(per_expert) {
                *count += activated as u64;
            }
        }

        let cache = GateCache {
            kind: self.kind,
            raw_logits,
            activation_mask,
            prototypes: self.prototypes.as_tensor().clone(),
            expert_outputs: None,
        };
        Ok((routing_weights, cache))
    }

    /// Expert slots with zero accumulated activations since the last reset.
    pub fn dead_experts(&self) -> Vec<usize> {
        self.activation_counts
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == 0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn activation_counts(&self) -> Vec<u64> {
        self.activation_counts.borrow().clone()
    }

    /// Part of the regeneration contract: called exactly once per cycle,
    /// after the dead slots have been reinitialized.
    pub fn reset_counts(&self) {
        self.activation_counts.borrow_mut().fill(0);
    }

    /// Reinitialize one slot's gate parameters: fresh small-norm prototype
    /// column, zeroed threshold. Writes directly into the live `Var`s, so it
    /// must only run between train steps.
    pub fn reinit_expert(&self, expert_idx: usize) -> Result<()> {
        let prototypes = self.prototypes.as_tensor();
        let (c, e) = prototypes.dims2()?;
        let fresh_column = Tensor::randn(0f32, 0.02f32, (c, 1), prototypes.device())?;
        let mut columns = Vec::with_capacity(e);
        for i in 0..e {
            if i == expert_idx {
                columns.push(fresh_column.clone());
            } else {
                columns.push(prototypes.narrow(1, i, 1)?.contiguous()?);
            }
        }
        self.prototypes.set(&Tensor::cat(&columns, 1)?)?;

        let mut thresholds = self.thresholds.as_tensor().to_vec1::<f32>()?;
        thresholds[expert_idx] = 0.0;
        let e_len = thresholds.len();
        self.thresholds.set(&Tensor::from_vec(
            thresholds,
            e_len,
            self.thresholds.as_tensor().device(),
        )?)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_counts_for_test(&self, counts: Vec<u64>) {
        *self.activation_counts.borrow_mut() = counts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn gate(max_experts: usize, hidden: usize) -> GatingNetwork {
        GatingNetwork::new(ExpertKind::FeedForward, hidden, max_experts, &Device::Cpu).unwrap()
    }

    #[test]
    fn every_token_gets_at_least_one_expert() -> Result<()> {
        let g = gate(4, 8);
        // Push all thresholds far above any cosine similarity so that the
        // plain threshold activation yields nothing and the fallback fires.
        g.thresholds
            .set(&Tensor::full(10f32, 4, &Device::Cpu)?)?;

        let hidden = Tensor::randn(0f32, 1f32, (2, 3, 8), &Device::Cpu)?;
        let (weights, cache) = g.forward(&hidden, 2, false)?;

        let mask = cache.activation_mask.to_vec2::<f32>()?;
        for row in &mask {
            let active: f32 = row.iter().sum();
            assert_eq!(active, 2.0, "fallback must force exactly k slots");
        }

        // Routing weights sum to 1 over the active set and are 0 elsewhere.
        let weights = weights.to_vec2::<f32>()?;
        for (w_row, m_row) in weights.iter().zip(&mask) {
            let total: f32 = w_row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
            for (w, m) in w_row.iter().zip(m_row) {
                if *m == 0.0 {
                    assert_eq!(*w, 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn counts_accumulate_only_in_train_mode() -> Result<()> {
        let g = gate(4, 8);
        let hidden = Tensor::randn(0f32, 1f32, (1, 5, 8), &Device::Cpu)?;

        g.forward(&hidden, 1, false)?;
        assert_eq!(g.activation_counts(), vec![0, 0, 0, 0]);

        g.forward(&hidden, 1, true)?;
        let total: u64 = g.activation_counts().iter().sum();
        assert!(total >= 5, "every one of the 5 tokens activates something");
        Ok(())
    }

    #[test]
    fn fallback_k_out_of_range_is_an_error() {
        let g = gate(4, 8);
        let hidden = Tensor::randn(0f32, 1f32, (1, 2, 8), &Device::Cpu).unwrap();
        assert!(g.forward(&hidden, 0, false).is_err());
        assert!(g.forward(&hidden, 5, false).is_err());
    }

    #[test]
    fn reinit_zeroes_threshold_and_replaces_prototype_column() -> Result<()> {
        let g = gate(3, 6);
        g.thresholds
            .set(&Tensor::from_vec(vec![0.5f32, 0.5, 0.5], 3, &Device::Cpu)?)?;
        let before = g.prototypes.as_tensor().to_vec2::<f32>()?;

        g.reinit_expert(1)?;

        let after = g.prototypes.as_tensor().to_vec2::<f32>()?;
        let thresholds = g.thresholds.as_tensor().to_vec1::<f32>()?;
        assert_eq!(thresholds, vec![0.5, 0.0, 0.5]);
        for (row_before, row_after) in before.iter().zip(&after) {
            assert_eq!(row_before[0], row_after[0]);
            assert_eq!(row_before[2], row_after[2]);
            // Fresh column is drawn at sigma 0.02, virtually never equal.
            assert_ne!(row_before[1], row_after[1]);
        }
        Ok(())
    }
}
