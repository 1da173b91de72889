use candle_core::{Result, Tensor, Var};

use crate::config::ExpertPoolKnobs;
use crate::model::gating::{ExpertKind, GateCache, GatingNetwork};
use crate::model::init::{kaiming_uniform, reinit_bank_slice};

/// Feed-forward layer with a pool of expand/contract expert pairs.
///
/// Every expert is computed densely for every token (expand, GELU, contract)
/// and the results are combined by the token's routing weights. The sparsity
/// here shapes gradients and the auxiliary losses rather than skipping
/// compute.
pub struct DynMoeLayer {
    gating: GatingNetwork,
    /// `[max_experts, hidden, intermediate]`
    w1: Var,
    /// `[max_experts, intermediate, hidden]`
    w2: Var,
    hidden_size: usize,
    intermediate_size: usize,
    fallback_k: usize,
}

impl DynMoeLayer {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        pool: ExpertPoolKnobs,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let e = pool.max_experts;
        let gating = GatingNetwork::new(ExpertKind::FeedForward, hidden_size, e, device)?;
        let w1 = Var::from_tensor(&kaiming_uniform(
            hidden_size,
            (e, hidden_size, intermediate_size),
            device,
        )?)?;
        let w2 = Var::from_tensor(&kaiming_uniform(
            intermediate_size,
            (e, intermediate_size, hidden_size),
            device,
        )?)?;
        Ok(Self {
            gating,
            w1,
            w2,
            hidden_size,
            intermediate_size,
            fallback_k: pool.fallback_k,
        })
    }

    pub fn gating(&self) -> &GatingNetwork {
        &self.gating
    }

    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<(Tensor, GateCache)> {
        let (b, t, c) = hidden.dims3()?;
        let n_tokens = b * t;
        let (routing, mut cache) = self.gating.forward(hidden, self.fallback_k, train)?;

        // Dense per-expert compute: [1, n, c] x [e, c, i] -> [e, n, i].
        let flat = hidden.reshape((n_tokens, c))?;
        let intermediate = flat
            .unsqueeze(0)?
            .broadcast_matmul(self.w1.as_tensor())?
            .gelu_erf()?;
        let expert_outputs = intermediate.matmul(self.w2.as_tensor())?;
        // [n, e, c] so each token can mix its own expert set.
        let expert_outputs = expert_outputs.transpose(0, 1)?.contiguous()?;

        let mixed = routing
            .unsqueeze(1)?
            .matmul(&expert_outputs)?
            .squeeze(1)?
            .reshape((b, t, c))?;

        cache.expert_outputs = Some(expert_outputs);
        Ok((mixed, cache))
    }

    /// See [`DynAttentionLayer::regenerate_dead_experts`]; same contract with
    /// the feed-forward initialization scheme.
    ///
    /// [`DynAttentionLayer::regenerate_dead_experts`]:
    /// crate::model::attention::DynAttentionLayer::regenerate_dead_experts
    pub fn regenerate_dead_experts(&self) -> Result<usize> {
        let dead = self.gating.dead_experts();
        let device = self.w1.as_tensor().device().clone();
        let (c, i) = (self.hidden_size, self.intermediate_size);
        for &idx in &dead {
            reinit_bank_slice(&self.w1, idx, &kaiming_uniform(c, (1, c, i), &device)?)?;
            reinit_bank_slice(&self.w2, idx, &kaiming_uniform(i, (1, i, c), &device)?)?;
            self.gating.reinit_expert(idx)?;
        }
        self.gating.reset_counts();
        Ok(dead.len())
    }

    pub fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{prefix}.w1"), self.w1.clone()));
        out.push((format!("{prefix}.w2"), self.w2.clone()));
        out.push((
            format!("{prefix}.gating.prototypes"),
            self.gating.prototypes().clone(),
        ));
        out.push((
            format!("{prefix}.gating.thresholds"),
            self.gating.thresholds().clone(),
        ));
    }
}
