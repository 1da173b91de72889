use candle_core::{Result, Tensor, Var, D};
use candle_nn::ops::softmax;

use crate::config::ExpertPoolKnobs;
use crate::model::gating::{ExpertKind, GateCache, GatingNetwork};
use crate::model::init::{reinit_bank_slice, xavier_uniform};

/// Attention layer whose q/k/v/o projections are per-token mixtures of a
/// fixed bank of expert projection matrices.
///
/// Each token's routing weights (from the internal gating network) blend the
/// expert bank into a bespoke single-head projection for that token; attention
/// itself is ordinary scaled dot-product with no causal mask. In
/// cross-attention mode the query-side and key/value-side streams are routed
/// by two independent gate calls on the same gating network.
pub struct DynAttentionLayer {
    gating: GatingNetwork,
    /// `[max_experts, hidden, head_dim]`
    q_proj: Var,
    k_proj: Var,
    v_proj: Var,
    /// `[max_experts, head_dim, hidden]`
    o_proj: Var,
    hidden_size: usize,
    head_dim: usize,
    max_experts: usize,
    fallback_k: usize,
}

impl DynAttentionLayer {
    pub fn new(
        hidden_size: usize,
        head_dim: usize,
        pool: ExpertPoolKnobs,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let e = pool.max_experts;
        let gating = GatingNetwork::new(ExpertKind::Attention, hidden_size, e, device)?;
        let q_proj = Var::from_tensor(&xavier_uniform(
            hidden_size,
            head_dim,
            (e, hidden_size, head_dim),
            device,
        )?)?;
        let k_proj = Var::from_tensor(&xavier_uniform(
            hidden_size,
            head_dim,
            (e, hidden_size, head_dim),
            device,
        )?)?;
        let v_proj = Var::from_tensor(&xavier_uniform(
            hidden_size,
            head_dim,
            (e, hidden_size, head_dim),
            device,
        )?)?;
        let o_proj = Var::from_tensor(&xavier_uniform(
            head_dim,
            hidden_size,
            (e, head_dim, hidden_size),
            device,
        )?)?;
        Ok(Self {
            gating,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            hidden_size,
            head_dim,
            max_experts: e,
            fallback_k: pool.fallback_k,
        })
    }

    pub fn gating(&self) -> &GatingNetwork {
        &self.gating
    }

    /// Blend an expert bank `[E, rows, cols]` into per-token matrices
    /// `[b, t, rows, cols]` using routing weights `[b*t, E]`.
    fn mix_bank(
        routing: &Tensor,
        bank: &Tensor,
        b: usize,
        t: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Tensor> {
        let e = bank.dim(0)?;
        let flat = bank.reshape((e, rows * cols))?;
        routing.matmul(&flat)?.reshape((b, t, rows, cols))
    }

    /// Self-attention when `encoder_hidden` is `None`, cross-attention against
    /// the encoder output otherwise. Returns one gate cache for self-attention
    /// and two (query-side, key/value-side) for cross-attention.
    pub fn forward(
        &self,
        hidden: &Tensor,
        encoder_hidden: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Vec<GateCache>)> {
        let (b, t, c) = hidden.dims3()?;
        let d = self.head_dim;
        let key_value_states = encoder_hidden.unwrap_or(hidden);
        let (bk, tk, _) = key_value_states.dims3()?;

        let (q_routing, mut q_cache) = self.gating.forward(hidden, self.fallback_k, train)?;
        let (kv_routing, kv_cache) = match encoder_hidden {
            Some(kv) => {
                let (w, cache) = self.gating.forward(kv, self.fallback_k, train)?;
                (w, Some(cache))
            }
            None => (q_routing.clone(), None),
        };

        let q_mix = Self::mix_bank(&q_routing, self.q_proj.as_tensor(), b, t, c, d)?;
        let k_mix = Self::mix_bank(&kv_routing, self.k_proj.as_tensor(), bk, tk, c, d)?;
        let v_mix = Self::mix_bank(&kv_routing, self.v_proj.as_tensor(), bk, tk, c, d)?;

        // Per-token bespoke projections: [b, t, 1, c] x [b, t, c, d].
        let q = hidden.unsqueeze(2)?.contiguous()?.matmul(&q_mix)?.squeeze(2)?;
        let k = key_value_states
            .unsqueeze(2)?
            .contiguous()?
            .matmul(&k_mix)?
            .squeeze(2)?;
        let v = key_value_states
            .unsqueeze(2)?
            .contiguous()?
            .matmul(&v_mix)?
            .squeeze(2)?;

        // Single-head scaled dot-product attention, no causal mask.
        let scale = 1.0 / (d as f64).sqrt();
        let scores = (q.matmul(&k.transpose(1, 2)?.contiguous()?)? * scale)?;
        let attn = softmax(&scores, D::Minus1)?;
        let context = attn.matmul(&v)?;

        let o_mix = Self::mix_bank(&q_routing, self.o_proj.as_tensor(), b, t, d, c)?;
        let output = context
            .unsqueeze(2)?
            .contiguous()?
            .matmul(&o_mix)?
            .squeeze(2)?;

        q_cache.expert_outputs = Some(output.clone());
        let mut caches = vec![q_cache];
        if let Some(mut cache) = kv_cache {
            cache.expert_outputs = Some(output.clone());
            caches.push(cache);
        }
        Ok((output, caches))
    }

    /// Reinitialize every expert slot unused since the last counter reset,
    /// then reset all counters. Runs strictly between train steps; parameter
    /// writes bypass the autodiff tape. Returns the number of regenerated
    /// slots.
    pub fn regenerate_dead_experts(&self) -> Result<usize> {
        let dead = self.gating.dead_experts();
        let device = self.q_proj.as_tensor().device().clone();
        let (c, d) = (self.hidden_size, self.head_dim);
        for &idx in &dead {
            reinit_bank_slice(
                &self.q_proj,
                idx,
                &xavier_uniform(c, d, (1, c, d), &device)?,
            )?;
            reinit_bank_slice(
                &self.k_proj,
                idx,
                &xavier_uniform(c, d, (1, c, d), &device)?,
            )?;
            reinit_bank_slice(
                &self.v_proj,
                idx,
                &xavier_uniform(c, d, (1, c, d), &device)?,
            )?;
            reinit_bank_slice(
                &self.o_proj,
                idx,
                &xavier_uniform(d, c, (1, d, c), &device)?,
            )?;
            self.gating.reinit_expert(idx)?;
        }
        self.gating.reset_counts();
        Ok(dead.len())
    }

    pub fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{prefix}.q_proj"), self.q_proj.clone()));
        out.push((format!("{prefix}.k_proj"), self.k_proj.clone()));
        out.push((format!("{prefix}.v_proj"), self.v_proj.clone()));
        out.push((format!("{prefix}.o_proj"), self.o_proj.clone()));
        out.push((
            format!("{prefix}.gating.prototypes"),
            self.gating.prototypes().clone(),
        ));
        out.push((
            format!("{prefix}.gating.thresholds"),
            self.gating.thresholds().clone(),
        ));
    }

    pub fn max_experts(&self) -> usize {
        self.max_experts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn layer() -> DynAttentionLayer {
        let pool = ExpertPoolKnobs {
            max_experts: 4,
            min_experts: 1,
            fallback_k: 2,
        };
        DynAttentionLayer::new(16, 8, pool, &Device::Cpu).unwrap()
    }

    #[test]
    fn self_attention_preserves_shape_and_yields_one_cache() -> Result<()> {
        let l = layer();
        let hidden = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu)?;
        let (out, caches) = l.forward(&hidden, None, false)?;
        assert_eq!(out.dims(), &[2, 5, 16]);
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].kind, ExpertKind::Attention);
        assert_eq!(caches[0].activation_mask.dims(), &[10, 4]);
        Ok(())
    }

    #[test]
    fn cross_attention_routes_both_streams() -> Result<()> {
        let l = layer();
        let queries = Tensor::randn(0f32, 1f32, (2, 3, 16), &Device::Cpu)?;
        let memory = Tensor::randn(0f32, 1f32, (2, 7, 16), &Device::Cpu)?;
        let (out, caches) = l.forward(&queries, Some(&memory), false)?;
        assert_eq!(out.dims(), &[2, 3, 16]);
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].activation_mask.dims(), &[6, 4]);
        assert_eq!(caches[1].activation_mask.dims(), &[14, 4]);
        Ok(())
    }

    #[test]
    fn regeneration_reports_dead_slots_and_resets_counts() -> Result<()> {
        let l = layer();
        // Simulate a cycle where only experts 0 and 1 ever fired.
        l.gating.set_counts_for_test(vec![12, 3, 0, 0]);
        let regenerated = l.regenerate_dead_experts()?;
        assert_eq!(regenerated, 2);
        assert_eq!(l.gating.activation_counts(), vec![0, 0, 0, 0]);

        // Clean-slate boundary: with no forward in between, a second call sees
        // every counter at zero and regenerates the whole pool.
        let regenerated_again = l.regenerate_dead_experts()?;
        assert_eq!(regenerated_again, 4);
        Ok(())
    }
}
