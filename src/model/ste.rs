use candle_core::{CpuStorage, CustomOp1, Layout, Result, Shape, Tensor};

/// Hard threshold with a straight-through gradient.
///
/// Forward: 1.0 where the score is strictly positive, 0.0 elsewhere.
/// Backward: the incoming gradient is passed through unchanged, ignoring the
/// true (zero almost everywhere) derivative of the step function. This is what
/// lets gradients reach the similarity/threshold parameters behind a discrete
/// expert-activation decision.
struct HardStep;

impl CustomOp1 for HardStep {
    fn name(&self) -> &'static str {
        "hard-step-ste"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let slice = storage.as_slice::<f32>()?;
        let src = match layout.contiguous_offsets() {
            Some((start, end)) => &slice[start..end],
            None => candle_core::bail!("hard-step-ste requires a contiguous input"),
        };
        let out: Vec<f32> = src
            .iter()
            .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
            .collect();
        Ok((CpuStorage::F32(out), layout.shape().clone()))
    }

    // Identity gradient, regardless of the forward thresholding.
    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        Ok(Some(grad_res.clone()))
    }
}

/// Binarize `scores` on the forward path while keeping an identity gradient
/// on the backward path.
pub fn straight_through_step(scores: &Tensor) -> Result<Tensor> {
    scores.contiguous()?.apply_op1(HardStep)
}
