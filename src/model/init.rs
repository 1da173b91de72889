use candle_core::{Device, Result, Shape, Tensor, Var};

/// Xavier/Glorot uniform draw: U(-b, b) with b = sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform(
    fan_in: usize,
    fan_out: usize,
    shape: impl Into<Shape>,
    device: &Device,
) -> Result<Tensor> {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
    Tensor::rand(-bound, bound, shape, device)
}

/// Kaiming uniform with a = sqrt(5), the default scheme for linear weights:
/// the bound simplifies to 1 / sqrt(fan_in).
pub fn kaiming_uniform(fan_in: usize, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
    let bound = (1.0 / fan_in as f64).sqrt() as f32;
    Tensor::rand(-bound, bound, shape, device)
}

/// Uniform bias init matching the linear-weight fan-in.
pub fn fan_in_bias(fan_in: usize, len: usize, device: &Device) -> Result<Tensor> {
    let bound = (1.0 / fan_in as f64).sqrt() as f32;
    Tensor::rand(-bound, bound, len, device)
}

/// Overwrite one expert slice (index along dim 0) of a parameter bank with
/// `fresh`, leaving every other slice untouched. The write goes through
/// `Var::set`, outside any autodiff tape.
pub fn reinit_bank_slice(bank: &Var, expert_idx: usize, fresh: &Tensor) -> Result<()> {
    let tensor = bank.as_tensor();
    let slots = tensor.dim(0)?;
    let mut slices = Vec::with_capacity(slots);
    for i in 0..slots {
        if i == expert_idx {
            slices.push(fresh.clone());
        } else {
            slices.push(tensor.narrow(0, i, 1)?);
        }
    }
    bank.set(&Tensor::cat(&slices, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinit_only_touches_the_requested_slice() -> Result<()> {
        let device = Device::Cpu;
        let bank = Var::from_tensor(&Tensor::randn(0f32, 1f32, (3, 2, 2), &device)?)?;
        let before = bank.as_tensor().to_vec3::<f32>()?;

        let fresh = Tensor::zeros((1, 2, 2), candle_core::DType::F32, &device)?;
        reinit_bank_slice(&bank, 1, &fresh)?;

        let after = bank.as_tensor().to_vec3::<f32>()?;
        assert_eq!(before[0], after[0]);
        assert_eq!(before[2], after[2]);
        assert_eq!(after[1], vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn xavier_bound_holds() -> Result<()> {
        let t = xavier_uniform(8, 8, (4, 4), &Device::Cpu)?;
        let bound = (6.0f32 / 16.0).sqrt();
        for row in t.to_vec2::<f32>()? {
            for v in row {
                assert!(v.abs() <= bound);
            }
        }
        Ok(())
    }
}
