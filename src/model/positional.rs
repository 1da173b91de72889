use candle_core::{Device, Result, Tensor};

/// 2D sinusoidal positional embedding, shaped `[1, height, width, hidden]`.
///
/// The first half of the channels encodes the column position, the second
/// half the row position, sin/cos interleaved with the usual 10000 frequency
/// schedule. Odd hidden sizes cannot be split and are rejected.
pub fn sinusoidal_2d(
    height: usize,
    width: usize,
    hidden_size: usize,
    device: &Device,
) -> Result<Tensor> {
    if hidden_size % 2 != 0 {
        candle_core::bail!(
            "cannot create 2D sinusoidal embedding for odd hidden size {hidden_size}"
        );
    }

    let half = hidden_size / 2;
    let freqs: Vec<f32> = (0..half)
        .step_by(2)
        .map(|i| (-(i as f32) * (10000f32).ln() / half as f32).exp())
        .collect();

    let mut data = vec![0f32; height * width * hidden_size];
    for y in 0..height {
        for x in 0..width {
            let base = (y * width + x) * hidden_size;
            for (j, &freq) in freqs.iter().enumerate() {
                let col_angle = x as f32 * freq;
                let row_angle = y as f32 * freq;
                let sin_idx = 2 * j;
                let cos_idx = 2 * j + 1;
                if sin_idx < half {
                    data[base + sin_idx] = col_angle.sin();
                }
                if cos_idx < half {
                    data[base + cos_idx] = col_angle.cos();
                }
                if half + sin_idx < hidden_size {
                    data[base + half + sin_idx] = row_angle.sin();
                }
                if half + cos_idx < hidden_size {
                    data[base + half + cos_idx] = row_angle.cos();
                }
            }
        }
    }

    Tensor::from_vec(data, (1, height, width, hidden_size), device)
}
