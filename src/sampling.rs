use anyhow::{bail, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::str::FromStr;

use crate::augment::{collate_grids, flip_horizontal, flip_vertical, nearest_resize, rotate_ccw, Grid};
use crate::config::SamplingKnobs;
use crate::model::DynOnnModel;
use crate::tokenizer::PAD_TOKEN_ID;

/// How candidate grids are drawn from the decoder's cell distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Greedy,
    Temperature,
    TopP,
}

impl FromStr for SamplingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greedy" => Ok(Self::Greedy),
            "temperature" => Ok(Self::Temperature),
            "top_p" | "top-p" => Ok(Self::TopP),
            other => bail!("unknown sampling strategy '{other}'"),
        }
    }
}

/// One randomly drawn geometric transform, applied identically to the input
/// and candidate grids of a scoring round.
struct GridTransform {
    flip_h: bool,
    flip_v: bool,
    rotations: u8,
}

impl GridTransform {
    fn sample<R: Rng>(rng: &mut R) -> Self {
        Self {
            flip_h: rng.gen::<f64>() > 0.5,
            flip_v: rng.gen::<f64>() > 0.5,
            rotations: rng.gen_range(0..=3),
        }
    }

    fn apply(&self, grid: &Grid) -> Grid {
        let mut grid = grid.clone();
        if self.flip_h {
            grid = flip_horizontal(&grid);
        }
        if self.flip_v {
            grid = flip_vertical(&grid);
        }
        for _ in 0..self.rotations {
            grid = rotate_ccw(&grid);
        }
        grid
    }

    fn transposes_aspect(&self) -> bool {
        self.rotations % 2 == 1
    }
}

/// Draw `num_candidates` output grids of shape `target_hw` from a single
/// forward pass over `input` (`[1, h, w]` symbol ids).
pub fn generate_candidates<R: Rng>(
    model: &DynOnnModel,
    input: &Tensor,
    target_hw: (usize, usize),
    strategy: SamplingStrategy,
    knobs: &SamplingKnobs,
    rng: &mut R,
) -> Result<Vec<Grid>> {
    let (target_h, target_w) = target_hw;
    let (logits, _) = model.forward(input, None, Some(target_hw), false)?;
    let vocab = logits.dim(D::Minus1)?;
    let flat = logits.reshape((target_h * target_w, vocab))?;

    let mut candidates = Vec::with_capacity(knobs.num_candidates);
    for _ in 0..knobs.num_candidates {
        let cells = match strategy {
            SamplingStrategy::Greedy => flat
                .argmax(D::Minus1)?
                .to_dtype(candle_core::DType::U32)?
                .to_vec1::<u32>()?,
            SamplingStrategy::Temperature => {
                let scaled = (&flat / knobs.temperature)?;
                let probs = softmax(&scaled, D::Minus1)?.to_vec2::<f32>()?;
                sample_cells(&probs, rng)?
            }
            SamplingStrategy::TopP => {
                let probs = softmax(&flat, D::Minus1)?.to_vec2::<f32>()?;
                let nucleus: Vec<Vec<f32>> = probs
                    .iter()
                    .map(|row| truncate_to_nucleus(row, knobs.top_p as f32))
                    .collect();
                sample_cells(&nucleus, rng)?
            }
        };
        candidates.push(
            cells
                .chunks(target_w)
                .map(|row| row.to_vec())
                .collect::<Grid>(),
        );
    }
    Ok(candidates)
}

fn sample_cells<R: Rng>(probs: &[Vec<f32>], rng: &mut R) -> Result<Vec<u32>> {
    probs
        .iter()
        .map(|row| {
            let dist = WeightedIndex::new(row)?;
            Ok(dist.sample(rng) as u32)
        })
        .collect()
}

/// Zero out everything outside the smallest probability set whose cumulative
/// mass reaches `p`. At least the top symbol always survives.
fn truncate_to_nucleus(probs: &[f32], p: f32) -> Vec<f32> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = vec![0f32; probs.len()];
    let mut cumulative = 0f32;
    for &idx in &order {
        kept[idx] = probs[idx];
        cumulative += probs[idx];
        if cumulative >= p {
            break;
        }
    }
    kept
}

/// Test-time augmentation score for one candidate: the mean, over random
/// geometric transforms applied identically to input and candidate, of the
/// candidate's summed log-probability under the model. When a rotation
/// transposes the aspect, the candidate is nearest-resized back to its
/// original shape so the scored target dimensions stay fixed.
pub fn augmented_score<R: Rng>(
    model: &DynOnnModel,
    input: &Grid,
    candidate: &Grid,
    num_augmentations: usize,
    device: &Device,
    rng: &mut R,
) -> Result<f64> {
    let (cand_h, cand_w) = (candidate.len(), candidate[0].len());
    let mut total = 0f64;

    for _ in 0..num_augmentations {
        let transform = GridTransform::sample(rng);
        let aug_input = transform.apply(input);
        let mut aug_candidate = transform.apply(candidate);
        if transform.transposes_aspect() {
            aug_candidate = nearest_resize(&aug_candidate, cand_h, cand_w);
        }

        let input_tensor = collate_grids(std::slice::from_ref(&aug_input), PAD_TOKEN_ID, device)?;
        let (h, w) = (aug_candidate.len(), aug_candidate[0].len());
        let (logits, _) = model.forward(&input_tensor, None, Some((h, w)), false)?;
        let vocab = logits.dim(D::Minus1)?;
        let log_probs = log_softmax(&logits.reshape((h * w, vocab))?, D::Minus1)?.to_vec2::<f32>()?;

        for (i, row) in aug_candidate.iter().enumerate() {
            for (j, &symbol) in row.iter().enumerate() {
                total += log_probs[i * w + j][symbol as usize] as f64;
            }
        }
    }

    Ok(total / num_augmentations.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tokenizer::ArcTokenizer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model() -> (DynOnnModel, Config) {
        let mut config = Config::default();
        config.model.hidden_size = 16;
        config.model.num_hidden_layers = 2;
        config.model.head_dim = 8;
        config.model.intermediate_size = 8;
        config.model.max_grid_size = 6;
        config.gating.attention.max_experts = 4;
        config.gating.attention.fallback_k = 2;
        config.gating.moe.max_experts = 4;
        config.gating.moe.fallback_k = 2;
        let model = DynOnnModel::new(
            &config.model,
            &config.gating,
            ArcTokenizer::new().vocab_size(),
            &Device::Cpu,
        )
        .unwrap();
        (model, config)
    }

    #[test]
    fn strategy_parsing_rejects_unknown_names() {
        assert_eq!(
            SamplingStrategy::from_str("greedy").unwrap(),
            SamplingStrategy::Greedy
        );
        assert_eq!(
            SamplingStrategy::from_str("top_p").unwrap(),
            SamplingStrategy::TopP
        );
        assert!(SamplingStrategy::from_str("beam").is_err());
    }

    #[test]
    fn greedy_candidates_are_identical_and_correctly_shaped() -> Result<()> {
        let (model, config) = tiny_model();
        let mut rng = StdRng::seed_from_u64(0);
        let input = Tensor::zeros((1, 3, 3), candle_core::DType::U32, &Device::Cpu)?;

        let candidates = generate_candidates(
            &model,
            &input,
            (2, 4),
            SamplingStrategy::Greedy,
            &config.sampling,
            &mut rng,
        )?;
        assert_eq!(candidates.len(), config.sampling.num_candidates);
        for candidate in &candidates {
            assert_eq!(candidate.len(), 2);
            assert_eq!(candidate[0].len(), 4);
            assert_eq!(candidate, &candidates[0]);
        }
        Ok(())
    }

    #[test]
    fn sampled_candidates_stay_inside_the_vocabulary() -> Result<()> {
        let (model, config) = tiny_model();
        let vocab = ArcTokenizer::new().vocab_size() as u32;
        let mut rng = StdRng::seed_from_u64(1);
        let input = Tensor::zeros((1, 2, 2), candle_core::DType::U32, &Device::Cpu)?;

        for strategy in [SamplingStrategy::Temperature, SamplingStrategy::TopP] {
            let candidates =
                generate_candidates(&model, &input, (2, 2), strategy, &config.sampling, &mut rng)?;
            for candidate in candidates {
                for row in candidate {
                    for symbol in row {
                        assert!(symbol < vocab);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn nucleus_truncation_keeps_at_least_the_top_symbol() {
        let probs = vec![0.7f32, 0.2, 0.1];
        let kept = truncate_to_nucleus(&probs, 0.05);
        assert_eq!(kept, vec![0.7, 0.0, 0.0]);

        let kept = truncate_to_nucleus(&probs, 0.85);
        assert_eq!(kept, vec![0.7, 0.2, 0.0]);
    }

    #[test]
    fn augmented_score_is_finite_for_non_square_grids() -> Result<()> {
        let (model, config) = tiny_model();
        let mut rng = StdRng::seed_from_u64(2);
        let input = vec![vec![1u32, 2, 3], vec![4, 5, 6]];
        let candidate = vec![vec![0u32, 1], vec![2, 3], vec![4, 5]];

        let score = augmented_score(
            &model,
            &input,
            &candidate,
            config.sampling.num_augmentations,
            &Device::Cpu,
            &mut rng,
        )?;
        assert!(score.is_finite());
        assert!(score < 0.0, "sum of log-probabilities is negative");
        Ok(())
    }
}
