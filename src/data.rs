use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::augment::{collate_grids, Grid};
use crate::tokenizer::PAD_TOKEN_ID;

#[derive(Debug, Deserialize)]
struct ArcTaskFile {
    train: Vec<ArcPairJson>,
    #[serde(default)]
    test: Vec<ArcPairJson>,
}

#[derive(Debug, Deserialize)]
struct ArcPairJson {
    input: Grid,
    output: Grid,
}

/// One input/output grid pair, unpadded.
#[derive(Debug, Clone)]
pub struct GridPair {
    pub input: Grid,
    pub output: Grid,
}

/// A collated batch: grids padded to the per-batch maxima with the pad symbol.
pub struct GridBatch {
    pub inputs: Vec<Grid>,
    pub outputs: Vec<Grid>,
}

impl GridBatch {
    /// `[batch, max_h, max_w]` U32 tensors, pad-filled.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        Ok((
            collate_grids(&self.inputs, PAD_TOKEN_ID, device)?,
            collate_grids(&self.outputs, PAD_TOKEN_ID, device)?,
        ))
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// In-memory ARC dataset. Unreadable task files are skipped, as are pairs
/// whose grids exceed the supported size.
pub struct ArcDataset {
    pairs: Vec<GridPair>,
}

impl ArcDataset {
    pub fn load(dir: impl AsRef<Path>, max_grid_size: usize, use_test_pairs: bool) -> Result<Self> {
        let mut task_files: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())
            .with_context(|| format!("listing ARC tasks in {:?}", dir.as_ref()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        task_files.sort();

        let mut pairs = Vec::new();
        for task_file in task_files {
            let Ok(content) = std::fs::read_to_string(&task_file) else {
                continue;
            };
            let Ok(task) = serde_json::from_str::<ArcTaskFile>(&content) else {
                continue;
            };
            let pair_set = if use_test_pairs { task.test } else { task.train };
            for pair in pair_set {
                if grid_fits(&pair.input, max_grid_size) && grid_fits(&pair.output, max_grid_size) {
                    pairs.push(GridPair {
                        input: pair.input,
                        output: pair.output,
                    });
                }
            }
        }

        Ok(Self { pairs })
    }

    pub fn from_pairs(pairs: Vec<GridPair>) -> Self {
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Batches for one epoch. Training shuffles and drops the trailing
    /// partial batch; evaluation keeps order and the remainder.
    pub fn batches<R: Rng>(
        &self,
        batch_size: usize,
        shuffle: bool,
        rng: &mut R,
    ) -> Vec<GridBatch> {
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }

        let mut batches = Vec::new();
        for chunk in order.chunks(batch_size) {
            if shuffle && chunk.len() < batch_size {
                break; // drop_last
            }
            batches.push(GridBatch {
                inputs: chunk.iter().map(|&i| self.pairs[i].input.clone()).collect(),
                outputs: chunk
                    .iter()
                    .map(|&i| self.pairs[i].output.clone())
                    .collect(),
            });
        }
        batches
    }
}

fn grid_fits(grid: &Grid, max_grid_size: usize) -> bool {
    grid.len() <= max_grid_size && grid.iter().all(|row| row.len() <= max_grid_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_pairs(n: usize) -> Vec<GridPair> {
        (0..n)
            .map(|i| GridPair {
                input: vec![vec![(i % 10) as u32; 2]; 2],
                output: vec![vec![(i % 10) as u32; 3]; 2],
            })
            .collect()
    }

    #[test]
    fn training_batches_drop_the_partial_tail() {
        let dataset = ArcDataset::from_pairs(sample_pairs(10));
        let mut rng = StdRng::seed_from_u64(0);
        let batches = dataset.batches(4, true, &mut rng);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn eval_batches_keep_order_and_remainder() {
        let dataset = ArcDataset::from_pairs(sample_pairs(10));
        let mut rng = StdRng::seed_from_u64(0);
        let batches = dataset.batches(4, false, &mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
        assert_eq!(batches[0].inputs[0][0][0], 0);
        assert_eq!(batches[0].inputs[1][0][0], 1);
    }

    #[test]
    fn collation_pads_with_the_pad_symbol() -> Result<()> {
        let batch = GridBatch {
            inputs: vec![vec![vec![1u32, 2]], vec![vec![3u32, 4, 5], vec![6, 7, 8]]],
            outputs: vec![vec![vec![0u32]], vec![vec![9u32]]],
        };
        let (inputs, _) = batch.to_tensors(&Device::Cpu)?;
        assert_eq!(inputs.dims(), &[2, 2, 3]);
        let host = inputs.to_vec3::<u32>()?;
        assert_eq!(host[0][0], vec![1, 2, PAD_TOKEN_ID]);
        assert_eq!(host[0][1], vec![PAD_TOKEN_ID; 3]);
        Ok(())
    }

    #[test]
    fn oversized_pairs_are_filtered_on_load() {
        let dir = std::env::temp_dir().join("dynonn_data_test");
        std::fs::create_dir_all(&dir).unwrap();
        let oversized = vec![vec![0u32; 40]; 40];
        let task = serde_json::json!({
            "train": [
                {"input": [[1, 2]], "output": [[3]]},
                {"input": oversized, "output": [[1]]}
            ],
            "test": []
        });
        std::fs::write(dir.join("task.json"), task.to_string()).unwrap();
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();

        let dataset = ArcDataset::load(&dir, 30, false).unwrap();
        assert_eq!(dataset.len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }
}
