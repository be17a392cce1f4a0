use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use trading_core::{SplitKind, TrainingConfig};

/// Row indices of one train/val/test partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partition the concatenated dataset. The split is computed per symbol
/// segment so that the same rows land in the same partition regardless of
/// the symbol concatenation order; within a segment the partition is
/// chronological (or seeded-random when explicitly requested).
pub fn split_rows(symbol_tags: &[String], config: &TrainingConfig) -> Split {
    let mut split = Split::default();

    let mut start = 0usize;
    while start < symbol_tags.len() {
        let tag = &symbol_tags[start];
        let mut end = start;
        while end < symbol_tags.len() && symbol_tags[end] == *tag {
            end += 1;
        }
        segment_split(start, end, config, &mut split);
        start = end;
    }
    split
}

fn segment_split(start: usize, end: usize, config: &TrainingConfig, out: &mut Split) {
    let n = end - start;
    let mut indices: Vec<usize> = (start..end).collect();

    if config.split == SplitKind::Random {
        // Seeded; reproducible across runs but leaks future bars into the
        // training set. Opt-in only.
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        indices.shuffle(&mut rng);
    }

    let test_len = ((n as f64) * config.test_split).round() as usize;
    let val_len = ((n as f64) * config.val_split).round() as usize;
    let train_len = n.saturating_sub(test_len + val_len);

    out.train.extend(&indices[..train_len]);
    out.val.extend(&indices[train_len..train_len + val_len]);
    out.test.extend(&indices[train_len + val_len..]);
}
