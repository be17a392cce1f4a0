use serde::{Deserialize, Serialize};

/// Per-feature z-score statistics, fitted on the training split only and
/// persisted with the model artifact so inference applies the identical
/// transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl NormStats {
    /// Fit over the given row indices. Zero-variance features keep a unit
    /// scale so they normalize to zero instead of NaN.
    pub fn fit(rows: &[Vec<f64>], indices: &[usize]) -> Self {
        let dim = rows.first().map_or(0, |r| r.len());
        let n = indices.len().max(1) as f64;

        let mut mean = vec![0.0; dim];
        for &i in indices {
            for (j, &v) in rows[i].iter().enumerate() {
                mean[j] += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut var = vec![0.0; dim];
        for &i in indices {
            for (j, &v) in rows[i].iter().enumerate() {
                var[j] += (v - mean[j]).powi(2);
            }
        }
        let std = var
            .into_iter()
            .map(|v| {
                let sd = (v / n).sqrt();
                if sd > 0.0 {
                    sd
                } else {
                    1.0
                }
            })
            .collect();

        Self { mean, std }
    }

    pub fn apply_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, &v)| (v - self.mean[j]) / self.std[j])
            .collect()
    }

    pub fn apply(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.apply_row(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_uses_only_training_rows() {
        let rows = vec![
            vec![1.0],
            vec![3.0],
            // The outlier lives in the would-be test partition and must
            // not influence the statistics.
            vec![1_000.0],
        ];
        let stats = NormStats::fit(&rows, &[0, 1]);
        assert_eq!(stats.mean, vec![2.0]);
        assert_eq!(stats.std, vec![1.0]);
        assert_eq!(stats.apply_row(&rows[2]), vec![998.0]);
    }

    #[test]
    fn zero_variance_feature_normalizes_to_zero() {
        let rows = vec![vec![5.0, 1.0], vec![5.0, 3.0]];
        let stats = NormStats::fit(&rows, &[0, 1]);
        let out = stats.apply(&rows);
        assert_eq!(out[0][0], 0.0);
        assert_eq!(out[1][0], 0.0);
        assert!(out[0][1] < 0.0 && out[1][1] > 0.0);
    }
}
