// THEORY:
// The `weights` module is the statistical heart of relevance feedback. The
// intuition is Rocchio-style: the more consistently the user's relevant set
// agrees on a feature (low variance), the more that feature should dominate
// the distance metric. Weights are therefore inverse standard deviations,
// normalized to sum to 1.
//
// Everything subtle in this module is about numeric degeneracy:
//
// - The sample standard deviation is unbiased (divides by n-1), so it needs
//   at least two relevant rows. A single-row set is a reportable error, not
//   a silent zero.
// - A standard deviation below `STD_DEV_FLOOR` is treated as exactly zero to
//   suppress floating-point noise.
// - A zero-deviation column with a non-zero mean means the relevant set
//   agrees on a non-trivial value; such a column is substituted with half
//   the smallest non-zero deviation so it stays influential instead of
//   collapsing to an undefined weight.
// - A zero-deviation column with a zero mean is non-informative and gets
//   weight 0. If every column is degenerate, the weight vector is all-zero.
//
// No path through this module produces a NaN or infinite weight.
//
// `standardize_columns` applies the corpus-wide Gaussian (z-score)
// normalization the combined method scores over. The statistics are always
// taken over the actual row count, and a zero-deviation column standardizes
// to 0 rather than dividing by zero.

use crate::error::{RetrievalError, Result};

/// Standard deviations below this are treated as exactly zero.
pub const STD_DEV_FLOOR: f64 = 1e-16;

pub type WeightVector = Vec<f64>;

/// Equal weights summing to 1, used for the initial combined pass before any
/// relevance feedback exists.
pub fn uniform_weights(dimension: usize) -> WeightVector {
    vec![1.0 / dimension as f64; dimension]
}

/// Derives per-feature weights from the rows of `feature_matrix` named by
/// `relevant_rows`. Requires at least two relevant rows.
pub fn relevance_weights(feature_matrix: &[Vec<f64>], relevant_rows: &[usize]) -> Result<WeightVector> {
    if relevant_rows.len() < 2 {
        return Err(RetrievalError::InsufficientRelevantSet {
            found: relevant_rows.len(),
        });
    }

    let dimension = feature_matrix[relevant_rows[0]].len();
    let n = relevant_rows.len() as f64;
    let mut means = Vec::with_capacity(dimension);
    let mut std_devs = Vec::with_capacity(dimension);

    for column in 0..dimension {
        let sum: f64 = relevant_rows
            .iter()
            .map(|&row| feature_matrix[row][column])
            .sum();
        let mean = sum / n;
        let squared_deviations: f64 = relevant_rows
            .iter()
            .map(|&row| {
                let deviation = feature_matrix[row][column] - mean;
                deviation * deviation
            })
            .sum();
        let mut std_dev = (squared_deviations / (n - 1.0)).sqrt();
        if std_dev < STD_DEV_FLOOR {
            std_dev = 0.0;
        }
        means.push(mean);
        std_devs.push(std_dev);
    }

    // Keep agreed-upon features influential: a zero deviation with a
    // non-zero mean borrows half the smallest real deviation.
    let min_nonzero = std_devs
        .iter()
        .copied()
        .filter(|&s| s > 0.0)
        .fold(f64::INFINITY, f64::min);
    if min_nonzero.is_finite() {
        for (std_dev, mean) in std_devs.iter_mut().zip(&means) {
            if *std_dev == 0.0 && *mean != 0.0 {
                *std_dev = 0.5 * min_nonzero;
            }
        }
    }

    let mut weights: WeightVector = std_devs
        .iter()
        .map(|&std_dev| if std_dev > 0.0 { 1.0 / std_dev } else { 0.0 })
        .collect();

    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        for weight in &mut weights {
            *weight /= total;
        }
    }
    Ok(weights)
}

/// Z-score standardization of every column in place, over all rows. A column
/// with zero deviation (including a single-row matrix) standardizes to 0.
pub fn standardize_columns(matrix: &mut [Vec<f64>]) {
    let rows = matrix.len();
    if rows == 0 {
        return;
    }
    let n = rows as f64;
    let dimension = matrix[0].len();

    for column in 0..dimension {
        let mean = matrix.iter().map(|row| row[column]).sum::<f64>() / n;
        let std_dev = if rows > 1 {
            let squared_deviations: f64 = matrix
                .iter()
                .map(|row| {
                    let deviation = row[column] - mean;
                    deviation * deviation
                })
                .sum();
            (squared_deviations / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        for row in matrix.iter_mut() {
            row[column] = if std_dev > STD_DEV_FLOOR {
                (row[column] - mean) / std_dev
            } else {
                0.0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_weights_sum_to_one() {
        let weights = uniform_weights(89);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((weights[0] - 1.0 / 89.0).abs() < 1e-12);
    }

    #[test]
    fn weights_are_nonnegative_and_normalized() {
        let matrix = vec![
            vec![0.1, 0.5, 0.9],
            vec![0.2, 0.4, 0.7],
            vec![0.3, 0.6, 0.8],
        ];
        let weights = relevance_weights(&matrix, &[0, 1, 2]).unwrap();
        assert!(weights.iter().all(|&w| w >= 0.0));
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(weights.iter().all(|w| w.is_finite()));
    }

    #[test]
    fn lower_variance_features_weigh_more() {
        // Column 0 varies much less than column 1 across the relevant rows.
        let matrix = vec![vec![0.50, 0.1], vec![0.51, 0.9]];
        let weights = relevance_weights(&matrix, &[0, 1]).unwrap();
        assert!(weights[0] > weights[1]);
    }

    #[test]
    fn single_relevant_row_is_an_error() {
        let matrix = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        match relevance_weights(&matrix, &[0]) {
            Err(RetrievalError::InsufficientRelevantSet { found: 1 }) => {}
            other => panic!("expected InsufficientRelevantSet, got {other:?}"),
        }
    }

    #[test]
    fn agreed_nonzero_feature_borrows_half_min_std() {
        // Column 0: values [0.5, 0.5] -> std 0, mean 0.5. Column 1 varies.
        let matrix = vec![vec![0.5, 0.1], vec![0.5, 0.3]];
        let weights = relevance_weights(&matrix, &[0, 1]).unwrap();
        // Column 1 std is ~0.1414; column 0 substitutes half of it, so its
        // raw weight is twice column 1's and it must dominate.
        assert!(weights[0] > 0.0);
        assert!(weights[0] > weights[1]);
        assert!((weights[0] - 2.0 * weights[1]).abs() < 1e-9);
    }

    #[test]
    fn zero_mean_zero_std_feature_gets_zero_weight() {
        let matrix = vec![vec![0.0, 0.2], vec![0.0, 0.6]];
        let weights = relevance_weights(&matrix, &[0, 1]).unwrap();
        assert_eq!(weights[0], 0.0);
        assert!((weights[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn globally_constant_matrix_gives_all_zero_weights() {
        let matrix = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        let weights = relevance_weights(&matrix, &[0, 1]).unwrap();
        assert!(weights.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn standardization_centers_and_scales_columns() {
        let mut matrix = vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0]];
        standardize_columns(&mut matrix);
        // Column 0: mean 3, unbiased std 2 -> [-1, 0, 1].
        assert!((matrix[0][0] + 1.0).abs() < 1e-12);
        assert!(matrix[1][0].abs() < 1e-12);
        assert!((matrix[2][0] - 1.0).abs() < 1e-12);
        // Column 1 is constant: standardizes to 0, never NaN.
        assert!(matrix.iter().all(|row| row[1] == 0.0));
    }

    #[test]
    fn single_row_matrix_standardizes_to_zero() {
        let mut matrix = vec![vec![4.0, 2.0]];
        standardize_columns(&mut matrix);
        assert_eq!(matrix[0], vec![0.0, 0.0]);
    }
}
