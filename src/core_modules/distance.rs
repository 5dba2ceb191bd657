// THEORY:
// The `distance` module is the comparison engine. It provides the two L1
// variants the session ranks with:
//
// 1.  **Unweighted normalized L1** over raw bin counts. Each count is divided
//     by its own image's pixel total before the per-bin differences are
//     summed, so two images of different resolutions with the same pixel
//     distribution have distance 0. The metric is symmetric and zero on
//     identical inputs.
// 2.  **Weighted L1** over pre-normalized feature vectors. The caller is
//     responsible for having normalized the features exactly once; this
//     function only applies the per-feature weights.
//
// Length mismatches between the inputs are programming errors, not runtime
// conditions: the dimensionality of every vector in a session is fixed by
// the method, so a mismatch means a caller bug. Both functions fail fast.

use crate::core_modules::histogram::BinHistogram;

pub type Distance = f64;

/// Normalized L1 distance between two raw bin-count histograms.
///
/// `D = sum(|a[i]/totalA - b[i]/totalB|)`
pub fn normalized_l1(a: &BinHistogram, b: &BinHistogram) -> Distance {
    assert_eq!(
        a.len(),
        b.len(),
        "histogram dimension mismatch: {} vs {}",
        a.len(),
        b.len()
    );
    let total_a = a.pixel_total() as f64;
    let total_b = b.pixel_total() as f64;
    a.counts()
        .iter()
        .zip(b.counts())
        .map(|(&count_a, &count_b)| {
            let freq_a = if total_a > 0.0 { count_a as f64 / total_a } else { 0.0 };
            let freq_b = if total_b > 0.0 { count_b as f64 / total_b } else { 0.0 };
            (freq_a - freq_b).abs()
        })
        .sum()
}

/// Weighted L1 distance between two already-normalized feature vectors.
///
/// `D = sum(w[i] * |a[i] - b[i]|)`
pub fn weighted_l1(a: &[f64], b: &[f64], weights: &[f64]) -> Distance {
    assert_eq!(
        a.len(),
        b.len(),
        "feature dimension mismatch: {} vs {}",
        a.len(),
        b.len()
    );
    assert_eq!(
        weights.len(),
        a.len(),
        "weight dimension mismatch: {} weights for {} features",
        weights.len(),
        a.len()
    );
    weights
        .iter()
        .zip(a.iter().zip(b))
        .map(|(&weight, (&feature_a, &feature_b))| weight * (feature_a - feature_b).abs())
        .sum()
}
