//! Mobility predictions: per-interval origin x destination matrices,
//! per-user random-walk vectors and the coverage matrix of the heuristic.

use sfcsim_placement::{InputError, NodeId, RequestId};
use std::collections::BTreeMap;

/// Dense `P[src][dst]` arrival probabilities.
pub type ProbMatrix = Vec<Vec<f64>>;

/// Every prediction source available to a replicate.
#[derive(Debug, Clone, Default)]
pub struct MobilityModel {
    /// Prediction matrix of each interval. A single matrix serves every interval.
    pub matrices: Vec<ProbMatrix>,
    /// Random-walk vector over all nodes, per logical request.
    pub per_user: BTreeMap<RequestId, Vec<f64>>,
    /// Location matrix of the coverage heuristic, already thresholded.
    pub coverage: Option<ProbMatrix>,
}

impl MobilityModel {
    /// Matrix used to predict interval `t`.
    pub fn matrix(&self, t: usize) -> Option<&ProbMatrix> {
        match self.matrices.len() {
            0 => None,
            1 => self.matrices.first(),
            _ => self.matrices.get(t),
        }
    }

    /// Probability vector the heuristic covers for a user at `location`.
    pub fn heuristic_probs(
        &self,
        t: usize,
        request: RequestId,
        location: NodeId,
        threshold: f64,
        nodes: usize,
    ) -> Vec<f64> {
        if let Some(vector) = self.per_user.get(&request) {
            return thresholded(vector, threshold);
        }
        let row = self
            .coverage
            .as_ref()
            .or_else(|| self.matrix(t))
            .and_then(|m| m.get(location));
        match row {
            Some(row) => thresholded(row, threshold),
            None => {
                let mut only = vec![0.0; nodes];
                if location < nodes {
                    only[location] = 1.0;
                }
                only
            }
        }
    }

    /// Check every matrix and vector against a topology of `nodes` nodes.
    pub fn validate(&self, nodes: usize) -> Result<(), InputError> {
        for matrix in self.matrices.iter().chain(self.coverage.iter()) {
            validate_matrix(matrix, nodes)?;
        }
        for (user, vector) in &self.per_user {
            validate_row(*user as usize, vector, nodes)?;
        }
        Ok(())
    }
}

fn thresholded(row: &[f64], threshold: f64) -> Vec<f64> {
    row.iter()
        .map(|p| if *p < threshold { 0.0 } else { *p })
        .collect()
}

pub fn validate_matrix(matrix: &ProbMatrix, nodes: usize) -> Result<(), InputError> {
    if matrix.len() != nodes {
        return Err(InputError::ProbabilityRowMismatch {
            row: matrix.len().min(nodes),
            got: matrix.len(),
            expected: nodes,
        });
    }
    for (i, row) in matrix.iter().enumerate() {
        validate_row(i, row, nodes)?;
    }
    Ok(())
}

fn validate_row(row: usize, values: &[f64], nodes: usize) -> Result<(), InputError> {
    if values.len() != nodes {
        return Err(InputError::ProbabilityRowMismatch {
            row,
            got: values.len(),
            expected: nodes,
        });
    }
    if let Some(value) = values.iter().find(|p| **p > 1.0) {
        return Err(InputError::ProbabilityAboveOne { row, value: *value });
    }
    Ok(())
}

/// Zero every entry below `threshold`.
pub fn apply_threshold(matrix: &mut ProbMatrix, threshold: f64) {
    for row in matrix.iter_mut() {
        for p in row.iter_mut() {
            if *p < threshold {
                *p = 0.0;
            }
        }
    }
}

/// Give a row without any prediction a self-transition so its users still
/// fan out somewhere.
pub fn fix_empty_rows(matrix: &mut ProbMatrix, threshold: f64) {
    for (i, row) in matrix.iter_mut().enumerate() {
        if i < row.len() && row.iter().sum::<f64>() == 0.0 {
            row[i] = (threshold + 0.01).max(0.05);
        }
    }
}

/// Keep the `k` largest entries of every row; `k == 0` keeps all of them.
/// Ties go to the lower destination index.
pub fn keep_top_k(matrix: &mut ProbMatrix, k: usize) {
    if k == 0 {
        return;
    }
    for row in matrix.iter_mut() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|a, b| row[*b].total_cmp(&row[*a]).then(a.cmp(b)));
        for j in order.into_iter().skip(k) {
            row[j] = 0.0;
        }
    }
}

/// Element-wise mean of all interval matrices.
pub fn merge(matrices: &[ProbMatrix]) -> Option<ProbMatrix> {
    let first = matrices.first()?;
    let count = matrices.len() as f64;
    let mut merged: ProbMatrix = first.iter().map(|row| vec![0.0; row.len()]).collect();
    for matrix in matrices {
        for (acc, row) in merged.iter_mut().zip(matrix.iter()) {
            for (a, p) in acc.iter_mut().zip(row.iter()) {
                *a += *p;
            }
        }
    }
    for row in merged.iter_mut() {
        for p in row.iter_mut() {
            *p /= count;
        }
    }
    Some(merged)
}

/// Threshold, fix empty rows, and keep the top `k` of raw interval
/// matrices. In merge mode the mean matrix is thresholded and trimmed
/// instead, and serves every interval.
pub fn prepare(
    mut matrices: Vec<ProbMatrix>,
    threshold: f64,
    top_k: usize,
    merge_intervals: bool,
) -> Vec<ProbMatrix> {
    if merge_intervals {
        let Some(mut merged) = merge(&matrices) else {
            return matrices;
        };
        apply_threshold(&mut merged, threshold);
        keep_top_k(&mut merged, top_k);
        return vec![merged];
    }
    for matrix in matrices.iter_mut() {
        apply_threshold(matrix, threshold);
        fix_empty_rows(matrix, threshold);
        keep_top_k(matrix, top_k);
    }
    matrices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_then_fix_empty_row() {
        let mut m = vec![vec![0.02, 0.03], vec![0.4, 0.6]];
        apply_threshold(&mut m, 0.05);
        fix_empty_rows(&mut m, 0.05);
        assert!((m[0][0] - 0.06).abs() < 1e-9);
        assert_eq!(m[0][1], 0.0);
        assert_eq!(m[1], vec![0.4, 0.6]);
    }

    #[test]
    fn test_fix_uses_floor_for_small_threshold() {
        let mut m = vec![vec![0.0, 0.0], vec![0.0, 1.0]];
        fix_empty_rows(&mut m, 0.0);
        assert_eq!(m[0][0], 0.05);
    }

    #[test]
    fn test_top_k_keeps_largest() {
        let mut m = vec![vec![0.1, 0.5, 0.2, 0.2]];
        keep_top_k(&mut m, 2);
        assert_eq!(m[0], vec![0.0, 0.5, 0.2, 0.0]);
    }

    #[test]
    fn test_top_k_zero_keeps_all() {
        let mut m = vec![vec![0.1, 0.5]];
        keep_top_k(&mut m, 0);
        assert_eq!(m[0], vec![0.1, 0.5]);
    }

    #[test]
    fn test_merge_mode_serves_every_interval() {
        let a = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let b = vec![vec![0.0, 1.0], vec![0.0, 1.0]];
        let prepared = prepare(vec![a, b], 0.05, 0, true);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0][0], vec![0.5, 0.5]);
        let model = MobilityModel {
            matrices: prepared,
            ..Default::default()
        };
        assert_eq!(model.matrix(3).unwrap()[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_validate_rejects_probability_above_one() {
        let model = MobilityModel {
            matrices: vec![vec![vec![1.5, 0.0], vec![0.0, 1.0]]],
            ..Default::default()
        };
        assert!(matches!(
            model.validate(2),
            Err(InputError::ProbabilityAboveOne { row: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_row() {
        let model = MobilityModel {
            matrices: vec![vec![vec![1.0], vec![0.0, 1.0]]],
            ..Default::default()
        };
        assert!(matches!(
            model.validate(2),
            Err(InputError::ProbabilityRowMismatch { row: 0, got: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_heuristic_prefers_per_user_vector() {
        let mut model = MobilityModel {
            matrices: vec![vec![vec![1.0, 0.0], vec![0.0, 1.0]]],
            ..Default::default()
        };
        model.per_user.insert(7, vec![0.3, 0.7]);
        assert_eq!(model.heuristic_probs(0, 7, 0, 0.5, 2), vec![0.0, 0.7]);
        assert_eq!(model.heuristic_probs(0, 8, 1, 0.0, 2), vec![0.0, 1.0]);
    }
}
