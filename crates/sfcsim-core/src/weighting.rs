//! Probability-weighted fan-out of an interval's requests across the
//! locations their users may occupy next.

use crate::mobility::ProbMatrix;
use rand::Rng;
use sfcsim_placement::{InputError, Request, RequestId, Topology};
use std::collections::BTreeMap;

/// Where instance locations and weights come from.
#[derive(Debug, Clone, Copy)]
pub enum Prediction<'a> {
    /// Each request at its own location with weight 1.
    Realized,
    /// Each request at the location it takes in `actual`, with weight 1.
    /// Requests absent from `actual` keep their location with revenue 0.
    NextInterval(&'a [Request]),
    /// One instance per destination of the origin row above the threshold.
    Matrix(&'a ProbMatrix),
    /// Per-user random-walk vectors, restricted to in-range destinations.
    PerUser(&'a BTreeMap<RequestId, Vec<f64>>),
}

#[derive(Debug, Clone, Copy)]
pub struct FanOutOptions {
    /// Destinations must be strictly above this probability.
    pub threshold: f64,
    /// Whether the instances feed an estimated (Preallocate) model.
    pub estimated: bool,
    /// Probability that a request's location is perturbed.
    pub error_rate: f64,
    /// Mass a random walk leaves the system with.
    pub exit_rate: f64,
    /// Keep only this many heaviest instances of an estimated fan-out.
    pub limit: Option<usize>,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            estimated: false,
            error_rate: 0.0,
            exit_rate: 0.0,
            limit: None,
        }
    }
}

/// Round to two significant digits, half away from zero.
pub fn round_significant(value: f64) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let digits = 1 - value.abs().log10().floor() as i32;
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Fan `requests` out into weighted location instances.
///
/// A location error is drawn once per request from `rng`, whatever the
/// prediction source, so the same seed perturbs the same requests.
pub fn weighted_fan_out<R: Rng>(
    requests: &[Request],
    prediction: Prediction<'_>,
    topology: &Topology,
    options: &FanOutOptions,
    rng: &mut R,
) -> Result<Vec<Request>, InputError> {
    let n = topology.len();
    let actual: Option<BTreeMap<RequestId, usize>> = match prediction {
        Prediction::NextInterval(next) => Some(next.iter().map(|r| (r.id, r.location)).collect()),
        _ => None,
    };
    let mut instances = Vec::with_capacity(requests.len());

    for request in requests {
        if request.location >= n {
            return Err(InputError::UnknownNode {
                node: request.location,
                nodes: n,
            });
        }
        let location_error = rng.gen::<f64>() < options.error_rate;

        let row: Vec<f64> = match prediction {
            Prediction::Realized | Prediction::NextInterval(_) => {
                let mut instance = request.instance(request.location, 1.0, 1.0);
                if let Some(actual) = &actual {
                    match actual.get(&request.id) {
                        Some(loc) => instance.location = *loc,
                        None => instance.revenue = 0,
                    }
                }
                if location_error && options.estimated {
                    instance.location = (instance.location + 1) % n;
                }
                instances.push(instance);
                continue;
            }
            Prediction::Matrix(matrix) => matrix
                .get(request.location)
                .cloned()
                .ok_or(InputError::UnknownNode {
                    node: request.location,
                    nodes: matrix.len(),
                })?,
            Prediction::PerUser(vectors) => {
                let vector = vectors
                    .get(&request.id)
                    .ok_or(InputError::ZeroTotalWeight { request: request.id })?;
                in_range_vector(vector, topology, request.location, options.exit_rate)
            }
        };
        if row.len() != n {
            return Err(InputError::ProbabilityRowMismatch {
                row: request.location,
                got: row.len(),
                expected: n,
            });
        }

        let total: f64 = match prediction {
            Prediction::PerUser(_) => row.iter().sum(),
            _ => row.iter().filter(|p| **p > options.threshold).sum(),
        };
        let total = round_significant(total);
        if total == 0.0 {
            return Err(InputError::ZeroTotalWeight { request: request.id });
        }

        let perturb = location_error && matches!(prediction, Prediction::Matrix(_));
        let positive = row.iter().filter(|p| **p > 0.0).count();
        let max = row.iter().copied().fold(0.0, f64::max);
        for (dst, p) in row.iter().enumerate() {
            if *p <= options.threshold {
                continue;
            }
            let weight = if perturb {
                if *p == max {
                    round_significant(p + 0.05 * (positive as f64 - 1.0))
                } else if *p <= 0.05 {
                    continue;
                } else {
                    round_significant(p - 0.05)
                }
            } else {
                *p
            };
            instances.push(request.instance(dst, weight, total));
        }
    }

    if options.estimated {
        if let Some(limit) = options.limit {
            instances.sort_by(|a, b| b.weight.total_cmp(&a.weight));
            instances.truncate(limit);
        }
    }
    Ok(instances)
}

/// Zero destinations out of range of `origin` and scale the rest to sum to
/// `1 - exit_rate`.
fn in_range_vector(vector: &[f64], topology: &Topology, origin: usize, exit_rate: f64) -> Vec<f64> {
    let kept: Vec<f64> = vector
        .iter()
        .enumerate()
        .map(|(d, p)| {
            if d < topology.len() && topology.in_range(origin, d) {
                *p
            } else {
                0.0
            }
        })
        .collect();
    let sum: f64 = kept.iter().sum();
    if sum == 0.0 {
        return kept;
    }
    let scale = (1.0 - exit_rate) / sum;
    kept.into_iter().map(|p| p * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use sfcsim_placement::NodeSpec;

    fn topo(n: usize) -> Topology {
        let specs: Vec<NodeSpec> = (0..n)
            .map(|id| NodeSpec {
                id,
                x: id as i64,
                y: 0,
                capacity: 10,
                processing_rate: 1,
                state_cost: 0,
            })
            .collect();
        Topology::ranged(&specs, 1, 1, 1).unwrap()
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0)
    }

    #[test]
    fn test_round_significant() {
        assert_eq!(round_significant(0.8349), 0.83);
        assert_eq!(round_significant(0.996), 1.0);
        assert_eq!(round_significant(12.6), 13.0);
        assert_eq!(round_significant(0.0), 0.0);
    }

    #[test]
    fn test_realized_gets_unit_weight() {
        let reqs = vec![Request::new(1, 0, 1, 2, 40)];
        let out = weighted_fan_out(&reqs, Prediction::Realized, &topo(3), &Default::default(), &mut rng())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].location, out[0].weight, out[0].total_weight), (2, 1.0, 1.0));
    }

    #[test]
    fn test_next_interval_moves_or_zeroes_revenue() {
        let reqs = vec![Request::new(1, 0, 1, 0, 40), Request::new(2, 0, 1, 0, 30)];
        let next = vec![Request::new(1, 1, 1, 2, 40)];
        let out = weighted_fan_out(
            &reqs,
            Prediction::NextInterval(&next),
            &topo(3),
            &FanOutOptions { estimated: true, ..Default::default() },
            &mut rng(),
        )
        .unwrap();
        assert_eq!(out[0].location, 2);
        assert_eq!(out[1].revenue, 0);
        assert_eq!(out[1].location, 0);
    }

    #[test]
    fn test_certain_location_error_shifts_estimate() {
        let reqs = vec![Request::new(1, 0, 1, 2, 40)];
        let options = FanOutOptions { estimated: true, error_rate: 1.0, ..Default::default() };
        let out = weighted_fan_out(&reqs, Prediction::NextInterval(&reqs), &topo(3), &options, &mut rng())
            .unwrap();
        assert_eq!(out[0].location, 0);
    }

    #[test]
    fn test_matrix_threshold_and_total_weight() {
        let matrix = vec![
            vec![0.6, 0.3, 0.04],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let reqs = vec![Request::new(5, 0, 1, 0, 10)];
        let options = FanOutOptions { threshold: 0.05, estimated: true, ..Default::default() };
        let out = weighted_fan_out(&reqs, Prediction::Matrix(&matrix), &topo(3), &options, &mut rng())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].weight, 0.6);
        assert_eq!(out[1].weight, 0.3);
        assert!(out.iter().all(|r| r.total_weight == 0.9));
    }

    #[test]
    fn test_zero_total_weight_is_malformed() {
        let matrix = vec![vec![0.0, 0.0], vec![0.0, 1.0]];
        let reqs = vec![Request::new(5, 0, 1, 0, 10)];
        let err = weighted_fan_out(&reqs, Prediction::Matrix(&matrix), &topo(2), &Default::default(), &mut rng())
            .unwrap_err();
        assert_eq!(err, InputError::ZeroTotalWeight { request: 5 });
    }

    #[test]
    fn test_per_user_vector_restricted_and_normalized() {
        let mut vectors = BTreeMap::new();
        vectors.insert(3, vec![0.2, 0.2, 0.6]);
        let reqs = vec![Request::new(3, 0, 1, 0, 10)];
        let options = FanOutOptions { exit_rate: 0.2, ..Default::default() };
        let out = weighted_fan_out(&reqs, Prediction::PerUser(&vectors), &topo(3), &options, &mut rng())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0].weight - 0.4).abs() < 1e-9);
        assert!((out[1].weight - 0.4).abs() < 1e-9);
        assert_eq!(out[0].total_weight, 0.8);
    }

    #[test]
    fn test_limit_keeps_heaviest_instances() {
        let matrix = vec![vec![0.7, 0.3], vec![0.5, 0.5]];
        let reqs = vec![Request::new(1, 0, 1, 0, 10), Request::new(2, 0, 1, 1, 10)];
        let options = FanOutOptions { estimated: true, limit: Some(2), ..Default::default() };
        let out = weighted_fan_out(&reqs, Prediction::Matrix(&matrix), &topo(2), &options, &mut rng())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].weight, 0.7);
        assert_eq!(out[1].weight, 0.5);
    }
}
