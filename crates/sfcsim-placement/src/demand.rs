//! Functions, chains and requests.
//!
//! A chain ("app") of `n + 1` functions has `n` real segments numbered
//! `1..=n`, segment `i` joining `f_i` to `f_{i+1}` under a latency budget.
//! Two synthetic segments with budget 0 attach the user's location to the
//! chain: segment `0 = (0, f_1)` and segment `n + 1 = (f_{n+1}, 0)`, where
//! [`USER`] stands for the user endpoint.

use crate::error::InputError;
use crate::topology::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type FunctionId = u32;
pub type AppId = u32;
pub type RequestId = u32;

/// Pseudo-function standing for the user's own location.
pub const USER: FunctionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    /// Capacity units consumed when placed.
    pub size: u32,
}

/// One adjacent pair of a chain and its latency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub from: FunctionId,
    pub to: FunctionId,
    pub budget: u32,
}

/// A raw chain row: `(app, pair id, from, to, budget)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRow {
    pub app: AppId,
    pub pair: u32,
    pub from: FunctionId,
    pub to: FunctionId,
    pub budget: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct App {
    pub id: AppId,
    functions: Vec<FunctionId>,
    segments: Vec<Segment>,
    total_size: u32,
}

impl App {
    /// Build a chain from its pair rows. Rows may arrive in any order but
    /// their ids must be contiguous from 1 and each pair must extend the chain
    /// with a function not seen before.
    pub fn from_pairs(
        id: AppId,
        rows: &[PairRow],
        functions: &BTreeMap<FunctionId, Function>,
    ) -> Result<Self, InputError> {
        let mut by_id: BTreeMap<u32, &PairRow> = BTreeMap::new();
        for row in rows {
            if by_id.insert(row.pair, row).is_some() {
                return Err(InputError::DuplicatePair {
                    app: id,
                    from: row.from,
                    to: row.to,
                });
            }
        }
        let ids: Vec<u32> = by_id.keys().copied().collect();
        if ids.is_empty() {
            return Err(InputError::ChainTooShort { app: id });
        }
        if ids.iter().enumerate().any(|(i, pair)| *pair != i as u32 + 1) {
            return Err(InputError::NonContiguousPairs { app: id, ids });
        }

        let mut chain: Vec<FunctionId> = Vec::with_capacity(by_id.len() + 1);
        let mut segments = Vec::with_capacity(by_id.len() + 2);
        for row in by_id.values() {
            for f in [row.from, row.to] {
                if !functions.contains_key(&f) {
                    return Err(InputError::UnknownFunction { app: id, function: f });
                }
            }
            if chain.is_empty() {
                chain.push(row.from);
            } else if chain.last() != Some(&row.from) {
                return Err(InputError::BrokenChain { app: id, pair: row.pair });
            }
            if chain.contains(&row.to) {
                return Err(InputError::BrokenChain { app: id, pair: row.pair });
            }
            chain.push(row.to);
            segments.push(Segment {
                from: row.from,
                to: row.to,
                budget: row.budget,
            });
        }
        if chain.len() < 2 {
            return Err(InputError::ChainTooShort { app: id });
        }

        let first = chain[0];
        let last = chain[chain.len() - 1];
        segments.insert(0, Segment { from: USER, to: first, budget: 0 });
        segments.push(Segment { from: last, to: USER, budget: 0 });
        let total_size = chain.iter().map(|f| functions[f].size).sum();

        Ok(Self {
            id,
            functions: chain,
            segments,
            total_size,
        })
    }

    /// Real functions in chain order, `f_1..=f_{n+1}`.
    pub fn functions(&self) -> &[FunctionId] {
        &self.functions
    }

    /// Number of real segments `n`.
    pub fn real_pairs(&self) -> usize {
        self.functions.len() - 1
    }

    /// Segment `i` in `0..=n+1`.
    pub fn segment(&self, i: usize) -> &Segment {
        &self.segments[i]
    }

    /// All segments including both synthetic endpoints.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn budget(&self, i: usize) -> u32 {
        self.segments[i].budget
    }

    /// Sum of the real segment budgets.
    pub fn total_budget(&self) -> u32 {
        self.segments[1..=self.real_pairs()]
            .iter()
            .map(|s| s.budget)
            .sum()
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn first(&self) -> FunctionId {
        self.functions[0]
    }

    pub fn last(&self) -> FunctionId {
        self.functions[self.functions.len() - 1]
    }

    pub fn pair_rows(&self) -> Vec<PairRow> {
        self.segments[1..=self.real_pairs()]
            .iter()
            .enumerate()
            .map(|(i, s)| PairRow {
                app: self.id,
                pair: i as u32 + 1,
                from: s.from,
                to: s.to,
                budget: s.budget,
            })
            .collect()
    }
}

/// The immutable function and chain catalogue of a run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub functions: BTreeMap<FunctionId, Function>,
    pub apps: BTreeMap<AppId, App>,
}

impl Catalog {
    pub fn new(functions: Vec<Function>) -> Self {
        Self {
            functions: functions.into_iter().map(|f| (f.id, f)).collect(),
            apps: BTreeMap::new(),
        }
    }

    /// Group pair rows by app and build every chain.
    pub fn with_pairs(mut self, rows: &[PairRow]) -> Result<Self, InputError> {
        let mut grouped: BTreeMap<AppId, Vec<PairRow>> = BTreeMap::new();
        for row in rows {
            grouped.entry(row.app).or_default().push(*row);
        }
        for (id, rows) in grouped {
            let app = App::from_pairs(id, &rows, &self.functions)?;
            self.apps.insert(id, app);
        }
        Ok(self)
    }

    pub fn app(&self, id: AppId) -> Option<&App> {
        self.apps.get(&id)
    }

    /// Size of `function`; the user endpoint has size 0.
    pub fn size(&self, function: FunctionId) -> u32 {
        self.functions.get(&function).map(|f| f.size).unwrap_or(0)
    }

    /// Check that every request names a known chain.
    pub fn check_requests(&self, requests: &[Request]) -> Result<(), InputError> {
        for r in requests {
            if !self.apps.contains_key(&r.app) {
                return Err(InputError::UnknownApp { request: r.id, app: r.app });
            }
        }
        Ok(())
    }
}

/// A chain instance. Several instances with the same `id` may exist at
/// different candidate locations while a prediction is fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub time: u32,
    pub app: AppId,
    pub location: NodeId,
    pub revenue: u32,
    /// Probability mass of this location instance.
    pub weight: f64,
    /// Sum of `weight` over all instances of the logical request.
    pub total_weight: f64,
    pub used: bool,
}

impl Request {
    pub fn new(id: RequestId, time: u32, app: AppId, location: NodeId, revenue: u32) -> Self {
        Self {
            id,
            time,
            app,
            location,
            revenue,
            weight: 1.0,
            total_weight: 1.0,
            used: true,
        }
    }

    /// A fan-out instance of this request at `location` with `weight`.
    pub fn instance(&self, location: NodeId, weight: f64, total_weight: f64) -> Self {
        Self {
            location,
            weight,
            total_weight,
            ..self.clone()
        }
    }

    pub fn weighted_revenue(&self) -> f64 {
        self.revenue as f64 * self.weight
    }

    /// `(request, location)` identifying one fan-out instance.
    pub fn instance_key(&self) -> (RequestId, NodeId) {
        (self.id, self.location)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn functions(sizes: &[u32]) -> BTreeMap<FunctionId, Function> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let id = i as u32 + 1;
                (id, Function { id, size: *s })
            })
            .collect()
    }

    pub fn row(app: AppId, pair: u32, from: FunctionId, to: FunctionId, budget: u32) -> PairRow {
        PairRow { app, pair, from, to, budget }
    }

    #[test]
    fn test_chain_gets_user_endpoints() {
        let funcs = functions(&[1, 2, 3]);
        let app = App::from_pairs(7, &[row(7, 2, 2, 3, 4), row(7, 1, 1, 2, 5)], &funcs).unwrap();
        assert_eq!(app.functions(), &[1, 2, 3]);
        assert_eq!(app.real_pairs(), 2);
        assert_eq!(app.segments().len(), 4);
        assert_eq!(app.segment(0), &Segment { from: USER, to: 1, budget: 0 });
        assert_eq!(app.segment(3), &Segment { from: 3, to: USER, budget: 0 });
        assert_eq!(app.total_size(), 6);
        assert_eq!(app.total_budget(), 9);
    }

    #[test]
    fn test_non_contiguous_pairs_rejected() {
        let funcs = functions(&[1, 1, 1]);
        let err = App::from_pairs(1, &[row(1, 1, 1, 2, 5), row(1, 3, 2, 3, 5)], &funcs);
        assert!(matches!(err, Err(InputError::NonContiguousPairs { .. })));
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let funcs = functions(&[1, 1]);
        let err = App::from_pairs(1, &[row(1, 1, 1, 2, 5), row(1, 1, 1, 2, 5)], &funcs);
        assert!(matches!(err, Err(InputError::DuplicatePair { .. })));
    }

    #[test]
    fn test_repeated_function_rejected() {
        let funcs = functions(&[1, 1]);
        let err = App::from_pairs(1, &[row(1, 1, 1, 2, 5), row(1, 2, 2, 1, 5)], &funcs);
        assert!(matches!(err, Err(InputError::BrokenChain { pair: 2, .. })));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let funcs = functions(&[1]);
        let err = App::from_pairs(1, &[row(1, 1, 1, 9, 5)], &funcs);
        assert!(matches!(err, Err(InputError::UnknownFunction { function: 9, .. })));
    }

    #[test]
    fn test_catalog_checks_requests() {
        let catalog = Catalog::new(vec![Function { id: 1, size: 1 }, Function { id: 2, size: 1 }])
            .with_pairs(&[row(4, 1, 1, 2, 3)])
            .unwrap();
        assert!(catalog.check_requests(&[Request::new(1, 0, 4, 0, 10)]).is_ok());
        assert!(matches!(
            catalog.check_requests(&[Request::new(1, 0, 5, 0, 10)]),
            Err(InputError::UnknownApp { app: 5, .. })
        ));
    }
}
