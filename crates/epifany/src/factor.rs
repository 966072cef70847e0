//! Translation of one connected component into a discrete factor graph.
//!
//! Binary variables (proteins, PSMs) use state 0 for "absent" and 1 for
//! "present". Every other node counts how many of its lower neighbours are
//! present, so its support is `0..=Σ(card - 1)` over those neighbours.

use crate::graph::{Component, IdGraph, NodeId, NodeKind};
use crate::params::ParameterTriple;
use crate::InferenceError;
use fnv::FnvHashMap;

/// How messages are marginalized: a finite p-norm (p = 1 is sum-product) or
/// the max norm (max-product)
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PNorm {
    Finite(f64),
    Max,
}

impl PNorm {
    /// Negative values select max-product
    pub fn from_parameter(p: f64) -> Self {
        match p < 0.0 {
            true => PNorm::Max,
            false => PNorm::Finite(p),
        }
    }

    #[inline]
    pub fn lift(self, x: f64) -> f64 {
        match self {
            PNorm::Finite(p) if p != 1.0 => x.powf(p),
            _ => x,
        }
    }

    #[inline]
    pub fn combine(self, acc: f64, x: f64) -> f64 {
        match self {
            PNorm::Finite(_) => acc + x,
            PNorm::Max => acc.max(x),
        }
    }

    #[inline]
    pub fn lower(self, x: f64) -> f64 {
        match self {
            PNorm::Finite(p) if p != 1.0 => x.powf(p.recip()),
            _ => x,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ModelSettings {
    pub triple: ParameterTriple,
    pub pep_prior: f64,
    pub regularize: bool,
    pub user_defined_priors: bool,
    pub p_norm: PNorm,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FactorKind {
    ProteinPrior { prior: f64 },
    PeptideEvidence { score: f64 },
    SumEvidence { evidence: usize, regularized: bool },
    ProbabilisticAdder,
}

/// Dense table in row-major order: the last variable varies fastest
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub dims: Vec<usize>,
    pub values: Vec<f64>,
}

impl Table {
    pub fn get(&self, index: &[usize]) -> f64 {
        let offset = index
            .iter()
            .zip(&self.dims)
            .fold(0, |acc, (&i, &dim)| acc * dim + i);
        self.values[offset]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Potential {
    Table(Table),
    /// The last variable is the sum of the others
    Adder,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Factor {
    pub kind: FactorKind,
    /// Indices into [`InferenceGraph::variables`]
    pub variables: Vec<usize>,
    pub potential: Potential,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub node: NodeId,
    pub cardinality: usize,
}

#[derive(Clone, Debug)]
pub struct InferenceGraph {
    pub variables: Vec<Variable>,
    pub factors: Vec<Factor>,
    pub p_norm: PNorm,
    index: FnvHashMap<NodeId, usize>,
}

impl InferenceGraph {
    pub fn variable(&self, node: NodeId) -> Option<usize> {
        self.index.get(&node).copied()
    }

    /// Number of factor-variable edges
    pub fn edge_count(&self) -> usize {
        self.factors.iter().map(|f| f.variables.len()).sum()
    }
}

pub struct FactorGraphBuilder {
    settings: ModelSettings,
}

impl FactorGraphBuilder {
    pub fn new(settings: ModelSettings) -> Self {
        Self { settings }
    }

    fn protein_prior(prior: f64) -> Factor {
        Factor {
            kind: FactorKind::ProteinPrior { prior },
            variables: Vec::new(),
            potential: Potential::Table(Table {
                dims: vec![2],
                values: vec![1.0 - prior, prior],
            }),
        }
    }

    fn peptide_evidence(&self, score: f64) -> Factor {
        let pi = self.settings.pep_prior;
        Factor {
            kind: FactorKind::PeptideEvidence { score },
            variables: Vec::new(),
            potential: Potential::Table(Table {
                dims: vec![2],
                values: vec![(1.0 - score) / (1.0 - pi), score / pi],
            }),
        }
    }

    /// P(PSM | number of present parents), one row per parent state
    fn sum_evidence(&self, parent_states: usize, evidence: usize) -> Factor {
        let ParameterTriple { alpha, beta, .. } = self.settings.triple;
        let regularized = self.settings.regularize;
        let mut values = Vec::with_capacity(parent_states * 2);
        for i in 0..parent_states {
            let absent = (1.0 - beta) * (1.0 - alpha).powi(i as i32);
            let present = match (regularized, i) {
                (true, i) if i > 0 => (1.0 - absent) / i as f64,
                _ => 1.0 - absent,
            };
            values.push(absent);
            values.push(present);
        }
        Factor {
            kind: FactorKind::SumEvidence {
                evidence,
                regularized,
            },
            variables: Vec::new(),
            potential: Potential::Table(Table {
                dims: vec![parent_states, 2],
                values,
            }),
        }
    }

    /// Variables are created bottom-up by layer so that every sum node's
    /// inputs already have a known support.
    pub fn build(
        &self,
        graph: &IdGraph,
        component: &Component,
    ) -> Result<InferenceGraph, InferenceError> {
        let mut order = component.nodes.clone();
        order.sort_by_key(|&n| (graph.node(n).kind.layer(), n));

        let mut variables: Vec<Variable> = Vec::with_capacity(order.len());
        let mut factors = Vec::new();
        let mut index = FnvHashMap::default();

        for node in order {
            let (lower, _) = graph.neighbors_by_layer(node);
            let lower = lower
                .into_iter()
                .map(|n| index.get(&n).copied().ok_or(InferenceError::DomainMismatch(n)))
                .collect::<Result<Vec<usize>, _>>()?;

            let var = variables.len();
            match &graph.node(node).kind {
                NodeKind::Protein { prior, .. } => {
                    let prior = match self.settings.user_defined_priors {
                        true => prior.unwrap_or(self.settings.triple.gamma),
                        false => self.settings.triple.gamma,
                    };
                    variables.push(Variable {
                        node,
                        cardinality: 2,
                    });
                    let mut factor = Self::protein_prior(prior);
                    factor.variables.push(var);
                    factors.push(factor);
                }
                NodeKind::Psm {
                    score, evidence, ..
                } => {
                    if lower.len() > 1 {
                        return Err(InferenceError::AmbiguousParent(node));
                    }
                    variables.push(Variable {
                        node,
                        cardinality: 2,
                    });
                    let mut factor = self.peptide_evidence(*score);
                    factor.variables.push(var);
                    factors.push(factor);

                    if let Some(&parent) = lower.first() {
                        let mut factor =
                            self.sum_evidence(variables[parent].cardinality, *evidence);
                        factor.variables = vec![parent, var];
                        factors.push(factor);
                    }
                }
                NodeKind::ProteinGroup
                | NodeKind::PeptideGroup
                | NodeKind::Peptide { .. }
                | NodeKind::RunIndex { .. }
                | NodeKind::Charge { .. } => {
                    if lower.is_empty() {
                        return Err(InferenceError::EmptyEvidenceSet(node));
                    }
                    let cardinality = 1 + lower
                        .iter()
                        .map(|&v| variables[v].cardinality - 1)
                        .sum::<usize>();
                    variables.push(Variable { node, cardinality });
                    let mut inputs = lower;
                    inputs.push(var);
                    factors.push(Factor {
                        kind: FactorKind::ProbabilisticAdder,
                        variables: inputs,
                        potential: Potential::Adder,
                    });
                }
            }
            index.insert(node, var);
        }

        Ok(InferenceGraph {
            variables,
            factors,
            p_norm: self.settings.p_norm,
            index,
        })
    }
}
