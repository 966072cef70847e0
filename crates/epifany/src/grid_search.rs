//! Grid search over the model parameters (α, β, γ).
//!
//! Parameters left negative in the configuration are searched over a small
//! fixed list of candidates; fixed parameters contribute a single value.

use crate::params::{ModelParameters, ParameterTriple};
use log::{debug, info};
use std::time::Instant;

pub const GAMMA_CANDIDATES: [f64; 3] = [0.2, 0.5, 0.7];
pub const BETA_CANDIDATES: [f64; 3] = [0.01, 0.2, 0.4];
pub const ALPHA_CANDIDATES: [f64; 5] = [0.1, 0.25, 0.5, 0.65, 0.8];

/// Spurious emission well above true emission: not worth scoring
pub fn is_improbable(triple: &ParameterTriple) -> bool {
    triple.beta - triple.alpha >= 0.3 && triple.alpha + triple.beta <= 1.0
}

#[derive(Clone, Debug, PartialEq)]
pub struct GridSearch {
    pub alphas: Vec<f64>,
    pub betas: Vec<f64>,
    pub gammas: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GridResult {
    /// Indices into alphas, betas, gammas
    pub best: [usize; 3],
    pub best_score: f64,
    pub evaluations: usize,
    pub rejected: usize,
}

impl GridSearch {
    pub fn from_model(model: &ModelParameters) -> Self {
        fn candidates(value: f64, defaults: &[f64]) -> Vec<f64> {
            match value < 0.0 {
                true => defaults.to_vec(),
                false => vec![value],
            }
        }
        Self {
            alphas: candidates(model.pep_emission, &ALPHA_CANDIDATES),
            betas: candidates(model.pep_spurious_emission, &BETA_CANDIDATES),
            gammas: candidates(model.prot_prior, &GAMMA_CANDIDATES),
        }
    }

    pub fn len(&self) -> usize {
        self.alphas.len() * self.betas.len() * self.gammas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A single combination needs no search
    pub fn is_trivial(&self) -> bool {
        self.len() == 1
    }

    pub fn triple(&self, [a, b, g]: [usize; 3]) -> ParameterTriple {
        ParameterTriple {
            alpha: self.alphas[a],
            beta: self.betas[b],
            gamma: self.gammas[g],
        }
    }

    /// Score every combination (α outermost, γ innermost) with `evaluate`
    /// and keep the best. Improbable combinations are skipped and count as
    /// zero; on ties the first combination seen wins.
    pub fn search<F>(&self, mut evaluate: F) -> GridResult
    where
        F: FnMut(ParameterTriple) -> f64,
    {
        let start = Instant::now();
        let mut result = GridResult {
            best: [0, 0, 0],
            best_score: 0.0,
            evaluations: 0,
            rejected: 0,
        };
        let mut found = false;

        for a in 0..self.alphas.len() {
            for b in 0..self.betas.len() {
                for g in 0..self.gammas.len() {
                    let triple = self.triple([a, b, g]);
                    if is_improbable(&triple) {
                        debug!("skipping improbable parameters {}", triple);
                        result.rejected += 1;
                        continue;
                    }
                    let score = evaluate(triple);
                    result.evaluations += 1;
                    debug!("{}: score {:.5}", triple, score);
                    if !found || score > result.best_score {
                        found = true;
                        result.best = [a, b, g];
                        result.best_score = score;
                    }
                }
            }
        }

        info!(
            "grid search: {} combinations scored, {} rejected, best {} ({:.5}) in {}ms",
            result.evaluations,
            result.rejected,
            self.triple(result.best),
            result.best_score,
            start.elapsed().as_millis()
        );
        result
    }
}
