//! Target/decoy evaluation of posterior probabilities.
//!
//! Two quantities are blended into a single objective:
//! - calibration: the area between the FDR estimated from the posteriors
//!   (running mean of `1 - p`) and the empirical FDR from decoy counts
//! - discrimination: the ROC area up to a fixed number of false positives
//!   (ROC-N), normalised to [0, 1]
//!
//! Käll et al., https://pubmed.ncbi.nlm.nih.gov/18052118/
//! Pfeuffer et al., https://pubmed.ncbi.nlm.nih.gov/31975601/

use crate::params::OptimizeParameters;
use serde::Serialize;

/// Number of false positives at which ROC-N stops integrating
pub const FP_CUTOFF: u32 = 50;
/// Upper bound on the width used to scale the calibration area
pub const PEP_CUTOFF: f64 = 1.0;

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct FdrEvaluator {
    /// Weight of ROC-N; `1 - aucweight` goes to calibration
    pub aucweight: f64,
    /// Empirical FDR as decoys / targets instead of decoys / all
    pub conservative: bool,
    /// Add one pseudo-decoy to the empirical FDR
    pub regularized: bool,
    pub fp_cutoff: u32,
    pub pep_cutoff: f64,
}

impl From<&OptimizeParameters> for FdrEvaluator {
    fn from(params: &OptimizeParameters) -> Self {
        Self {
            aucweight: params.aucweight,
            conservative: params.conservative_fdr,
            regularized: params.regularized_fdr,
            fp_cutoff: FP_CUTOFF,
            pep_cutoff: PEP_CUTOFF,
        }
    }
}

/// Area between segment (x1, y1)-(x2, y2) and the line x = y, over the
/// interval [x1, x2]. Handles segments crossing the diagonal.
fn trapezoidal_area_xeqy(x1: f64, x2: f64, y1: f64, y2: f64) -> f64 {
    let height = x2 - x1;
    let b1 = y1 - x1;
    let b2 = y2 - x2;
    if b1.is_sign_negative() == b2.is_sign_negative() {
        (b1.abs() + b2.abs()) * height / 2.0
    } else {
        (b1 * b1 + b2 * b2) * height / (2.0 * (b1.abs() + b2.abs()))
    }
}

fn trapezoidal_area(x1: f64, x2: f64, y1: f64, y2: f64) -> f64 {
    (x1 - x2).abs() * (y1 + y2) / 2.0
}

impl FdrEvaluator {
    fn empirical_fdr(&self, targets: u32, decoys: u32) -> f64 {
        let decoys = decoys as f64 + self.regularized as u8 as f64;
        let denominator = match self.conservative {
            true => targets as f64,
            false => targets as f64 + decoys,
        };
        match denominator > 0.0 {
            true => (decoys / denominator).min(1.0),
            false => 1.0,
        }
    }

    /// Area between estimated and empirical FDR curves, scaled by the
    /// largest estimated FDR reached. Expects scores sorted descending.
    pub fn calibration_error(&self, sorted: &[(f64, bool)]) -> f64 {
        let (mut targets, mut decoys) = (0u32, 0u32);
        let mut pep_sum = 0.0;
        let (mut est_prev, mut emp_prev) = (0.0, 0.0);
        let mut est = 0.0;
        let mut area = 0.0;

        for (ix, &(score, target)) in sorted.iter().enumerate() {
            match target {
                true => targets += 1,
                false => decoys += 1,
            }
            pep_sum += 1.0 - score;

            // only close a segment when the score changes
            let last = ix + 1 == sorted.len();
            if last || sorted[ix + 1].0 != score {
                est = pep_sum / (targets + decoys) as f64;
                let emp = self.empirical_fdr(targets, decoys);
                area += trapezoidal_area_xeqy(est_prev, est, emp_prev, emp);
                est_prev = est;
                emp_prev = emp;
            }
        }

        let width = est.min(self.pep_cutoff);
        match width > 0.0 {
            true => area / width,
            false => area,
        }
    }

    /// ROC area up to `fp_cutoff` false positives, normalised by FP·TP.
    /// Perfect separation and target-only lists give 1.
    pub fn roc_n(&self, sorted: &[(f64, bool)]) -> f64 {
        let (mut targets, mut decoys) = (0u32, 0u32);
        let (mut targets_prev, mut decoys_prev) = (0u32, 0u32);
        let mut area = 0.0;

        for (ix, &(score, target)) in sorted.iter().enumerate() {
            match target {
                true => targets += 1,
                false => decoys += 1,
            }
            let last = ix + 1 == sorted.len();
            if last || sorted[ix + 1].0 != score {
                area += trapezoidal_area(
                    decoys as f64,
                    decoys_prev as f64,
                    targets as f64,
                    targets_prev as f64,
                );
                if !last && decoys >= self.fp_cutoff {
                    break;
                }
                targets_prev = targets;
                decoys_prev = decoys;
            }
        }

        match (decoys, targets) {
            (0, _) => 1.0,
            (_, 0) => 0.0,
            (fp, tp) => area / (fp as f64 * tp as f64),
        }
    }

    /// Blend of calibration and ROC-N; higher is better. `scores` holds
    /// `(posterior, is_target)` pairs in any order.
    pub fn evaluate(&self, scores: &mut [(f64, bool)]) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        scores.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        let diff = self.calibration_error(scores);
        let auc = self.roc_n(scores);
        log::trace!("calibration error {:.4}, ROC-N {:.4}", diff, auc);
        (1.0 - diff) * (1.0 - self.aucweight) + auc * self.aucweight
    }
}
