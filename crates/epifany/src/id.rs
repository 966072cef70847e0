//! Identification data model: protein runs, peptide-spectrum matches and
//! consensus features, plus the filters applied before inference.

use crate::params::ParameterTriple;
use crate::Error;
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

pub const POSTERIOR_PROBABILITY: &str = "Posterior Probability";
pub const POSTERIOR_ERROR_PROBABILITY: &str = "Posterior Error Probability";
pub const SEARCH_ENGINE: &str = "Epifany";

/// PSI-MS accession of the posterior error probability score
const PEP_ACCESSION: &str = "MS:1001493";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProteinHit {
    pub accession: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub decoy: bool,
    /// User-supplied prior probability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndistinguishableGroup {
    pub accessions: Vec<String>,
    pub probability: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProteinIdentification {
    pub identifier: String,
    pub hits: Vec<ProteinHit>,
    #[serde(default)]
    pub indistinguishable_proteins: Vec<IndistinguishableGroup>,
    #[serde(default)]
    pub score_type: String,
    #[serde(default)]
    pub higher_score_better: bool,
    #[serde(default)]
    pub search_engine: String,
    #[serde(default)]
    pub search_engine_version: String,
    /// Parameters used by the last inference on this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_parameters: Option<ParameterTriple>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeptideHit {
    pub sequence: String,
    #[serde(default)]
    pub charge: i32,
    pub score: f64,
    #[serde(default)]
    pub accessions: Vec<String>,
}

/// All candidate matches for one spectrum
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeptideIdentification {
    /// Identifier of the protein run this spectrum belongs to
    pub identifier: String,
    pub score_type: String,
    #[serde(default)]
    pub higher_score_better: bool,
    /// Index of the input file (consensus maps) or fraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_index: Option<usize>,
    pub hits: Vec<PeptideHit>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusFeature {
    pub peptide_ids: Vec<PeptideIdentification>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMap {
    pub protein_ids: Vec<ProteinIdentification>,
    pub features: Vec<ConsensusFeature>,
    /// Identifications not assigned to any feature
    #[serde(default)]
    pub unassigned_peptide_ids: Vec<PeptideIdentification>,
}

fn is_posterior_error_probability(score_type: &str) -> bool {
    let lower = score_type.to_ascii_lowercase();
    lower == "pep" || lower == "posterior error probability" || score_type == PEP_ACCESSION
}

pub fn is_posterior_probability(score_type: &str) -> bool {
    let lower = score_type.to_ascii_lowercase();
    lower == "posterior probability" || lower == "pp"
}

/// Check that every identification carries a supported score type and
/// that every score is a probability
pub fn check_probabilities<'a, I>(peptides: I) -> Result<(), Error>
where
    I: IntoIterator<Item = &'a PeptideIdentification>,
{
    for id in peptides {
        if !is_posterior_error_probability(&id.score_type)
            && !is_posterior_probability(&id.score_type)
        {
            return Err(Error::MissingInformation(format!(
                "PSMs need posterior (error) probabilities, found score type `{}`",
                id.score_type
            )));
        }
        if let Some(hit) = id.hits.iter().find(|hit| !(0.0..=1.0).contains(&hit.score)) {
            return Err(Error::MissingInformation(format!(
                "PSM `{}` scored as `{}` has score {}, outside [0, 1]",
                hit.sequence, id.score_type, hit.score
            )));
        }
    }
    Ok(())
}

/// Convert posterior error probabilities into posterior probabilities
/// (`1 - PEP`) in place. Identifications already scored with posterior
/// probabilities are left alone. Nothing is modified unless every
/// identification passes [`check_probabilities`].
pub fn convert_pep_to_pp(peptides: &mut [PeptideIdentification]) -> Result<(), Error> {
    check_probabilities(peptides.iter())?;
    for id in peptides.iter_mut() {
        if is_posterior_error_probability(&id.score_type) {
            id.hits.iter_mut().for_each(|hit| hit.score = 1.0 - hit.score);
            id.score_type = POSTERIOR_PROBABILITY.into();
        }
        id.higher_score_better = true;
    }
    Ok(())
}

/// Remove PSM hits scoring below `cutoff`
pub fn filter_by_probability(peptides: &mut [PeptideIdentification], cutoff: f64) {
    for id in peptides.iter_mut() {
        id.hits.retain(|hit| hit.score >= cutoff);
    }
}

/// Keep the `n` best hits of each spectrum. `n == 0` keeps everything.
pub fn keep_n_best_hits(peptides: &mut [PeptideIdentification], n: usize) {
    for id in peptides.iter_mut() {
        id.hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        if n > 0 {
            id.hits.truncate(n);
        }
    }
}

/// Considering only the `n` best hits per spectrum, keep a single PSM for
/// every (run, sequence, charge): the one with the highest score. Ties go
/// to the spectrum seen first.
pub fn keep_best_per_peptide_per_run(peptides: &mut [PeptideIdentification], n: usize) {
    keep_n_best_hits(peptides, n);

    let mut best: FnvHashMap<(&str, &str, i32), (usize, usize, f64)> = FnvHashMap::default();
    for (i, id) in peptides.iter().enumerate() {
        for (j, hit) in id.hits.iter().enumerate() {
            let key = (id.identifier.as_str(), hit.sequence.as_str(), hit.charge);
            let entry = best.entry(key).or_insert((i, j, hit.score));
            if hit.score > entry.2 {
                *entry = (i, j, hit.score);
            }
        }
    }

    let keep = best
        .into_values()
        .map(|(i, j, _)| (i, j))
        .collect::<FnvHashSet<_>>();

    for (i, id) in peptides.iter_mut().enumerate() {
        let mut j = 0;
        id.hits.retain(|_| {
            let retain = keep.contains(&(i, j));
            j += 1;
            retain
        });
    }
}

pub fn remove_empty_identifications(peptides: &mut Vec<PeptideIdentification>) {
    peptides.retain(|id| !id.hits.is_empty());
}

/// Remove proteins of `run` that no PSM of that run references, returning
/// them so they can be restored after inference
pub fn remove_unreferenced_proteins(
    run: &mut ProteinIdentification,
    peptides: &[PeptideIdentification],
) -> Vec<ProteinHit> {
    let referenced = peptides
        .iter()
        .filter(|id| id.identifier == run.identifier)
        .flat_map(|id| id.hits.iter())
        .flat_map(|hit| hit.accessions.iter().map(String::as_str))
        .collect::<FnvHashSet<_>>();

    let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut run.hits)
        .into_iter()
        .partition(|hit| referenced.contains(hit.accession.as_str()));
    run.hits = kept;
    removed
}
