//! # Bayesian protein inference
//!
//! [`BayesianProteinInference`] runs the whole pipeline for one protein
//! identification run:
//!
//! 1. PSM scores become posterior probabilities and low scoring PSMs go
//! 2. PSMs are deduplicated and proteins without evidence are set aside
//! 3. protein scores are reset (optionally keeping them as priors)
//! 4. the identification graph is built, decomposed and clustered
//! 5. (α, β, γ) are picked by grid search unless all of them are fixed
//! 6. inference is rerun with the chosen parameters and posteriors are
//!    written back to proteins, protein groups and (optionally) PSMs
//! 7. greedy resolution and indistinguishable group annotation
//! 8. set-aside proteins are restored with score 0
//!
//! Connected components are independent and run in parallel. A component
//! that fails numerically is logged and keeps its reset scores.

use crate::factor::{FactorGraphBuilder, ModelSettings, PNorm};
use crate::fdr::FdrEvaluator;
use crate::graph::{Component, GraphOptions, IdGraph, NodeId, NodeKind, ProteinIx};
use crate::grid_search::GridSearch;
use crate::id::{
    check_probabilities, convert_pep_to_pp, filter_by_probability, keep_best_per_peptide_per_run,
    keep_n_best_hits, remove_empty_identifications, remove_unreferenced_proteins, ConsensusMap,
    IndistinguishableGroup, PeptideIdentification, ProteinIdentification, POSTERIOR_PROBABILITY,
    SEARCH_ENGINE,
};
use crate::message_passing::{self, ComponentOutcome, EngineSettings};
use crate::params::{ParameterTriple, Parameters};
use crate::{Error, InferenceError};
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;

/// Posteriors closer than this to the best one count as tied during
/// greedy resolution
const GREEDY_TOLERANCE: f64 = 1e-9;

/// Statistics for one inference call on one run
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InferenceSummary {
    pub run: String,
    pub proteins: usize,
    pub psms: usize,
    pub components: usize,
    /// Components too small to carry information
    pub skipped_components: usize,
    pub failed_components: usize,
    /// Messages passed during the final inference
    pub messages: u64,
    pub grid_evaluations: usize,
    /// Full inference runs, grid search included
    pub inference_runs: usize,
    pub parameters: Option<ParameterTriple>,
    pub best_score: Option<f64>,
}

/// Node kinds whose posteriors are requested from the engine
#[derive(Copy, Clone, Debug)]
struct QuerySet {
    proteins: bool,
    groups: bool,
    psms: bool,
}

impl QuerySet {
    fn matches(&self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Protein { .. } => self.proteins,
            NodeKind::ProteinGroup => self.groups,
            NodeKind::Psm { .. } => self.psms,
            _ => false,
        }
    }
}

/// `None` for skipped components
type ComponentResult = Option<Result<ComponentOutcome, InferenceError>>;

fn infer_component(
    graph: &IdGraph,
    component: &Component,
    model: &ModelSettings,
    engine: &EngineSettings,
    queries: QuerySet,
) -> ComponentResult {
    if component.nodes.len() < 2 {
        return None;
    }
    let engine = EngineSettings {
        seed: engine.seed.wrapping_add(component.index as u64),
        ..*engine
    };
    let queries = component
        .nodes
        .iter()
        .copied()
        .filter(|&n| queries.matches(&graph.node(n).kind))
        .collect::<Vec<_>>();
    Some(
        FactorGraphBuilder::new(*model)
            .build(graph, component)
            .and_then(|fg| message_passing::infer(&fg, &engine, &queries)),
    )
}

fn merged_posteriors(results: &[ComponentResult]) -> FnvHashMap<NodeId, f64> {
    results
        .iter()
        .flatten()
        .flatten()
        .flat_map(|outcome| outcome.posteriors.iter().map(|(&n, &p)| (n, p)))
        .collect()
}

/// Protein groups of the graph (with their group node) followed by every
/// protein that is not part of a group
fn protein_groups(graph: &IdGraph) -> Vec<(Option<NodeId>, Vec<(NodeId, ProteinIx)>)> {
    let protein = |id: NodeId| match graph.node(id).kind {
        NodeKind::Protein { protein, .. } => Some((id, protein)),
        _ => None,
    };

    let mut grouped = FnvHashSet::default();
    let mut groups = Vec::new();
    for (id, node) in graph.iter() {
        if node.kind == NodeKind::ProteinGroup {
            let (lower, _) = graph.neighbors_by_layer(id);
            let members = lower.into_iter().filter_map(protein).collect::<Vec<_>>();
            grouped.extend(members.iter().map(|(n, _)| *n));
            groups.push((Some(id), members));
        }
    }
    for (id, _) in graph.iter() {
        if let Some(member) = protein(id) {
            if !grouped.contains(&id) {
                groups.push((None, vec![member]));
            }
        }
    }
    groups
}

/// `(score, is_target)` pairs for the grid search objective
fn evaluation_scores(
    graph: &IdGraph,
    run: &ProteinIdentification,
    posteriors: &FnvHashMap<NodeId, f64>,
    group_level: bool,
) -> Vec<(f64, bool)> {
    let posterior = |n: &NodeId| posteriors.get(n).copied().unwrap_or(0.0);
    match group_level {
        true => protein_groups(graph)
            .into_iter()
            .map(|(_, members)| {
                let score = members.iter().map(|(n, _)| posterior(n)).fold(0.0, f64::max);
                let target = members
                    .iter()
                    .any(|(_, ix)| !run.hits[ix.0 as usize].decoy);
                (score, target)
            })
            .collect(),
        false => graph
            .iter()
            .filter_map(|(id, node)| match node.kind {
                NodeKind::Protein { protein, .. } => {
                    Some((posterior(&id), !run.hits[protein.0 as usize].decoy))
                }
                _ => None,
            })
            .collect(),
    }
}

/// Keep, for every PSM with several candidate proteins, only the accessions
/// of the best scoring protein and the members of its indistinguishable group
fn greedy_group_resolution(run: &ProteinIdentification, peptides: &mut [PeptideIdentification]) {
    let posterior = run
        .hits
        .iter()
        .map(|hit| (hit.accession.as_str(), hit.score))
        .collect::<FnvHashMap<_, _>>();
    let group_of = run
        .indistinguishable_proteins
        .iter()
        .enumerate()
        .flat_map(|(ix, group)| group.accessions.iter().map(move |acc| (acc.as_str(), ix)))
        .collect::<FnvHashMap<_, _>>();

    let mut resolved = 0;
    for hit in peptides.iter_mut().flat_map(|id| id.hits.iter_mut()) {
        if hit.accessions.len() < 2 {
            continue;
        }
        let best = hit
            .accessions
            .iter()
            .filter_map(|acc| posterior.get(acc.as_str()))
            .fold(f64::NEG_INFINITY, |acc, &p| acc.max(p));
        if best == f64::NEG_INFINITY {
            continue;
        }
        let winners = hit
            .accessions
            .iter()
            .filter(|acc| {
                posterior
                    .get(acc.as_str())
                    .map_or(false, |&p| p >= best - GREEDY_TOLERANCE)
            })
            .filter_map(|acc| group_of.get(acc.as_str()).copied())
            .collect::<FnvHashSet<_>>();

        let before = hit.accessions.len();
        hit.accessions.retain(|acc| {
            let score = posterior.get(acc.as_str()).copied();
            score.map_or(false, |p| p >= best - GREEDY_TOLERANCE)
                || group_of
                    .get(acc.as_str())
                    .map_or(false, |g| winners.contains(g))
        });
        if hit.accessions.len() < before {
            resolved += 1;
        }
    }
    info!("greedy resolution reassigned {} shared PSMs", resolved);
}

pub struct BayesianProteinInference {
    parameters: Parameters,
}

impl BayesianProteinInference {
    pub fn new(parameters: Parameters) -> Result<Self, Error> {
        parameters.validate()?;
        Ok(Self { parameters })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn model_settings(&self, triple: ParameterTriple) -> ModelSettings {
        let model = &self.parameters.model_parameters;
        ModelSettings {
            triple,
            pep_prior: model.pep_prior,
            regularize: model.regularize,
            user_defined_priors: self.parameters.user_defined_priors,
            p_norm: PNorm::from_parameter(
                self.parameters.loopy_belief_propagation.p_norm_inference,
            ),
        }
    }

    fn engine_settings(&self) -> EngineSettings {
        let loopy = &self.parameters.loopy_belief_propagation;
        EngineSettings {
            scheduling: loopy.scheduling_type,
            convergence_threshold: loopy.convergence_threshold,
            dampening_lambda: loopy.dampening_lambda,
            max_messages: loopy.max_nr_iterations,
            seed: loopy.seed,
        }
    }

    /// Run every component with `triple`, one rayon task per component.
    /// Results are indexed by component.
    fn run_components(
        &self,
        graph: &IdGraph,
        triple: ParameterTriple,
        queries: QuerySet,
    ) -> Vec<ComponentResult> {
        let model = self.model_settings(triple);
        let engine = self.engine_settings();
        graph
            .connected_components()
            .par_iter()
            .map(|component| infer_component(graph, component, &model, &engine, queries))
            .collect()
    }

    /// Infer protein posteriors for `run` from the PSMs in `peptides` that
    /// share its identifier. Empty peptide identifications are removed
    /// afterwards.
    pub fn infer(
        &self,
        run: &mut ProteinIdentification,
        peptides: &mut Vec<PeptideIdentification>,
    ) -> Result<InferenceSummary, Error> {
        self.check_inputs(run, peptides.iter())?;
        let summary = self.infer_run(run, peptides)?;
        remove_empty_identifications(peptides);
        Ok(summary)
    }

    /// Fail before anything is modified if the PSMs of `run` are not scored
    /// with probabilities, or if a user-defined prior is not a probability
    fn check_inputs<'a, I>(&self, run: &ProteinIdentification, peptides: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a PeptideIdentification>,
    {
        check_probabilities(
            peptides
                .into_iter()
                .filter(|id| id.identifier == run.identifier),
        )?;
        if self.parameters.user_defined_priors {
            for hit in &run.hits {
                let prior = hit.prior.unwrap_or(hit.score);
                if !(0.0..=1.0).contains(&prior) {
                    return Err(Error::InvalidParameter(format!(
                        "prior of protein `{}` in run `{}` is {}, outside [0, 1]",
                        hit.accession, run.identifier, prior
                    )));
                }
            }
        }
        Ok(())
    }

    /// Independent inference for every run
    pub fn infer_all_runs(
        &self,
        runs: &mut [ProteinIdentification],
        peptides: &mut Vec<PeptideIdentification>,
    ) -> Result<Vec<InferenceSummary>, Error> {
        for run in runs.iter() {
            self.check_inputs(run, peptides.iter())?;
        }
        let summaries = runs
            .iter_mut()
            .map(|run| self.infer_run(run, peptides))
            .collect::<Result<Vec<_>, _>>()?;
        remove_empty_identifications(peptides);
        Ok(summaries)
    }

    /// Inference for every run of a consensus map. Identifications outside
    /// features take part only with `use_ids_outside_features`. Feature
    /// structure is preserved: no identification is removed.
    pub fn infer_consensus(&self, map: &mut ConsensusMap) -> Result<Vec<InferenceSummary>, Error> {
        let use_unassigned = self.parameters.use_ids_outside_features;
        for run in &map.protein_ids {
            let unassigned = map
                .unassigned_peptide_ids
                .iter()
                .filter(|_| use_unassigned);
            let ids = map.features.iter().flat_map(|f| f.peptide_ids.iter());
            self.check_inputs(run, ids.chain(unassigned))?;
        }
        let mut sizes = Vec::with_capacity(map.features.len());
        let mut peptides = Vec::new();
        for feature in map.features.iter_mut() {
            sizes.push(feature.peptide_ids.len());
            peptides.append(&mut feature.peptide_ids);
        }
        let assigned = peptides.len();
        if use_unassigned {
            peptides.append(&mut map.unassigned_peptide_ids);
        }

        let result = map
            .protein_ids
            .iter_mut()
            .map(|run| self.infer_run(run, &mut peptides))
            .collect::<Result<Vec<_>, _>>();

        let unassigned = peptides.split_off(assigned);
        if use_unassigned {
            map.unassigned_peptide_ids = unassigned;
        }
        let mut peptides = peptides.into_iter();
        for (feature, size) in map.features.iter_mut().zip(sizes) {
            feature.peptide_ids = peptides.by_ref().take(size).collect();
        }
        result
    }

    /// Steps 1 to 8 on the identifications belonging to `run`. The other
    /// identifications are untouched, and `peptides` keeps its length.
    fn infer_run(
        &self,
        run: &mut ProteinIdentification,
        peptides: &mut [PeptideIdentification],
    ) -> Result<InferenceSummary, Error> {
        let mut slots = Vec::new();
        let mut own = Vec::new();
        for (ix, id) in peptides.iter_mut().enumerate() {
            if id.identifier == run.identifier {
                slots.push(ix);
                own.push(std::mem::take(id));
            }
        }

        let result = self.infer_own(run, &mut own);

        for (slot, id) in slots.into_iter().zip(own) {
            peptides[slot] = id;
        }
        result
    }

    fn infer_own(
        &self,
        run: &mut ProteinIdentification,
        peptides: &mut [PeptideIdentification],
    ) -> Result<InferenceSummary, Error> {
        let start = Instant::now();
        let params = &self.parameters;

        convert_pep_to_pp(peptides)?;
        filter_by_probability(peptides, params.psm_probability_cutoff);
        match params.keep_best_psm_only {
            true => keep_best_per_peptide_per_run(peptides, params.top_psms),
            false => keep_n_best_hits(peptides, params.top_psms),
        }
        let set_aside = remove_unreferenced_proteins(run, peptides);

        for hit in run.hits.iter_mut() {
            if params.user_defined_priors && hit.prior.is_none() {
                hit.prior = Some(hit.score);
            }
            hit.score = 0.0;
        }

        let options = GraphOptions {
            top_psms: params.top_psms,
            extended_model: params.model_parameters.extended_model,
            user_defined_priors: params.user_defined_priors,
        };
        let mut graph = IdGraph::build(run, peptides, &options)?;
        graph.compute_connected_components();
        graph.cluster_indistinguishable();

        let mut summary = InferenceSummary {
            run: run.identifier.clone(),
            components: graph.connected_components().len(),
            ..Default::default()
        };
        for (_, node) in graph.iter() {
            match node.kind {
                NodeKind::Protein { .. } => summary.proteins += 1,
                NodeKind::Psm { .. } => summary.psms += 1,
                _ => {}
            }
        }
        info!(
            "run `{}`: {} proteins, {} PSMs in {} connected components",
            summary.run, summary.proteins, summary.psms, summary.components
        );

        let grid = GridSearch::from_model(&params.model_parameters);
        let triple = match grid.is_trivial() {
            true => grid.triple([0, 0, 0]),
            false => {
                let evaluator = FdrEvaluator::from(&params.param_optimize);
                let group_level = params.annotate_group_probabilities;
                let proteins_only = QuerySet {
                    proteins: true,
                    groups: false,
                    psms: false,
                };
                let snapshot: &ProteinIdentification = run;
                let result = grid.search(|triple| {
                    let results = self.run_components(&graph, triple, proteins_only);
                    let posteriors = merged_posteriors(&results);
                    let mut scores = evaluation_scores(&graph, snapshot, &posteriors, group_level);
                    evaluator.evaluate(&mut scores)
                });
                summary.grid_evaluations = result.evaluations;
                summary.inference_runs = result.evaluations;
                summary.best_score = Some(result.best_score);
                grid.triple(result.best)
            }
        };
        info!("running final inference with {}", triple);

        let queries = QuerySet {
            proteins: true,
            groups: params.annotate_group_probabilities,
            psms: params.update_psm_probabilities,
        };
        let results = self.run_components(&graph, triple, queries);
        summary.inference_runs += 1;
        summary.parameters = Some(triple);

        for (component, result) in graph.connected_components().iter().zip(&results) {
            match result {
                None => summary.skipped_components += 1,
                Some(Ok(outcome)) => {
                    summary.messages += outcome.messages;
                    if !outcome.converged {
                        warn!(
                            "component {} did not converge within the message budget",
                            component.index
                        );
                    }
                }
                Some(Err(e)) => {
                    summary.failed_components += 1;
                    warn!(
                        "inference failed on component {} ({} nodes): {}; keeping reset scores",
                        component.index,
                        component.nodes.len(),
                        e
                    );
                }
            }
        }
        for (node, posterior) in merged_posteriors(&results) {
            graph.node_mut(node).posterior = Some(posterior);
        }

        // write back
        for (_, node) in graph.iter() {
            match node.kind {
                NodeKind::Protein { protein, .. } => {
                    let hit = &mut run.hits[protein.0 as usize];
                    hit.score = match (node.posterior, params.user_defined_priors) {
                        (Some(p), _) => p,
                        (None, true) => hit.prior.unwrap_or(0.0).clamp(0.0, 1.0),
                        (None, false) => 0.0,
                    };
                }
                NodeKind::Psm { psm, .. } if params.update_psm_probabilities => {
                    if let Some(p) = node.posterior {
                        peptides[psm.spectrum as usize].hits[psm.hit as usize].score = p;
                    }
                }
                _ => {}
            }
        }

        let hits = &run.hits;
        run.indistinguishable_proteins = protein_groups(&graph)
            .into_iter()
            .map(|(group, members)| {
                let best_member = members
                    .iter()
                    .map(|(_, ix)| hits[ix.0 as usize].score)
                    .fold(0.0, f64::max);
                let probability = match params.annotate_group_probabilities {
                    true => group
                        .and_then(|g| graph.node(g).posterior)
                        .unwrap_or(best_member),
                    false => best_member,
                };
                IndistinguishableGroup {
                    accessions: members
                        .iter()
                        .map(|(_, ix)| hits[ix.0 as usize].accession.clone())
                        .sorted()
                        .collect(),
                    probability,
                }
            })
            .sorted_by(|a, b| {
                b.probability
                    .total_cmp(&a.probability)
                    .then_with(|| a.accessions.cmp(&b.accessions))
            })
            .collect();

        if params.greedy_group_resolution {
            greedy_group_resolution(run, peptides);
        }

        if params.keep_unreferenced_proteins {
            run.hits.extend(set_aside.into_iter().map(|mut hit| {
                hit.score = 0.0;
                hit
            }));
        }

        run.score_type = POSTERIOR_PROBABILITY.into();
        run.higher_score_better = true;
        run.search_engine = SEARCH_ENGINE.into();
        run.search_engine_version = env!("CARGO_PKG_VERSION").into();
        run.inference_parameters = Some(triple);

        info!(
            "inference on run `{}` finished in {}ms: {} messages, {} skipped and {} failed components",
            summary.run,
            start.elapsed().as_millis(),
            summary.messages,
            summary.skipped_components,
            summary.failed_components
        );
        Ok(summary)
    }
}
