//! # Identification graph
//!
//! A layered, undirected graph linking proteins to the peptide-spectrum
//! matches (PSMs) that support them. Nodes live in an arena and are addressed
//! by [`NodeId`]; nodes that stand for external objects (protein hits, PSMs)
//! hold integer handles into the [`ProteinIdentification`] and
//! [`PeptideIdentification`] collections the graph was built from.
//!
//! Layers, from bottom to top:
//!
//! | layer | node             |
//! |-------|------------------|
//! | 0     | `Protein`        |
//! | 1     | `ProteinGroup`   |
//! | 2     | `PeptideGroup`   |
//! | 3     | `Peptide`        |
//! | 4     | `RunIndex`       |
//! | 5     | `Charge`         |
//! | 6     | `Psm`            |
//!
//! Layers 3 to 5 only exist in the extended model, where PSMs of the same
//! sequence are chained through peptide, run and charge nodes instead of
//! pointing straight at proteins.
//!
//! [`IdGraph::cluster_indistinguishable`] collapses proteins with identical
//! evidence into protein groups, and evidence nodes shared by the same set
//! of proteins into peptide groups. After clustering every PSM has at most
//! one lower neighbour, which is what the factor graph builder relies on.

use crate::id::{is_posterior_probability, PeptideIdentification, ProteinIdentification};
use crate::Error;
use fnv::FnvHashMap;
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u32);

/// Index into [`ProteinIdentification::hits`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProteinIx(pub u32);

/// Index of a peptide hit: spectrum (position in the peptide identification
/// list) and hit within that spectrum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PsmIx {
    pub spectrum: u32,
    pub hit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Protein { protein: ProteinIx, prior: Option<f64> },
    ProteinGroup,
    PeptideGroup,
    Peptide { sequence: String },
    RunIndex { run: usize },
    Charge { charge: i32 },
    Psm { psm: PsmIx, score: f64, evidence: usize },
}

impl NodeKind {
    pub fn layer(&self) -> u8 {
        match self {
            NodeKind::Protein { .. } => 0,
            NodeKind::ProteinGroup => 1,
            NodeKind::PeptideGroup => 2,
            NodeKind::Peptide { .. } => 3,
            NodeKind::RunIndex { .. } => 4,
            NodeKind::Charge { .. } => 5,
            NodeKind::Psm { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// Written back after the final inference run
    pub posterior: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub index: usize,
    /// Sorted node ids
    pub nodes: Vec<NodeId>,
}

impl Component {
    /// Edges (as `(low, high)` node pairs) with both endpoints in this component
    pub fn edges(&self, graph: &IdGraph) -> Vec<(NodeId, NodeId)> {
        self.nodes
            .iter()
            .flat_map(|&a| {
                graph
                    .neighbors(a)
                    .iter()
                    .filter(move |&&b| a < b)
                    .map(move |&b| (a, b))
            })
            .collect()
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct GraphOptions {
    /// Number of best hits per spectrum to include, 0 for all
    pub top_psms: usize,
    pub extended_model: bool,
    /// Carry each protein hit's `prior` onto its node
    pub user_defined_priors: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IdGraph {
    nodes: Vec<Node>,
    adjacency: Vec<Vec<NodeId>>,
    components: Vec<Component>,
}

impl IdGraph {
    /// Build the graph for one protein run from the PSMs sharing its
    /// identifier. Proteins are added lazily, so proteins without evidence
    /// get no node. Accessions missing from the run are skipped.
    pub fn build(
        run: &ProteinIdentification,
        peptides: &[PeptideIdentification],
        options: &GraphOptions,
    ) -> Result<Self, Error> {
        let start = Instant::now();
        let accessions = run
            .hits
            .iter()
            .enumerate()
            .map(|(ix, hit)| (hit.accession.as_str(), ProteinIx(ix as u32)))
            .collect::<FnvHashMap<_, _>>();

        let mut graph = IdGraph::default();
        let mut protein_nodes: FnvHashMap<ProteinIx, NodeId> = FnvHashMap::default();
        let mut unknown = 0;

        for (spectrum, id) in peptides
            .iter()
            .enumerate()
            .filter(|(_, id)| id.identifier == run.identifier)
        {
            if !is_posterior_probability(&id.score_type) {
                return Err(Error::MissingScoreType(format!(
                    "PSMs of run `{}` are scored as `{}`, convert them to posterior probabilities first",
                    run.identifier, id.score_type
                )));
            }

            let take = match options.top_psms {
                0 => id.hits.len(),
                n => n,
            };
            let best = (0..id.hits.len())
                .sorted_by(|&a, &b| id.hits[b].score.total_cmp(&id.hits[a].score))
                .take(take);

            for hit_ix in best {
                let hit = &id.hits[hit_ix];
                let proteins = hit
                    .accessions
                    .iter()
                    .filter_map(|acc| {
                        let ix = accessions.get(acc.as_str()).copied();
                        if ix.is_none() {
                            unknown += 1;
                        }
                        ix
                    })
                    .sorted()
                    .dedup()
                    .collect::<Vec<_>>();

                let psm = graph.add_node(NodeKind::Psm {
                    psm: PsmIx {
                        spectrum: spectrum as u32,
                        hit: hit_ix as u32,
                    },
                    score: hit.score,
                    evidence: proteins.len(),
                });

                for protein in proteins {
                    let node = *protein_nodes.entry(protein).or_insert_with(|| {
                        let prior = match options.user_defined_priors {
                            true => run.hits[protein.0 as usize].prior,
                            false => None,
                        };
                        graph.add_node(NodeKind::Protein { protein, prior })
                    });
                    graph.add_edge(node, psm);
                }
            }
        }

        if unknown > 0 {
            warn!(
                "{} peptide evidences reference proteins missing from run `{}`; skipped",
                unknown, run.identifier
            );
        }

        if options.extended_model {
            graph.insert_peptide_layers(peptides);
        }

        info!(
            "built graph for run `{}`: {} proteins, {} nodes, {} edges in {}ms",
            run.identifier,
            protein_nodes.len(),
            graph.nodes.len(),
            graph.edge_count(),
            start.elapsed().as_millis()
        );
        Ok(graph)
    }

    /// Route PSMs through per-sequence peptide nodes, then run index and
    /// charge nodes. The peptide node takes over the protein edges.
    fn insert_peptide_layers(&mut self, peptides: &[PeptideIdentification]) {
        let mut sequences: FnvHashMap<&str, NodeId> = FnvHashMap::default();
        let mut runs: FnvHashMap<(NodeId, usize), NodeId> = FnvHashMap::default();
        let mut charges: FnvHashMap<(NodeId, i32), NodeId> = FnvHashMap::default();

        let psms = self
            .iter()
            .filter_map(|(id, node)| match node.kind {
                NodeKind::Psm { psm, .. } => Some((id, psm)),
                _ => None,
            })
            .collect::<Vec<_>>();

        for (node, psm) in psms {
            let proteins = self.adjacency[node.0 as usize].clone();
            if proteins.is_empty() {
                continue;
            }
            let id = &peptides[psm.spectrum as usize];
            let hit = &id.hits[psm.hit as usize];

            let peptide = *sequences.entry(hit.sequence.as_str()).or_insert_with(|| {
                self.add_node(NodeKind::Peptide {
                    sequence: hit.sequence.clone(),
                })
            });
            for protein in proteins {
                self.remove_edge(protein, node);
                self.add_edge(protein, peptide);
            }

            let run_ix = id.map_index.unwrap_or(0);
            let run = match runs.get(&(peptide, run_ix)) {
                Some(&run) => run,
                None => {
                    let run = self.add_node(NodeKind::RunIndex { run: run_ix });
                    self.add_edge(peptide, run);
                    runs.insert((peptide, run_ix), run);
                    run
                }
            };
            let charge = match charges.get(&(run, hit.charge)) {
                Some(&charge) => charge,
                None => {
                    let charge = self.add_node(NodeKind::Charge { charge: hit.charge });
                    self.add_edge(run, charge);
                    charges.insert((run, hit.charge), charge);
                    charge
                }
            };
            self.add_edge(charge, node);
        }
        debug!(
            "extended model: {} peptides, {} run nodes, {} charge nodes",
            sequences.len(),
            runs.len(),
            charges.len()
        );
    }

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            posterior: None,
        });
        self.adjacency.push(Vec::new());
        id
    }

    pub fn add_edge(&mut self, a: NodeId, b: NodeId) {
        if a == b || self.adjacency[a.0 as usize].contains(&b) {
            return;
        }
        self.adjacency[a.0 as usize].push(b);
        self.adjacency[b.0 as usize].push(a);
    }

    fn remove_edge(&mut self, a: NodeId, b: NodeId) {
        self.adjacency[a.0 as usize].retain(|&n| n != b);
        self.adjacency[b.0 as usize].retain(|&n| n != a);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(ix, node)| (NodeId(ix as u32), node))
    }

    pub fn neighbors(&self, id: NodeId) -> &[NodeId] {
        &self.adjacency[id.0 as usize]
    }

    /// Neighbours split into `(lower, higher)` layers, each sorted by id
    pub fn neighbors_by_layer(&self, id: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
        let layer = self.node(id).kind.layer();
        let (mut lower, mut higher): (Vec<_>, Vec<_>) = self
            .neighbors(id)
            .iter()
            .copied()
            .partition(|&n| self.node(n).kind.layer() < layer);
        lower.sort_unstable();
        higher.sort_unstable();
        (lower, higher)
    }

    /// Breadth-first decomposition. Components are ordered by their smallest
    /// node id, and singleton nodes form their own component.
    pub fn compute_connected_components(&mut self) {
        let mut seen = vec![false; self.nodes.len()];
        let mut components = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..self.nodes.len() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            queue.push_back(NodeId(start as u32));
            let mut nodes = Vec::new();
            while let Some(node) = queue.pop_front() {
                nodes.push(node);
                for &n in self.neighbors(node) {
                    if !seen[n.0 as usize] {
                        seen[n.0 as usize] = true;
                        queue.push_back(n);
                    }
                }
            }
            nodes.sort_unstable();
            components.push(Component {
                index: components.len(),
                nodes,
            });
        }
        self.components = components;
    }

    pub fn connected_components(&self) -> &[Component] {
        &self.components
    }

    /// Collapse proteins with identical evidence into protein groups, then
    /// evidence nodes attached to more than one protein (or protein group)
    /// into peptide groups keyed by that parent set. Calling this again on
    /// an unchanged graph is a no-op.
    pub fn cluster_indistinguishable(&mut self) {
        let start = Instant::now();

        let mut by_children: FnvHashMap<Vec<NodeId>, Vec<NodeId>> = FnvHashMap::default();
        for (id, node) in self.iter() {
            if !matches!(node.kind, NodeKind::Protein { .. }) {
                continue;
            }
            let (_, higher) = self.neighbors_by_layer(id);
            if higher
                .iter()
                .any(|&n| matches!(self.node(n).kind, NodeKind::ProteinGroup))
            {
                continue;
            }
            if !higher.is_empty() {
                by_children.entry(higher).or_default().push(id);
            }
        }

        let mut protein_groups = 0;
        for (children, members) in by_children
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .sorted()
        {
            let group = self.add_node(NodeKind::ProteinGroup);
            for &member in &members {
                for &child in &children {
                    self.remove_edge(member, child);
                }
                self.add_edge(member, group);
            }
            for &child in &children {
                self.add_edge(group, child);
            }
            protein_groups += 1;
        }

        let mut by_parents: FnvHashMap<Vec<NodeId>, Vec<NodeId>> = FnvHashMap::default();
        for (id, node) in self.iter() {
            if node.kind.layer() < 3 {
                continue;
            }
            let (lower, _) = self.neighbors_by_layer(id);
            let parents = lower
                .into_iter()
                .filter(|&n| self.node(n).kind.layer() <= 1)
                .collect::<Vec<_>>();
            if parents.len() > 1 {
                by_parents.entry(parents).or_default().push(id);
            }
        }

        let mut peptide_groups = 0;
        for (parents, members) in by_parents.into_iter().sorted() {
            let group = self.add_node(NodeKind::PeptideGroup);
            for &parent in &parents {
                for &member in &members {
                    self.remove_edge(parent, member);
                }
                self.add_edge(parent, group);
            }
            for &member in &members {
                self.add_edge(group, member);
            }
            peptide_groups += 1;
        }

        if !self.components.is_empty() {
            self.compute_connected_components();
        }

        info!(
            "clustered {} protein groups and {} peptide groups in {}ms",
            protein_groups,
            peptide_groups,
            start.elapsed().as_millis()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::id::{PeptideHit, ProteinHit, POSTERIOR_PROBABILITY};
    use fnv::FnvHashSet;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn run(accessions: &[&str]) -> ProteinIdentification {
        ProteinIdentification {
            identifier: "run".into(),
            hits: accessions
                .iter()
                .map(|acc| ProteinHit {
                    accession: acc.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn spectrum(sequence: &str, score: f64, accessions: &[&str]) -> PeptideIdentification {
        PeptideIdentification {
            identifier: "run".into(),
            score_type: POSTERIOR_PROBABILITY.into(),
            higher_score_better: true,
            map_index: None,
            hits: vec![PeptideHit {
                sequence: sequence.into(),
                charge: 2,
                score,
                accessions: accessions.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }

    fn count(graph: &IdGraph, f: impl Fn(&NodeKind) -> bool) -> usize {
        graph.iter().filter(|(_, node)| f(&node.kind)).count()
    }

    fn edge_set(graph: &IdGraph) -> FnvHashSet<(NodeId, NodeId)> {
        graph
            .iter()
            .flat_map(|(a, _)| {
                graph
                    .neighbors(a)
                    .iter()
                    .filter(move |&&b| a < b)
                    .map(move |&b| (a, b))
            })
            .collect()
    }

    #[test]
    fn build_skips_unknown_accessions() -> Result<(), Error> {
        let run = run(&["A", "B", "C"]);
        let peptides = vec![
            spectrum("PEPTIDE", 0.9, &["A", "B", "UNKNOWN"]),
            spectrum("PEPTIDER", 0.8, &["B"]),
        ];
        let graph = IdGraph::build(&run, &peptides, &GraphOptions::default())?;
        assert_eq!(count(&graph, |k| matches!(k, NodeKind::Protein { .. })), 2);
        assert_eq!(count(&graph, |k| matches!(k, NodeKind::Psm { .. })), 2);
        assert_eq!(graph.edge_count(), 3);
        Ok(())
    }

    #[test]
    fn build_requires_posterior_probabilities() {
        let run = run(&["A"]);
        let mut peptides = vec![spectrum("PEPTIDE", 0.9, &["A"])];
        peptides[0].score_type = "Posterior Error Probability".into();
        assert!(matches!(
            IdGraph::build(&run, &peptides, &GraphOptions::default()),
            Err(Error::MissingScoreType(_))
        ));
    }

    #[test]
    fn top_psms_per_spectrum() -> Result<(), Error> {
        let run = run(&["A", "B"]);
        let mut peptides = vec![spectrum("PEPTIDE", 0.2, &["A"])];
        peptides[0].hits.push(PeptideHit {
            sequence: "PEPTIDER".into(),
            charge: 2,
            score: 0.7,
            accessions: vec!["B".into()],
        });
        let options = GraphOptions {
            top_psms: 1,
            ..Default::default()
        };
        let graph = IdGraph::build(&run, &peptides, &options)?;
        let hits = graph
            .iter()
            .filter_map(|(_, node)| match node.kind {
                NodeKind::Psm { psm, .. } => Some(psm.hit),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(hits, vec![1]);
        Ok(())
    }

    #[test]
    fn clustering() -> Result<(), Error> {
        // A and B share all evidence, C shares one PSM with them
        let run = run(&["A", "B", "C"]);
        let peptides = vec![
            spectrum("PEPTIDE", 0.9, &["A", "B"]),
            spectrum("PEPTIDER", 0.8, &["A", "B", "C"]),
            spectrum("PEPTIDEK", 0.7, &["C"]),
        ];
        let mut graph = IdGraph::build(&run, &peptides, &GraphOptions::default())?;
        graph.compute_connected_components();
        assert_eq!(graph.connected_components().len(), 1);

        graph.cluster_indistinguishable();
        assert_eq!(count(&graph, |k| *k == NodeKind::ProteinGroup), 1);
        assert_eq!(count(&graph, |k| *k == NodeKind::PeptideGroup), 1);

        for (id, node) in graph.iter() {
            if let NodeKind::Psm { .. } = node.kind {
                let (lower, higher) = graph.neighbors_by_layer(id);
                assert_eq!(lower.len(), 1);
                assert!(higher.is_empty());
            }
        }
        assert_eq!(graph.connected_components().len(), 1);
        assert_eq!(graph.connected_components()[0].nodes.len(), graph.len());
        Ok(())
    }

    #[test]
    fn extended_model_layers() -> Result<(), Error> {
        let run = run(&["A", "B"]);
        let mut peptides = vec![
            spectrum("PEPTIDE", 0.9, &["A", "B"]),
            spectrum("PEPTIDE", 0.8, &["A", "B"]),
            spectrum("PEPTIDE", 0.7, &["A", "B"]),
        ];
        peptides[1].hits[0].charge = 3;
        peptides[2].map_index = Some(1);
        let options = GraphOptions {
            extended_model: true,
            ..Default::default()
        };
        let mut graph = IdGraph::build(&run, &peptides, &options)?;
        assert_eq!(count(&graph, |k| matches!(k, NodeKind::Peptide { .. })), 1);
        assert_eq!(count(&graph, |k| matches!(k, NodeKind::RunIndex { .. })), 2);
        assert_eq!(count(&graph, |k| matches!(k, NodeKind::Charge { .. })), 3);

        graph.cluster_indistinguishable();
        assert_eq!(count(&graph, |k| *k == NodeKind::ProteinGroup), 1);
        // the peptide node now hangs off the protein group alone
        assert_eq!(count(&graph, |k| *k == NodeKind::PeptideGroup), 0);
        for (id, node) in graph.iter() {
            if node.kind.layer() >= 3 {
                assert_eq!(graph.neighbors_by_layer(id).0.len(), 1);
            }
        }
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct Evidence(Vec<Vec<u8>>);

    impl Arbitrary for Evidence {
        fn arbitrary(g: &mut Gen) -> Self {
            let spectra = usize::arbitrary(g) % 24;
            Evidence(
                (0..spectra)
                    .map(|_| {
                        let n = 1 + usize::arbitrary(g) % 3;
                        (0..n).map(|_| u8::arbitrary(g) % 8).collect()
                    })
                    .collect(),
            )
        }
    }

    impl Evidence {
        fn graph(&self) -> IdGraph {
            let names = (0..8).map(|i| format!("P{}", i)).collect::<Vec<_>>();
            let run = run(&names.iter().map(String::as_str).collect::<Vec<_>>());
            let peptides = self
                .0
                .iter()
                .enumerate()
                .map(|(ix, proteins)| {
                    let accessions = proteins
                        .iter()
                        .map(|p| names[*p as usize].as_str())
                        .collect::<Vec<_>>();
                    spectrum(&format!("PEPTIDE{}", ix), 0.5, &accessions)
                })
                .collect::<Vec<_>>();
            match IdGraph::build(&run, &peptides, &GraphOptions::default()) {
                Ok(graph) => graph,
                Err(e) => panic!("{}", e),
            }
        }
    }

    #[quickcheck]
    fn components_partition_edges(evidence: Evidence) -> bool {
        let mut graph = evidence.graph();
        graph.cluster_indistinguishable();
        graph.compute_connected_components();

        let mut owner = vec![usize::MAX; graph.len()];
        for component in graph.connected_components() {
            for node in &component.nodes {
                if owner[node.0 as usize] != usize::MAX {
                    return false;
                }
                owner[node.0 as usize] = component.index;
            }
        }
        if owner.iter().any(|&o| o == usize::MAX) {
            return false;
        }

        let mut seen = 0;
        for component in graph.connected_components() {
            for (a, b) in component.edges(&graph) {
                if owner[a.0 as usize] != component.index || owner[b.0 as usize] != component.index
                {
                    return false;
                }
                seen += 1;
            }
        }
        seen == graph.edge_count()
    }

    #[quickcheck]
    fn clustering_is_idempotent(evidence: Evidence) -> bool {
        let mut graph = evidence.graph();
        graph.compute_connected_components();
        graph.cluster_indistinguishable();
        let nodes = graph.len();
        let edges = edge_set(&graph);
        let components = graph.connected_components().to_vec();

        graph.cluster_indistinguishable();
        graph.len() == nodes
            && edge_set(&graph) == edges
            && graph.connected_components() == components.as_slice()
    }

    #[quickcheck]
    fn edges_connect_distinct_layers(evidence: Evidence) -> bool {
        let mut graph = evidence.graph();
        graph.cluster_indistinguishable();
        edge_set(&graph)
            .into_iter()
            .all(|(a, b)| graph.node(a).kind.layer() != graph.node(b).kind.layer())
    }
}
