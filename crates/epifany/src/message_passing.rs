//! Loopy belief propagation over an [`InferenceGraph`].
//!
//! Messages travel along factor-variable edges in both directions and are
//! distributions over the variable's full support. Every update is damped,
//! `new = (1 - λ)·fresh + λ·old`, and its residual is the largest absolute
//! change of any entry. A component has converged once no message would move
//! by more than the threshold.
//!
//! Three schedules are supported:
//! - priority (residual belief propagation): always commit the pending
//!   message with the largest residual, ties going to the lower message id
//! - FIFO: sweep over every message in a fixed order
//! - random subtree: each sweep draws a random spanning forest and passes
//!   messages from the leaves to the roots and back
//!
//! Large components get a cumulative message budget split into three passes
//! with increasing dampening and threshold, which forces termination on
//! graphs that oscillate.

use crate::factor::{InferenceGraph, PNorm, Potential, Table};
use crate::graph::NodeId;
use crate::params::SchedulingType;
use crate::InferenceError;
use fnv::FnvHashMap;
use log::trace;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

const RELAXATION_PASSES: u32 = 3;
const MAX_RELAXED_LAMBDA: f64 = 0.49;

/// Presence reported for a variable whose support does not contain the
/// absent state. Every variable built by [`crate::factor`] starts at 0, so
/// this only applies to empty distributions.
pub const ABSENT_STATE_FALLBACK: f64 = 1.0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub scheduling: SchedulingType,
    pub convergence_threshold: f64,
    pub dampening_lambda: f64,
    /// Message budget
    pub max_messages: u64,
    /// Seeds the random spanning forests of [`SchedulingType::Subtree`]
    pub seed: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Sent,
    Converged,
}

/// Presence probability per query node
pub type PosteriorResult = FnvHashMap<NodeId, f64>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentOutcome {
    pub posteriors: PosteriorResult,
    pub messages: u64,
    pub converged: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Pass {
    /// Cumulative message budget at the end of this pass
    budget: u64,
    lambda: f64,
    threshold: f64,
}

fn relaxation_passes(settings: &EngineSettings, edges: u64) -> Vec<Pass> {
    let squared = edges.saturating_mul(edges);
    if settings.max_messages < squared.saturating_mul(RELAXATION_PASSES as u64) {
        return vec![Pass {
            budget: settings.max_messages,
            lambda: settings.dampening_lambda,
            threshold: settings.convergence_threshold,
        }];
    }
    (0..RELAXATION_PASSES)
        .map(|k| {
            let scale = 10f64.powi(k as i32);
            Pass {
                budget: squared.saturating_mul(k as u64 + 1),
                lambda: (settings.dampening_lambda * scale)
                    .min(MAX_RELAXED_LAMBDA)
                    .max(settings.dampening_lambda),
                threshold: settings.convergence_threshold * scale,
            }
        })
        .collect()
}

/// Scale to unit sum; `None` if nothing is left to scale
fn normalize(mut message: Vec<f64>) -> Option<Vec<f64>> {
    let sum = message.iter().sum::<f64>();
    if !(sum > 0.0 && sum.is_finite()) {
        return None;
    }
    message.iter_mut().for_each(|x| *x /= sum);
    Some(message)
}

/// Message from a table factor to the variable in `slot`
fn table_message(table: &Table, slot: usize, incoming: &[&[f64]], norm: PNorm) -> Vec<f64> {
    let dims = &table.dims;
    let mut out = vec![0.0; dims[slot]];
    let mut index = vec![0usize; dims.len()];
    for &value in &table.values {
        let weight = incoming
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != slot)
            .fold(value, |acc, (j, message)| acc * message[index[j]]);
        out[index[slot]] = norm.combine(out[index[slot]], norm.lift(weight));

        for j in (0..dims.len()).rev() {
            index[j] += 1;
            if index[j] < dims[j] {
                break;
            }
            index[j] = 0;
        }
    }
    out.into_iter().map(|x| norm.lower(x)).collect()
}

/// Convolution of two distributions already lifted into the p-norm space
fn convolve(a: &[f64], b: &[f64], norm: PNorm) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] = norm.combine(out[i + j], x * y);
        }
    }
    out
}

/// Message from an adder factor (inputs first, sum last) to `slot`
fn adder_message(slot: usize, incoming: &[&[f64]], norm: PNorm) -> Vec<f64> {
    let output = incoming.len() - 1;
    let lifted = incoming
        .iter()
        .map(|m| m.iter().map(|&x| norm.lift(x)).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    // distribution of the sum of every input except `slot`
    let rest = (0..output)
        .filter(|&j| j != slot)
        .fold(vec![1.0], |acc, j| convolve(&acc, &lifted[j], norm));

    let out = match slot == output {
        true => rest,
        false => {
            let sum = &lifted[output];
            (0..incoming[slot].len())
                .map(|x| {
                    rest.iter()
                        .enumerate()
                        .filter_map(|(k, &r)| sum.get(x + k).map(|&s| r * s))
                        .fold(0.0, |acc, w| norm.combine(acc, w))
                })
                .collect()
        }
    };
    out.into_iter().map(|x| norm.lower(x)).collect()
}

#[derive(Copy, Clone, Debug)]
struct Edge {
    factor: usize,
    slot: usize,
    variable: usize,
}

#[inline]
fn to_factor(edge: usize) -> usize {
    2 * edge
}

#[inline]
fn to_variable(edge: usize) -> usize {
    2 * edge + 1
}

#[derive(Debug, PartialEq)]
struct Queued {
    residual: f64,
    message: usize,
    stamp: u32,
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.residual
            .total_cmp(&other.residual)
            .then_with(|| other.message.cmp(&self.message))
    }
}

/// Max-heap of candidate messages. Entries are invalidated lazily: each
/// message carries a stamp and only the most recent push is live.
struct ResidualQueue {
    heap: BinaryHeap<Queued>,
    stamps: Vec<u32>,
    pending: Vec<Option<Vec<f64>>>,
}

impl ResidualQueue {
    fn new(messages: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(messages),
            stamps: vec![0; messages],
            pending: vec![None; messages],
        }
    }

    fn push(&mut self, message: usize, value: Vec<f64>, residual: f64) {
        self.stamps[message] = self.stamps[message].wrapping_add(1);
        self.pending[message] = Some(value);
        self.heap.push(Queued {
            residual,
            message,
            stamp: self.stamps[message],
        });
    }

    fn invalidate(&mut self, message: usize) {
        self.stamps[message] = self.stamps[message].wrapping_add(1);
        self.pending[message] = None;
    }

    fn pop(&mut self) -> Option<(usize, Vec<f64>)> {
        while let Some(Queued { message, stamp, .. }) = self.heap.pop() {
            if stamp != self.stamps[message] {
                continue;
            }
            if let Some(value) = self.pending[message].take() {
                return Some((message, value));
            }
        }
        None
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        self.parent[a] = b;
        true
    }
}

struct MessagePasser<'g> {
    graph: &'g InferenceGraph,
    edges: Vec<Edge>,
    variable_edges: Vec<Vec<usize>>,
    factor_edges: Vec<Vec<usize>>,
    /// Indexed by [`to_factor`] / [`to_variable`]
    messages: Vec<Vec<f64>>,
    states: Vec<MessageState>,
    passed: u64,
}

impl<'g> MessagePasser<'g> {
    /// Wire up the edges and start every message uniform
    fn new(graph: &'g InferenceGraph) -> Result<Self, InferenceError> {
        let mut edges = Vec::with_capacity(graph.edge_count());
        let mut variable_edges = vec![Vec::new(); graph.variables.len()];
        let mut factor_edges = vec![Vec::new(); graph.factors.len()];

        for (f, factor) in graph.factors.iter().enumerate() {
            let cards = factor
                .variables
                .iter()
                .map(|&v| graph.variables[v].cardinality)
                .collect::<Vec<_>>();
            let consistent = match &factor.potential {
                Potential::Table(table) => table.dims == cards,
                Potential::Adder => match cards.split_last() {
                    Some((&sum, inputs)) => {
                        !inputs.is_empty() && sum == 1 + inputs.iter().map(|c| c - 1).sum::<usize>()
                    }
                    None => false,
                },
            };
            if !consistent {
                let node = factor
                    .variables
                    .last()
                    .map(|&v| graph.variables[v].node)
                    .unwrap_or_default();
                return Err(InferenceError::DomainMismatch(node));
            }

            for (slot, &variable) in factor.variables.iter().enumerate() {
                let edge = edges.len();
                edges.push(Edge {
                    factor: f,
                    slot,
                    variable,
                });
                variable_edges[variable].push(edge);
                factor_edges[f].push(edge);
            }
        }

        let messages = edges
            .iter()
            .flat_map(|edge| {
                let card = graph.variables[edge.variable].cardinality;
                let uniform = vec![1.0 / card as f64; card];
                [uniform.clone(), uniform]
            })
            .collect::<Vec<_>>();

        Ok(Self {
            graph,
            states: vec![MessageState::Pending; messages.len()],
            edges,
            variable_edges,
            factor_edges,
            messages,
            passed: 0,
        })
    }

    fn fresh(&self, message: usize) -> Result<Vec<f64>, InferenceError> {
        let edge = message / 2;
        let Edge {
            factor,
            slot,
            variable,
        } = self.edges[edge];

        let raw = if message == to_factor(edge) {
            let mut out = vec![1.0; self.graph.variables[variable].cardinality];
            for &other in self.variable_edges[variable].iter().filter(|&&e| e != edge) {
                for (o, m) in out.iter_mut().zip(&self.messages[to_variable(other)]) {
                    *o *= m;
                }
            }
            out
        } else {
            let incoming = self.factor_edges[factor]
                .iter()
                .map(|&e| self.messages[to_factor(e)].as_slice())
                .collect::<Vec<_>>();
            match &self.graph.factors[factor].potential {
                Potential::Table(table) => {
                    table_message(table, slot, &incoming, self.graph.p_norm)
                }
                Potential::Adder => adder_message(slot, &incoming, self.graph.p_norm),
            }
        };
        normalize(raw)
            .ok_or_else(|| InferenceError::DegenerateMessage(self.graph.variables[variable].node))
    }

    /// Damped update for `message` and its residual against the current value
    fn candidate(&self, message: usize, lambda: f64) -> Result<(Vec<f64>, f64), InferenceError> {
        let fresh = self.fresh(message)?;
        let old = &self.messages[message];
        let damped = fresh
            .iter()
            .zip(old)
            .map(|(f, o)| (1.0 - lambda) * f + lambda * o)
            .collect();
        let node = self.graph.variables[self.edges[message / 2].variable].node;
        let damped = normalize(damped).ok_or(InferenceError::DegenerateMessage(node))?;
        let residual = damped
            .iter()
            .zip(old)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        Ok((damped, residual))
    }

    fn commit(&mut self, message: usize, value: Vec<f64>) {
        self.messages[message] = value;
        self.states[message] = MessageState::Sent;
        self.passed += 1;
    }

    /// Messages whose fresh value reads `message`
    fn dependents(&self, message: usize) -> Vec<usize> {
        let edge = message / 2;
        let Edge {
            factor, variable, ..
        } = self.edges[edge];
        if message == to_variable(edge) {
            self.variable_edges[variable]
                .iter()
                .filter(|&&e| e != edge)
                .map(|&e| to_factor(e))
                .collect()
        } else {
            self.factor_edges[factor]
                .iter()
                .filter(|&&e| e != edge)
                .map(|&e| to_variable(e))
                .collect()
        }
    }

    fn reschedule(
        &mut self,
        queue: &mut ResidualQueue,
        message: usize,
        pass: &Pass,
    ) -> Result<(), InferenceError> {
        let (value, residual) = self.candidate(message, pass.lambda)?;
        if residual < pass.threshold {
            queue.invalidate(message);
            self.states[message] = MessageState::Converged;
        } else {
            queue.push(message, value, residual);
            self.states[message] = MessageState::Pending;
        }
        Ok(())
    }

    fn run_priority(&mut self, pass: &Pass) -> Result<bool, InferenceError> {
        let mut queue = ResidualQueue::new(self.messages.len());
        for message in 0..self.messages.len() {
            self.reschedule(&mut queue, message, pass)?;
        }
        while let Some((message, value)) = queue.pop() {
            if self.passed >= pass.budget {
                return Ok(false);
            }
            self.commit(message, value);
            self.reschedule(&mut queue, message, pass)?;
            for dependent in self.dependents(message) {
                self.reschedule(&mut queue, dependent, pass)?;
            }
        }
        Ok(true)
    }

    fn run_fifo(&mut self, pass: &Pass) -> Result<bool, InferenceError> {
        if self.messages.is_empty() {
            return Ok(true);
        }
        loop {
            let mut max_residual: f64 = 0.0;
            for message in 0..self.messages.len() {
                if self.passed >= pass.budget {
                    return Ok(false);
                }
                let (value, residual) = self.candidate(message, pass.lambda)?;
                max_residual = max_residual.max(residual);
                self.commit(message, value);
                if residual < pass.threshold {
                    self.states[message] = MessageState::Converged;
                }
            }
            if max_residual < pass.threshold {
                return Ok(true);
            }
        }
    }

    /// Upward then downward message order over a random spanning forest of
    /// the factor graph. Variables are vertices `0..V`, factors `V..V+F`.
    fn random_forest_schedule(&self, rng: &mut StdRng) -> Vec<usize> {
        let offset = self.graph.variables.len();
        let vertices = offset + self.graph.factors.len();

        let mut order = (0..self.edges.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        let mut sets = DisjointSet::new(vertices);
        let mut tree = vec![Vec::new(); vertices];
        for edge in order {
            let Edge {
                factor, variable, ..
            } = self.edges[edge];
            if sets.union(variable, offset + factor) {
                tree[variable].push((offset + factor, edge));
                tree[offset + factor].push((variable, edge));
            }
        }

        let mut roots = (0..vertices).collect::<Vec<_>>();
        roots.shuffle(rng);
        let mut seen = vec![false; vertices];
        let mut links = Vec::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if seen[root] {
                continue;
            }
            seen[root] = true;
            queue.push_back(root);
            while let Some(vertex) = queue.pop_front() {
                for &(next, edge) in &tree[vertex] {
                    if !seen[next] {
                        seen[next] = true;
                        links.push((vertex, next, edge));
                        queue.push_back(next);
                    }
                }
            }
        }

        // message leaving `from` along `edge`
        let outgoing = |from: usize, edge: usize| match from < offset {
            true => to_factor(edge),
            false => to_variable(edge),
        };
        links
            .iter()
            .rev()
            .map(|&(_, child, edge)| outgoing(child, edge))
            .chain(links.iter().map(|&(parent, _, edge)| outgoing(parent, edge)))
            .collect()
    }

    fn run_random_subtree(
        &mut self,
        pass: &Pass,
        rng: &mut StdRng,
    ) -> Result<bool, InferenceError> {
        if self.messages.is_empty() {
            return Ok(true);
        }
        loop {
            for message in self.random_forest_schedule(rng) {
                if self.passed >= pass.budget {
                    return Ok(false);
                }
                let (value, _) = self.candidate(message, pass.lambda)?;
                self.commit(message, value);
            }

            let mut max_residual: f64 = 0.0;
            for message in 0..self.messages.len() {
                let (_, residual) = self.candidate(message, pass.lambda)?;
                if residual < pass.threshold {
                    self.states[message] = MessageState::Converged;
                }
                max_residual = max_residual.max(residual);
            }
            if max_residual < pass.threshold {
                return Ok(true);
            }
        }
    }

    fn marginal(&self, variable: usize) -> Result<Vec<f64>, InferenceError> {
        let mut out = vec![1.0; self.graph.variables[variable].cardinality];
        for &edge in &self.variable_edges[variable] {
            for (o, m) in out.iter_mut().zip(&self.messages[to_variable(edge)]) {
                *o *= m;
            }
        }
        normalize(out).ok_or(InferenceError::DegenerateMessage(
            self.graph.variables[variable].node,
        ))
    }
}

/// Probability that a variable is not in its absent state (state 0)
pub fn presence(distribution: &[f64]) -> f64 {
    match distribution.first() {
        Some(absent) => (1.0 - absent).clamp(0.0, 1.0),
        None => ABSENT_STATE_FALLBACK,
    }
}

/// Run belief propagation on one component and report the presence
/// probability of every query node that has a variable in `graph`
pub fn infer(
    graph: &InferenceGraph,
    settings: &EngineSettings,
    queries: &[NodeId],
) -> Result<ComponentOutcome, InferenceError> {
    let mut passer = MessagePasser::new(graph)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);

    let mut converged = false;
    for pass in relaxation_passes(settings, passer.edges.len() as u64) {
        converged = match settings.scheduling {
            SchedulingType::Priority => passer.run_priority(&pass)?,
            SchedulingType::Fifo => passer.run_fifo(&pass)?,
            SchedulingType::Subtree => passer.run_random_subtree(&pass, &mut rng)?,
        };
        if converged {
            break;
        }
    }

    let unconverged = passer
        .states
        .iter()
        .filter(|&&s| s != MessageState::Converged)
        .count();
    trace!(
        "{} variables, {} factors: {} messages passed, {} not converged",
        graph.variables.len(),
        graph.factors.len(),
        passer.passed,
        unconverged
    );

    let posteriors = queries
        .iter()
        .filter_map(|&node| graph.variable(node).map(|v| (node, v)))
        .map(|(node, v)| passer.marginal(v).map(|m| (node, presence(&m))))
        .collect::<Result<PosteriorResult, _>>()?;

    Ok(ComponentOutcome {
        posteriors,
        messages: passer.passed,
        converged,
    })
}
