pub mod factor;
pub mod fdr;
pub mod graph;
pub mod grid_search;
pub mod id;
pub mod inference;
pub mod message_passing;
pub mod params;

use graph::NodeId;
use std::path::Path;

/// Errors that abort an inference call
#[derive(Debug)]
pub enum Error {
    /// Required data (e.g. a supported PSM score type) is absent from the input
    MissingInformation(String),
    /// A peptide identification does not carry a posterior probability score
    MissingScoreType(String),
    InvalidParameter(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInformation(s) => write!(f, "missing information: {}", s),
            Self::MissingScoreType(s) => write!(f, "missing score type: {}", s),
            Self::InvalidParameter(s) => write!(f, "invalid parameter: {}", s),
            Self::Io(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Errors scoped to a single connected component. The orchestrator logs
/// these and leaves the component's posteriors untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// A sum node has no lower neighbours to add up
    EmptyEvidenceSet(NodeId),
    /// A PSM is attached to more than one parent after clustering
    AmbiguousParent(NodeId),
    /// A message summed to zero (or to a non-finite value)
    DegenerateMessage(NodeId),
    /// A factor and its variable disagree on the variable's support
    DomainMismatch(NodeId),
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyEvidenceSet(n) => write!(f, "node {} has no evidence to sum", n.0),
            Self::AmbiguousParent(n) => write!(f, "PSM node {} has more than one parent", n.0),
            Self::DegenerateMessage(n) => write!(f, "message to node {} vanished", n.0),
            Self::DomainMismatch(n) => write!(f, "support mismatch at node {}", n.0),
        }
    }
}

impl std::error::Error for InferenceError {}

pub fn read_json<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
