use anyhow::{ensure, Context};
use clap::ArgMatches;
use epifany_core::id::{ConsensusMap, PeptideIdentification, ProteinIdentification};
use epifany_core::params::{Builder, Parameters};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize)]
/// Actual inference settings - may include overrides or default values not set by user
pub struct Settings {
    pub version: String,
    pub parameters: Parameters,
    pub input_path: String,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize)]
/// Input parameters deserialized from JSON file
pub struct Input {
    #[serde(flatten)]
    inference: Builder,
    input_path: Option<String>,
    output_directory: Option<String>,
}

/// Identifications read from the input file: either plain protein runs with
/// their PSMs, or a consensus map
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Identifications {
    Runs {
        protein_ids: Vec<ProteinIdentification>,
        peptide_ids: Vec<PeptideIdentification>,
    },
    Consensus(ConsensusMap),
}

impl Identifications {
    pub fn protein_ids(&self) -> &[ProteinIdentification] {
        match self {
            Identifications::Runs { protein_ids, .. } => protein_ids,
            Identifications::Consensus(map) => &map.protein_ids,
        }
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        epifany_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` is a required argument")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(input_path) = matches.get_one::<String>("input_path") {
            log::trace!("overriding `input_path` parameter.");
            input.input_path = Some(input_path.into());
        }
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }

        ensure!(
            input.input_path.is_some(),
            "`input_path` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        epifany_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Settings> {
        let parameters = self
            .inference
            .make_parameters()
            .context("Invalid inference parameters")?;

        if parameters.fixed_triple().is_none() {
            log::info!("model parameters not fully set, running a grid search");
        }
        if parameters.psm_probability_cutoff > 0.5 {
            log::warn!(
                "`psm_probability_cutoff` of {} discards most PSMs",
                parameters.psm_probability_cutoff
            );
        }

        let input_path = self
            .input_path
            .context("`input_path` must be provided!")?;

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path).with_context(|| {
                    format!("Failed to create output directory `{}`", path.display())
                })?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Settings {
            version: clap::crate_version!().into(),
            parameters,
            input_path,
            output_paths: Vec::new(),
            output_directory,
        })
    }
}
