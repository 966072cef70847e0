use super::input::{Identifications, Settings};
use anyhow::Context;
use epifany_core::inference::{BayesianProteinInference, InferenceSummary};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

pub struct Runner {
    pub engine: BayesianProteinInference,
    pub parameters: Settings,
    start: Instant,
}

/// Everything written to `results.epifany.json`
#[derive(Serialize)]
pub struct EpifanyResults<'a> {
    pub settings: &'a Settings,
    pub summaries: &'a [InferenceSummary],
    pub identifications: &'a Identifications,
}

impl Runner {
    pub fn new(parameters: Settings) -> anyhow::Result<Self> {
        let engine = BayesianProteinInference::new(parameters.parameters.clone())?;
        Ok(Self {
            engine,
            parameters,
            start: Instant::now(),
        })
    }

    pub fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.parameters.output_directory.join(file_name.as_ref())
    }

    /// Run inference on every protein run of `ids` in place
    pub fn infer(&self, ids: &mut Identifications) -> anyhow::Result<Vec<InferenceSummary>> {
        let summaries = match ids {
            Identifications::Runs {
                protein_ids,
                peptide_ids,
            } => self.engine.infer_all_runs(protein_ids, peptide_ids)?,
            Identifications::Consensus(map) => self.engine.infer_consensus(map)?,
        };

        for summary in &summaries {
            info!(
                "run `{}`: {} proteins from {} PSMs, {} components ({} failed)",
                summary.run,
                summary.proteins,
                summary.psms,
                summary.components,
                summary.failed_components
            );
            if let Some(triple) = summary.parameters {
                info!("- parameters: {}", triple);
            }
        }
        Ok(summaries)
    }

    pub fn run(mut self) -> anyhow::Result<Vec<InferenceSummary>> {
        let path = &self.parameters.input_path;
        let mut ids = Identifications::load(path)
            .with_context(|| format!("Failed to read identifications from `{path}`"))?;
        info!(
            "read {} protein runs from `{}` in {}ms",
            ids.protein_ids().len(),
            path,
            self.start.elapsed().as_millis()
        );

        let summaries = self.infer(&mut ids)?;

        let proteins = self.write_proteins(ids.protein_ids())?;
        self.parameters.output_paths.push(proteins);

        let results = self.make_path("results.epifany.json");
        self.parameters
            .output_paths
            .push(results.display().to_string());
        let bytes = serde_json::to_vec_pretty(&EpifanyResults {
            settings: &self.parameters,
            summaries: &summaries,
            identifications: &ids,
        })?;
        std::fs::write(&results, bytes)
            .with_context(|| format!("Failed to write `{}`", results.display()))?;

        println!("{}", serde_json::to_string_pretty(&self.parameters)?);

        let run_time = (Instant::now() - self.start).as_secs_f32();
        info!("finished in {}s", run_time);
        info!("cite: \"Epifany: A Method for Efficient High-Confidence Protein Inference\" https://doi.org/10.1021/acs.jproteome.9b00566");
        Ok(summaries)
    }
}
