//! Inference parameters.
//!
//! Options are deserialized into all-optional builders ([`Builder`] and its
//! nested `*Options` structs), then resolved against defaults and validated
//! by [`Builder::make_parameters`]. Negative `prot_prior`, `pep_emission`
//! or `pep_spurious_emission` request a grid search over that parameter.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One point of the (α, β, γ) model parameter space
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterTriple {
    /// Peptide emission probability
    pub alpha: f64,
    /// Spurious peptide emission probability
    pub beta: f64,
    /// Protein prior
    pub gamma: f64,
}

impl std::fmt::Display for ParameterTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "alpha={}, beta={}, gamma={}",
            self.alpha, self.beta, self.gamma
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingType {
    /// Residual belief propagation: always send the message that changes most
    Priority,
    /// Round-robin sweeps over all messages
    Fifo,
    /// Two-pass sweeps over a random spanning forest
    Subtree,
}

impl FromStr for SchedulingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" => Ok(Self::Priority),
            "fifo" => Ok(Self::Fifo),
            "subtree" => Ok(Self::Subtree),
            _ => Err(Error::InvalidParameter(format!(
                "unknown scheduling type `{}`",
                s
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub prot_prior: f64,
    pub pep_emission: f64,
    pub pep_spurious_emission: f64,
    pub pep_prior: f64,
    pub regularize: bool,
    pub extended_model: bool,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            prot_prior: -1.0,
            pep_emission: -1.0,
            pep_spurious_emission: -1.0,
            pep_prior: 0.1,
            regularize: false,
            extended_model: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopyParameters {
    pub scheduling_type: SchedulingType,
    pub convergence_threshold: f64,
    pub dampening_lambda: f64,
    pub max_nr_iterations: u64,
    pub p_norm_inference: f64,
    pub seed: u64,
}

impl Default for LoopyParameters {
    fn default() -> Self {
        Self {
            scheduling_type: SchedulingType::Priority,
            convergence_threshold: 1e-5,
            dampening_lambda: 1e-3,
            max_nr_iterations: (1 << 31) - 1,
            p_norm_inference: 1.0,
            seed: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizeParameters {
    pub aucweight: f64,
    pub conservative_fdr: bool,
    pub regularized_fdr: bool,
}

impl Default for OptimizeParameters {
    fn default() -> Self {
        Self {
            aucweight: 0.3,
            conservative_fdr: true,
            regularized_fdr: true,
        }
    }
}

/// Resolved, validated inference parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub psm_probability_cutoff: f64,
    #[serde(rename = "top_PSMs")]
    pub top_psms: usize,
    #[serde(rename = "keep_best_PSM_only")]
    pub keep_best_psm_only: bool,
    #[serde(rename = "update_PSM_probabilities")]
    pub update_psm_probabilities: bool,
    pub user_defined_priors: bool,
    pub annotate_group_probabilities: bool,
    pub use_ids_outside_features: bool,
    pub greedy_group_resolution: bool,
    pub keep_unreferenced_proteins: bool,
    pub model_parameters: ModelParameters,
    pub loopy_belief_propagation: LoopyParameters,
    pub param_optimize: OptimizeParameters,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            psm_probability_cutoff: 0.001,
            top_psms: 1,
            keep_best_psm_only: true,
            update_psm_probabilities: true,
            user_defined_priors: false,
            annotate_group_probabilities: true,
            use_ids_outside_features: false,
            greedy_group_resolution: false,
            keep_unreferenced_proteins: true,
            model_parameters: ModelParameters::default(),
            loopy_belief_propagation: LoopyParameters::default(),
            param_optimize: OptimizeParameters::default(),
        }
    }
}

impl Parameters {
    /// Check every numeric option against its allowed range
    pub fn validate(&self) -> Result<(), Error> {
        fn check(ok: bool, name: &str, value: f64, range: &str) -> Result<(), Error> {
            match ok {
                true => Ok(()),
                false => Err(Error::InvalidParameter(format!(
                    "{} = {} is outside {}",
                    name, value, range
                ))),
            }
        }

        let cutoff = self.psm_probability_cutoff;
        check(
            (0.0..=1.0).contains(&cutoff),
            "psm_probability_cutoff",
            cutoff,
            "[0, 1]",
        )?;

        let model = &self.model_parameters;
        for (name, value) in [
            ("model_parameters:prot_prior", model.prot_prior),
            ("model_parameters:pep_emission", model.pep_emission),
            (
                "model_parameters:pep_spurious_emission",
                model.pep_spurious_emission,
            ),
        ] {
            check(
                value < 0.0 || value <= 1.0,
                name,
                value,
                "[0, 1] (or negative for a grid search)",
            )?;
        }
        check(
            model.pep_prior > 0.0 && model.pep_prior < 1.0,
            "model_parameters:pep_prior",
            model.pep_prior,
            "(0, 1)",
        )?;

        let loopy = &self.loopy_belief_propagation;
        check(
            loopy.convergence_threshold > 0.0,
            "loopy_belief_propagation:convergence_threshold",
            loopy.convergence_threshold,
            "(0, inf)",
        )?;
        check(
            (0.0..0.5).contains(&loopy.dampening_lambda),
            "loopy_belief_propagation:dampening_lambda",
            loopy.dampening_lambda,
            "[0, 0.5)",
        )?;
        check(
            loopy.max_nr_iterations > 0,
            "loopy_belief_propagation:max_nr_iterations",
            loopy.max_nr_iterations as f64,
            "[1, inf)",
        )?;
        check(
            loopy.p_norm_inference < 0.0 || loopy.p_norm_inference >= 1.0,
            "loopy_belief_propagation:p_norm_inference",
            loopy.p_norm_inference,
            "[1, inf) (or negative for max-product)",
        )?;

        let aucweight = self.param_optimize.aucweight;
        check(
            (0.0..=1.0).contains(&aucweight),
            "param_optimize:aucweight",
            aucweight,
            "[0, 1]",
        )?;
        Ok(())
    }

    /// The fixed (α, β, γ), if no parameter is left to a grid search
    pub fn fixed_triple(&self) -> Option<ParameterTriple> {
        let model = &self.model_parameters;
        let triple = ParameterTriple {
            alpha: model.pep_emission,
            beta: model.pep_spurious_emission,
            gamma: model.prot_prior,
        };
        match triple.alpha >= 0.0 && triple.beta >= 0.0 && triple.gamma >= 0.0 {
            true => Some(triple),
            false => None,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct ModelOptions {
    pub prot_prior: Option<f64>,
    pub pep_emission: Option<f64>,
    pub pep_spurious_emission: Option<f64>,
    pub pep_prior: Option<f64>,
    pub regularize: Option<bool>,
    pub extended_model: Option<bool>,
}

impl From<ModelOptions> for ModelParameters {
    fn from(value: ModelOptions) -> Self {
        let default = Self::default();
        Self {
            prot_prior: value.prot_prior.unwrap_or(default.prot_prior),
            pep_emission: value.pep_emission.unwrap_or(default.pep_emission),
            pep_spurious_emission: value
                .pep_spurious_emission
                .unwrap_or(default.pep_spurious_emission),
            pep_prior: value.pep_prior.unwrap_or(default.pep_prior),
            regularize: value.regularize.unwrap_or(default.regularize),
            extended_model: value.extended_model.unwrap_or(default.extended_model),
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct LoopyOptions {
    /// Parsed case-insensitively, see [`SchedulingType::from_str`]
    pub scheduling_type: Option<String>,
    pub convergence_threshold: Option<f64>,
    pub dampening_lambda: Option<f64>,
    pub max_nr_iterations: Option<u64>,
    pub p_norm_inference: Option<f64>,
    pub seed: Option<u64>,
}

impl TryFrom<LoopyOptions> for LoopyParameters {
    type Error = Error;

    fn try_from(value: LoopyOptions) -> Result<Self, Error> {
        let default = Self::default();
        let settings = Self {
            scheduling_type: match value.scheduling_type {
                Some(s) => s.parse()?,
                None => default.scheduling_type,
            },
            convergence_threshold: value
                .convergence_threshold
                .unwrap_or(default.convergence_threshold),
            dampening_lambda: value.dampening_lambda.unwrap_or(default.dampening_lambda),
            max_nr_iterations: value.max_nr_iterations.unwrap_or(default.max_nr_iterations),
            p_norm_inference: value.p_norm_inference.unwrap_or(default.p_norm_inference),
            seed: value.seed.unwrap_or(default.seed),
        };
        if settings.convergence_threshold > 0.1 {
            log::warn!("loopy_belief_propagation.convergence_threshold is higher than expected");
        }
        Ok(settings)
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct OptimizeOptions {
    pub aucweight: Option<f64>,
    pub conservative_fdr: Option<bool>,
    pub regularized_fdr: Option<bool>,
}

impl From<OptimizeOptions> for OptimizeParameters {
    fn from(value: OptimizeOptions) -> Self {
        let default = Self::default();
        Self {
            aucweight: value.aucweight.unwrap_or(default.aucweight),
            conservative_fdr: value.conservative_fdr.unwrap_or(default.conservative_fdr),
            regularized_fdr: value.regularized_fdr.unwrap_or(default.regularized_fdr),
        }
    }
}

/// User-facing options, deserialized from JSON. Every field is optional.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Builder {
    pub psm_probability_cutoff: Option<f64>,
    #[serde(rename = "top_PSMs")]
    pub top_psms: Option<usize>,
    #[serde(rename = "keep_best_PSM_only")]
    pub keep_best_psm_only: Option<bool>,
    #[serde(rename = "update_PSM_probabilities")]
    pub update_psm_probabilities: Option<bool>,
    pub user_defined_priors: Option<bool>,
    pub annotate_group_probabilities: Option<bool>,
    pub use_ids_outside_features: Option<bool>,
    pub greedy_group_resolution: Option<bool>,
    pub keep_unreferenced_proteins: Option<bool>,
    pub model_parameters: Option<ModelOptions>,
    pub loopy_belief_propagation: Option<LoopyOptions>,
    pub param_optimize: Option<OptimizeOptions>,
}

impl Builder {
    pub fn make_parameters(self) -> Result<Parameters, Error> {
        let default = Parameters::default();
        let parameters = Parameters {
            psm_probability_cutoff: self
                .psm_probability_cutoff
                .unwrap_or(default.psm_probability_cutoff),
            top_psms: self.top_psms.unwrap_or(default.top_psms),
            keep_best_psm_only: self.keep_best_psm_only.unwrap_or(default.keep_best_psm_only),
            update_psm_probabilities: self
                .update_psm_probabilities
                .unwrap_or(default.update_psm_probabilities),
            user_defined_priors: self
                .user_defined_priors
                .unwrap_or(default.user_defined_priors),
            annotate_group_probabilities: self
                .annotate_group_probabilities
                .unwrap_or(default.annotate_group_probabilities),
            use_ids_outside_features: self
                .use_ids_outside_features
                .unwrap_or(default.use_ids_outside_features),
            greedy_group_resolution: self
                .greedy_group_resolution
                .unwrap_or(default.greedy_group_resolution),
            keep_unreferenced_proteins: self
                .keep_unreferenced_proteins
                .unwrap_or(default.keep_unreferenced_proteins),
            model_parameters: self.model_parameters.unwrap_or_default().into(),
            loopy_belief_propagation: self
                .loopy_belief_propagation
                .unwrap_or_default()
                .try_into()?,
            param_optimize: self.param_optimize.unwrap_or_default().into(),
        };
        parameters.validate()?;
        Ok(parameters)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() -> Result<(), Error> {
        let parameters = Builder::default().make_parameters()?;
        assert_eq!(parameters, Parameters::default());
        assert_eq!(parameters.top_psms, 1);
        assert_eq!(parameters.loopy_belief_propagation.max_nr_iterations, 2147483647);
        assert_eq!(
            parameters.loopy_belief_propagation.scheduling_type,
            SchedulingType::Priority
        );
        assert_eq!(parameters.fixed_triple(), None);
        Ok(())
    }

    #[test]
    fn nested_options() -> Result<(), Error> {
        let json = r#"{
            "top_PSMs": 3,
            "keep_best_PSM_only": false,
            "model_parameters": { "prot_prior": 0.7, "pep_emission": 0.1, "pep_spurious_emission": 0.01 },
            "loopy_belief_propagation": { "scheduling_type": "subtree", "seed": 42 },
            "param_optimize": { "aucweight": 0.5 }
        }"#;
        let builder: Builder = serde_json::from_str(json)?;
        let parameters = builder.make_parameters()?;
        assert_eq!(parameters.top_psms, 3);
        assert!(!parameters.keep_best_psm_only);
        assert_eq!(
            parameters.fixed_triple(),
            Some(ParameterTriple {
                alpha: 0.1,
                beta: 0.01,
                gamma: 0.7
            })
        );
        assert_eq!(
            parameters.loopy_belief_propagation.scheduling_type,
            SchedulingType::Subtree
        );
        assert_eq!(parameters.loopy_belief_propagation.seed, 42);
        assert_eq!(parameters.loopy_belief_propagation.dampening_lambda, 1e-3);
        assert_eq!(parameters.param_optimize.aucweight, 0.5);
        assert!(parameters.param_optimize.conservative_fdr);
        Ok(())
    }

    #[test]
    fn invalid_parameters() {
        let mut builder = Builder::default();
        builder.psm_probability_cutoff = Some(1.5);
        assert!(matches!(
            builder.make_parameters(),
            Err(Error::InvalidParameter(_))
        ));

        let mut parameters = Parameters::default();
        parameters.loopy_belief_propagation.dampening_lambda = 0.5;
        assert!(parameters.validate().is_err());

        let mut parameters = Parameters::default();
        parameters.model_parameters.pep_prior = 0.0;
        assert!(parameters.validate().is_err());

        let mut parameters = Parameters::default();
        parameters.model_parameters.prot_prior = 1.2;
        assert!(parameters.validate().is_err());

        let mut parameters = Parameters::default();
        parameters.loopy_belief_propagation.p_norm_inference = 0.5;
        assert!(parameters.validate().is_err());
        parameters.loopy_belief_propagation.p_norm_inference = -1.0;
        assert!(parameters.validate().is_ok());
    }

    #[test]
    fn scheduling_from_str() {
        assert_eq!("FIFO".parse::<SchedulingType>().ok(), Some(SchedulingType::Fifo));
        assert_eq!(
            "priority".parse::<SchedulingType>().ok(),
            Some(SchedulingType::Priority)
        );
        assert!("random".parse::<SchedulingType>().is_err());
    }

    #[test]
    fn scheduling_from_json() -> Result<(), Error> {
        let builder: Builder = serde_json::from_str(
            r#"{ "loopy_belief_propagation": { "scheduling_type": "FIFO" } }"#,
        )?;
        assert_eq!(
            builder.make_parameters()?.loopy_belief_propagation.scheduling_type,
            SchedulingType::Fifo
        );

        let builder: Builder = serde_json::from_str(
            r#"{ "loopy_belief_propagation": { "scheduling_type": "random" } }"#,
        )?;
        assert!(matches!(
            builder.make_parameters(),
            Err(Error::InvalidParameter(_))
        ));
        Ok(())
    }

    #[test]
    fn triple_serialization() -> Result<(), Error> {
        let triple = ParameterTriple {
            alpha: 0.65,
            beta: 0.2,
            gamma: 0.5,
        };
        let json = serde_json::to_string(&triple)?;
        let back: ParameterTriple = serde_json::from_str(&json)?;
        assert_eq!(triple, back);
        Ok(())
    }
}
