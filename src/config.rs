use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::MocoError;

/// Similarity metric handed to the registration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Metric {
    #[serde(rename = "MI")]
    MutualInformation,
    #[serde(rename = "MeanSquares")]
    MeanSquares,
    #[serde(rename = "CC")]
    CrossCorrelation,
}

impl FromStr for Metric {
    type Err = MocoError;

    fn from_str(s: &str) -> Result<Self, MocoError> {
        match s {
            "MI" => Ok(Metric::MutualInformation),
            "MeanSquares" => Ok(Metric::MeanSquares),
            "CC" => Ok(Metric::CrossCorrelation),
            other => Err(MocoError::InvalidParam {
                key: "metric".into(),
                value: other.into(),
                reason: "expected MI, MeanSquares or CC".into(),
            }),
        }
    }
}

/// Metric plus its radius parameter: number of histogram bins for mutual
/// information, neighbourhood radius for the other metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSpec {
    pub metric: Metric,
    pub radius: u32,
}

impl MetricSpec {
    /// Defaults used by slice-wise moco (MI with 16 bins).
    pub fn for_moco(metric: Metric) -> Self {
        let radius = match metric {
            Metric::MutualInformation => 16,
            _ => 4,
        };
        MetricSpec { metric, radius }
    }

    /// Defaults used by one-shot multimodal registration (MI with 32 bins).
    /// Kept distinct from [`MetricSpec::for_moco`]; the two call sites have
    /// always used different bin counts.
    pub fn for_single_registration(metric: Metric) -> Self {
        let radius = match metric {
            Metric::MutualInformation => 32,
            _ => 4,
        };
        MetricSpec { metric, radius }
    }
}

/// Interpolation used when resampling the registered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interp {
    #[serde(rename = "nn")]
    Nearest,
    Linear,
    Spline,
}

impl FromStr for Interp {
    type Err = MocoError;

    fn from_str(s: &str) -> Result<Self, MocoError> {
        match s {
            "nn" => Ok(Interp::Nearest),
            "linear" => Ok(Interp::Linear),
            "spline" => Ok(Interp::Spline),
            other => Err(MocoError::InvalidParam {
                key: "interp".into(),
                value: other.into(),
                reason: "expected nn, linear or spline".into(),
            }),
        }
    }
}

/// What the pipeline should do with each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Todo {
    Estimate,
    EstimateAndApply,
    Apply,
}

impl Todo {
    pub fn estimates(&self) -> bool {
        !matches!(self, Todo::Apply)
    }
}

impl FromStr for Todo {
    type Err = MocoError;

    fn from_str(s: &str) -> Result<Self, MocoError> {
        match s {
            "estimate" => Ok(Todo::Estimate),
            "estimate_and_apply" => Ok(Todo::EstimateAndApply),
            "apply" => Ok(Todo::Apply),
            other => Err(MocoError::InvalidParam {
                key: "todo".into(),
                value: other.into(),
                reason: "expected estimate, estimate_and_apply or apply".into(),
            }),
        }
    }
}

/// Typed moco configuration.
///
/// Constructed once, validated field by field, and passed by reference into
/// every component. Unknown keys are rejected at construction time, both in
/// `key=value` updates and in TOML input.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MocoParams {
    pub fname_data: PathBuf,
    pub fname_target: PathBuf,
    pub fname_mask: Option<PathBuf>,
    /// Output folder for per-job transform files.
    pub folder_mat: PathBuf,
    /// Folder receiving one transform per native timepoint after grouping.
    pub mat_final: PathBuf,
    /// Key prefix for intermediate volumes in the image store.
    pub path_tmp: PathBuf,
    pub todo: Todo,
    /// Number of native timepoints averaged per job before registration.
    pub group_size: usize,
    pub spline_fitting: bool,
    pub suffix: String,
    /// Degree of the polynomial regularization along the slice axis.
    pub poly: u32,
    /// Smoothing sigma in mm applied during registration.
    pub smooth: f64,
    #[serde(rename = "gradStep")]
    pub grad_step: f64,
    pub iter: u32,
    pub metric: Metric,
    /// Sampling fraction used for the registration metric.
    pub sampling: f64,
    pub interp: Interp,
    /// b-value threshold below which volumes count as no-motion references.
    /// Consumed by callers grouping diffusion volumes, not by the core.
    pub bval_min: f64,
    /// Iteratively average the target image for more robust moco.
    #[serde(rename = "iterAvg")]
    pub iter_avg: bool,
    /// Split along Z and register each 2D slice instead of the 3D volume.
    pub is_sagittal: bool,
    /// Write raw-vs-smoothed motion traces as CSV during spline fitting.
    pub plot_graph: bool,
    pub verbose: u32,
}

impl Default for MocoParams {
    fn default() -> Self {
        MocoParams {
            fname_data: PathBuf::new(),
            fname_target: PathBuf::new(),
            fname_mask: None,
            folder_mat: PathBuf::from("mat_moco"),
            mat_final: PathBuf::from("mat_final"),
            path_tmp: PathBuf::from("tmp_moco"),
            todo: Todo::EstimateAndApply,
            group_size: 1,
            spline_fitting: false,
            suffix: "_moco".to_string(),
            poly: 2,
            smooth: 2.0,
            grad_step: 1.0,
            iter: 10,
            metric: Metric::MutualInformation,
            sampling: 0.2,
            interp: Interp::Spline,
            bval_min: 100.0,
            iter_avg: true,
            is_sagittal: false,
            plot_graph: false,
            verbose: 1,
        }
    }
}

impl MocoParams {
    /// Parse a TOML document into a validated parameter set.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: MocoParams = toml::from_str(s)?;
        Ok(params)
    }

    /// Apply user-supplied `key=value` overrides. Unknown keys and
    /// unparseable values are rejected before any job runs.
    pub fn update(&mut self, pairs: &[&str]) -> Result<(), MocoError> {
        for pair in pairs {
            let (key, value) = pair.split_once('=').ok_or_else(|| MocoError::InvalidParam {
                key: (*pair).into(),
                value: String::new(),
                reason: "expected key=value".into(),
            })?;
            self.set(key, value)?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), MocoError> {
        let invalid = |reason: &str| MocoError::InvalidParam {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        };
        match key {
            "todo" => self.todo = value.parse()?,
            "group_size" => {
                self.group_size = value.parse().map_err(|_| invalid("expected an integer"))?;
                if self.group_size == 0 {
                    return Err(invalid("must be at least 1"));
                }
            }
            "spline_fitting" => {
                self.spline_fitting = value.parse().map_err(|_| invalid("expected a boolean"))?
            }
            "suffix" => self.suffix = value.to_string(),
            "poly" => self.poly = value.parse().map_err(|_| invalid("expected an integer"))?,
            "smooth" => self.smooth = value.parse().map_err(|_| invalid("expected a number"))?,
            "gradStep" => {
                self.grad_step = value.parse().map_err(|_| invalid("expected a number"))?
            }
            "iter" => self.iter = value.parse().map_err(|_| invalid("expected an integer"))?,
            "metric" => self.metric = value.parse()?,
            "sampling" => {
                self.sampling = value.parse().map_err(|_| invalid("expected a number"))?;
                if !(0.0..=1.0).contains(&self.sampling) {
                    return Err(invalid("must be within [0, 1]"));
                }
            }
            "interp" => self.interp = value.parse()?,
            "bval_min" => {
                self.bval_min = value.parse().map_err(|_| invalid("expected a number"))?
            }
            "iterAvg" => {
                self.iter_avg = value.parse().map_err(|_| invalid("expected a boolean"))?
            }
            "is_sagittal" => {
                self.is_sagittal = value.parse().map_err(|_| invalid("expected a boolean"))?
            }
            "plot_graph" => {
                self.plot_graph = value.parse().map_err(|_| invalid("expected a boolean"))?
            }
            "verbose" => self.verbose = value.parse().map_err(|_| invalid("expected an integer"))?,
            other => return Err(MocoError::UnknownParam(other.to_string())),
        }
        Ok(())
    }

    pub fn metric_spec(&self) -> MetricSpec {
        MetricSpec::for_moco(self.metric)
    }
}
