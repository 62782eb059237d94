use anyhow::Result;
use std::path::Path;

use crate::config::{MocoParams, Todo};
use crate::engine::{RegistrationEngine, RegistrationMode, RegistrationRequest};
use crate::io::{matrix, ImageIo};
use crate::moco::indexer::with_suffix;

/// Everything one registration job needs, by path.
#[derive(Debug, Clone)]
pub struct JobSpec<'a> {
    pub src: &'a Path,
    pub target: &'a Path,
    /// Binary region-of-interest mask for this job's slice. Soft masks are
    /// multiplied into the source before the job is built and never appear
    /// here.
    pub binary_mask: Option<&'a Path>,
    pub mat_prefix: &'a Path,
    pub output: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Registered,
    /// Registration was skipped (empty mask); output is a verbatim copy of
    /// the source and the transform is an explicit identity.
    Skipped,
    /// The engine produced no output volume. Recoverable; resolved later by
    /// failure recovery.
    Failed,
}

impl JobOutcome {
    pub fn failed(&self) -> bool {
        matches!(self, JobOutcome::Failed)
    }
}

/// Run one registration job: build the request, dispatch it, classify the
/// outcome. Never aborts on a per-job engine failure.
pub fn run_job(
    io: &dyn ImageIo,
    engine: &dyn RegistrationEngine,
    params: &MocoParams,
    spec: &JobSpec<'_>,
) -> Result<JobOutcome> {
    let suffix = engine.transform_kind().suffix();

    if params.todo == Todo::Apply {
        let transform = with_suffix(spec.mat_prefix, suffix);
        engine.apply_transform(io, spec.src, spec.target, &transform, spec.output, params.interp)?;
        return Ok(classify_output(io, params, spec));
    }

    let src_vol = io.load_3d(spec.src)?;
    let sagittal_2d = src_vol.orientation.is_sagittal();

    if let Some(mask_path) = spec.binary_mask {
        let mask = io.load_3d(mask_path)?;
        if mask.count_nonzero() == 0 {
            // Mask only contains zeros: copy the source instead of
            // estimating. The identity transform keeps the
            // one-transform-per-job invariant for downstream consumers.
            io.save_3d(spec.output, &src_vol)?;
            matrix::write_identity(&with_suffix(spec.mat_prefix, suffix))?;
            return Ok(JobOutcome::Skipped);
        }
    }

    let mode = if sagittal_2d {
        RegistrationMode::Affine2d
    } else {
        RegistrationMode::SliceRegularized3d
    };
    let request = RegistrationRequest {
        src: spec.src,
        dest: spec.target,
        mask: spec.binary_mask,
        transform_prefix: spec.mat_prefix,
        output: spec.output,
        mode,
        metric: params.metric_spec(),
        poly: params.poly,
        smooth: params.smooth,
        grad_step: params.grad_step,
        iterations: params.iter,
        sampling: params.sampling,
        interp: params.interp,
    };
    engine.register(io, &request)?;

    let outcome = classify_output(io, params, spec);
    if outcome == JobOutcome::Failed {
        return Ok(outcome);
    }

    if sagittal_2d {
        // 2D engines return headerless slices; restore the source geometry
        // so the slice stacks back along Z (the singleton third axis is
        // preserved by the volume type itself).
        let mut out_vol = io.load_3d(spec.output)?;
        out_vol.copy_meta_from(&src_vol);
        io.save_3d(spec.output, &out_vol)?;
    }
    Ok(outcome)
}

fn classify_output(io: &dyn ImageIo, params: &MocoParams, spec: &JobSpec<'_>) -> JobOutcome {
    if io.exists(spec.output) {
        JobOutcome::Registered
    } else {
        if params.verbose > 0 {
            eprintln!(
                "WARNING: no output for {}. Maybe related to improper calculation of \
                 mutual information: either the mask is too small, or the subject \
                 moved a lot. Using the closest good transformation for this volume.",
                spec.src.display()
            );
        }
        JobOutcome::Failed
    }
}
