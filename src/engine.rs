use anyhow::Result;
use std::path::Path;

use crate::config::{Interp, MetricSpec};
use crate::io::ImageIo;

/// Kind of transform artifact a registration engine produces, and the file
/// suffix appended to each job's `mat.Z....T....` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Affine,
    Warp,
}

impl TransformKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            TransformKind::Affine => "0GenericAffine.mat",
            TransformKind::Warp => "Warp.nii.gz",
        }
    }
}

/// How one job is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    /// 2D affine registration of a single sagittal slice.
    Affine2d,
    /// 3D translation-only registration, regularized along the slice axis
    /// with a polynomial of the requested degree.
    SliceRegularized3d,
}

/// One fully-specified registration job. Every field is explicit; nothing
/// is smuggled through string-built command lines.
#[derive(Debug, Clone)]
pub struct RegistrationRequest<'a> {
    pub src: &'a Path,
    pub dest: &'a Path,
    /// Binary region-of-interest mask. Soft masks are never passed here;
    /// they are multiplied into the data beforehand.
    pub mask: Option<&'a Path>,
    /// Prefix for the transform artifact; the engine appends its
    /// [`TransformKind`] suffix.
    pub transform_prefix: &'a Path,
    /// Where the registered volume must be written.
    pub output: &'a Path,
    pub mode: RegistrationMode,
    pub metric: MetricSpec,
    pub poly: u32,
    pub smooth: f64,
    pub grad_step: f64,
    pub iterations: u32,
    pub sampling: f64,
    pub interp: Interp,
}

/// Port to the external registration optimizer.
///
/// An `Ok` return only means the engine ran; whether it produced a usable
/// output is judged afterwards by checking for the output volume, and a
/// missing output is a recoverable per-job failure, never an abort.
pub trait RegistrationEngine: Sync {
    fn transform_kind(&self) -> TransformKind;

    /// Estimate the transform for one job and resample the source onto the
    /// target, writing both artifacts.
    fn register(&self, io: &dyn ImageIo, req: &RegistrationRequest<'_>) -> Result<()>;

    /// Re-apply an already-estimated transform to a source volume.
    fn apply_transform(
        &self,
        io: &dyn ImageIo,
        src: &Path,
        dest: &Path,
        transform: &Path,
        output: &Path,
        interp: Interp,
    ) -> Result<()>;
}
