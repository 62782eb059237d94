use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::io::ImageIo;
use crate::moco::indexer::{mat_basename, with_suffix};
use crate::volume::Volume4D;

/// Merge one slice's registered timepoints back into a 4D series, in the
/// exact order the job indexer enumerated them.
pub fn assemble_slice(io: &dyn ImageIo, out_paths: &[PathBuf], pt: f64) -> Result<Volume4D> {
    let vols = out_paths
        .iter()
        .map(|p| io.load_3d(p))
        .collect::<Result<Vec<_>>>()
        .context("missing registered volume during reassembly")?;
    Volume4D::concat_t(&vols, pt)
}

/// Merge per-slice 4D series back along the slice axis (sagittal only),
/// ascending `iz`.
pub fn assemble_sagittal(slices: &[Volume4D]) -> Result<Volume4D> {
    Volume4D::concat_z(slices)
}

/// Copy grouped transform files into a final folder holding one transform
/// per *native* timepoint.
///
/// `job_for_timepoint[it]` names the job whose transform serves native
/// timepoint `it` (`None` leaves that timepoint without a copy, e.g. for
/// volumes corrected by a separate pass). Used when jobs group several
/// native timepoints to reduce engine invocations.
pub fn copy_mat_files(
    nt: usize,
    mat_prefixes: &[Vec<PathBuf>],
    job_for_timepoint: &[Option<usize>],
    folder_out: &Path,
    suffix: &str,
) -> Result<usize> {
    if job_for_timepoint.len() != nt {
        bail!(
            "timepoint map has {} entries for {} native timepoints",
            job_for_timepoint.len(),
            nt
        );
    }
    fs::create_dir_all(folder_out)
        .with_context(|| format!("failed to create {}", folder_out.display()))?;
    let mut copied = 0;
    for (iz, row) in mat_prefixes.iter().enumerate() {
        for (it, job) in job_for_timepoint.iter().enumerate() {
            let Some(job) = job else { continue };
            let src = match row.get(*job) {
                Some(prefix) => with_suffix(prefix, suffix),
                None => bail!("timepoint {} maps to job {} out of range", it, job),
            };
            let dest = folder_out.join(format!("{}{}", mat_basename(iz, it), suffix));
            fs::copy(&src, &dest).with_context(|| {
                format!("failed to copy {} -> {}", src.display(), dest.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
