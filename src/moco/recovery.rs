use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::MocoParams;
use crate::engine::RegistrationEngine;
use crate::error::MocoError;
use crate::io::ImageIo;
use crate::moco::indexer::with_suffix;

/// Patch this slice's failed jobs by substituting the nearest successful
/// neighbour's transform (by time-index distance, first occurrence winning
/// ties) and re-applying it to the failed source.
///
/// Assumes motion is temporally smooth enough that the nearest-in-time good
/// transform is an acceptable proxy. If no job in the slice succeeded the
/// whole pipeline aborts: there is nothing to substitute.
pub fn recover_failed_jobs(
    io: &dyn ImageIo,
    engine: &dyn RegistrationEngine,
    params: &MocoParams,
    iz: usize,
    failed: &[bool],
    src_paths: &[PathBuf],
    target: &Path,
    mat_prefixes: &[PathBuf],
    out_paths: &[PathBuf],
) -> Result<()> {
    let failed_t: Vec<usize> = (0..failed.len()).filter(|&it| failed[it]).collect();
    let good_t: Vec<usize> = (0..failed.len()).filter(|&it| !failed[it]).collect();

    if failed_t.is_empty() {
        return Ok(());
    }
    if good_t.is_empty() {
        return Err(MocoError::NoGoodTransform { slice: iz }.into());
    }

    let suffix = engine.transform_kind().suffix();
    for &ft in &failed_t {
        // first-encountered minimizer of |g - f| over the good set
        let Some(gt) = good_t.iter().copied().min_by_key(|&g| g.abs_diff(ft)) else {
            continue;
        };
        if params.verbose > 0 {
            println!("  transfo #{} --> use transfo #{}", ft, gt);
        }
        let src_mat = with_suffix(&mat_prefixes[gt], suffix);
        let dst_mat = with_suffix(&mat_prefixes[ft], suffix);
        fs::copy(&src_mat, &dst_mat).with_context(|| {
            format!(
                "failed to copy transform {} -> {}",
                src_mat.display(),
                dst_mat.display()
            )
        })?;
        engine.apply_transform(
            io,
            &src_paths[ft],
            target,
            &dst_mat,
            &out_paths[ft],
            params.interp,
        )?;
    }
    Ok(())
}
