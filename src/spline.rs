use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use std::fs;
use std::path::Path;

use crate::engine::TransformKind;
use crate::error::MocoError;
use crate::io::matrix::{read_matrix, write_matrix};
use crate::io::report::{write_motion_traces, SliceTrace};
use crate::moco::indexer::{mat_basename, with_suffix};

/// Cubic smoothing spline with a second-difference roughness penalty,
/// evaluated at the knots: minimizes `sum((f_i - y_i)^2) + s * sum((d2 f)^2)`.
/// `s = 0` reproduces the samples exactly, and linear sequences are fixed
/// points for any `s` because their second differences vanish.
pub fn smooth_spline_series(y: &[f64], s: f64) -> Result<Vec<f64>> {
    let n = y.len();
    if s <= 0.0 || n < 4 {
        return Ok(y.to_vec());
    }
    // A = I + s * D2' D2, symmetric positive definite
    let mut a = DMatrix::<f64>::identity(n, n);
    for i in 0..n - 2 {
        let row = [(i, 1.0), (i + 1, -2.0), (i + 2, 1.0)];
        for &(j, cj) in &row {
            for &(k, ck) in &row {
                a[(j, k)] += s * cj * ck;
            }
        }
    }
    let rhs = DVector::from_column_slice(y);
    let solved = a
        .cholesky()
        .context("spline system is not positive definite")?
        .solve(&rhs);
    Ok(solved.iter().copied().collect())
}

/// Temporal regularization of patient motion: smooth each slice's tx/ty
/// series across time and rewrite the transform files with the smoothed
/// translations, leaving rotation and scale entries untouched.
///
/// All existing matrix files are first copied into an `old/` subfolder;
/// files already backed up are skipped, so re-running never clobbers the
/// original backups.
///
/// The smoothing factor defaults to the number of samples, so the fit
/// regularizes instead of interpolating.
pub fn spline(
    folder_mat: &Path,
    nz: usize,
    nt: usize,
    kind: TransformKind,
    verbose: u32,
    trace_csv: Option<&Path>,
) -> Result<()> {
    spline_with_factor(folder_mat, nz, nt, kind, nt as f64, verbose, trace_csv)
}

pub fn spline_with_factor(
    folder_mat: &Path,
    nz: usize,
    nt: usize,
    kind: TransformKind,
    smoothing: f64,
    verbose: u32,
    trace_csv: Option<&Path>,
) -> Result<()> {
    if kind != TransformKind::Affine {
        return Err(MocoError::UnsupportedTransform(
            "spline regularization needs affine matrices, not warp fields".into(),
        )
        .into());
    }
    if verbose > 0 {
        println!("\nSpline regularization along T: smoothing patient motion...");
    }

    let mat_files: Vec<Vec<_>> = (0..nz)
        .map(|iz| {
            (0..nt)
                .map(|it| with_suffix(&folder_mat.join(mat_basename(iz, it)), kind.suffix()))
                .collect()
        })
        .collect();

    // keep the unsmoothed matrices around
    let old_dir = folder_mat.join("old");
    fs::create_dir_all(&old_dir)
        .with_context(|| format!("failed to create {}", old_dir.display()))?;
    for row in &mat_files {
        for path in row {
            let name = path.file_name().context("matrix path has no file name")?;
            let backup = old_dir.join(name);
            if !backup.exists() {
                fs::copy(path, &backup).with_context(|| {
                    format!("failed to back up {} into {}", path.display(), old_dir.display())
                })?;
            }
        }
    }

    let mut traces = Vec::with_capacity(nz);
    for (iz, row) in mat_files.iter().enumerate() {
        let mut x_raw = Vec::with_capacity(nt);
        let mut y_raw = Vec::with_capacity(nt);
        for path in row {
            let m = read_matrix(path)?;
            x_raw.push(m[(0, 3)]);
            y_raw.push(m[(1, 3)]);
        }

        let x_smooth = smooth_spline_series(&x_raw, smoothing)?;
        let y_smooth = smooth_spline_series(&y_raw, smoothing)?;

        for (it, path) in row.iter().enumerate() {
            let mut m = read_matrix(path)?;
            m[(0, 3)] = x_smooth[it];
            m[(1, 3)] = y_smooth[it];
            write_matrix(path, &m)?;
        }
        traces.push(SliceTrace {
            iz,
            x_raw,
            x_smooth,
            y_raw,
            y_smooth,
        });
    }

    if let Some(csv_path) = trace_csv {
        write_motion_traces(csv_path, &traces)?;
    }
    if verbose > 0 {
        println!("...done. Patient motion has been smoothed");
    }
    Ok(())
}

#[cfg(test)]
mod spline_tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::path::PathBuf;

    fn roughness(y: &[f64]) -> f64 {
        y.windows(3)
            .map(|w| (w[0] - 2.0 * w[1] + w[2]).powi(2))
            .sum()
    }

    #[test]
    fn test_linear_sequence_is_unchanged() {
        let y: Vec<f64> = (0..20).map(|i| 0.3 * i as f64 - 2.0).collect();
        for s in [0.0, 1.0, 100.0] {
            let smoothed = smooth_spline_series(&y, s).unwrap();
            for (a, b) in y.iter().zip(&smoothed) {
                assert_relative_eq!(a, b, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_noisy_trace_gets_smoother() {
        let mut rng = StdRng::seed_from_u64(42);
        let y: Vec<f64> = (0..50)
            .map(|i| (i as f64 * 0.3).sin() + rng.random_range(-0.3..0.3))
            .collect();
        let smoothed = smooth_spline_series(&y, 5.0).unwrap();
        assert!(roughness(&smoothed) < roughness(&y));
        // the fit still tracks the data
        let max_dev = y
            .iter()
            .zip(&smoothed)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_dev < 1.0);
    }

    fn mat_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "slicemoco_spline_{}_{}",
            tag,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_grid(dir: &Path, nz: usize, nt: usize, tx: impl Fn(usize, usize) -> f64) {
        for iz in 0..nz {
            for it in 0..nt {
                let mut m = Matrix4::identity();
                m[(0, 3)] = tx(iz, it);
                m[(1, 3)] = -tx(iz, it);
                m[(0, 0)] = 0.9; // rotation/scale entries must survive
                write_matrix(
                    &with_suffix(&dir.join(mat_basename(iz, it)), "0GenericAffine.mat"),
                    &m,
                )
                .unwrap();
            }
        }
    }

    #[test]
    fn test_default_factor_regularizes_jittery_motion() {
        let dir = mat_dir("default_factor");
        let raw = [0.0, 5.0, -4.0, 6.0, -3.0, 7.0];
        write_grid(&dir, 1, 6, |_, it| raw[it]);
        spline(&dir, 1, 6, TransformKind::Affine, 0, None).unwrap();

        let after: Vec<f64> = (0..6)
            .map(|it| {
                let name = format!("{}0GenericAffine.mat", mat_basename(0, it));
                read_matrix(&dir.join(name)).unwrap()[(0, 3)]
            })
            .collect();
        // the default pass must actually regularize, not rewrite verbatim
        assert_ne!(after, raw.to_vec());
        assert!(roughness(&after) < roughness(&raw));
    }

    #[test]
    fn test_spline_backs_up_and_preserves_non_translation_entries() {
        let dir = mat_dir("backup");
        write_grid(&dir, 1, 6, |_, it| it as f64 * 0.5);
        spline(&dir, 1, 6, TransformKind::Affine, 0, None).unwrap();

        for it in 0..6 {
            let name = format!("{}0GenericAffine.mat", mat_basename(0, it));
            let m = read_matrix(&dir.join(&name)).unwrap();
            // linear motion: translations unchanged within tolerance
            assert_relative_eq!(m[(0, 3)], it as f64 * 0.5, epsilon = 1e-8);
            assert_relative_eq!(m[(0, 0)], 0.9, epsilon = 1e-12);
            // backup copy exists and is pristine
            let old = read_matrix(&dir.join("old").join(&name)).unwrap();
            assert_relative_eq!(old[(0, 3)], it as f64 * 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_second_pass_keeps_first_backup() {
        let dir = mat_dir("idempotent");
        write_grid(&dir, 1, 5, |_, it| it as f64);
        spline(&dir, 1, 5, TransformKind::Affine, 0, None).unwrap();

        // overwrite a live matrix, then smooth again: the backup must keep
        // the original value
        let name = format!("{}0GenericAffine.mat", mat_basename(0, 2));
        let mut m = read_matrix(&dir.join(&name)).unwrap();
        m[(0, 3)] = 99.0;
        write_matrix(&dir.join(&name), &m).unwrap();
        spline(&dir, 1, 5, TransformKind::Affine, 0, None).unwrap();

        let old = read_matrix(&dir.join("old").join(&name)).unwrap();
        assert_relative_eq!(old[(0, 3)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_warp_fields_are_rejected() {
        let dir = mat_dir("warp");
        let err = spline(&dir, 1, 3, TransformKind::Warp, 0, None).unwrap_err();
        assert!(err.downcast::<MocoError>().is_ok());
    }

    #[test]
    fn test_trace_csv_written() {
        let dir = mat_dir("trace");
        write_grid(&dir, 2, 4, |iz, it| (iz + it) as f64);
        let csv = dir.join("motion_traces.csv");
        spline(&dir, 2, 4, TransformKind::Affine, 0, Some(&csv)).unwrap();
        let text = fs::read_to_string(&csv).unwrap();
        assert_eq!(text.lines().count(), 1 + 2 * 4);
    }
}
