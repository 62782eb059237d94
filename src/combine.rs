use anyhow::{Context, Result};
use nalgebra::{Matrix3, Matrix4, Vector3};
use std::fs;
use std::path::Path;

use crate::io::matrix::{read_matrix, write_matrix};

/// How two affine chains are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// Historical behaviour, kept verbatim for compatibility with matrices
    /// produced by earlier runs: element-wise product of the rotation
    /// blocks and plain sum of the translations. This is NOT a true affine
    /// composition; do not "fix" it without migrating existing data.
    Legacy,
    /// Correct affine composition: `R = R_f * R_c`, `t = t_f + R_f * t_c`.
    Proper,
}

fn rotation(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

fn translation(m: &Matrix4<f64>) -> Vector3<f64> {
    Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)])
}

/// Compose two 4x4 homogeneous matrices. The bottom row of the result is
/// always the identity row.
pub fn compose(final_m: &Matrix4<f64>, to_combine: &Matrix4<f64>, mode: CombineMode) -> Matrix4<f64> {
    let (rot, trans) = match mode {
        CombineMode::Legacy => (
            rotation(final_m).component_mul(&rotation(to_combine)),
            translation(final_m) + translation(to_combine),
        ),
        CombineMode::Proper => (
            rotation(final_m) * rotation(to_combine),
            translation(final_m) + rotation(final_m) * translation(to_combine),
        ),
    };
    let mut out = Matrix4::identity();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
    out[(0, 3)] = trans[0];
    out[(1, 3)] = trans[1];
    out[(2, 3)] = trans[2];
    out
}

/// Fold a folder of transform matrices into a "final" folder in place:
/// every file name present in both folders is composed and the final file
/// overwritten. Returns how many files were combined.
pub fn combine_matrices(
    mat_to_combine: &Path,
    mat_final: &Path,
    mode: CombineMode,
    verbose: u32,
) -> Result<usize> {
    if verbose > 0 {
        println!("\nCombine matrices...");
    }
    let mut combined = 0;
    let entries = fs::read_dir(mat_to_combine)
        .with_context(|| format!("failed to list {}", mat_to_combine.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let final_path = mat_final.join(entry.file_name());
        if !final_path.is_file() {
            continue;
        }
        let m_to_combine = read_matrix(&entry.path())?;
        let m_final = read_matrix(&final_path)?;
        write_matrix(&final_path, &compose(&m_final, &m_to_combine, mode))?;
        combined += 1;
    }
    Ok(combined)
}
