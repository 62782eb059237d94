use anyhow::{bail, Context, Result};
use nalgebra::Matrix4;
use std::fs;
use std::path::Path;

/// Read a 4x4 affine matrix from a whitespace-separated text file
/// (the layout `numpy.savetxt` writes).
pub fn read_matrix(path: &Path) -> Result<Matrix4<f64>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read matrix file {}", path.display()))?;
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .with_context(|| format!("bad value '{}' in {}", tok, path.display()))
        })
        .collect::<Result<_>>()?;
    if values.len() != 16 {
        bail!(
            "matrix file {} holds {} values, expected 16",
            path.display(),
            values.len()
        );
    }
    Ok(Matrix4::from_row_slice(&values))
}

/// Write a 4x4 affine matrix as four text rows, two spaces between values.
pub fn write_matrix(path: &Path, matrix: &Matrix4<f64>) -> Result<()> {
    let mut out = String::new();
    for row in 0..4 {
        let cells: Vec<String> = (0..4).map(|col| format!("{}", matrix[(row, col)])).collect();
        out.push_str(&cells.join("  "));
        out.push('\n');
    }
    fs::write(path, out)
        .with_context(|| format!("failed to write matrix file {}", path.display()))
}

/// Identity affine, written for jobs whose registration is skipped so that
/// every job still owns exactly one transform artifact.
pub fn write_identity(path: &Path) -> Result<()> {
    write_matrix(path, &Matrix4::identity())
}
