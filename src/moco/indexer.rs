use std::path::{Path, PathBuf};

/// Identifies one registration job and the one transform it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobIndex {
    pub iz: usize,
    pub it: usize,
}

/// Dense grid of registration jobs for one 4D acquisition.
///
/// Sagittal data gets one row per slice; axial data collapses to a single
/// row because the whole 3D volume is registered at once.
#[derive(Debug, Clone, Copy)]
pub struct JobGrid {
    pub nz: usize,
    pub nt: usize,
}

impl JobGrid {
    pub fn new(nz: usize, nt: usize, is_sagittal: bool) -> Self {
        JobGrid {
            nz: if is_sagittal { nz } else { 1 },
            nt,
        }
    }

    pub fn len(&self) -> usize {
        self.nz * self.nt
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs of one slice row, ascending `it`. The time order within a row
    /// is a contract: the iterative target refinement is order-dependent,
    /// so reproducing a pipeline bit-for-bit requires processing timepoints
    /// exactly in this order.
    pub fn row(self, iz: usize) -> impl Iterator<Item = JobIndex> {
        (0..self.nt).map(move |it| JobIndex { iz, it })
    }

    /// Enumerate every job, ascending `iz` then ascending `it`.
    pub fn jobs(self) -> impl Iterator<Item = JobIndex> {
        (0..self.nz).flat_map(move |iz| self.row(iz))
    }
}

/// Deterministic artifact name for one job, without the transform suffix.
pub fn mat_basename(iz: usize, it: usize) -> String {
    format!("mat.Z{:04}T{:04}", iz, it)
}

/// Transform-file prefix for one job inside the mat folder. The engine's
/// suffix ("0GenericAffine.mat" or "Warp.nii.gz") is appended to this.
pub fn mat_prefix(folder_mat: &Path, iz: usize, it: usize) -> PathBuf {
    folder_mat.join(mat_basename(iz, it))
}

/// Append a transform suffix to a job's mat prefix.
pub fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    match prefix.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod indexer_tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_grid_shape() {
        let sag = JobGrid::new(5, 7, true);
        assert_eq!(sag.len(), 35);
        let axial = JobGrid::new(5, 7, false);
        assert_eq!(axial.len(), 7);
        assert_eq!(axial.nz, 1);
    }

    #[test]
    fn test_job_ordering_and_uniqueness() {
        let grid = JobGrid::new(3, 4, true);
        let jobs: Vec<_> = grid.jobs().collect();
        assert_eq!(jobs.len(), 12);
        // ascending iz, then ascending it, with no duplicates
        assert_eq!(jobs[0], JobIndex { iz: 0, it: 0 });
        assert_eq!(jobs[3], JobIndex { iz: 0, it: 3 });
        assert_eq!(jobs[4], JobIndex { iz: 1, it: 0 });
        let names: HashSet<_> = jobs.iter().map(|j| mat_basename(j.iz, j.it)).collect();
        assert_eq!(names.len(), jobs.len());
    }

    #[test]
    fn test_naming_is_deterministic_and_padded() {
        assert_eq!(mat_basename(0, 3), "mat.Z0000T0003");
        assert_eq!(mat_basename(12, 345), "mat.Z0012T0345");
        // rerunning with the same inputs must reproduce the same names
        assert_eq!(mat_basename(12, 345), mat_basename(12, 345));
    }

    #[test]
    fn test_with_suffix() {
        let prefix = mat_prefix(Path::new("mat_moco"), 0, 1);
        assert_eq!(
            with_suffix(&prefix, "0GenericAffine.mat"),
            PathBuf::from("mat_moco/mat.Z0000T00010GenericAffine.mat")
        );
    }
}
