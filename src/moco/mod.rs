pub mod assemble;
pub mod indexer;
pub mod invoke;
pub mod mask;
pub mod recovery;
pub mod target;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;

use crate::config::{MocoParams, Todo};
use crate::engine::RegistrationEngine;
use crate::io::ImageIo;
use crate::spline;
use crate::utils::add_suffix;
use crate::volume::{mean_volumes, Volume3D, Volume4D};
use assemble::{assemble_sagittal, assemble_slice, copy_mat_files};
use indexer::{mat_prefix, JobGrid};
use invoke::{run_job, JobSpec};
use mask::{classify_mask, MaskKind};
use target::{TargetRefiner, TARGET_REFINE_WINDOW};

/// What one moco pass leaves behind.
#[derive(Debug)]
pub struct MocoOutput {
    /// Transform-file prefixes, indexed `[iz][it]`. After the pass there is
    /// exactly one transform artifact per entry, real or substituted.
    pub mat_prefixes: Vec<Vec<PathBuf>>,
    /// The reassembled 4D volume; `None` when `todo = estimate`.
    pub volume: Option<Volume4D>,
    /// Where the reassembled volume was saved.
    pub fname_output: Option<PathBuf>,
}

/// Per-slice mask hand-off, decided once before the job loop.
enum SliceMask {
    None,
    /// Binary region of interest, passed to the engine by path.
    Binary(PathBuf),
    /// Soft mask, multiplied into each job's source (never passed on).
    Soft(Volume3D),
}

struct SliceInput {
    data_4d: PathBuf,
    target: PathBuf,
    mask: SliceMask,
}

struct SliceResult {
    mat_prefixes: Vec<PathBuf>,
    volume: Option<Volume4D>,
}

/// One motion-correction pass: enumerate (slice, time) jobs, register each
/// against the iteratively refined target, patch failures, reassemble.
pub fn moco<I: ImageIo, E: RegistrationEngine>(
    params: &MocoParams,
    io: &I,
    engine: &E,
) -> Result<MocoOutput> {
    if params.verbose > 0 {
        println!("\nInput parameters:");
        println!("  Input file ............ {}", params.fname_data.display());
        println!("  Reference file ........ {}", params.fname_target.display());
        println!("  Polynomial degree ..... {}", params.poly);
        println!("  Smoothing kernel ...... {}", params.smooth);
        println!("  Gradient step ......... {}", params.grad_step);
        println!("  Metric ................ {:?}", params.metric);
        println!("  Sampling .............. {}", params.sampling);
        println!("  Todo .................. {:?}", params.todo);
        println!("  Output mat folder ..... {}", params.folder_mat.display());
    }

    fs::create_dir_all(&params.folder_mat)
        .with_context(|| format!("failed to create {}", params.folder_mat.display()))?;

    let im_data = io.load_4d(&params.fname_data)?;
    let (nx, ny, nz, nt) = im_data.dim();
    if nt == 0 {
        bail!("input {} has no timepoints", params.fname_data.display());
    }
    if params.verbose > 0 {
        println!("\nData dimensions:\n  {} x {} x {} x {}", nx, ny, nz, nt);
    }

    // working copy of the target: it is mutated during warm-up
    let mut target = io.load_3d(&params.fname_target)?;

    // mask classification is a single global decision, not a per-job one
    let mask_info = match &params.fname_mask {
        Some(path) => {
            let mask = io.load_3d(path)?;
            let kind = classify_mask(&mask);
            Some((mask, kind))
        }
        None => None,
    };
    if let Some((mask, MaskKind::Soft)) = &mask_info {
        // soft masks weight the target too, once, at initialization
        target.multiply(mask)?;
    }

    let grid = JobGrid::new(nz, nt, params.is_sagittal);
    let tmp = &params.path_tmp;

    let slices: Vec<SliceInput> = if params.is_sagittal {
        let data_z = im_data.split_z();
        let target_z = target.split_z();
        if target_z.len() != data_z.len() {
            bail!(
                "target has {} slices but the data has {}",
                target_z.len(),
                data_z.len()
            );
        }
        let mask_z = mask_info
            .as_ref()
            .map(|(mask, _)| mask.split_z())
            .unwrap_or_default();
        if mask_info.is_some() && mask_z.len() != data_z.len() {
            bail!(
                "mask has {} slices but the data has {}",
                mask_z.len(),
                data_z.len()
            );
        }
        let mut slices = Vec::with_capacity(grid.nz);
        for iz in 0..grid.nz {
            let data_path = tmp.join(format!("data_Z{:04}.nii.gz", iz));
            io.save_4d(&data_path, &data_z[iz])?;
            let target_path = tmp.join(format!("target_Z{:04}.nii.gz", iz));
            io.save_3d(&target_path, &target_z[iz])?;
            let mask = match &mask_info {
                Some((_, MaskKind::Binary)) => {
                    let mask_path = tmp.join(format!("mask_Z{:04}.nii.gz", iz));
                    io.save_3d(&mask_path, &mask_z[iz])?;
                    SliceMask::Binary(mask_path)
                }
                Some((_, MaskKind::Soft)) => SliceMask::Soft(mask_z[iz].clone()),
                None => SliceMask::None,
            };
            slices.push(SliceInput {
                data_4d: data_path,
                target: target_path,
                mask,
            });
        }
        slices
    } else {
        let target_path = tmp.join("target.nii.gz");
        io.save_3d(&target_path, &target)?;
        let mask = match (&params.fname_mask, &mask_info) {
            (Some(path), Some((_, MaskKind::Binary))) => SliceMask::Binary(path.clone()),
            (_, Some((mask, MaskKind::Soft))) => SliceMask::Soft(mask.clone()),
            _ => SliceMask::None,
        };
        vec![SliceInput {
            data_4d: params.fname_data.clone(),
            target: target_path,
            mask,
        }]
    };

    if params.verbose > 0 {
        println!("\nRegister. Loop across Z (one Z only if orientation is axial)");
        println!("  {} registration jobs", grid.len());
    }

    // slices are independent of each other at all times
    let results: Vec<SliceResult> = slices
        .par_iter()
        .enumerate()
        .map(|(iz, slice)| process_slice(io, engine, params, iz, slice, grid, im_data.spacing[3]))
        .collect::<Result<Vec<_>>>()?;

    let mat_prefixes: Vec<Vec<PathBuf>> = results.iter().map(|r| r.mat_prefixes.clone()).collect();

    if params.todo == Todo::Estimate {
        return Ok(MocoOutput {
            mat_prefixes,
            volume: None,
            fname_output: None,
        });
    }

    let slice_vols = results
        .into_iter()
        .map(|r| r.volume.context("slice volume missing after reassembly"))
        .collect::<Result<Vec<_>>>()?;
    let out_vol = if params.is_sagittal {
        assemble_sagittal(&slice_vols)?
    } else {
        slice_vols
            .into_iter()
            .next()
            .context("no slice volume produced")?
    };
    let out_path = add_suffix(&params.fname_data, &params.suffix);
    io.save_4d(&out_path, &out_vol)?;
    if params.verbose > 0 {
        println!("\nSaved motion-corrected volume to {}", out_path.display());
    }

    Ok(MocoOutput {
        mat_prefixes,
        volume: Some(out_vol),
        fname_output: Some(out_path),
    })
}

fn process_slice(
    io: &dyn ImageIo,
    engine: &dyn RegistrationEngine,
    params: &MocoParams,
    iz: usize,
    slice: &SliceInput,
    grid: JobGrid,
    pt: f64,
) -> Result<SliceResult> {
    let nt = grid.nt;
    let data = io.load_4d(&slice.data_4d)?;
    let parts = data.split_t();

    let mut src_paths = Vec::with_capacity(nt);
    let mut out_paths = Vec::with_capacity(nt);
    let mut mat_prefixes = Vec::with_capacity(nt);
    for (job, part) in grid.row(iz).zip(&parts) {
        let src = params
            .path_tmp
            .join(format!("data_Z{:04}T{:04}.nii.gz", job.iz, job.it));
        if params.todo.estimates() {
            if let SliceMask::Soft(mask) = &slice.mask {
                let mut weighted = part.clone();
                weighted.multiply(mask)?;
                io.save_3d(&src, &weighted)?;
            } else {
                io.save_3d(&src, part)?;
            }
        } else {
            io.save_3d(&src, part)?;
        }
        out_paths.push(add_suffix(&src, &params.suffix));
        mat_prefixes.push(mat_prefix(&params.folder_mat, job.iz, job.it));
        src_paths.push(src);
    }

    let binary_mask = match &slice.mask {
        // masking is irrelevant when only re-applying transforms
        SliceMask::Binary(path) if params.todo.estimates() => Some(path.as_path()),
        _ => None,
    };
    let job_spec = |it: usize| JobSpec {
        src: &src_paths[it],
        target: &slice.target,
        binary_mask,
        mat_prefix: &mat_prefixes[it],
        output: &out_paths[it],
    };

    let mut failed = vec![false; nt];

    // Warm-up window: sequential, ascending it. The target refinement is
    // order-dependent, so this ordering is a contract, not a convenience.
    let warmup_end = if params.iter_avg && params.todo.estimates() {
        TARGET_REFINE_WINDOW.min(nt)
    } else {
        0
    };
    let mut refiner = TargetRefiner::new();
    for job in grid.row(iz).take(warmup_end) {
        let outcome = run_job(io, engine, params, &job_spec(job.it))?;
        failed[job.it] = outcome.failed();
        if !outcome.failed() {
            let mut target = io.load_3d(&slice.target)?;
            let moco_vol = io.load_3d(&out_paths[job.it])?;
            refiner.absorb(&mut target, &moco_vol);
            io.save_3d(&slice.target, &target)?;
        }
    }

    // after the window the target is frozen and timepoints are independent
    let tail: Vec<(usize, bool)> = grid
        .row(iz)
        .skip(warmup_end)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|job| -> Result<(usize, bool)> {
            let outcome = run_job(io, engine, params, &job_spec(job.it))?;
            Ok((job.it, outcome.failed()))
        })
        .collect::<Result<Vec<_>>>()?;
    for (it, was_failed) in tail {
        failed[it] = was_failed;
    }

    recovery::recover_failed_jobs(
        io,
        engine,
        params,
        iz,
        &failed,
        &src_paths,
        &slice.target,
        &mat_prefixes,
        &out_paths,
    )?;

    let volume = if params.todo != Todo::Estimate {
        Some(assemble_slice(io, &out_paths, pt)?)
    } else {
        None
    };
    Ok(SliceResult {
        mat_prefixes,
        volume,
    })
}

/// Full diffusion-style moco driver: estimate on grouped timepoint means,
/// expand the grouped transforms to one per native timepoint, optionally
/// spline-smooth them, then apply to the native series.
///
/// With `group_size = 1` and no spline fitting this collapses to a single
/// estimate-and-apply pass.
pub fn run_dmri_moco<I: ImageIo, E: RegistrationEngine>(
    params: &MocoParams,
    io: &I,
    engine: &E,
) -> Result<MocoOutput> {
    let two_phase = params.group_size > 1 || params.spline_fitting;
    if !two_phase {
        return moco(params, io, engine);
    }

    let native = io.load_4d(&params.fname_data)?;
    let nt = native.dim().3;
    if nt == 0 {
        bail!("input {} has no timepoints", params.fname_data.display());
    }
    let gs = params.group_size;

    // phase 1: estimate on grouped means (fewer engine invocations)
    let mut est = params.clone();
    est.todo = Todo::Estimate;
    if gs > 1 {
        let parts = native.split_t();
        let n_groups = nt.div_ceil(gs);
        let grouped_vols: Vec<Volume3D> = (0..n_groups)
            .map(|g| mean_volumes(&parts[g * gs..((g + 1) * gs).min(nt)]))
            .collect::<Result<_>>()?;
        let grouped = Volume4D::concat_t(&grouped_vols, native.spacing[3] * gs as f64)?;
        let grouped_path = params.path_tmp.join("data_grouped.nii.gz");
        io.save_4d(&grouped_path, &grouped)?;
        est.fname_data = grouped_path;
    }
    let est_out = moco(&est, io, engine)?;

    // one transform per native timepoint in the final mat folder
    let suffix = engine.transform_kind().suffix();
    let job_for_timepoint: Vec<Option<usize>> = (0..nt).map(|it| Some(it / gs)).collect();
    copy_mat_files(
        nt,
        &est_out.mat_prefixes,
        &job_for_timepoint,
        &params.mat_final,
        suffix,
    )?;

    if params.spline_fitting {
        let trace = params
            .plot_graph
            .then(|| params.mat_final.join("motion_traces.csv"));
        spline::spline(
            &params.mat_final,
            est_out.mat_prefixes.len(),
            nt,
            engine.transform_kind(),
            params.verbose,
            trace.as_deref(),
        )?;
    }

    // phase 2: apply the final transforms to the native series
    let mut app = params.clone();
    app.todo = Todo::Apply;
    app.folder_mat = params.mat_final.clone();
    moco(&app, io, engine)
}

#[cfg(test)]
mod moco_tests {
    use super::*;
    use crate::config::Interp;
    use crate::engine::{RegistrationRequest, TransformKind};
    use crate::io::{matrix, MemoryIo};
    use crate::moco::indexer::with_suffix;
    use crate::volume::Orientation;
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;
    use ndarray::Array4;
    use std::collections::HashSet;
    use std::path::Path;

    /// Registration stand-in: copies the source to the output, writes an
    /// affine whose tx encodes the job's time index, and can be told to
    /// fail (produce nothing) for chosen timepoints.
    struct MockEngine {
        fail_times: HashSet<usize>,
    }

    impl MockEngine {
        fn reliable() -> Self {
            MockEngine {
                fail_times: HashSet::new(),
            }
        }

        fn failing(times: &[usize]) -> Self {
            MockEngine {
                fail_times: times.iter().copied().collect(),
            }
        }

        fn time_index(prefix: &Path) -> usize {
            let name = prefix.file_name().unwrap().to_string_lossy().into_owned();
            name.rsplit('T').next().unwrap().parse().unwrap()
        }
    }

    impl RegistrationEngine for MockEngine {
        fn transform_kind(&self) -> TransformKind {
            TransformKind::Affine
        }

        fn register(&self, io: &dyn ImageIo, req: &RegistrationRequest<'_>) -> Result<()> {
            let it = Self::time_index(req.transform_prefix);
            if self.fail_times.contains(&it) {
                return Ok(()); // engine ran but produced no artifacts
            }
            let mut m = Matrix4::identity();
            m[(0, 3)] = it as f64 * 0.1;
            matrix::write_matrix(
                &with_suffix(req.transform_prefix, "0GenericAffine.mat"),
                &m,
            )?;
            let vol = io.load_3d(req.src)?;
            io.save_3d(req.output, &vol)
        }

        fn apply_transform(
            &self,
            io: &dyn ImageIo,
            src: &Path,
            _dest: &Path,
            transform: &Path,
            output: &Path,
            _interp: Interp,
        ) -> Result<()> {
            matrix::read_matrix(transform)?;
            let vol = io.load_3d(src)?;
            io.save_3d(output, &vol)
        }
    }

    fn mock_data(
        io: &MemoryIo,
        orientation: &str,
        nz: usize,
        nt: usize,
        target_value: f64,
    ) -> Volume4D {
        let orientation: Orientation = orientation.parse().unwrap();
        // voxel value = timepoint index, constant within a volume
        let data = Array4::from_shape_fn((4, 4, nz, nt), |(_, _, _, it)| it as f64);
        let vol = Volume4D {
            data,
            spacing: [2.0, 2.0, 5.0, 1.5],
            orientation,
        };
        io.insert_4d("dmri.nii.gz", vol.clone());
        io.insert_3d(
            "target.nii.gz",
            Volume3D {
                data: ndarray::Array3::from_elem((4, 4, nz), target_value),
                spacing: [2.0, 2.0, 5.0],
                orientation,
            },
        );
        vol
    }

    fn test_params(tag: &str) -> MocoParams {
        let base = std::env::temp_dir().join(format!("slicemoco_moco_{}_{}", tag, std::process::id()));
        MocoParams {
            fname_data: "dmri.nii.gz".into(),
            fname_target: "target.nii.gz".into(),
            folder_mat: base.join("mat_moco"),
            mat_final: base.join("mat_final"),
            path_tmp: PathBuf::from(format!("tmp_{}", tag)),
            verbose: 0,
            ..MocoParams::default()
        }
    }

    #[test]
    fn test_every_job_ends_with_one_transform() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 2, 6, 0.0);
        let params = test_params("complete");
        let out = moco(&params, &io, &MockEngine::failing(&[2])).unwrap();

        assert_eq!(out.mat_prefixes.len(), 1); // axial: one Z row
        assert_eq!(out.mat_prefixes[0].len(), 6);
        for prefix in &out.mat_prefixes[0] {
            assert!(with_suffix(prefix, "0GenericAffine.mat").is_file());
        }
        // the failed job borrowed its nearest good neighbour (t=1)
        let m2 =
            matrix::read_matrix(&with_suffix(&out.mat_prefixes[0][2], "0GenericAffine.mat"))
                .unwrap();
        assert_relative_eq!(m2[(0, 3)], 0.1, epsilon = 1e-12);

        // reassembly preserved timepoint order
        let vol = out.volume.unwrap();
        assert_eq!(vol.dim(), (4, 4, 2, 6));
        for it in 0..6 {
            assert_eq!(vol.data[(0, 0, 0, it)], it as f64);
        }
        assert!(io.exists(Path::new("dmri_moco.nii.gz")));
    }

    #[test]
    fn test_total_failure_aborts_without_output() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 2, 4, 0.0);
        let params = test_params("fatal");
        let err = moco(&params, &io, &MockEngine::failing(&[0, 1, 2, 3])).unwrap_err();
        let moco_err = err.downcast::<crate::error::MocoError>().unwrap();
        assert!(matches!(
            moco_err,
            crate::error::MocoError::NoGoodTransform { slice: 0 }
        ));
        assert!(!io.exists(Path::new("dmri_moco.nii.gz")));
    }

    #[test]
    fn test_sagittal_grid_and_reassembly() {
        let io = MemoryIo::new();
        let input = mock_data(&io, "AIL", 3, 4, 0.0);
        let mut params = test_params("sagittal");
        params.is_sagittal = true;
        let out = moco(&params, &io, &MockEngine::reliable()).unwrap();

        // one job row per slice
        assert_eq!(out.mat_prefixes.len(), 3);
        for row in &out.mat_prefixes {
            assert_eq!(row.len(), 4);
        }
        // slices reassembled along Z in enumeration order
        let vol = out.volume.unwrap();
        assert_eq!(vol.dim(), input.dim());
        assert_eq!(vol.data, input.data);
    }

    #[test]
    fn test_sagittal_mask_slice_count_mismatch_is_fatal() {
        let io = MemoryIo::new();
        mock_data(&io, "AIL", 3, 4, 0.0);
        io.insert_3d(
            "mask.nii.gz",
            Volume3D {
                data: ndarray::Array3::from_elem((4, 4, 1), 1.0),
                spacing: [2.0, 2.0, 5.0],
                orientation: "AIL".parse().unwrap(),
            },
        );
        let mut params = test_params("short_mask");
        params.is_sagittal = true;
        params.fname_mask = Some("mask.nii.gz".into());
        let err = moco(&params, &io, &MockEngine::reliable()).unwrap_err();
        assert!(err.to_string().contains("mask has 1 slices"));
    }

    #[test]
    fn test_estimate_only_produces_no_volume() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 1, 3, 0.0);
        let mut params = test_params("estimate");
        params.todo = Todo::Estimate;
        let out = moco(&params, &io, &MockEngine::reliable()).unwrap();
        assert!(out.volume.is_none());
        assert!(out.fname_output.is_none());
        assert!(!io.exists(Path::new("dmri_moco.nii.gz")));
        for prefix in &out.mat_prefixes[0] {
            assert!(with_suffix(prefix, "0GenericAffine.mat").is_file());
        }
    }

    #[test]
    fn test_target_warm_up_running_mean() {
        let io = MemoryIo::new();
        // timepoint volumes are constant 0, 1, 2; initial target constant 10
        mock_data(&io, "RPI", 1, 3, 10.0);
        let params = test_params("warmup");
        moco(&params, &io, &MockEngine::reliable()).unwrap();

        // t3 = (10 + 0 + 1 + 2) / 4
        let target = io.load_3d(&params.path_tmp.join("target.nii.gz")).unwrap();
        assert_relative_eq!(target.data[(0, 0, 0)], 13.0 / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_warm_up_disabled_leaves_target_untouched() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 1, 3, 10.0);
        let mut params = test_params("no_warmup");
        params.iter_avg = false;
        moco(&params, &io, &MockEngine::reliable()).unwrap();
        let target = io.load_3d(&params.path_tmp.join("target.nii.gz")).unwrap();
        assert_relative_eq!(target.data[(0, 0, 0)], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_soft_mask_weights_sources_and_target() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 1, 2, 8.0);
        io.insert_3d(
            "mask.nii.gz",
            Volume3D {
                data: ndarray::Array3::from_elem((4, 4, 1), 0.5),
                spacing: [2.0, 2.0, 5.0],
                orientation: Orientation::RPI,
            },
        );
        let mut params = test_params("softmask");
        params.fname_mask = Some("mask.nii.gz".into());
        params.iter_avg = false;
        moco(&params, &io, &MockEngine::reliable()).unwrap();

        // the target was premultiplied at init
        let target = io.load_3d(&params.path_tmp.join("target.nii.gz")).unwrap();
        assert_relative_eq!(target.data[(0, 0, 0)], 4.0, epsilon = 1e-12);
        // and each source was weighted before registration
        let src = io
            .load_3d(&params.path_tmp.join("data_Z0000T0001.nii.gz"))
            .unwrap();
        assert_relative_eq!(src.data[(0, 0, 0)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_grouped_driver_fills_one_mat_per_native_timepoint() {
        let io = MemoryIo::new();
        mock_data(&io, "RPI", 2, 6, 0.0);
        let mut params = test_params("grouped");
        params.group_size = 2;
        let out = run_dmri_moco(&params, &io, &MockEngine::reliable()).unwrap();

        for it in 0..6 {
            let path = params
                .mat_final
                .join(format!("{}0GenericAffine.mat", indexer::mat_basename(0, it)));
            assert!(path.is_file(), "missing final mat for t={}", it);
            // each native timepoint carries its group's transform
            let m = matrix::read_matrix(&path).unwrap();
            assert_relative_eq!(m[(0, 3)], (it / 2) as f64 * 0.1, epsilon = 1e-12);
        }
        let vol = out.volume.unwrap();
        assert_eq!(vol.dim(), (4, 4, 2, 6));
    }
}
