use anyhow::{bail, Context, Result};
use ndarray::{concatenate, Array3, Array4, Axis};
use std::fmt;
use std::str::FromStr;

/// Three-letter anatomical axis code (e.g. "RPI"), one letter per data axis.
///
/// The third letter decides the job decomposition: if the slice axis points
/// left or right the acquisition is sagittal and each slice is registered
/// as an independent 2D problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation([u8; 3]);

impl Orientation {
    pub const RPI: Orientation = Orientation(*b"RPI");

    /// True when the slice (third) axis is left-right oriented.
    pub fn is_sagittal(&self) -> bool {
        self.0[2] == b'L' || self.0[2] == b'R'
    }
}

impl FromStr for Orientation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            bail!("orientation code must have exactly 3 letters, got '{}'", s);
        }
        for &b in bytes {
            if !b"RLAPIS".contains(&b) {
                bail!("orientation letter '{}' not in RLAPIS", b as char);
            }
        }
        Ok(Orientation([bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// A 3D volume (one timepoint, or one 2D slice kept with a singleton third
/// axis so it remains stackable along Z).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume3D {
    pub data: Array3<f64>,
    pub spacing: [f64; 3],
    pub orientation: Orientation,
}

/// A 4D time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume4D {
    pub data: Array4<f64>,
    pub spacing: [f64; 4],
    pub orientation: Orientation,
}

impl Volume3D {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Split along the slice axis, keeping a singleton third dimension in
    /// each piece so the pieces concatenate back without reshaping.
    pub fn split_z(&self) -> Vec<Volume3D> {
        let (_, _, nz) = self.dim();
        (0..nz)
            .map(|iz| Volume3D {
                data: self
                    .data
                    .slice(ndarray::s![.., .., iz..iz + 1])
                    .to_owned(),
                spacing: self.spacing,
                orientation: self.orientation,
            })
            .collect()
    }

    /// Voxel-wise multiplication, used to bake soft masks into the data.
    pub fn multiply(&mut self, other: &Volume3D) -> Result<()> {
        if self.dim() != other.dim() {
            bail!(
                "cannot multiply volumes of shape {:?} and {:?}",
                self.dim(),
                other.dim()
            );
        }
        self.data *= &other.data;
        Ok(())
    }

    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|v| **v != 0.0).count()
    }

    /// Copy spacing and orientation from another volume. Registration engines
    /// working in 2D return headerless slices; this restores their geometry.
    pub fn copy_meta_from(&mut self, src: &Volume3D) {
        self.spacing = src.spacing;
        self.orientation = src.orientation;
    }
}

impl Volume4D {
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    /// Split along time into one 3D volume per timepoint, ascending `it`.
    pub fn split_t(&self) -> Vec<Volume3D> {
        let nt = self.dim().3;
        (0..nt)
            .map(|it| Volume3D {
                data: self.data.index_axis(Axis(3), it).to_owned(),
                spacing: [self.spacing[0], self.spacing[1], self.spacing[2]],
                orientation: self.orientation,
            })
            .collect()
    }

    /// Split along the slice axis into per-slice 4D volumes (nz = 1 each),
    /// ascending `iz`.
    pub fn split_z(&self) -> Vec<Volume4D> {
        let nz = self.dim().2;
        (0..nz)
            .map(|iz| Volume4D {
                data: self
                    .data
                    .slice(ndarray::s![.., .., iz..iz + 1, ..])
                    .to_owned(),
                spacing: self.spacing,
                orientation: self.orientation,
            })
            .collect()
    }

    /// Concatenate 3D volumes along time, in the order given.
    pub fn concat_t(vols: &[Volume3D], pt: f64) -> Result<Volume4D> {
        if vols.is_empty() {
            bail!("cannot concatenate an empty list of volumes along T");
        }
        let views: Vec<_> = vols
            .iter()
            .map(|v| v.data.view().insert_axis(Axis(3)))
            .collect();
        let data =
            concatenate(Axis(3), &views).context("volume shapes do not agree along T")?;
        let first = &vols[0];
        Ok(Volume4D {
            data,
            spacing: [first.spacing[0], first.spacing[1], first.spacing[2], pt],
            orientation: first.orientation,
        })
    }

    /// Concatenate per-slice 4D volumes back along the slice axis.
    pub fn concat_z(vols: &[Volume4D]) -> Result<Volume4D> {
        if vols.is_empty() {
            bail!("cannot concatenate an empty list of volumes along Z");
        }
        let views: Vec<_> = vols.iter().map(|v| v.data.view()).collect();
        let data =
            concatenate(Axis(2), &views).context("volume shapes do not agree along Z")?;
        Ok(Volume4D {
            data,
            spacing: vols[0].spacing,
            orientation: vols[0].orientation,
        })
    }
}

/// Voxel-wise mean of several 3D volumes, used when grouping timepoints
/// before registration.
pub fn mean_volumes(vols: &[Volume3D]) -> Result<Volume3D> {
    let first = match vols.first() {
        Some(v) => v,
        None => bail!("cannot average an empty list of volumes"),
    };
    let mut acc = first.data.clone();
    for vol in &vols[1..] {
        if vol.dim() != first.dim() {
            bail!(
                "cannot average volumes of shape {:?} and {:?}",
                first.dim(),
                vol.dim()
            );
        }
        acc += &vol.data;
    }
    acc /= vols.len() as f64;
    Ok(Volume3D {
        data: acc,
        spacing: first.spacing,
        orientation: first.orientation,
    })
}
