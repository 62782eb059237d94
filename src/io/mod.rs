pub mod matrix;
pub mod report;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::volume::{Volume3D, Volume4D};

/// Port to the external image I/O service.
///
/// The pipeline addresses every volume by path and never interprets image
/// formats itself; format decoding, header juggling and orientation
/// conversion live behind this trait.
pub trait ImageIo: Sync {
    fn load_3d(&self, path: &Path) -> Result<Volume3D>;
    fn save_3d(&self, path: &Path, vol: &Volume3D) -> Result<()>;
    fn load_4d(&self, path: &Path) -> Result<Volume4D>;
    fn save_4d(&self, path: &Path, vol: &Volume4D) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

enum Stored {
    V3(Volume3D),
    V4(Volume4D),
}

/// Thread-safe, path-keyed in-memory image store.
///
/// Serves as the shipped [`ImageIo`] implementation for tests and for
/// embedders that already hold decoded voxel data; a NIfTI- or DICOM-backed
/// implementation belongs to the embedding application.
#[derive(Default)]
pub struct MemoryIo {
    inner: Mutex<HashMap<PathBuf, Stored>>,
}

impl MemoryIo {
    pub fn new() -> Self {
        MemoryIo::default()
    }

    pub fn insert_3d(&self, path: impl Into<PathBuf>, vol: Volume3D) {
        self.inner
            .lock()
            .expect("image store poisoned")
            .insert(path.into(), Stored::V3(vol));
    }

    pub fn insert_4d(&self, path: impl Into<PathBuf>, vol: Volume4D) {
        self.inner
            .lock()
            .expect("image store poisoned")
            .insert(path.into(), Stored::V4(vol));
    }
}

impl ImageIo for MemoryIo {
    fn load_3d(&self, path: &Path) -> Result<Volume3D> {
        match self.inner.lock().expect("image store poisoned").get(path) {
            Some(Stored::V3(vol)) => Ok(vol.clone()),
            Some(Stored::V4(_)) => Err(anyhow!("{} is a 4D volume", path.display())),
            None => Err(crate::error::MocoError::MissingInput(path.to_path_buf()).into()),
        }
    }

    fn save_3d(&self, path: &Path, vol: &Volume3D) -> Result<()> {
        self.insert_3d(path, vol.clone());
        Ok(())
    }

    fn load_4d(&self, path: &Path) -> Result<Volume4D> {
        match self.inner.lock().expect("image store poisoned").get(path) {
            Some(Stored::V4(vol)) => Ok(vol.clone()),
            Some(Stored::V3(_)) => Err(anyhow!("{} is a 3D volume", path.display())),
            None => Err(crate::error::MocoError::MissingInput(path.to_path_buf()).into()),
        }
    }

    fn save_4d(&self, path: &Path, vol: &Volume4D) -> Result<()> {
        self.insert_4d(path, vol.clone());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("image store poisoned")
            .contains_key(path)
    }
}
