//! Disk layer: the private cache directory and per-image files.
//!
//! One directory per process, created from a unique template under the
//! platform temp dir and removed when the engine is dropped. Inside it,
//! one flat file per image named `img-<id>`.

use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// The engine's private image cache directory.
#[derive(Debug)]
pub struct CacheDir {
    dir: TempDir,
}

impl CacheDir {
    /// Creates a fresh cache directory `<tempdir>/<prefix>-XXXXXX`.
    pub fn new(prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir()?;
        info!("image cache directory: {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Re-creates the directory if it disappeared during operation.
    pub fn ensure(&self) -> io::Result<()> {
        if !self.dir.path().is_dir() {
            warn!("cache directory vanished, re-creating {:?}", self.dir.path());
            fs::create_dir_all(self.dir.path())?;
        }
        Ok(())
    }

    /// Path of the cache file for an image id, `img-<id>` with the id
    /// zero-padded to at least 3 digits.
    pub fn image_path(&self, image_id: u32) -> PathBuf {
        self.dir.path().join(format!("img-{image_id:03}"))
    }

    /// Opens the image's cache file for appending, creating it if needed.
    pub fn open_for_append(&self, image_id: u32) -> io::Result<File> {
        self.ensure()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.image_path(image_id))
    }

    /// Size of the image's cache file, or 0 if absent.
    pub fn file_size(&self, image_id: u32) -> u64 {
        fs::metadata(self.image_path(image_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Deletes the image's cache file. Returns the bytes freed.
    pub fn remove(&self, image_id: u32) -> u64 {
        let path = self.image_path(image_id);
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => debug!("deleted cache file {path:?} ({size} bytes)"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to delete cache file {path:?}: {e}"),
        }
        size
    }

    /// Copies an uploaded source file into the cache. Returns the number
    /// of bytes copied.
    pub fn copy_into(&self, source: &Path, image_id: u32) -> io::Result<u64> {
        self.ensure()?;
        fs::copy(source, self.image_path(image_id))
    }
}
