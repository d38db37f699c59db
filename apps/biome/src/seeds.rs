//! Seed images the user can restart the world from.
//!
//! Seeds live as plain image files in one directory. The server fetches a
//! seed by URL, so a local seed is sent inline as a `data:` URL.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, ImageOutputFormat};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const SEEDS_DIR_NAME: &str = "seeds";
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 80;

const SEED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Seed file not found: {0}")]
    NotFound(String),
    #[error("Invalid seed name: {0}")]
    InvalidName(String),
    #[error("seed I/O error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("seed image could not be processed: {0}")]
    Image(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SeedError + '_ {
    move |source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_seed_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SEED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
        _ => "image/jpeg",
    }
}

/// Read-only view of the seeds directory, apart from [`SeedLibrary::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedLibrary {
    dir: PathBuf,
}

impl SeedLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies bundled seeds into the library, keeping files already there.
    /// Returns how many were copied.
    pub fn initialize(&self, bundled: &Path) -> Result<usize, SeedError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        if !bundled.is_dir() {
            debug!(target: "biome::seeds", dir = %bundled.display(), "no bundled seeds");
            return Ok(0);
        }
        let mut copied = 0;
        for entry in fs::read_dir(bundled).map_err(io_error(bundled))?.flatten() {
            let source = entry.path();
            let (true, Some(name)) = (is_seed_image(&source), source.file_name()) else {
                continue;
            };
            let target = self.dir.join(name);
            if target.exists() {
                continue;
            }
            fs::copy(&source, &target).map_err(io_error(&target))?;
            copied += 1;
        }
        info!(target: "biome::seeds", copied, dir = %self.dir.display(), "seeds initialized");
        Ok(copied)
    }

    /// Image file names in the library, sorted. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<String>, SeedError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .map_err(io_error(&self.dir))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_seed_image(path))
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn read_base64(&self, name: &str) -> Result<String, SeedError> {
        let path = self.resolve(name)?;
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        Ok(BASE64.encode(bytes))
    }

    /// The seed as a `data:image/...;base64,` URL for `prompt_with_seed`.
    pub fn data_url(&self, name: &str) -> Result<String, SeedError> {
        let path = self.resolve(name)?;
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        Ok(format!("data:{};base64,{}", mime_type(&path), BASE64.encode(bytes)))
    }

    /// A JPEG no larger than `max_size` on either side, base64 encoded.
    pub fn thumbnail_base64(&self, name: &str, max_size: Option<u32>) -> Result<String, SeedError> {
        let path = self.resolve(name)?;
        let max = max_size.unwrap_or(DEFAULT_THUMBNAIL_SIZE).max(1);
        let image = image::open(&path).map_err(|err| SeedError::Image(err.to_string()))?;
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image.thumbnail(max, max).to_rgb8())
            .write_to(&mut out, ImageOutputFormat::Jpeg(85))
            .map_err(|err| SeedError::Image(err.to_string()))?;
        Ok(BASE64.encode(out.into_inner()))
    }

    /// Path of a seed that exists inside the library.
    fn resolve(&self, name: &str) -> Result<PathBuf, SeedError> {
        let plain = Path::new(name)
            .file_name()
            .is_some_and(|file| file == name);
        if !plain || !is_seed_image(Path::new(name)) {
            return Err(SeedError::InvalidName(name.to_string()));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(SeedError::NotFound(name.to_string()));
        }
        let root = self.dir.canonicalize().map_err(io_error(&self.dir))?;
        let real = path.canonicalize().map_err(io_error(&path))?;
        if !real.starts_with(&root) {
            return Err(SeedError::InvalidName(name.to_string()));
        }
        Ok(real)
    }
}
