//! Image-directory frame source for offline runs.

use footfall_core::{Frame, FrameSource, SourceError};
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("cannot read replay directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images in {0}")]
    Empty(PathBuf),
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Plays the images of a directory back in file-name order, converted to
/// luma. The stream ends after the last image.
#[derive(Debug)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    pub fn open(dir: &Path) -> Result<Self, ReplayError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ReplayError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        if paths.is_empty() {
            return Err(ReplayError::Empty(dir.to_path_buf()));
        }
        paths.sort();

        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.paths.len() - self.next
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode any supported image file into a luma frame.
pub fn load_luma(path: &Path) -> Result<Frame, ReplayError> {
    let img = image::open(path).map_err(|source| ReplayError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let luma = img.into_luma8();
    let (w, h) = luma.dimensions();
    Ok(Frame::new(luma.into_raw(), w, h))
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let sequence = self.next as u32;
        self.next += 1;

        let frame = load_luma(path).map_err(|e| SourceError::ReadFailed(e.to_string()))?;
        tracing::trace!(path = %path.display(), sequence, "replay frame");
        Ok(Some(frame.with_sequence(sequence)))
    }

    fn reset(&mut self) -> Result<(), SourceError> {
        self.next = 0;
        Ok(())
    }
}
