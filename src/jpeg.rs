use std::fs;
use std::path::Path;

use log::info;

use crate::error::{Error, Result};

/// Start of image, expected at offset 0 of every input.
pub const SOI: [u8; 2] = [0xff, 0xd8];
/// Comment segment marker. The big-endian length that follows counts itself.
pub const COM: [u8; 2] = [0xff, 0xfe];

/// One input image with its start-of-image marker stripped.
///
/// The marker is written once at the head of the shared buffer, so every image body that gets
/// chained in starts directly with its first real segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    /// Base name of the input file, reused for the matching output file.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl RawImage {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        if bytes.len() < SOI.len() || bytes[..SOI.len()] != SOI {
            return Err(Error::NotAJpeg { path: name });
        }

        Ok(RawImage {
            name,
            bytes: bytes[SOI.len()..].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

pub fn load_image(path: &Path) -> Result<RawImage> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let image = RawImage::from_bytes(name, &bytes).map_err(|_| Error::NotAJpeg {
        path: path.display().to_string(),
    })?;
    info!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(image)
}

/// Loads every image up front so a bad input aborts before any collision search starts.
pub fn load_images<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<RawImage>> {
    paths.iter().map(|path| load_image(path.as_ref())).collect()
}
