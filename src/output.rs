use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::chain::ChainLayout;
use crate::error::{Error, Result};
use crate::jpeg::RawImage;

impl ChainLayout {
    /// Number of outputs the layout encodes, one per input image.
    pub fn image_count(&self) -> usize {
        self.substitutions.len() + 1
    }

    /// Bytes of output `index`: the shared buffer with that boundary's B variant swapped in. The
    /// last image needs no swap.
    pub fn render(&self, index: usize) -> Vec<u8> {
        let mut output = self.buffer.clone();
        if let Some(sub) = self.substitutions.get(index) {
            output[sub.position..sub.position + sub.b.len()].copy_from_slice(&sub.b);
        }
        output
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| Error::io(path, e))?;
    info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Writes one file per image into `output_dir`, named after the input.
///
/// The shared buffer is toggled in place rather than copied per output; it is back to all-A
/// variants when this returns successfully. Files already written are left behind on error.
pub fn write_outputs(
    layout: &mut ChainLayout,
    images: &[RawImage],
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    debug_assert_eq!(images.len(), layout.image_count());
    let mut written = Vec::with_capacity(images.len());

    if let Some(last) = images.last() {
        let path = output_dir.join(&last.name);
        write_file(&path, &layout.buffer)?;
        written.push(path);
    }

    let ChainLayout {
        buffer,
        substitutions,
    } = layout;
    for (sub, image) in substitutions.iter().zip(images.iter()) {
        let window = sub.position..sub.position + sub.b.len();
        buffer[window.clone()].copy_from_slice(&sub.b);
        let path = output_dir.join(&image.name);
        let result = write_file(&path, &buffer[..]);
        buffer[window].copy_from_slice(&sub.a);
        result?;
        written.push(path);
    }

    Ok(written)
}
