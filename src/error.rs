use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure aborts the run; nothing here is retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{path}: not a jpeg (missing FF D8 start-of-image marker)")]
    NotAJpeg { path: String },

    #[error("need at least two images, got {0}")]
    InsufficientImages(usize),

    #[error("buffer wrong size {0}: not a multiple of 64 bytes")]
    Size(usize),

    #[error("missing comment block: collision pair lacks FF FE 00 at offset 56")]
    MissingCommentBlock,

    #[error("digest mismatch between the two collision variants")]
    DigestMismatch,

    #[error("wrong size difference: {b} {a}")]
    WrongSizeDelta { a: u8, b: u8 },

    #[error("comment size not large enough: {size} (minimum {minimum})")]
    CommentTooShort { size: u8, minimum: u8 },

    #[error("jump over image {image} needs a {size} byte comment, more than a 16-bit length can hold")]
    JumpTooLong { image: usize, size: usize },

    #[error("prefix has only {available} bytes but {wanted} were requested")]
    PrefixTooShort { wanted: usize, available: usize },

    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
