use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op} failed on {}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    View(#[from] ndview::ViewError),

    #[error("array is not backed by a mapped file")]
    NotMemmapBacked,

    #[error("backing file path {} is not valid utf-8", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("strided descriptor is missing total_buffer_len")]
    MissingTotalLen,

    #[error("failed to encode wire payload")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode wire payload")]
    Decode(#[from] bincode::error::DecodeError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
