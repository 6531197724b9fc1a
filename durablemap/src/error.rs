use std::io;
use thiserror::Error;

/// Errors that can occur when working with durable maps and their storages
#[derive(Error, Debug)]
pub enum DurableMapError {
    /// IO errors when reading/writing to disk
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Decoding errors when converting bytes back to data
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// On-disk data doesn't match the expected layout
    #[error("Corrupted storage: {0}")]
    Corrupted(String),

    /// Operation requires an existing key, but the key is absent
    #[error("Key not found")]
    KeyNotFound,

    /// One or more owned resources failed to close
    #[error("Failed to close [{resources}]: {source}")]
    Close {
        resources: String,
        #[source]
        source: Box<DurableMapError>,
    },
}

pub type Result<T> = std::result::Result<T, DurableMapError>;

impl From<std::str::Utf8Error> for DurableMapError {
    fn from(err: std::str::Utf8Error) -> Self {
        DurableMapError::Decoding(err.to_string())
    }
}

/// Closes every resource in `closers`, even if an earlier one fails.
///
/// The first failure is returned wrapped in [`DurableMapError::Close`], which names
/// all the resources that were attempted.
pub(crate) fn close_all<'a>(
    closers: impl IntoIterator<Item = (&'a str, Box<dyn FnOnce() -> Result<()> + 'a>)>,
) -> Result<()> {
    let mut names = Vec::new();
    let mut first_error = None;
    for (name, close) in closers {
        names.push(name);
        if let Err(e) = close() {
            tracing::warn!(resource = name, error = %e, "failed to close resource");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(DurableMapError::Close {
            resources: names.join(", "),
            source: Box::new(e),
        }),
    }
}
