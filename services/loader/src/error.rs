//! Error taxonomy for the load pipeline.
//!
//! Row-level validation problems are NOT errors: they are counted, logged
//! and the row is dropped. Everything that can abort a run lives here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    /// Bad or incomplete configuration. Fatal before any chunk is read.
    #[error("configuration error: {0}")]
    Config(String),

    /// Two source columns normalize to the same field name.
    #[error("column name collision: '{0}' appears more than once after normalization")]
    NameCollision(String),

    /// The header row is missing a column the pipeline requires.
    #[error("missing required column: no header matches any of {0:?}")]
    MissingColumn(&'static [&'static str]),

    /// A warehouse read/write failed for a reason worth retrying.
    #[error("transient warehouse error: {0}")]
    Transient(String),

    /// Anything else that aborts the remaining run. Chunks already
    /// committed stay committed.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
