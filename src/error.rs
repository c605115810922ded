use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A field value failed its enforcement rule.
    #[error("Invalid value for field '{key}': {message}")]
    Enforce { key: String, message: String },

    /// A record is missing mandatory information or cannot become an item.
    #[error("Invalid entry: {0}")]
    Entry(String),

    /// An insert collided with an existing record name.
    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lookup expected one match and found several.
    #[error("Ambiguous match: {0}")]
    Ambiguous(String),

    /// A type name or factory path could not be resolved.
    #[error("Unable to resolve '{target}': {reason}")]
    Resolution { target: String, reason: String },

    /// A schema or field descriptor is set up incorrectly.
    #[error("Container error: {0}")]
    Container(String),

    /// Malformed search arguments (bad range bounds, bad pattern).
    #[error("Search error: {0}")]
    Search(String),

    /// Storage unreachable or corrupt.
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
