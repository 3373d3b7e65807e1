use vellum_core::registry::CodecError;

/// Error type for `PostgreSQL` store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A payload could not be encoded or decoded through the type registry.
    #[error("codec error: {0} (hint: register every stored event and snapshot shape)")]
    Codec(#[from] CodecError),
    /// A version column held a value that is not a valid log version.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
    /// A log version does not fit in a `BIGINT` column.
    #[error("version {0} does not fit in a BIGINT column")]
    VersionOverflow(u64),
}
