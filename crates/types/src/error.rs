//! Error types for the Sky storage engine using snafu.
//!
//! One unified error enum covers the stable taxonomy exposed to callers:
//! database and table lifecycle, schema validation, factor lookups, event
//! codec failures, and substrate errors. Validation errors surface
//! unchanged; substrate errors preserve their original cause in the
//! message.

use snafu::{Location, Snafu};

/// Unified result type for storage operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type for storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The database is already open.
    #[snafu(display("database already open"))]
    DatabaseOpen,

    /// An operation was attempted while the database is not open.
    #[snafu(display("database not open"))]
    DatabaseNotOpen,

    /// A table with this name already exists.
    #[snafu(display("table already exists: {name}"))]
    TableExists {
        /// Table name.
        name: String,
    },

    /// The named table does not exist.
    #[snafu(display("table not found: {name}"))]
    TableNotFound {
        /// Table name.
        name: String,
    },

    /// A table operation was issued without a table name.
    #[snafu(display("table name required"))]
    TableNameRequired,

    /// An operation was attempted on a table that is not open.
    #[snafu(display("table not open: {name}"))]
    TableNotOpen {
        /// Table name.
        name: String,
    },

    /// The persisted table meta record could not be encoded or decoded.
    #[snafu(display("table meta error: {message}"))]
    TableMeta {
        /// Description of the meta failure.
        message: String,
    },

    /// A property with this name already exists.
    #[snafu(display("property already exists: {name}"))]
    PropertyExists {
        /// Property name.
        name: String,
    },

    /// The named property is not bound in the schema.
    #[snafu(display("property not found: {name}"))]
    PropertyNotFound {
        /// Property name.
        name: String,
    },

    /// A property name contains characters outside `[0-9A-Za-z_]` or is
    /// empty.
    #[snafu(display("invalid property name: {name:?}"))]
    InvalidPropertyName {
        /// The rejected name.
        name: String,
    },

    /// A property data type is not one of the supported types.
    #[snafu(display("invalid data type: {name:?}"))]
    InvalidDataType {
        /// The rejected type name.
        name: String,
    },

    /// An event operation was issued without an object identifier.
    #[snafu(display("object id required"))]
    ObjectIdRequired,

    /// A factor was dereferenced that has not previously been factorized.
    #[snafu(display("factor not found: {property_id}: {factor}"))]
    FactorNotFound {
        /// Property the factor belongs to.
        property_id: i64,
        /// The missing factor value or index.
        factor: String,
    },

    /// Event encode or decode failed.
    #[snafu(display("codec error at {location}: {message}"))]
    Codec {
        /// Description of the codec failure.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Substrate (key-value store) error.
    #[snafu(display("storage error at {location}: {message}"))]
    Storage {
        /// Description carrying the substrate's original cause.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Filesystem I/O error.
    #[snafu(display("i/o error at {location}: {source}"))]
    Io {
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },
}
