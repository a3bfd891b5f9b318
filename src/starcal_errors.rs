use thiserror::Error;

/// Crate-wide error type.
///
/// Normal "nothing found" paths (no match, no outlier) are not errors: they
/// are reported through `Option` or empty lists. The variants below cover
/// degenerate inputs, numerical breakdown, and I/O around the diagnostic
/// dumps.
#[derive(Error, Debug)]
pub enum StarcalError {
    #[error("Cholesky factorization failed: normal matrix not positive definite")]
    FactorizationFailed,

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("Singular linear transform (determinant too small)")]
    SingularTransform,

    #[error("Transform of kind '{0}' has no analytical inverse")]
    NotInvertible(&'static str),

    #[error("Unknown whatToFit token: '{0}'")]
    InvalidWhatToFit(String),

    #[error("Invalid match conditions: {0}")]
    InvalidMatchConditions(String),

    #[error("Cannot parse transform: {0}")]
    ParseTransform(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),
}
