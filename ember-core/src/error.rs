/// Errors produced by the `ember-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A request field failed validation.
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}
