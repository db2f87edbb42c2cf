use copro_derive::Error;

/// Errors that stop a script before its first statement runs.
///
/// Timeouts and cancellation are not errors; they are reported through
/// [`RunEnd`](super::machine::RunEnd).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The script has more statements than the line table holds.
    #[error("script exceeds {max} statements")]
    TooManyLines { max: usize },
    /// The script defines more distinct labels than the label table holds.
    #[error("script exceeds {max} labels")]
    TooManyLabels { max: usize },
}
