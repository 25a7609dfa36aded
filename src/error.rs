//! Failure kinds of the editing pipeline

/// Soft kinds (`LandmarkNotFound`, `DataExhausted`) are logged and counted but never
/// escape the sampling loop. The rest terminate the affected unit of work.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("no eye landmarks found on target image")]
    LandmarkNotFound,
    #[error("image source exhausted after {0} pairs, restarting from the first pair")]
    DataExhausted(usize),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to load collaborator '{name}': {reason}")]
    CollaboratorLoadFailure { name: String, reason: String },
    #[error("non-finite {what} at step {step}")]
    NumericInstability { step: usize, what: &'static str },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl EditError {
    /// Soft failures are recorded and the run continues.
    pub fn is_soft(&self) -> bool {
        matches!(self, EditError::LandmarkNotFound | EditError::DataExhausted(_))
    }

    /// Short stable key used by the diagnostic accumulator.
    pub fn kind(&self) -> &'static str {
        match self {
            EditError::LandmarkNotFound => "landmark_not_found",
            EditError::DataExhausted(_) => "data_exhausted",
            EditError::DeviceUnavailable(_) => "device_unavailable",
            EditError::CollaboratorLoadFailure { .. } => "collaborator_load_failure",
            EditError::NumericInstability { .. } => "numeric_instability",
            EditError::InvalidConfig(_) => "invalid_config",
        }
    }
}
