use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid workflow at phase '{phase}': {reason}")]
    InvalidWorkflow { phase: String, reason: String },

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownPhase("deploy".to_string());
        assert!(error.to_string().contains("deploy"));

        let error = CoreError::InvalidWorkflow {
            phase: "apply".to_string(),
            reason: "missing next_phase_on_success".to_string(),
        };
        assert!(error.to_string().contains("apply"));
        assert!(error.to_string().contains("next_phase_on_success"));
    }
}
