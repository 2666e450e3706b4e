use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_errors_carry_their_message() {
        let err = InfraError::telemetry("subscriber already installed");
        assert_eq!(
            err.to_string(),
            "telemetry initialization failed: subscriber already installed"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: InfraError = std::io::Error::other("broken pipe").into();
        assert!(matches!(err, InfraError::Io(_)));
    }
}
