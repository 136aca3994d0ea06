/// Centralized error types for the candle store
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CandleError {
    // Bar Model Errors
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),

    // Storage Errors
    #[error("Disk write failed: {0}")]
    DiskWriteFailed(String),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Tier unavailable: {tier} - {reason}")]
    TierUnavailable { tier: String, reason: String },

    // Collaborator Errors
    #[error("History source error: {0}")]
    HistorySource(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Generic Errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CandleError>;

impl CandleError {
    /// Shorthand for a cache-tier outage
    pub fn tier_unavailable(tier: &str, reason: impl Into<String>) -> Self {
        CandleError::TierUnavailable {
            tier: tier.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if error can be absorbed locally (fall to the next tier, retry later)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CandleError::TierUnavailable { .. }
                | CandleError::HistorySource(_)
        )
    }

    /// Check if error must stop the producing unit
    pub fn is_fatal(&self) -> bool {
        matches!(self, CandleError::InvariantViolation(_))
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            CandleError::InvariantViolation(_) => "BAR_001",
            CandleError::InvalidBarData(_) => "BAR_002",
            CandleError::UnknownTimeframe(_) => "BAR_003",
            CandleError::DiskWriteFailed(_) => "DISK_001",
            CandleError::FileError(_) => "DISK_002",
            CandleError::DeserializationError(_) => "DISK_003",
            CandleError::TierUnavailable { .. } => "TIER_001",
            CandleError::HistorySource(_) => "SRC_001",
            CandleError::ConfigError(_) => "CFG_001",
            CandleError::InvalidParameter(_) => "CFG_002",
            CandleError::InternalError(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = CandleError::InvariantViolation("misaligned".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(err.error_code(), "BAR_001");

        let err = CandleError::tier_unavailable("snapshot", "connection refused");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Tier unavailable: snapshot - connection refused");
    }
}
