use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the retry layer should treat a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Safe to retry with backoff.
    Retryable,
    /// Retryable at most once within the same budget.
    RetryableOnce,
    /// Re-thrown immediately; retrying cannot help.
    Terminal,
}

/// The closed failure taxonomy observed at every component boundary.
/// Adapters classify raw vendor failures into one of these before returning.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation timed out")]
    Timeout,

    #[error("network error: {detail}")]
    Network { detail: String },

    #[error("transient upstream error (HTTP {status})")]
    #[serde(rename = "TRANSIENT_5XX")]
    Transient5xx { status: u16 },

    #[error("stale browser tab")]
    StaleTab,

    #[error("browser tab held by another run")]
    TabContended,

    #[error("authentication failed for {platform}")]
    AuthFailed { platform: String },

    #[error("platform {platform} is down")]
    PlatformDown { platform: String },

    #[error("circuit open for {platform}")]
    CircuitOpen { platform: String },

    #[error("not found")]
    NotFound,

    #[error("parse error: {detail}")]
    ParseError { detail: String },

    #[error("vehicle could not be resolved")]
    VehicleUnresolved,
}

impl SourceError {
    pub fn network(detail: impl Into<String>) -> Self {
        Self::Network {
            detail: detail.into(),
        }
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::ParseError {
            detail: detail.into(),
        }
    }

    pub fn auth_failed(platform: impl Into<String>) -> Self {
        Self::AuthFailed {
            platform: platform.into(),
        }
    }

    pub fn platform_down(platform: impl Into<String>) -> Self {
        Self::PlatformDown {
            platform: platform.into(),
        }
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::Network { .. } | Self::Transient5xx { .. } | Self::StaleTab => {
                FailureClass::Retryable
            }
            Self::DeadlineExceeded => FailureClass::RetryableOnce,
            Self::TabContended
            | Self::AuthFailed { .. }
            | Self::PlatformDown { .. }
            | Self::CircuitOpen { .. }
            | Self::NotFound
            | Self::ParseError { .. }
            | Self::VehicleUnresolved => FailureClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Retryable
    }

    /// The taxonomy code, stable across releases; used in warnings and
    /// stage status records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::Network { .. } => "NETWORK",
            Self::Transient5xx { .. } => "TRANSIENT_5XX",
            Self::StaleTab => "STALE_TAB",
            Self::TabContended => "TAB_CONTENDED",
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::PlatformDown { .. } => "PLATFORM_DOWN",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::NotFound => "NOT_FOUND",
            Self::ParseError { .. } => "PARSE_ERROR",
            Self::VehicleUnresolved => "VEHICLE_UNRESOLVED",
        }
    }
}

/// Data-quality codes attached to results rather than thrown.
pub mod warn_codes {
    pub const INVALID_LABOR: &str = "INVALID_LABOR";
    pub const NO_PRICE: &str = "NO_PRICE";
    pub const PRICING_GATE_BLOCKED: &str = "PRICING_GATE_BLOCKED";
    pub const BROWSER_ORPHANED: &str = "BROWSER_ORPHANED";
    pub const STAGE_FAILED: &str = "STAGE_FAILED";
    pub const STAGE_SKIPPED: &str = "STAGE_SKIPPED";
    pub const LOW_CONFIDENCE: &str = "LOW_CONFIDENCE";
}

/// An ordered, user-presentable warning on an estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_partition_matches_taxonomy() {
        assert!(SourceError::Timeout.is_retryable());
        assert!(SourceError::StaleTab.is_retryable());
        assert!(SourceError::network("reset").is_retryable());
        assert!(SourceError::Transient5xx { status: 503 }.is_retryable());

        assert!(!SourceError::auth_failed("partstech").is_retryable());
        assert!(!SourceError::NotFound.is_retryable());
        assert!(!SourceError::parse("bad shape").is_retryable());
        assert_eq!(
            SourceError::DeadlineExceeded.classify(),
            FailureClass::RetryableOnce
        );
    }

    #[test]
    fn codes_round_trip_through_serde_tag() {
        let err = SourceError::CircuitOpen {
            platform: "prodemand".to_string(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "CIRCUIT_OPEN");
        let back: SourceError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}
