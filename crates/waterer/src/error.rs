//! Error taxonomy for the controller and the HTTP boundary.
//!
//! Only `ApiError` ever reaches a user; everything else is logged by the
//! control loop and degrades the cycle instead of ending it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Failure talking to GPIO/SPI. Surfaces as an actuator write error when the
/// pump is driven and as a sensor read error when a signal is sampled.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("gpio error: {0}")]
    Gpio(String),

    #[error("spi error: {0}")]
    Spi(String),
}

/// Transient sensor failure. The reader reuses the last good value.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor read failed: {0}")]
    Hardware(#[from] HardwareError),

    #[error("implausible sensor voltage {0}")]
    Implausible(f64),
}

/// A sqlite write or read failed. Never fatal to the control loop.
#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {0:#}")]
pub struct PersistenceError(#[from] pub anyhow::Error);

#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    #[error("thresholds must be within 0-100 (dry={dry}, wet={wet})")]
    OutOfRange { dry: i64, wet: i64 },

    #[error("dry threshold ({dry}) must be below wet threshold ({wet})")]
    Inverted { dry: i64, wet: i64 },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("manual watering already in progress")]
    Busy,

    #[error("pump write failed: {0}")]
    Actuator(#[from] HardwareError),

    #[error("manual watering task failed: {0}")]
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Threshold(#[from] ThresholdError),

    #[error(transparent)]
    Pump(#[from] PumpError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Threshold(ThresholdError::Persistence(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Threshold(_) => StatusCode::BAD_REQUEST,
            ApiError::Pump(PumpError::Busy) => StatusCode::CONFLICT,
            ApiError::Pump(PumpError::Actuator(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pump(PumpError::Aborted(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {self}");
        }
        let body = json!({
            "code": status.as_u16(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_thresholds_are_bad_requests() {
        let err = ApiError::from(ThresholdError::Inverted { dry: 60, wet: 30 });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "dry threshold (60) must be below wet threshold (30)"
        );
    }

    #[test]
    fn busy_pump_is_a_conflict() {
        assert_eq!(
            ApiError::from(PumpError::Busy).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn failed_threshold_write_is_a_server_error() {
        let err = ApiError::from(ThresholdError::from(PersistenceError(anyhow::anyhow!(
            "disk full"
        ))));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("disk full"));
    }
}
