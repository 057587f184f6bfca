// Delivery outcome classification

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How a delivery failure should be treated by the retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Network errors, timeouts, 5xx, throttling. Eligible for retry.
    Transient,
    /// Misconfiguration or permanent rejection. Never retried.
    Fatal,
    /// The destination refused the content. Never retried.
    Business,
    /// Not an error
    None,
}

impl ErrorClassification {
    /// Classify an HTTP-like response status
    pub fn from_status(status: u16) -> Self {
        match status {
            100..=399 => ErrorClassification::None,
            408 | 425 | 429 => ErrorClassification::Transient,
            400 | 409 | 412 | 422 => ErrorClassification::Business,
            400..=499 => ErrorClassification::Fatal,
            _ => ErrorClassification::Transient,
        }
    }

    pub fn is_retryable(self) -> bool {
        self == ErrorClassification::Transient
    }

    /// Whether a failure of this class says something about endpoint health
    pub fn trips_breaker(self) -> bool {
        matches!(self, ErrorClassification::Transient | ErrorClassification::Fatal)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Fatal => "fatal",
            ErrorClassification::Business => "business",
            ErrorClassification::None => "none",
        };
        f.write_str(name)
    }
}

/// Error-type label attached to tracked failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Business,
    Application,
    BusinessFatal,
    ApplicationFatal,
}

/// A failed dispatch as reported by a connector
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{classification} delivery error: {message}")]
pub struct DeliveryError {
    pub classification: ErrorClassification,
    pub message: String,
    /// Response status when the destination answered
    pub status: Option<u16>,
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            classification: ErrorClassification::Transient,
            message: message.into(),
            status: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            classification: ErrorClassification::Fatal,
            message: message.into(),
            status: None,
        }
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self {
            classification: ErrorClassification::Business,
            message: message.into(),
            status: None,
        }
    }

    /// Build from a non-success response
    pub fn from_status(status: u16, body: &Value) -> Self {
        Self {
            classification: ErrorClassification::from_status(status),
            message: format!("destination answered {}: {}", status, body),
            status: Some(status),
        }
    }

    /// Tracking label for this failure
    ///
    /// A fatal answer from the destination itself (401, 403, 404, ...) is a
    /// permanent refusal of this request: `business_fatal`. A fatal error with
    /// no answer means our side is misconfigured: `application_fatal`.
    pub fn error_type(&self) -> ErrorType {
        match (self.classification, self.status) {
            (ErrorClassification::Business, _) => ErrorType::Business,
            (ErrorClassification::Fatal, Some(_)) => ErrorType::BusinessFatal,
            (ErrorClassification::Fatal, None) => ErrorType::ApplicationFatal,
            _ => ErrorType::Application,
        }
    }

    /// Class that drives retries; a connector error left unclassified is
    /// treated as transient
    pub fn effective_classification(&self) -> ErrorClassification {
        match self.classification {
            ErrorClassification::None => ErrorClassification::Transient,
            class => class,
        }
    }
}

/// Successful connector answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorResponse {
    pub status: u16,
    pub body: Value,
}

impl ConnectorResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Result of one attempt, as fed back into the delivery gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(ErrorClassification),
}

impl AttemptOutcome {
    pub fn from_result(result: &Result<ConnectorResponse, DeliveryError>) -> Self {
        match result {
            Ok(response) => match ErrorClassification::from_status(response.status) {
                ErrorClassification::None => AttemptOutcome::Success,
                class => AttemptOutcome::Failure(class),
            },
            Err(err) => AttemptOutcome::Failure(err.effective_classification()),
        }
    }
}
