//! Core Event Types
//!
//! Events are the atomic records flowing from the trigger layer into the
//! context window and onwards to review and meta analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an event, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of observation an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MetricThreshold,
    ServiceFailure,
    LogPattern,
    ErrorRate,
    ProbeFailure,
    ReviewCompleted,
    ActionExecuted,
    MetaAnalysis,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MetricThreshold => "metric_threshold",
            EventKind::ServiceFailure => "service_failure",
            EventKind::LogPattern => "log_pattern",
            EventKind::ErrorRate => "error_rate",
            EventKind::ProbeFailure => "probe_failure",
            EventKind::ReviewCompleted => "review_completed",
            EventKind::ActionExecuted => "action_executed",
            EventKind::MetaAnalysis => "meta_analysis",
        }
    }
}

/// Which layer emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Trigger,
    Review,
    Meta,
    User,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Trigger => "trigger",
            EventSource::Review => "review",
            EventSource::Meta => "meta",
            EventSource::User => "user",
        }
    }
}

/// The atomic record emitted by the trigger layer and consumed by the
/// context and review layers. Immutable once admitted; the context layer
/// may replace the payload with a summary during compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub severity: Severity,
    pub source: EventSource,
    /// Kind-specific fields (trigger_type, value, service, message, ...).
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity, source: EventSource, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            source,
            payload,
        }
    }

    /// The human-readable message carried in the payload, if any.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// Per-kind debounce key used by the trigger layer.
    pub fn trigger_key(&self) -> Option<&str> {
        self.payload.get("trigger_type").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = Event::new(
            EventKind::MetricThreshold,
            Severity::Medium,
            EventSource::Trigger,
            json!({"trigger_type": "cpu_high", "value": 92.5}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "metric_threshold");
        assert_eq!(value["severity"], "medium");
        assert_eq!(value["source"], "trigger");
        assert_eq!(value["payload"]["trigger_type"], "cpu_high");
    }

    #[test]
    fn test_event_message_accessor() {
        let event = Event::new(
            EventKind::LogPattern,
            Severity::High,
            EventSource::Trigger,
            json!({"message": "Failed to start nginx.service"}),
        );
        assert_eq!(event.message(), Some("Failed to start nginx.service"));
    }
}
