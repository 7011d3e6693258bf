//! Event Record - append-only outcome events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An outcome reported for a user in an experiment variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    event_id: Uuid,
    experiment_id: String,
    user_id: String,
    variant_name: String,
    event_name: String,
    event_value: f64,
    event_data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with value 1.0 and empty data.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        variant_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        EventBuilder::new(experiment_id, user_id, variant_name, event_name).build()
    }

    /// Create a builder for an event with optional fields.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        variant_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder::new(experiment_id, user_id, variant_name, event_name)
    }

    /// Unique id, returned in the tracking acknowledgment.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the variant the event is attributed to.
    #[must_use]
    pub fn variant_name(&self) -> &str {
        &self.variant_name
    }

    /// Get the event name.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Get the numeric value.
    #[must_use]
    pub const fn event_value(&self) -> f64 {
        self.event_value
    }

    /// Get the opaque payload.
    #[must_use]
    pub const fn event_data(&self) -> &serde_json::Value {
        &self.event_data
    }

    /// Get the ingestion timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Builder for `Event`.
#[derive(Debug)]
pub struct EventBuilder {
    experiment_id: String,
    user_id: String,
    variant_name: String,
    event_name: String,
    event_value: f64,
    event_data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl EventBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        variant_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            user_id: user_id.into(),
            variant_name: variant_name.into(),
            event_name: event_name.into(),
            event_value: 1.0,
            event_data: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }

    /// Set the numeric value.
    #[must_use]
    pub const fn value(mut self, event_value: f64) -> Self {
        self.event_value = event_value;
        self
    }

    /// Set the opaque payload.
    #[must_use]
    pub fn data(mut self, event_data: serde_json::Value) -> Self {
        self.event_data = event_data;
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the `Event`.
    #[must_use]
    pub fn build(self) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            experiment_id: self.experiment_id,
            user_id: self.user_id,
            variant_name: self.variant_name,
            event_name: self.event_name,
            event_value: self.event_value,
            event_data: self.event_data,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_defaults() {
        let event = Event::new("exp-1", "user-1", "control", "click");
        assert!((event.event_value() - 1.0).abs() < f64::EPSILON);
        assert!(event.event_data().as_object().is_some_and(serde_json::Map::is_empty));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::new("exp-1", "user-1", "control", "click");
        let b = Event::new("exp-1", "user-1", "control", "click");
        assert_ne!(a.event_id(), b.event_id());
    }
}
