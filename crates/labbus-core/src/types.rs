/*!
 * Core data types for LabBus.
 *
 * This module defines identifiers and timestamped samples shared by the
 * device and engine crates.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for LabBus resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self::from_string(uuid.to_string())
    }
}

/// A value together with the moment it was acquired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    /// The acquired value
    pub value: T,
    /// Acquisition time
    pub acquired_at: DateTime<Utc>,
}

impl<T> Sample<T> {
    /// Stamp a value with the current time
    pub fn now(value: T) -> Self {
        Self {
            value,
            acquired_at: Utc::now(),
        }
    }

    /// Map the contained value
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Sample<U> {
        Sample {
            value: f(self.value),
            acquired_at: self.acquired_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id = Id::new();
        assert!(!id.as_str().is_empty());
        assert_ne!(Id::new(), id);

        let id = Id::from_string("gpib0::5");
        assert_eq!(id.as_str(), "gpib0::5");

        let id: Id = String::from("string-id").into();
        assert_eq!(id.to_string(), "string-id");
    }

    #[test]
    fn test_sample_map_keeps_timestamp() {
        let sample = Sample::now(21u8);
        let stamp = sample.acquired_at;
        let mapped = sample.map(|v| f64::from(v) / 2.0);
        assert_eq!(mapped.value, 10.5);
        assert_eq!(mapped.acquired_at, stamp);
    }
}
