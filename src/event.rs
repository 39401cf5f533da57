//! Event data model.
//!
//! A [`SensorEvent`] is created once, at the moment a state change is
//! detected, and never mutated afterwards. The identity of the shelter is kept
//! out of the event and only merged in when a [`DeliveryPayload`] is built for
//! the wire.

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Wire format of event timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Stable identifier of a logical sensor (GPIO line, thermal channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u32);

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical state reported by a sensor.
///
/// The serialized labels are fixed for compatibility with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "Obstacle")]
    Obstacle,
    #[serde(rename = "No obstacle")]
    NoObstacle,
    #[serde(rename = "Thermal movement")]
    ThermalMovement,
    #[serde(rename = "No thermal movement")]
    ThermalStill,
}

impl Status {
    /// Wire label for this status.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Obstacle => "Obstacle",
            Status::NoObstacle => "No obstacle",
            Status::ThermalMovement => "Thermal movement",
            Status::ThermalStill => "No thermal movement",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Serde adapter for `YYYY-MM-DD HH:MM:SS` timestamps.
pub mod timestamp_format {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// A detected state transition of one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    sensor_id: SensorId,
    status: Status,
    #[serde(with = "timestamp_format")]
    timestamp: NaiveDateTime,
}

impl SensorEvent {
    /// Create an event stamped with the current local wall-clock time.
    pub fn now(sensor_id: SensorId, status: Status) -> Self {
        let now = Local::now().naive_local();
        // Second resolution; the sub-second part is never sent.
        let timestamp = now.with_nanosecond(0).unwrap_or(now);
        Self::at(sensor_id, status, timestamp)
    }

    /// Create an event with an explicit capture time.
    pub fn at(sensor_id: SensorId, status: Status, timestamp: NaiveDateTime) -> Self {
        Self {
            sensor_id,
            status,
            timestamp,
        }
    }

    pub fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Capture time in wire format.
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Shelter identity attached to every outbound payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    shelter_id: String,
    password: String,
}

impl Credentials {
    pub fn new(shelter_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            shelter_id: shelter_id.into(),
            password: password.into(),
        }
    }

    pub fn shelter_id(&self) -> &str {
        &self.shelter_id
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("shelter_id", &self.shelter_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// JSON body POSTed to the backend.
///
/// Field names are fixed by the backend:
/// `{id_refugio, password, timestamp, status, sensor_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub id_refugio: String,
    pub password: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub status: Status,
    pub sensor_id: SensorId,
}

impl DeliveryPayload {
    /// Merge an event with the shelter identity.
    pub fn new(event: &SensorEvent, credentials: &Credentials) -> Self {
        Self {
            id_refugio: credentials.shelter_id.clone(),
            password: credentials.password.clone(),
            timestamp: event.timestamp,
            status: event.status,
            sensor_id: event.sensor_id,
        }
    }

    /// The event carried by this payload, without the identity fields.
    pub fn event(&self) -> SensorEvent {
        SensorEvent::at(self.sensor_id, self.status, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(7, 5, 3))
            .unwrap()
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(Status::Obstacle.to_string(), "Obstacle");
        assert_eq!(Status::NoObstacle.to_string(), "No obstacle");
        assert_eq!(
            serde_json::to_string(&Status::ThermalMovement).unwrap(),
            "\"Thermal movement\""
        );
        let parsed: Status = serde_json::from_str("\"No obstacle\"").unwrap();
        assert_eq!(parsed, Status::NoObstacle);
    }

    #[test]
    fn test_event_now_has_second_resolution() {
        let event = SensorEvent::now(SensorId(21), Status::Obstacle);
        assert_eq!(event.timestamp().nanosecond(), 0);
        assert_eq!(event.formatted_timestamp().len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn test_formatted_timestamp_is_zero_padded() {
        let event = SensorEvent::at(SensorId(21), Status::Obstacle, sample_time());
        assert_eq!(event.formatted_timestamp(), "2024-03-09 07:05:03");
    }

    #[test]
    fn test_payload_wire_fields() {
        let event = SensorEvent::at(SensorId(21), Status::NoObstacle, sample_time());
        let payload = DeliveryPayload::new(&event, &Credentials::new("7", "s3cret"));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id_refugio": "7",
                "password": "s3cret",
                "timestamp": "2024-03-09 07:05:03",
                "status": "No obstacle",
                "sensor_id": 21,
            })
        );
        assert_eq!(payload.event(), event);
    }

    #[test]
    fn test_payload_rejects_malformed_timestamp() {
        let raw = r#"{"id_refugio":"7","password":"x","timestamp":"yesterday","status":"Obstacle","sensor_id":21}"#;
        assert!(serde_json::from_str::<DeliveryPayload>(raw).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("7", "s3cret"));
        assert!(rendered.contains("7"));
        assert!(!rendered.contains("s3cret"));
    }
}
