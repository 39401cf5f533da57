//! Sensor sources and the mapping from raw readings to statuses.
//!
//! Hardware access sits behind [`SensorSource`]; everything the agent knows
//! about a source is "sample the current reading". [`Detector`] turns a
//! reading into a [`Status`] for that source's kind.

use crate::event::{SensorId, Status};

/// Kind of input a source represents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorKind {
    /// Digital presence sensor, status is the line level.
    Digital,
    /// Thermal camera, status is derived from the frame mean.
    Thermal { baseline: f32, threshold: f32 },
}

/// Raw value sampled from a source.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Line level of a digital input.
    Level(u8),
    /// Flattened frame of temperatures.
    Frame(Vec<f32>),
}

/// Errors raised by sensor sources.
#[derive(Debug)]
pub enum SensorError {
    /// The source could not be acquired at startup
    Setup { source: String, message: String },

    /// A single sample failed
    Read { source: String, error: std::io::Error },

    /// The sample was read but does not make sense
    InvalidReading { source: String, detail: String },

    /// A thermal frame could not be reduced
    MalformedFrame(String),
}

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorError::Setup { source, message } => {
                write!(f, "Failed to set up {}: {}", source, message)
            }
            SensorError::Read { source, error } => {
                write!(f, "Failed to read {}: {}", source, error)
            }
            SensorError::InvalidReading { source, detail } => {
                write!(f, "Invalid reading from {}: {}", source, detail)
            }
            SensorError::MalformedFrame(detail) => write!(f, "Malformed thermal frame: {}", detail),
        }
    }
}

impl std::error::Error for SensorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SensorError::Read { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// A sensor the poller can sample.
///
/// Implementations own their hardware handle and release it on drop.
pub trait SensorSource: Send {
    /// Logical id reported in events from this source.
    fn sensor_id(&self) -> SensorId;

    /// How readings from this source are interpreted.
    fn kind(&self) -> SensorKind;

    /// Sample the current reading.
    fn sample(&mut self) -> Result<Reading, SensorError>;
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn sensor_id(&self) -> SensorId {
        (**self).sensor_id()
    }

    fn kind(&self) -> SensorKind {
        (**self).kind()
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        (**self).sample()
    }
}

/// Arithmetic mean of a thermal frame.
pub fn frame_mean(frame: &[f32]) -> Result<f32, SensorError> {
    if frame.is_empty() {
        return Err(SensorError::MalformedFrame("frame is empty".to_string()));
    }
    if let Some(bad) = frame.iter().find(|v| !v.is_finite()) {
        return Err(SensorError::MalformedFrame(format!(
            "frame contains non-finite value {}",
            bad
        )));
    }
    let sum: f64 = frame.iter().map(|&v| v as f64).sum();
    Ok((sum / frame.len() as f64) as f32)
}

/// Converts readings of one source kind into statuses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detector {
    kind: SensorKind,
}

impl Detector {
    pub fn new(kind: SensorKind) -> Self {
        Self { kind }
    }

    /// Status for a reading, or an error when the reading does not fit the kind.
    pub fn status(&self, sensor_id: SensorId, reading: &Reading) -> Result<Status, SensorError> {
        match (self.kind, reading) {
            (SensorKind::Digital, Reading::Level(1)) => Ok(Status::NoObstacle),
            (SensorKind::Digital, Reading::Level(0)) => Ok(Status::Obstacle),
            (SensorKind::Digital, Reading::Level(other)) => Err(SensorError::InvalidReading {
                source: format!("sensor {}", sensor_id),
                detail: format!("unexpected line level {}", other),
            }),
            (SensorKind::Thermal { baseline, threshold }, Reading::Frame(frame)) => {
                let mean = frame_mean(frame)?;
                if (mean - baseline).abs() > threshold {
                    Ok(Status::ThermalMovement)
                } else {
                    Ok(Status::ThermalStill)
                }
            }
            (kind, reading) => Err(SensorError::InvalidReading {
                source: format!("sensor {}", sensor_id),
                detail: format!("{:?} reading from a {:?} source", reading, kind),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermal(baseline: f32, threshold: f32) -> Detector {
        Detector::new(SensorKind::Thermal {
            baseline,
            threshold,
        })
    }

    #[test]
    fn test_digital_levels() {
        let detector = Detector::new(SensorKind::Digital);
        let id = SensorId(21);
        assert_eq!(detector.status(id, &Reading::Level(1)).unwrap(), Status::NoObstacle);
        assert_eq!(detector.status(id, &Reading::Level(0)).unwrap(), Status::Obstacle);
        assert!(matches!(
            detector.status(id, &Reading::Level(2)),
            Err(SensorError::InvalidReading { .. })
        ));
    }

    #[test]
    fn test_frame_mean() {
        assert_eq!(frame_mean(&[1.0, 2.0, 3.0, 6.0]).unwrap(), 3.0);
        assert!(matches!(frame_mean(&[]), Err(SensorError::MalformedFrame(_))));
        assert!(matches!(
            frame_mean(&[1.0, f32::NAN]),
            Err(SensorError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_thermal_threshold_is_strict() {
        let detector = thermal(20.0, 5.0);
        let id = SensorId(100);

        let at_threshold = Reading::Frame(vec![25.0; 64]);
        assert_eq!(detector.status(id, &at_threshold).unwrap(), Status::ThermalStill);

        let below_baseline = Reading::Frame(vec![15.0; 64]);
        assert_eq!(detector.status(id, &below_baseline).unwrap(), Status::ThermalStill);

        let above = Reading::Frame(vec![25.5; 64]);
        assert_eq!(detector.status(id, &above).unwrap(), Status::ThermalMovement);

        let colder = Reading::Frame(vec![14.0; 64]);
        assert_eq!(detector.status(id, &colder).unwrap(), Status::ThermalMovement);
    }

    #[test]
    fn test_mismatched_reading() {
        let detector = thermal(20.0, 5.0);
        assert!(matches!(
            detector.status(SensorId(100), &Reading::Level(1)),
            Err(SensorError::InvalidReading { .. })
        ));
    }

    #[test]
    fn test_sensor_error_display() {
        let err = SensorError::Setup {
            source: "GPIO 21".to_string(),
            message: "permission denied".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to set up GPIO 21: permission denied");

        let err = SensorError::MalformedFrame("frame is empty".to_string());
        assert!(err.to_string().contains("frame is empty"));
    }
}
