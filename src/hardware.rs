//! Thin hardware shims behind [`SensorSource`].
//!
//! Digital inputs go through the Linux sysfs GPIO interface
//! (`/sys/class/gpio`). The thermal camera driver is expected to write its
//! latest frame to a text file as whitespace or comma separated temperatures,
//! one value per pixel.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::event::SensorId;
use crate::sensor::{Reading, SensorError, SensorKind, SensorSource};

/// Attempts at configuring a freshly exported line before giving up.
const DIRECTION_ATTEMPTS: u32 = 10;

/// The line directory and its permissions appear asynchronously after export.
const DIRECTION_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Acquire every source named in the configuration, digital inputs first.
///
/// Sources acquired before a failure are released when the partial list is dropped.
pub fn open_sources(config: &Config) -> Result<Vec<Box<dyn SensorSource>>, SensorError> {
    let mut sources: Vec<Box<dyn SensorSource>> = Vec::new();

    for &pin in &config.digital_pins {
        sources.push(Box::new(SysfsGpioInput::open(&config.gpio_root, pin)?));
    }

    if let Some(thermal) = &config.thermal {
        sources.push(Box::new(ThermalFrameFile::open(
            &thermal.frame_path,
            thermal.sensor_id,
            thermal.baseline,
            thermal.threshold,
        )?));
    }

    Ok(sources)
}

/// A GPIO line read through sysfs.
///
/// The line is exported and configured as an input on open. If this handle
/// exported it, the line is unexported again on drop.
#[derive(Debug)]
pub struct SysfsGpioInput {
    pin: u32,
    root: PathBuf,
    value_path: PathBuf,
    exported_here: bool,
}

impl SysfsGpioInput {
    pub fn open(root: &Path, pin: u32) -> Result<Self, SensorError> {
        let line_dir = root.join(format!("gpio{}", pin));
        let mut exported_here = false;

        if !line_dir.exists() {
            write_sysfs(&root.join("export"), &pin.to_string()).map_err(|e| {
                SensorError::Setup {
                    source: format!("GPIO {}", pin),
                    message: format!("export failed: {}", e),
                }
            })?;
            exported_here = true;
        }

        let input = Self {
            pin,
            root: root.to_path_buf(),
            value_path: line_dir.join("value"),
            exported_here,
        };

        // On failure `input` is dropped here, which unexports the line again.
        let direction = line_dir.join("direction");
        let mut attempt = 1;
        loop {
            match write_sysfs(&direction, "in") {
                Ok(()) => break,
                Err(e) if exported_here && attempt < DIRECTION_ATTEMPTS => {
                    debug!(pin = pin, attempt = attempt, error = %e, "GPIO line not ready yet");
                    attempt += 1;
                    thread::sleep(DIRECTION_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(SensorError::Setup {
                        source: format!("GPIO {}", pin),
                        message: format!("setting direction failed: {}", e),
                    })
                }
            }
        }

        debug!(pin = pin, exported_here = exported_here, "GPIO input ready");
        Ok(input)
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }
}

impl SensorSource for SysfsGpioInput {
    fn sensor_id(&self) -> SensorId {
        SensorId(self.pin)
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Digital
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        let raw = fs::read_to_string(&self.value_path).map_err(|error| SensorError::Read {
            source: format!("GPIO {}", self.pin),
            error,
        })?;
        let raw = raw.trim();
        raw.parse::<u8>()
            .map(Reading::Level)
            .map_err(|_| SensorError::InvalidReading {
                source: format!("GPIO {}", self.pin),
                detail: format!("expected 0 or 1, got '{}'", raw),
            })
    }
}

impl Drop for SysfsGpioInput {
    fn drop(&mut self) {
        if !self.exported_here {
            return;
        }
        match write_sysfs(&self.root.join("unexport"), &self.pin.to_string()) {
            Ok(()) => debug!(pin = self.pin, "GPIO released"),
            Err(e) => warn!(pin = self.pin, error = %e, "Failed to unexport GPIO"),
        }
    }
}

/// Thermal camera frames read from a file maintained by the camera driver.
#[derive(Debug)]
pub struct ThermalFrameFile {
    path: PathBuf,
    sensor_id: SensorId,
    baseline: f32,
    threshold: f32,
}

impl ThermalFrameFile {
    pub fn open(
        path: &Path,
        sensor_id: SensorId,
        baseline: f32,
        threshold: f32,
    ) -> Result<Self, SensorError> {
        if !path.exists() {
            return Err(SensorError::Setup {
                source: format!("thermal camera {}", sensor_id),
                message: format!("frame file {} not found", path.display()),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            sensor_id,
            baseline,
            threshold,
        })
    }
}

impl SensorSource for ThermalFrameFile {
    fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Thermal {
            baseline: self.baseline,
            threshold: self.threshold,
        }
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        let content = fs::read_to_string(&self.path).map_err(|error| SensorError::Read {
            source: format!("thermal camera {}", self.sensor_id),
            error,
        })?;
        parse_frame(&content).map(Reading::Frame)
    }
}

/// Parse a frame of whitespace or comma separated temperatures.
pub fn parse_frame(content: &str) -> Result<Vec<f32>, SensorError> {
    content
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f32>()
                .map_err(|_| SensorError::MalformedFrame(format!("'{}' is not a number", token)))
        })
        .collect()
}

fn write_sysfs(path: &Path, value: &str) -> std::io::Result<()> {
    fs::write(path, value)
}
