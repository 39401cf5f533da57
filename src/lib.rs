//! Shelter Sentry Library
//!
//! This library provides the event capture and delivery core of an edge
//! telemetry agent:
//!
//! - **config**: Environment-based configuration, resolved once at startup
//! - **event**: Sensor events and the wire payload sent to the backend
//! - **sensor**: Sensor source abstraction and reading-to-status detection
//! - **hardware**: sysfs GPIO and thermal frame file sources
//! - **poller**: Fixed-interval polling with per-source debouncing
//! - **buffer**: Ordered buffer of events pending delivery
//! - **client**: HTTP delivery with outcome classification
//! - **store**: Durable append-only log of undelivered payloads
//! - **dispatcher**: Immediate delivery, persistence on failure, retry sweeps
//!
//! # Example
//!
//! ```no_run
//! use shelter_sentry::client::DeliveryClient;
//! use shelter_sentry::config::Config;
//! use shelter_sentry::dispatcher::{Dispatcher, RetryPolicy};
//! use shelter_sentry::event::{SensorEvent, SensorId, Status};
//! use shelter_sentry::store::FailureStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let client = DeliveryClient::new(&config).expect("Failed to create client");
//!     let store = FailureStore::open(&config.failure_log, &config.dead_letter_log)
//!         .expect("Failed to open failure log");
//!     let mut dispatcher = Dispatcher::new(
//!         client,
//!         config.credentials(),
//!         store,
//!         RetryPolicy::from_config(&config),
//!     );
//!
//!     let event = SensorEvent::now(SensorId(21), Status::Obstacle);
//!     dispatcher.on_event(event).await;
//!     dispatcher.retry_sweep().await;
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod hardware;
pub mod poller;
pub mod sensor;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BufferStats, EventBuffer};
pub use client::{ClientError, ClientStats, Deliver, DeliveryClient, Outcome};
pub use config::{Config, ConfigError, ThermalConfig};
pub use dispatcher::{
    dispatcher_task, DispatchReport, DispatchStats, Dispatcher, RetryPolicy, SweepReport,
};
pub use event::{Credentials, DeliveryPayload, SensorEvent, SensorId, Status};
pub use hardware::{open_sources, SysfsGpioInput, ThermalFrameFile};
pub use poller::{poller_task, FirstSample, SensorPoller};
pub use sensor::{Detector, Reading, SensorError, SensorKind, SensorSource};
pub use store::{FailureStore, StoreError, StoredEntry};
