//! Sensor polling with per-source debouncing.
//!
//! Each registered source carries its last reported status. A sweep samples
//! every source in registration order and emits an event only for sources
//! whose status differs from the stored one.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{SensorEvent, SensorId, Status};
use crate::sensor::{Detector, SensorSource};

/// What to do with the first successful sample of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstSample {
    /// Report it, since "unknown" differs from every real status.
    #[default]
    AlwaysEmit,
    /// Record it as the baseline state without reporting it.
    SeedSilently,
}

struct PolledSource {
    source: Box<dyn SensorSource>,
    detector: Detector,
    last_status: Option<Status>,
}

/// Samples a set of sources and turns state changes into events.
pub struct SensorPoller {
    sources: Vec<PolledSource>,
    first_sample: FirstSample,
}

impl SensorPoller {
    pub fn new(first_sample: FirstSample) -> Self {
        Self {
            sources: Vec::new(),
            first_sample,
        }
    }

    /// Register a source. Sources are sampled in registration order.
    pub fn add_source(&mut self, source: Box<dyn SensorSource>) {
        let detector = Detector::new(source.kind());
        self.sources.push(PolledSource {
            source,
            detector,
            last_status: None,
        });
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Last reported status of a source, `None` until its first sample.
    pub fn last_status(&self, sensor_id: SensorId) -> Option<Status> {
        self.sources
            .iter()
            .find(|s| s.source.sensor_id() == sensor_id)
            .and_then(|s| s.last_status)
    }

    /// Sample every source once and return the events of this sweep.
    ///
    /// A failed sample produces no event and leaves that source's state as it was.
    pub fn poll_once(&mut self) -> Vec<SensorEvent> {
        let mut events = Vec::new();

        for polled in &mut self.sources {
            let sensor_id = polled.source.sensor_id();
            let status = match polled
                .source
                .sample()
                .and_then(|reading| polled.detector.status(sensor_id, &reading))
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(sensor_id = %sensor_id, error = %e, "Sensor read failed, skipping");
                    continue;
                }
            };

            let previous = polled.last_status.replace(status);
            match previous {
                Some(previous) if previous == status => {}
                None if self.first_sample == FirstSample::SeedSilently => {
                    debug!(sensor_id = %sensor_id, status = %status, "Seeded initial state");
                }
                _ => {
                    info!(sensor_id = %sensor_id, status = %status, "Sensor state changed");
                    events.push(SensorEvent::now(sensor_id, status));
                }
            }
        }

        events
    }
}

/// Poll at a fixed interval and forward each sweep's events as one batch.
///
/// Runs until `token` is cancelled or the receiving side goes away. The
/// poller, and with it every hardware handle, is dropped on return.
pub async fn poller_task(
    mut poller: SensorPoller,
    tx: mpsc::Sender<Vec<SensorEvent>>,
    token: CancellationToken,
    poll_interval: Duration,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Poller stopping");
                break;
            }

            _ = ticker.tick() => {
                let events = poller.poll_once();
                if events.is_empty() {
                    continue;
                }
                if let Err(mpsc::error::SendError(events)) = tx.send(events).await {
                    error!(
                        dropped = events.len(),
                        "Dispatcher is gone, stopping poller"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sensor::{Reading, SensorError, SensorKind};
    use std::collections::VecDeque;

    /// Source that replays a fixed script of readings.
    pub(crate) struct ScriptedSource {
        id: SensorId,
        kind: SensorKind,
        script: VecDeque<Result<Reading, String>>,
    }

    impl ScriptedSource {
        pub(crate) fn digital(id: u32, levels: &[u8]) -> Self {
            Self {
                id: SensorId(id),
                kind: SensorKind::Digital,
                script: levels.iter().map(|&l| Ok(Reading::Level(l))).collect(),
            }
        }

        pub(crate) fn thermal(id: u32, baseline: f32, threshold: f32, means: &[f32]) -> Self {
            Self {
                id: SensorId(id),
                kind: SensorKind::Thermal {
                    baseline,
                    threshold,
                },
                script: means.iter().map(|&m| Ok(Reading::Frame(vec![m; 4]))).collect(),
            }
        }

        fn with_failure_at(mut self, index: usize) -> Self {
            self.script.insert(index, Err("bus timeout".to_string()));
            self
        }
    }

    impl SensorSource for ScriptedSource {
        fn sensor_id(&self) -> SensorId {
            self.id
        }

        fn kind(&self) -> SensorKind {
            self.kind
        }

        fn sample(&mut self) -> Result<Reading, SensorError> {
            match self.script.pop_front() {
                Some(Ok(reading)) => Ok(reading),
                Some(Err(message)) => Err(SensorError::Read {
                    source: format!("scripted {}", self.id),
                    error: std::io::Error::new(std::io::ErrorKind::TimedOut, message),
                }),
                None => Err(SensorError::InvalidReading {
                    source: format!("scripted {}", self.id),
                    detail: "script exhausted".to_string(),
                }),
            }
        }
    }

    fn statuses(poller: &mut SensorPoller, polls: usize) -> Vec<Vec<Status>> {
        (0..polls)
            .map(|_| poller.poll_once().iter().map(|e| e.status()).collect())
            .collect()
    }

    #[test]
    fn test_debounce_scenario() {
        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(ScriptedSource::digital(21, &[1, 1, 0, 0, 1])));

        let per_poll = statuses(&mut poller, 5);
        assert_eq!(
            per_poll,
            vec![
                vec![Status::NoObstacle],
                vec![],
                vec![Status::Obstacle],
                vec![],
                vec![Status::NoObstacle],
            ]
        );
    }

    #[test]
    fn test_event_count_matches_changes() {
        let levels = [0, 0, 0, 1, 0, 1, 1, 1, 0, 0];
        let changes = levels.windows(2).filter(|w| w[0] != w[1]).count();

        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(ScriptedSource::digital(21, &levels)));
        let emitted: usize = (0..levels.len()).map(|_| poller.poll_once().len()).sum();

        assert_eq!(emitted, changes + 1);
    }

    #[test]
    fn test_seed_silently_suppresses_first_sample() {
        let mut poller = SensorPoller::new(FirstSample::SeedSilently);
        poller.add_source(Box::new(ScriptedSource::digital(21, &[1, 1, 0])));

        let per_poll = statuses(&mut poller, 3);
        assert_eq!(per_poll, vec![vec![], vec![], vec![Status::Obstacle]]);
        assert_eq!(poller.last_status(SensorId(21)), Some(Status::Obstacle));
    }

    #[test]
    fn test_read_failure_keeps_state() {
        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(
            ScriptedSource::digital(21, &[1, 1]).with_failure_at(1),
        ));

        let per_poll = statuses(&mut poller, 3);
        assert_eq!(per_poll, vec![vec![Status::NoObstacle], vec![], vec![]]);
    }

    #[test]
    fn test_thermal_threshold_boundary() {
        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(ScriptedSource::thermal(
            100,
            20.0,
            5.0,
            &[20.0, 25.0, 25.5, 25.5, 22.0],
        )));

        let per_poll = statuses(&mut poller, 5);
        assert_eq!(
            per_poll,
            vec![
                vec![Status::ThermalStill],
                vec![],
                vec![Status::ThermalMovement],
                vec![],
                vec![Status::ThermalStill],
            ]
        );
    }

    #[test]
    fn test_sweep_keeps_registration_order() {
        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(ScriptedSource::digital(21, &[0])));
        poller.add_source(Box::new(ScriptedSource::digital(20, &[1])));
        assert_eq!(poller.len(), 2);

        let ids: Vec<SensorId> = poller.poll_once().iter().map(|e| e.sensor_id()).collect();
        assert_eq!(ids, vec![SensorId(21), SensorId(20)]);
    }

    #[tokio::test]
    async fn test_poller_task_forwards_batches_and_stops() {
        let mut poller = SensorPoller::new(FirstSample::AlwaysEmit);
        poller.add_source(Box::new(ScriptedSource::digital(21, &[1, 0])));

        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let handle = tokio::spawn(poller_task(
            poller,
            tx,
            token.clone(),
            Duration::from_millis(10),
        ));

        let first = rx.recv().await.expect("first batch");
        assert_eq!(first[0].status(), Status::NoObstacle);
        let second = rx.recv().await.expect("second batch");
        assert_eq!(second[0].status(), Status::Obstacle);

        token.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
