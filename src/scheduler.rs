//! ==============================================================================
//! scheduler.rs - periodic sampling, diffing and aggregation
//! ==============================================================================
//!
//! purpose:
//!     decides WHAT gets reported. two independent loops:
//!
//!     network (default every 5 min):
//!         Idle -> Sampling -> Diffing -> Publishing -> Idle
//!         only addresses that are new or changed since the last snapshot are
//!         reported. the cached snapshot is always replaced.
//!
//!     thermal (default every 1 min):
//!         samples go into a window of 5. when it fills, the peak (not the
//!         average) is reported and the window starts over.
//!
//!     the loops share nothing but the session, so neither can stall the other.
//!
//! relationships:
//!     - used by: main.rs (spawn)
//!     - uses: sampler.rs (TelemetrySource), session.rs (TelemetrySession)
//!
//! ==============================================================================

use crate::reading::Reading;
use crate::sampler::{IpMap, TelemetrySource};
use crate::session::TelemetrySession;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const CPU_REFERENCE: &str = "cpuT";

#[derive(Debug, Clone)]
pub struct Schedule {
    pub network_interval: Duration,
    pub thermal_interval: Duration,
    pub thermal_window: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            network_interval: Duration::from_secs(300),
            thermal_interval: Duration::from_secs(60),
            thermal_window: 5,
        }
    }
}

// ==============================================================================
// network diff state
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkPhase {
    #[default]
    Idle,
    Sampling,
    Diffing,
    Publishing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpChange {
    pub key: String,
    pub previous: Option<String>,
    pub current: String,
}

#[derive(Debug, Default)]
pub struct NetworkTracker {
    cache: IpMap,
}

impl NetworkTracker {
    pub fn new(initial: IpMap) -> Self {
        Self { cache: initial }
    }

    pub fn cache(&self) -> &IpMap {
        &self.cache
    }

    /// keys of `snapshot` that are new or changed; the cache becomes `snapshot`
    pub fn diff(&mut self, snapshot: IpMap) -> Vec<IpChange> {
        let changes = snapshot
            .iter()
            .filter(|(key, value)| self.cache.get(*key) != Some(*value))
            .map(|(key, value)| IpChange {
                key: key.clone(),
                previous: self.cache.get(key).cloned(),
                current: value.clone(),
            })
            .collect();
        self.cache = snapshot;
        changes
    }
}

// ==============================================================================
// thermal window
// ==============================================================================

#[derive(Debug)]
pub struct ThermalWindow {
    samples: Vec<f64>,
    capacity: usize,
}

impl ThermalWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: Vec::with_capacity(capacity), capacity }
    }

    /// add a sample; once the window is full, return its peak and start over
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        self.samples.push(sample);
        if self.samples.len() < self.capacity {
            return None;
        }
        let peak = peak(&self.samples);
        self.samples.clear();
        peak
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// maximum, first occurrence wins on ties
fn peak(samples: &[f64]) -> Option<f64> {
    let mut iter = samples.iter().copied();
    let first = iter.next()?;
    Some(iter.fold(first, |best, s| if s > best { s } else { best }))
}

// ==============================================================================
// tasks
// ==============================================================================

pub struct NetworkTask {
    source: Arc<dyn TelemetrySource>,
    session: Arc<dyn TelemetrySession>,
    tracker: NetworkTracker,
    phase: NetworkPhase,
}

impl NetworkTask {
    /// starts with an empty cache, so the first cycle reports every address
    pub fn new(source: Arc<dyn TelemetrySource>, session: Arc<dyn TelemetrySession>) -> Self {
        Self { source, session, tracker: NetworkTracker::default(), phase: NetworkPhase::Idle }
    }

    pub fn phase(&self) -> NetworkPhase {
        self.phase
    }

    fn enter(&mut self, phase: NetworkPhase) {
        tracing::trace!("network tracker {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// one sample/diff/publish pass; returns how many addresses changed
    pub async fn cycle(&mut self) -> usize {
        self.enter(NetworkPhase::Sampling);
        let source = self.source.clone();
        let snapshot = match tokio::task::spawn_blocking(move || source.network_snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Network sampling task failed: {}", e);
                self.enter(NetworkPhase::Idle);
                return 0;
            }
        };
        if snapshot.is_empty() {
            tracing::warn!("Couldn't find IP Address");
        }

        self.enter(NetworkPhase::Diffing);
        let changes = self.tracker.diff(snapshot);

        self.enter(NetworkPhase::Publishing);
        for change in &changes {
            let reading = Reading::new(change.key.as_str(), change.current.as_str());
            self.session.add_reading(reading).await;
            tracing::info!(
                "{} IP Address has been updated from {} to {}",
                change.key,
                change.previous.as_deref().unwrap_or("null"),
                change.current
            );
        }
        // publish even without changes, this retries anything an earlier publish left behind
        publish(self.session.as_ref()).await;

        self.enter(NetworkPhase::Idle);
        changes.len()
    }

    pub async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }
}

pub struct ThermalTask {
    source: Arc<dyn TelemetrySource>,
    session: Arc<dyn TelemetrySession>,
    window: ThermalWindow,
    last_reported: Option<f64>,
}

impl ThermalTask {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        session: Arc<dyn TelemetrySession>,
        window: usize,
    ) -> Self {
        Self { source, session, window: ThermalWindow::new(window), last_reported: None }
    }

    async fn sample(&self) -> Option<f64> {
        let source = self.source.clone();
        match tokio::task::spawn_blocking(move || source.cpu_temperature()).await {
            Ok(Ok(t)) => Some(t),
            Ok(Err(e)) => {
                tracing::warn!("Skipping CPU temperature sample: {}", e);
                None
            }
            Err(e) => {
                tracing::error!("Thermal sampling task failed: {}", e);
                None
            }
        }
    }

    /// report one temperature straight away, outside the window
    pub async fn report_initial(&mut self) -> Option<f64> {
        let t = self.sample().await?;
        self.session.add_reading(Reading::new(CPU_REFERENCE, t)).await;
        self.last_reported = Some(t);
        Some(t)
    }

    /// one sample; returns the peak when the window filled and it was reported
    pub async fn cycle(&mut self) -> Option<f64> {
        let sample = self.sample().await?;
        let peak = self.window.push(sample)?;

        self.session.add_reading(Reading::new(CPU_REFERENCE, peak)).await;
        match self.last_reported {
            Some(previous) => {
                tracing::info!("CPU temperature has been updated from {} to {}", previous, peak)
            }
            None => tracing::info!("CPU temperature is {}", peak),
        }
        publish(self.session.as_ref()).await;
        self.last_reported = Some(peak);
        Some(peak)
    }

    pub fn window(&self) -> &ThermalWindow {
        &self.window
    }

    pub async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }
}

async fn publish(session: &dyn TelemetrySession) {
    if let Err(e) = session.publish().await {
        tracing::warn!("Publish failed, readings kept for the next attempt: {}", e);
    }
}

/// start both loops. the initial temperature is reported before the thermal
/// loop's first tick; the network loop's first tick is immediate.
pub async fn spawn(
    source: Arc<dyn TelemetrySource>,
    session: Arc<dyn TelemetrySession>,
    schedule: Schedule,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let mut thermal = ThermalTask::new(source.clone(), session.clone(), schedule.thermal_window);
    thermal.report_initial().await;

    let network = NetworkTask::new(source, session);
    let network_handle = tokio::spawn(network.run(schedule.network_interval));
    let thermal_handle = tokio::spawn(thermal.run(schedule.thermal_interval));
    (network_handle, thermal_handle)
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::error::{SensorError, SessionError};
    use crate::reading::ReadingValue;
    use crate::session::HttpSession;
    use crate::store::{ReadingStore, RemovalMode};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        snapshots: Mutex<VecDeque<IpMap>>,
        temperatures: Mutex<VecDeque<Option<f64>>>,
    }

    impl ScriptedSource {
        fn with_snapshots(snapshots: Vec<IpMap>) -> Self {
            Self { snapshots: Mutex::new(snapshots.into()), ..Default::default() }
        }

        fn with_temperatures(temperatures: Vec<Option<f64>>) -> Self {
            Self { temperatures: Mutex::new(temperatures.into()), ..Default::default() }
        }
    }

    impl TelemetrySource for ScriptedSource {
        fn network_snapshot(&self) -> IpMap {
            self.snapshots.lock().unwrap().pop_front().unwrap_or_default()
        }

        fn cpu_temperature(&self) -> Result<f64, SensorError> {
            self.temperatures
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or(SensorError::Unavailable)
        }
    }

    #[derive(Default)]
    struct RecordingSession {
        added: Mutex<Vec<Reading>>,
        publishes: AtomicUsize,
    }

    #[async_trait]
    impl TelemetrySession for RecordingSession {
        async fn connect(&self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn add_reading(&self, reading: Reading) -> bool {
            self.added.lock().unwrap().push(reading);
            true
        }

        async fn publish(&self) -> Result<usize, SessionError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            Ok(self.added.lock().unwrap().len())
        }
    }

    fn device(platform_host: &str) -> DeviceConfig {
        DeviceConfig {
            device_key: "gw".into(),
            device_password: "pw".into(),
            platform_host: platform_host.into(),
        }
    }

    fn ip_map(entries: &[(&str, &str)]) -> IpMap {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_diff_reports_new_and_changed() {
        let mut tracker = NetworkTracker::new(ip_map(&[("e4", "10.0.0.1"), ("w4", "10.0.0.2")]));
        let snapshot = ip_map(&[("e4", "10.0.0.1"), ("w4", "10.0.0.9"), ("e6", "fe80::1")]);
        let changes = tracker.diff(snapshot);

        assert_eq!(
            changes,
            vec![
                IpChange { key: "e6".into(), previous: None, current: "fe80::1".into() },
                IpChange {
                    key: "w4".into(),
                    previous: Some("10.0.0.2".into()),
                    current: "10.0.0.9".into(),
                },
            ]
        );
        assert_eq!(tracker.cache().len(), 3);
    }

    #[test]
    fn test_diff_replaces_cache_even_without_changes() {
        let mut tracker = NetworkTracker::new(ip_map(&[("e4", "10.0.0.1"), ("w4", "10.0.0.2")]));
        // w4 went away: not a change, but it must leave the cache
        assert!(tracker.diff(ip_map(&[("e4", "10.0.0.1")])).is_empty());
        assert_eq!(tracker.cache(), &ip_map(&[("e4", "10.0.0.1")]));

        // so its return is reported again
        let changes = tracker.diff(ip_map(&[("e4", "10.0.0.1"), ("w4", "10.0.0.2")]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, None);
    }

    #[test]
    fn test_window_reports_peak_and_resets() {
        let mut window = ThermalWindow::new(5);
        let samples = [20.1, 45.3, 45.3, 10.0];
        for s in samples {
            assert_eq!(window.push(s), None);
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.push(30.0), Some(45.3));
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_tie_keeps_first_occurrence() {
        let mut window = ThermalWindow::new(5);
        let mut result = None;
        for s in [-0.0, 0.0, -1.0, -2.0, -3.0] {
            result = window.push(s);
        }
        // -0.0 == 0.0, the first one seen is kept
        let peak = result.unwrap();
        assert_eq!(peak, 0.0);
        assert!(peak.is_sign_negative());
    }

    #[tokio::test]
    async fn test_network_cycle_idempotent_against_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistence_file");
        let store = Arc::new(ReadingStore::create(path, RemovalMode::OldestFirst).unwrap());
        // never connected: publish fails and every reading stays in the store
        let http = HttpSession::new(device("localhost"), store.clone(), Duration::from_secs(5));
        let session: Arc<dyn TelemetrySession> = Arc::new(http.unwrap());
        let snapshot = ip_map(&[("e4", "192.168.1.5"), ("l4", "127.0.0.1")]);
        let source = Arc::new(ScriptedSource::with_snapshots(vec![snapshot.clone(), snapshot]));

        let mut task = NetworkTask::new(source, session);
        assert_eq!(task.cycle().await, 2);
        assert_eq!(store.len(), 2);

        assert_eq!(task.cycle().await, 0);
        assert_eq!(store.len(), 2);
        assert_eq!(task.phase(), NetworkPhase::Idle);
    }

    #[tokio::test]
    async fn test_network_cycle_publishes_every_time() {
        let session = Arc::new(RecordingSession::default());
        let source = Arc::new(ScriptedSource::with_snapshots(vec![ip_map(&[("e4", "10.0.0.1")])]));
        let mut task = NetworkTask::new(source, session.clone());

        task.cycle().await;
        task.cycle().await;
        assert_eq!(session.publishes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_thermal_cycle_skips_unavailable_samples() {
        let temps = vec![Some(20.1), None, Some(45.3), Some(45.3), Some(10.0), Some(30.0)];
        let session = Arc::new(RecordingSession::default());
        let source = Arc::new(ScriptedSource::with_temperatures(temps));
        let mut task = ThermalTask::new(source, session.clone(), 5);

        let mut reported = Vec::new();
        for _ in 0..6 {
            if let Some(peak) = task.cycle().await {
                reported.push(peak);
            }
        }

        assert_eq!(reported, vec![45.3]);
        assert!(task.window().is_empty());
        let added = session.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].reference, CPU_REFERENCE);
        assert_eq!(added[0].value, ReadingValue::Number(45.3));
        assert_eq!(session.publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_temperature_bypasses_window() {
        let session = Arc::new(RecordingSession::default());
        let source = Arc::new(ScriptedSource::with_temperatures(vec![Some(38.5)]));
        let mut task = ThermalTask::new(source, session.clone(), 5);

        assert_eq!(task.report_initial().await, Some(38.5));
        assert!(task.window().is_empty());
        assert_eq!(session.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_thermal_cycle_not_held_up_by_stalled_network_publish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistence_file");
        let store = Arc::new(ReadingStore::create(path, RemovalMode::OldestFirst).unwrap());

        // a platform that accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let http = HttpSession::new(device(&host), store.clone(), Duration::from_secs(30)).unwrap();
        let session: Arc<dyn TelemetrySession> = Arc::new(http);
        session.connect().await.unwrap();

        let snapshot = ip_map(&[("e4", "192.168.1.5")]);
        let network_source = Arc::new(ScriptedSource::with_snapshots(vec![snapshot]));
        let mut network = NetworkTask::new(network_source, session.clone());
        let stalled = tokio::spawn(async move { network.cycle().await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let thermal_source = Arc::new(ScriptedSource::with_temperatures(vec![Some(52.0)]));
        let mut thermal = ThermalTask::new(thermal_source, session, 1);
        let peak = tokio::time::timeout(Duration::from_secs(5), thermal.cycle())
            .await
            .expect("thermal cycle must not wait on the network publish");
        assert_eq!(peak, Some(52.0));
        // the reading waits in the store for the next publish
        assert_eq!(store.get_readings(CPU_REFERENCE, 1).len(), 1);
        stalled.abort();
    }
}
