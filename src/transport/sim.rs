//! Scripted in-process transport.
//!
//! Backs the test suite and `blelog --simulate` dry runs. A [`SimBoard`] is
//! built up front with the behaviour it should exhibit (logged signals,
//! failing connects, a mid-download drop, ...), and a [`SimObserver`] keeps an
//! eye on it after the board has been handed to the orchestrators.

use super::{
    Advertisement, Board, BoardEvent, BoardInfo, RawSignal, Sample, SampleValue, Scanner,
    SignalHandle, SignalsReply, TransportError,
};
use crate::sensor::SensorKind;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Base handle for live sensor signals, kept clear of logged signal handles.
const LIVE_SIGNAL_BASE: u32 = 0x100;

/// One `connect_and_set_up` call as seen by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAttempt {
    /// Whether a resume blob was supplied
    pub resumed: bool,
    /// Whether setup succeeded
    pub succeeded: bool,
}

/// Commands the host issued to the board.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    CreateAnonymousSignals,
    Subscribe(SignalHandle),
    DownloadLog { notify_every: u32 },
    Reset,
    ResetAfterGc,
    EraseMacros,
    Disconnect,
    ConfigureSensor(SensorKind, f32),
    StartSensor(SensorKind),
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    /// Bumped on every successful setup; live sensors stop with their link
    link_generation: u64,
    failing_connects: u32,
    attempts: Vec<ConnectAttempt>,
    commands: Vec<SimCommand>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the board answers when asked for its logged signals.
#[derive(Debug, Clone)]
enum LogContents {
    Signals(Vec<String>),
    Status(i32),
}

/// A scripted board.
pub struct SimBoard {
    address: String,
    advertised_name: Option<String>,
    info: BoardInfo,
    log: LogContents,
    total_entries: u32,
    drop_after_entries: Option<u32>,
    unknown_entries: u32,
    unhandled_entries: u32,
    reject_resume: bool,
    setup_latency: Duration,
    sensors: Vec<SensorKind>,
    subscribed: Vec<SignalHandle>,
    state: Arc<Mutex<SimState>>,
    events_tx: UnboundedSender<BoardEvent>,
    events_rx: UnboundedReceiver<BoardEvent>,
}

impl SimBoard {
    /// Create a board that logs nothing and connects on the first try.
    pub fn new(address: impl Into<String>) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            address: address.into(),
            advertised_name: None,
            info: BoardInfo {
                model: "SimBoard".to_string(),
                firmware_revision: "1.0.0".to_string(),
            },
            log: LogContents::Signals(Vec::new()),
            total_entries: 0,
            drop_after_entries: None,
            unknown_entries: 0,
            unhandled_entries: 0,
            reject_resume: false,
            setup_latency: Duration::from_millis(20),
            sensors: Vec::new(),
            subscribed: Vec::new(),
            state: Arc::new(Mutex::new(SimState::default())),
            events_tx,
            events_rx,
        }
    }

    /// A board with a typical motion/pressure log and a full sensor set.
    pub fn demo(address: impl Into<String>) -> Self {
        Self::new(address)
            .logging(&["acceleration", "pressure"])
            .with_entries(500)
            .with_sensors(&SensorKind::ALL)
    }

    /// Name carried in the advertisement's manufacturer data.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.advertised_name = Some(name.into());
        self
    }

    /// Signals (by board identifier) the board is logging.
    pub fn logging(mut self, identifiers: &[&str]) -> Self {
        self.log = LogContents::Signals(identifiers.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Answer signal enumeration with an error status.
    pub fn enumeration_status(mut self, status: i32) -> Self {
        self.log = LogContents::Status(status);
        self
    }

    /// Number of log entries stored on the board.
    pub fn with_entries(mut self, total: u32) -> Self {
        self.total_entries = total;
        self
    }

    /// Drop the link after this many entries have been downloaded.
    pub fn drop_after(mut self, entries: u32) -> Self {
        self.drop_after_entries = Some(entries);
        self
    }

    /// Entries whose type tag the host cannot map.
    pub fn with_unknown_entries(mut self, count: u32) -> Self {
        self.unknown_entries = count;
        self
    }

    /// Entries that arrive outside any subscription.
    pub fn with_unhandled_entries(mut self, count: u32) -> Self {
        self.unhandled_entries = count;
        self
    }

    /// Fail the first `count` connect attempts.
    pub fn failing_connects(self, count: u32) -> Self {
        lock(&self.state).failing_connects = count;
        self
    }

    /// Refuse every resume blob, as after a firmware update.
    pub fn reject_resume(mut self) -> Self {
        self.reject_resume = true;
        self
    }

    /// Time each setup takes.
    pub fn setup_latency(mut self, latency: Duration) -> Self {
        self.setup_latency = latency;
        self
    }

    /// Sensors physically present on the board.
    pub fn with_sensors(mut self, sensors: &[SensorKind]) -> Self {
        self.sensors = sensors.to_vec();
        self
    }

    /// Handle for observing the board after it has been handed off.
    pub fn observer(&self) -> SimObserver {
        SimObserver {
            state: Arc::clone(&self.state),
            events: self.events_tx.clone(),
        }
    }

    /// The advertisement this board broadcasts.
    pub fn advertisement(&self) -> Advertisement {
        let mut adv = Advertisement::new(self.address.clone());
        if let Some(name) = &self.advertised_name {
            let mut data = vec![0x7e, 0x02];
            data.extend_from_slice(name.as_bytes());
            adv.manufacturer_data = Some(data);
        }
        adv
    }

    fn state_blob(&self) -> Vec<u8> {
        format!("sim-setup:{}", self.address.to_uppercase()).into_bytes()
    }

    fn record(&self, command: SimCommand) {
        lock(&self.state).commands.push(command);
    }

    fn emit(&self, event: BoardEvent) {
        // The receiver lives in `self`, so this only fails while dropping.
        let _ = self.events_tx.send(event);
    }

    fn drop_link(&self) {
        let was_connected = std::mem::replace(&mut lock(&self.state).connected, false);
        if was_connected {
            self.emit(BoardEvent::Disconnected);
        }
    }

    fn logged_identifiers(&self) -> &[String] {
        match &self.log {
            LogContents::Signals(ids) => ids,
            LogContents::Status(_) => &[],
        }
    }

    fn run_download(&self, notify_every: u32) {
        let notify_every = notify_every.max(1);
        let total = self.total_entries;
        let identifiers = self.logged_identifiers();

        self.emit(BoardEvent::Progress {
            entries_left: total,
            total_entries: total,
        });

        for id in 0..self.unknown_entries {
            self.emit(BoardEvent::UnknownEntry {
                id: 0x1f,
                epoch_ms: Utc::now().timestamp_millis(),
                data: vec![id as u8, 0x00, 0x7f],
            });
        }

        let mut entries_left = total;
        for entry in 0..total {
            if self.drop_after_entries == Some(entry) {
                self.drop_link();
                return;
            }

            // Entries are stamped as they are replayed.
            let epoch_ms = Utc::now().timestamp_millis();
            if !identifiers.is_empty() {
                let slot = entry as usize % identifiers.len();
                let kind = SensorKind::from_identifier(&identifiers[slot]);
                let sample = Sample::new(epoch_ms, synthetic_value(kind, entry));
                let handle = SignalHandle(slot as u32);
                if self.subscribed.contains(&handle) {
                    self.emit(BoardEvent::Data {
                        signal: handle,
                        sample,
                    });
                } else {
                    self.emit(BoardEvent::UnhandledEntry(sample));
                }
            }

            if entry < self.unhandled_entries {
                self.emit(BoardEvent::UnhandledEntry(Sample::new(
                    epoch_ms,
                    SampleValue::Scalar(0.0),
                )));
            }

            entries_left -= 1;
            if entries_left % notify_every == 0 {
                self.emit(BoardEvent::Progress {
                    entries_left,
                    total_entries: total,
                });
            }
        }
    }
}

fn synthetic_value(kind: Option<SensorKind>, n: u32) -> SampleValue {
    let t = n as f32 * 0.01;
    match kind {
        Some(SensorKind::Pressure) => SampleValue::Scalar(101_325.0 + t.sin() * 12.0),
        Some(SensorKind::AmbientLight) => SampleValue::Scalar(320.0 + t.cos() * 40.0),
        Some(SensorKind::Humidity) => SampleValue::Scalar(41.5 + t.sin()),
        Some(SensorKind::Magnetometer) => SampleValue::Cartesian {
            x: 2.1e-5 * t.cos(),
            y: 1.4e-5 * t.sin(),
            z: -4.2e-5,
        },
        Some(SensorKind::Quaternion) => SampleValue::Quaternion {
            w: t.cos(),
            x: t.sin(),
            y: 0.0,
            z: 0.0,
        },
        Some(SensorKind::EulerAngles) => SampleValue::Euler {
            heading: (t * 10.0) % 360.0,
            pitch: t.sin() * 30.0,
            roll: t.cos() * 15.0,
            yaw: (t * 10.0) % 360.0,
        },
        Some(_) | None => SampleValue::Cartesian {
            x: t.sin(),
            y: t.cos(),
            z: 1.0,
        },
    }
}

#[async_trait]
impl Board for SimBoard {
    fn address(&self) -> &str {
        &self.address
    }

    fn info(&self) -> BoardInfo {
        self.info.clone()
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn connect_and_set_up(&mut self, resume: Option<&[u8]>) -> Result<(), TransportError> {
        tokio::time::sleep(self.setup_latency).await;

        let stale = resume.is_some_and(|blob| self.reject_resume || blob != self.state_blob());
        let mut state = lock(&self.state);
        let result = if state.failing_connects > 0 {
            state.failing_connects -= 1;
            Err(TransportError::Setup("link refused".to_string()))
        } else if stale {
            Err(TransportError::Setup("stale resume state".to_string()))
        } else {
            state.connected = true;
            state.link_generation += 1;
            Ok(())
        };
        state.attempts.push(ConnectAttempt {
            resumed: resume.is_some(),
            succeeded: result.is_ok(),
        });
        result
    }

    fn serialize_state(&self) -> Vec<u8> {
        self.state_blob()
    }

    async fn create_anonymous_signals(&mut self) -> Result<SignalsReply, TransportError> {
        self.record(SimCommand::CreateAnonymousSignals);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(match &self.log {
            LogContents::Status(status) => SignalsReply::Status(*status),
            LogContents::Signals(ids) => SignalsReply::Signals(
                ids.iter()
                    .enumerate()
                    .map(|(i, id)| RawSignal {
                        handle: SignalHandle(i as u32),
                        identifier: id.clone(),
                    })
                    .collect(),
            ),
        })
    }

    fn subscribe(&mut self, signal: SignalHandle) {
        self.record(SimCommand::Subscribe(signal));
        if !self.subscribed.contains(&signal) {
            self.subscribed.push(signal);
        }
    }

    fn download_log(&mut self, notify_every: u32) {
        self.record(SimCommand::DownloadLog { notify_every });
        if self.is_connected() {
            self.run_download(notify_every);
        }
    }

    fn reset(&mut self) {
        self.record(SimCommand::Reset);
        self.subscribed.clear();
        self.drop_link();
    }

    fn reset_after_gc(&mut self) {
        self.record(SimCommand::ResetAfterGc);
    }

    fn erase_macros(&mut self) {
        self.record(SimCommand::EraseMacros);
    }

    fn disconnect(&mut self) {
        self.record(SimCommand::Disconnect);
        self.drop_link();
    }

    async fn next_event(&mut self) -> Option<BoardEvent> {
        self.events_rx.recv().await
    }

    fn has_sensor(&self, kind: SensorKind) -> bool {
        self.sensors.contains(&kind)
    }

    async fn configure_sensor(
        &mut self,
        kind: SensorKind,
        odr_hz: f32,
    ) -> Result<(), TransportError> {
        if !self.has_sensor(kind) {
            return Err(TransportError::NoSuchSensor);
        }
        self.record(SimCommand::ConfigureSensor(kind, odr_hz));
        Ok(())
    }

    fn start_sensor(&mut self, kind: SensorKind) -> Result<(), TransportError> {
        if !self.has_sensor(kind) {
            return Err(TransportError::NoSuchSensor);
        }
        self.record(SimCommand::StartSensor(kind));

        let odr = lock(&self.state)
            .commands
            .iter()
            .rev()
            .find_map(|c| match c {
                SimCommand::ConfigureSensor(k, odr) if *k == kind => Some(*odr),
                _ => None,
            })
            .unwrap_or(25.0);
        let period = Duration::from_secs_f32(1.0 / odr.max(0.1));
        let handle = SignalHandle(LIVE_SIGNAL_BASE + kind.index() as u32);
        let state = Arc::clone(&self.state);
        let generation = lock(&state).link_generation;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut n = 0u32;
            loop {
                ticker.tick().await;
                let alive = {
                    let link = lock(&state);
                    link.connected && link.link_generation == generation
                };
                if !alive {
                    break;
                }
                let sample = Sample::new(Utc::now().timestamp_millis(), synthetic_value(Some(kind), n));
                if events
                    .send(BoardEvent::Data {
                        signal: handle,
                        sample,
                    })
                    .is_err()
                {
                    break;
                }
                n = n.wrapping_add(1);
            }
        });
        Ok(())
    }

    fn sensor_signal(&mut self, kind: SensorKind) -> Result<SignalHandle, TransportError> {
        if !self.has_sensor(kind) {
            return Err(TransportError::NoSuchSensor);
        }
        Ok(SignalHandle(LIVE_SIGNAL_BASE + kind.index() as u32))
    }
}

/// Observer for a [`SimBoard`] that has been moved elsewhere.
#[derive(Clone)]
pub struct SimObserver {
    state: Arc<Mutex<SimState>>,
    events: UnboundedSender<BoardEvent>,
}

impl SimObserver {
    /// Every connect attempt so far, oldest first.
    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        lock(&self.state).attempts.clone()
    }

    /// Every command the host issued so far, oldest first.
    pub fn commands(&self) -> Vec<SimCommand> {
        lock(&self.state).commands.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).failing_connects = count;
    }

    /// Drop the link as if the board went out of range.
    pub fn drop_link(&self) {
        let was_connected = std::mem::replace(&mut lock(&self.state).connected, false);
        if was_connected {
            let _ = self.events.send(BoardEvent::Disconnected);
        }
    }
}

/// A scanner over a fixed set of scripted boards.
pub struct SimScanner {
    boards: Vec<SimBoard>,
    cursor: usize,
    scanning: bool,
    interval: Duration,
}

impl SimScanner {
    pub fn new(boards: Vec<SimBoard>) -> Self {
        Self {
            boards,
            cursor: 0,
            scanning: false,
            interval: Duration::from_millis(50),
        }
    }

    /// Demo boards for the given addresses.
    pub fn demo<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(addresses.into_iter().map(SimBoard::demo).collect())
    }

    /// Check if a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}

#[async_trait]
impl Scanner for SimScanner {
    type Board = SimBoard;

    fn start_scan(&mut self) -> Result<(), TransportError> {
        if self.scanning {
            return Err(TransportError::ScanInProgress);
        }
        self.scanning = true;
        Ok(())
    }

    async fn next_advertisement(&mut self) -> Option<Advertisement> {
        loop {
            tokio::time::sleep(self.interval).await;
            if !self.boards.is_empty() {
                let board = &self.boards[self.cursor % self.boards.len()];
                self.cursor = self.cursor.wrapping_add(1);
                return Some(board.advertisement());
            }
        }
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
    }

    fn attach(&mut self, advertisement: &Advertisement) -> Result<SimBoard, TransportError> {
        let position = self
            .boards
            .iter()
            .position(|b| advertisement.matches(b.address()))
            .ok_or_else(|| TransportError::Unavailable(advertisement.address.clone()))?;
        Ok(self.boards.remove(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stale_resume_blob_is_refused() {
        let mut board = SimBoard::new("AA:BB:CC:DD:EE:FF").reject_resume();
        let observer = board.observer();
        let blob = board.serialize_state();

        assert!(board.connect_and_set_up(Some(&blob)).await.is_err());
        assert!(board.connect_and_set_up(None).await.is_ok());

        let attempts = observer.connect_attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].resumed && !attempts[0].succeeded);
        assert!(!attempts[1].resumed && attempts[1].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_reports_progress_down_to_zero() {
        let mut board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .logging(&["acceleration"])
            .with_entries(250);
        board.connect_and_set_up(None).await.unwrap();
        board.subscribe(SignalHandle(0));
        board.download_log(100);

        let mut lefts = Vec::new();
        let mut data = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(1), board.next_event()).await
        {
            match event {
                BoardEvent::Progress { entries_left, .. } => lefts.push(entries_left),
                BoardEvent::Data { .. } => data += 1,
                _ => {}
            }
        }
        assert_eq!(lefts, vec![250, 200, 100, 0]);
        assert_eq!(data, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_link() {
        let mut board = SimBoard::new("AA:BB:CC:DD:EE:FF");
        board.connect_and_set_up(None).await.unwrap();
        board.reset();
        assert!(!board.is_connected());
        assert_eq!(board.next_event().await, Some(BoardEvent::Disconnected));
    }
}
