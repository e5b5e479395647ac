//! Log download orchestration.
//!
//! Devices are connected up front, then processed one at a time:
//!
//! ```text
//! CONNECTED ─▶ ENUMERATED ─▶ RESET_REQUESTED ─▶ DISCONNECTED ─▶ RECONNECTED
//!                                                                    │
//!        DONE ◀── FINALIZING ◀── DOWNLOADING ◀── SUBSCRIBED ◀────────┘
//!
//! any phase ──▶ ERROR
//! ```
//!
//! A failure only ends the device it happened on. Finalize failures are
//! kept in the [`RunSummary`] so the caller can surface them.

mod progress;

pub use progress::{
    BarReporter, DownloadSession, ProgressReporter, ProgressUpdate, SilentReporter,
};

use crate::capture::{
    CaptureError, CaptureState, CaptureStore, Completeness, FinalizeOutcome, FinalizedArtifact,
};
use crate::cloud::{sync_session, CloudLink, CloudSession, SessionIdentity};
use crate::config::DeviceEntry;
use crate::connection::{wait_for_disconnect, ConnectError, ConnectionManager, Device};
use crate::enumerate::{enumerate, EnumerateError};
use crate::transport::{Board, BoardEvent, Scanner, SignalHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Phases a device goes through during a download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadPhase {
    Connected,
    Enumerated,
    ResetRequested,
    Disconnected,
    Reconnected,
    Subscribed,
    Downloading,
    Finalizing,
    Done,
    Error,
}

/// Download errors.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Enumerate(#[from] EnumerateError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("artifacts left inconsistent: {0}")]
    Finalize(#[source] CaptureError),

    #[error("link to {address} dropped during download")]
    LinkLost {
        address: String,
        /// Last reported entries left, if any progress arrived
        entries_left: Option<u32>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("no device could be connected")]
    NoDevicesConnected,
}

impl DownloadError {
    /// Whether on-disk state may not match what was captured.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Finalize(_))
    }

    fn from_connect(e: ConnectError) -> Self {
        match e {
            ConnectError::Cancelled => Self::Cancelled,
            other => Self::Connect(other),
        }
    }
}

/// How a device's run ended.
#[derive(Debug)]
pub enum DeviceOutcome {
    Completed,
    /// The device was not logging anything
    NothingLogged,
    Failed(DownloadError),
}

/// What happened to one device.
#[derive(Debug)]
pub struct DeviceReport {
    pub address: String,
    pub name: Option<String>,
    /// Phases in the order they were entered
    pub phases: Vec<DownloadPhase>,
    pub outcome: DeviceOutcome,
    pub artifacts: Vec<FinalizeOutcome>,
}

impl DeviceReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, DeviceOutcome::Completed)
    }

    /// Artifacts that were renamed to a final name.
    pub fn finalized(&self) -> impl Iterator<Item = &FinalizedArtifact> {
        self.artifacts.iter().filter_map(|outcome| match outcome {
            FinalizeOutcome::Renamed(artifact) => Some(artifact),
            FinalizeOutcome::Discarded { .. } => None,
        })
    }
}

/// Result of a download run, one report per requested device.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub devices: Vec<DeviceReport>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.devices.iter().filter(|d| d.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, DeviceOutcome::Failed(_)))
            .count()
    }

    pub fn device(&self, address: &str) -> Option<&DeviceReport> {
        self.devices
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
    }

    /// Finalize failures, which the caller must not ignore.
    pub fn integrity_failures(&self) -> impl Iterator<Item = (&str, &DownloadError)> {
        self.devices.iter().filter_map(|d| match &d.outcome {
            DeviceOutcome::Failed(e) if e.is_integrity_failure() => Some((d.address.as_str(), e)),
            _ => None,
        })
    }
}

/// Tunables for a download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Reconnect budget after the pre-download reset
    pub reconnect_attempts: u32,
    /// Pause after connecting before issuing commands
    pub settle: Duration,
    /// Entries between progress notifications
    pub notify_every: u32,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            settle: Duration::from_secs(1),
            notify_every: 100,
        }
    }
}

/// Drives devices through the log download protocol.
pub struct DownloadOrchestrator<S: Scanner> {
    connections: ConnectionManager<S>,
    store: CaptureStore,
    cloud: Option<CloudLink>,
    reporter: Box<dyn ProgressReporter>,
    cancel: CancellationToken,
    options: DownloadOptions,
}

impl<S: Scanner> DownloadOrchestrator<S> {
    pub fn new(connections: ConnectionManager<S>, store: CaptureStore, options: DownloadOptions) -> Self {
        Self {
            connections,
            store,
            cloud: None,
            reporter: Box::new(SilentReporter),
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// Forward samples to a cloud service and sync after each device.
    pub fn with_cloud(mut self, cloud: CloudLink) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn connections(&self) -> &ConnectionManager<S> {
        &self.connections
    }

    /// Connect every device, then download each one in turn.
    ///
    /// Fails only when no device connected at all.
    pub async fn run(&mut self, devices: &[DeviceEntry]) -> Result<RunSummary, DownloadError> {
        let stats = Arc::clone(self.store.stats());
        let mut summary = RunSummary::default();
        let mut connected = Vec::new();

        for entry in devices {
            let attempt = tokio::select! {
                result = self.connections.connect(&entry.mac, entry.name.as_deref()) => result,
                _ = self.cancel.cancelled() => Err(ConnectError::Cancelled),
            };
            match attempt {
                Ok(device) => {
                    stats.record_device_connected();
                    connected.push(device);
                }
                Err(e) => {
                    stats.record_device_failed();
                    summary.devices.push(DeviceReport {
                        address: entry.mac.clone(),
                        name: entry.name.clone(),
                        phases: vec![DownloadPhase::Error],
                        outcome: DeviceOutcome::Failed(DownloadError::from_connect(e)),
                        artifacts: Vec::new(),
                    });
                }
            }
        }

        if connected.is_empty() {
            return Err(if self.cancel.is_cancelled() {
                DownloadError::Cancelled
            } else {
                DownloadError::NoDevicesConnected
            });
        }

        // Boards need a moment after setup before they accept commands.
        let _ = until_cancelled(&self.cancel, tokio::time::sleep(self.options.settle)).await;

        for device in connected {
            let report = self.process(device).await;
            match &report.outcome {
                DeviceOutcome::Completed => stats.record_device_completed(),
                DeviceOutcome::NothingLogged => {}
                DeviceOutcome::Failed(_) => stats.record_device_failed(),
            }
            summary.devices.push(report);
        }
        Ok(summary)
    }

    /// Run one connected device to completion or failure.
    async fn process(&mut self, mut device: Device<S::Board>) -> DeviceReport {
        let address = device.address().to_string();
        let mut phases = PhaseLog::new(&address);
        let mut captures = Vec::new();
        let mut cloud_session = None;
        phases.enter(DownloadPhase::Connected);

        let mut result = self
            .drive(&mut device, &mut phases, &mut captures, &mut cloud_session)
            .await;
        if phases.reached(DownloadPhase::Downloading) {
            self.reporter.on_finished(&address);
        }

        match &result {
            Ok(()) => {}
            Err(DownloadError::Enumerate(e)) => {
                tracing::warn!(mac = %address, "{e}");
                device.board_mut().disconnect();
                self.await_disconnect(&mut device).await;
            }
            Err(e) => {
                tracing::error!(mac = %address, "Download failed: {e}");
                if device.board().is_connected() {
                    device.board_mut().reset();
                    self.await_disconnect(&mut device).await;
                }
            }
        }

        let completeness = if result.is_ok() {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let artifacts = match self.store.finalize_all(captures, completeness) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                if let Err(earlier) = &result {
                    tracing::warn!(mac = %address, "Finalize failed after: {earlier}");
                }
                result = Err(DownloadError::Finalize(e));
                Vec::new()
            }
        };

        if let (Some(session), Some(link)) = (&cloud_session, &self.cloud) {
            sync_session(&address, session.as_ref(), &link.credentials).await;
        }

        let outcome = match result {
            Ok(()) => {
                phases.enter(DownloadPhase::Done);
                tracing::info!(mac = %address, "Device processed");
                DeviceOutcome::Completed
            }
            Err(DownloadError::Enumerate(EnumerateError::NoLoggedData)) => {
                phases.enter(DownloadPhase::Error);
                DeviceOutcome::NothingLogged
            }
            Err(e) => {
                phases.enter(DownloadPhase::Error);
                DeviceOutcome::Failed(e)
            }
        };

        DeviceReport {
            address,
            name: Some(device.name().to_string()),
            phases: phases.into_phases(),
            outcome,
            artifacts,
        }
    }

    /// The download protocol proper. Captures created along the way are
    /// left in `captures` for the caller to finalize.
    async fn drive(
        &mut self,
        device: &mut Device<S::Board>,
        phases: &mut PhaseLog,
        captures: &mut Vec<CaptureState>,
        cloud_session: &mut Option<Arc<dyn CloudSession>>,
    ) -> Result<(), DownloadError> {
        let address = device.address().to_string();
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let signals = enumerate(device.board_mut()).await?;
        phases.enter(DownloadPhase::Enumerated);
        tracing::info!(mac = %address, signals = signals.len(), "Found logged signals");

        tracing::info!(mac = %address, "Resetting device");
        device.board_mut().reset();
        phases.enter(DownloadPhase::ResetRequested);
        until_cancelled(&self.cancel, wait_for_disconnect(device.board_mut())).await?;
        device.mark_lost();
        phases.enter(DownloadPhase::Disconnected);

        let settings = *self.connections.settings();
        settings
            .reconnect
            .with_budget(Some(self.options.reconnect_attempts))
            .reconnect(device, settings.setup_timeout, &self.cancel)
            .await
            .map_err(DownloadError::from_connect)?;
        phases.enter(DownloadPhase::Reconnected);
        until_cancelled(&self.cancel, tokio::time::sleep(self.options.settle)).await?;

        if let Some(link) = &self.cloud {
            let info = device.board().info();
            *cloud_session = Some(link.service.create_session(SessionIdentity::new(
                info.firmware_revision,
                &address,
                info.model,
                device.name(),
            )));
        }

        let mut routes: HashMap<SignalHandle, usize> = HashMap::new();
        for signal in &signals {
            let capture = self
                .store
                .create(&address, signal.kind, cloud_session.clone())?;
            routes.insert(signal.handle, captures.len());
            captures.push(capture);
            device.board_mut().subscribe(signal.handle);
        }
        phases.enter(DownloadPhase::Subscribed);

        tracing::info!(mac = %address, "Downloading log");
        device.board_mut().download_log(self.options.notify_every);
        phases.enter(DownloadPhase::Downloading);
        self.receive_log(device, &routes, captures).await?;

        phases.enter(DownloadPhase::Finalizing);
        tracing::info!(mac = %address, "Download completed");
        let board = device.board_mut();
        board.erase_macros();
        board.reset_after_gc();
        board.disconnect();
        self.await_disconnect(device).await;
        Ok(())
    }

    /// Consume board events until the download completes.
    async fn receive_log(
        &mut self,
        device: &mut Device<S::Board>,
        routes: &HashMap<SignalHandle, usize>,
        captures: &mut [CaptureState],
    ) -> Result<(), DownloadError> {
        let address = device.address().to_string();
        let stats = Arc::clone(self.store.stats());
        let mut session = DownloadSession::new();

        loop {
            let event = tokio::select! {
                event = device.board_mut().next_event() => event,
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            };

            match event {
                None | Some(BoardEvent::Disconnected) => {
                    device.mark_lost();
                    return Err(DownloadError::LinkLost {
                        address,
                        entries_left: session.remaining(),
                    });
                }
                Some(BoardEvent::Progress {
                    entries_left,
                    total_entries,
                }) => match session.observe(entries_left, total_entries) {
                    ProgressUpdate::Advanced {
                        entries_left,
                        total_entries,
                    } => self.reporter.on_progress(&address, entries_left, total_entries),
                    ProgressUpdate::Completed { total_entries } => {
                        self.reporter.on_progress(&address, 0, total_entries);
                        return Ok(());
                    }
                    ProgressUpdate::Ignored => {
                        tracing::debug!(mac = %address, entries_left, "Ignoring stale progress");
                    }
                },
                Some(BoardEvent::Data { signal, sample }) => match routes.get(&signal) {
                    Some(&index) => {
                        if let Err(e) = captures[index].write(&sample) {
                            if !e.is_sample_error() {
                                return Err(e.into());
                            }
                            tracing::warn!(mac = %address, "Dropped sample: {e}");
                        }
                    }
                    None => {
                        stats.record_unhandled_entry();
                        tracing::warn!(mac = %address, ?signal, "Data for unknown signal: {}", sample.value);
                    }
                },
                Some(BoardEvent::UnknownEntry { id, epoch_ms, data }) => {
                    stats.record_unknown_entry();
                    tracing::warn!(
                        mac = %address,
                        id,
                        epoch_ms,
                        data = %hex::encode(&data),
                        "Unknown log entry"
                    );
                }
                Some(BoardEvent::UnhandledEntry(sample)) => {
                    stats.record_unhandled_entry();
                    tracing::warn!(
                        mac = %address,
                        epoch_ms = sample.epoch_ms,
                        "Unhandled log entry: {}",
                        sample.value
                    );
                }
            }
        }
    }

    /// Wait for a requested disconnect, bounded by the setup timeout.
    async fn await_disconnect(&self, device: &mut Device<S::Board>) {
        let timeout = self.connections.settings().setup_timeout;
        if tokio::time::timeout(timeout, wait_for_disconnect(device.board_mut()))
            .await
            .is_err()
        {
            tracing::warn!(mac = %device.address(), "Device did not disconnect within {timeout:?}");
        }
    }
}

/// Run `fut` unless `cancel` fires first.
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, DownloadError> {
    tokio::select! {
        output = fut => Ok(output),
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
    }
}

/// Ordered phase history of one device.
struct PhaseLog {
    address: String,
    phases: Vec<DownloadPhase>,
}

impl PhaseLog {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            phases: Vec::new(),
        }
    }

    fn enter(&mut self, phase: DownloadPhase) {
        tracing::debug!(mac = %self.address, ?phase, "Download phase");
        self.phases.push(phase);
    }

    fn reached(&self, phase: DownloadPhase) -> bool {
        self.phases.contains(&phase)
    }

    fn into_phases(self) -> Vec<DownloadPhase> {
        self.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DeviceCache;
    use crate::connection::ConnectionSettings;
    use crate::stats::create_shared_stats;
    use crate::transport::{SimBoard, SimCommand, SimScanner};

    fn orchestrator(boards: Vec<SimBoard>, dir: &std::path::Path) -> DownloadOrchestrator<SimScanner> {
        let connections = ConnectionManager::new(
            SimScanner::new(boards),
            DeviceCache::in_memory(),
            ConnectionSettings::default(),
        );
        let store = CaptureStore::new(dir, create_shared_stats()).unwrap();
        DownloadOrchestrator::new(connections, store, DownloadOptions::default())
    }

    fn entry(mac: &str) -> DeviceEntry {
        DeviceEntry {
            mac: mac.to_string(),
            name: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_order() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .logging(&["acceleration"])
            .with_entries(50);
        let mut orchestrator = orchestrator(vec![board], dir.path());

        let summary = orchestrator.run(&[entry("AA:BB:CC:DD:EE:FF")]).await.unwrap();
        let report = &summary.devices[0];
        assert!(report.is_completed());
        assert_eq!(
            report.phases,
            vec![
                DownloadPhase::Connected,
                DownloadPhase::Enumerated,
                DownloadPhase::ResetRequested,
                DownloadPhase::Disconnected,
                DownloadPhase::Reconnected,
                DownloadPhase::Subscribed,
                DownloadPhase::Downloading,
                DownloadPhase::Finalizing,
                DownloadPhase::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_logged_skips_reset() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF");
        let observer = board.observer();
        let mut orchestrator = orchestrator(vec![board], dir.path());

        let summary = orchestrator.run(&[entry("AA:BB:CC:DD:EE:FF")]).await.unwrap();
        let report = &summary.devices[0];
        assert!(matches!(report.outcome, DeviceOutcome::NothingLogged));
        assert_eq!(
            report.phases,
            vec![DownloadPhase::Connected, DownloadPhase::Error]
        );
        assert!(!observer.commands().contains(&SimCommand::Reset));
        assert_eq!(summary.failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_commands_follow_download() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .logging(&["pressure"])
            .with_entries(10);
        let observer = board.observer();
        let mut orchestrator = orchestrator(vec![board], dir.path());

        orchestrator.run(&[entry("AA:BB:CC:DD:EE:FF")]).await.unwrap();

        let commands = observer.commands();
        let tail: Vec<_> = commands.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                SimCommand::EraseMacros,
                SimCommand::ResetAfterGc,
                SimCommand::Disconnect
            ]
        );
        assert!(!observer.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_fails_device() {
        let dir = tempfile::tempdir().unwrap();
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .logging(&["acceleration"])
            .with_entries(10);
        let observer = board.observer();
        let mut orchestrator = orchestrator(vec![board], dir.path());

        // Let the first connect through, then refuse every reconnect.
        let entries = [entry("AA:BB:CC:DD:EE:FF")];
        let connect = orchestrator.run(&entries);
        tokio::pin!(connect);
        let summary = loop {
            tokio::select! {
                summary = &mut connect => break summary.unwrap(),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if observer.commands().contains(&SimCommand::Reset) {
                        observer.fail_next_connects(10);
                    }
                }
            }
        };

        let report = &summary.devices[0];
        assert!(matches!(
            report.outcome,
            DeviceOutcome::Failed(DownloadError::Connect(ConnectError::ReconnectExhausted {
                attempts: 3,
                ..
            }))
        ));
        assert_eq!(report.phases.last(), Some(&DownloadPhase::Error));
        assert!(!report.phases.contains(&DownloadPhase::Reconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_devices_connected() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(Vec::new(), dir.path());
        let result = orchestrator.run(&[entry("AA:BB:CC:DD:EE:FF")]).await;
        assert!(matches!(result, Err(DownloadError::NoDevicesConnected)));
    }
}
