//! Live streaming capture.
//!
//! Each connected device gets one capture per requested sensor and then runs
//! as its own task until the session is cancelled. A dropped link is brought
//! back with the reconnection policy and the sensors are restarted. On
//! cancellation every task resets its board, waits for the disconnect,
//! finalizes its captures and syncs buffered data to the cloud.

use crate::capture::{CaptureError, CaptureState, CaptureStore, Completeness, FinalizeOutcome};
use crate::cloud::{sync_session, CloudCredentials, CloudLink, CloudSession, SessionIdentity};
use crate::config::DeviceEntry;
use crate::connection::{
    wait_for_disconnect, ConnectError, ConnectionManager, Device, ReconnectPolicy,
};
use crate::sensor::SensorKind;
use crate::stats::SharedCaptureStats;
use crate::transport::{Board, BoardEvent, Scanner, SignalHandle, TransportError};
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Streaming errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no device could be connected")]
    NoDevicesConnected,

    #[error("no active sensors to receive data from")]
    NoActiveSensors,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("artifacts left inconsistent: {0}")]
    Finalize(#[source] CaptureError),

    #[error("event stream of {address} closed")]
    EventsClosed { address: String },

    #[error("streaming from {address} panicked")]
    Panicked { address: String },
}

impl StreamError {
    /// Whether on-disk state may not match what was captured.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Finalize(_))
    }
}

/// Tunables for a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Reconnect budget on link loss; `None` retries forever
    pub reconnect_attempts: Option<u32>,
    /// Pause after connecting before programming sensors
    pub settle: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect_attempts: None,
            settle: Duration::from_secs(1),
        }
    }
}

/// What happened to one streamed device.
#[derive(Debug)]
pub struct StreamDeviceReport {
    pub address: String,
    pub name: String,
    pub sensors: Vec<SensorKind>,
    pub artifacts: Vec<FinalizeOutcome>,
    /// Why the device stopped early, if it did
    pub error: Option<StreamError>,
}

/// Result of a streaming session.
#[derive(Debug, Default)]
pub struct StreamSummary {
    pub devices: Vec<StreamDeviceReport>,
    /// Devices that never connected
    pub skipped: Vec<(String, ConnectError)>,
}

impl StreamSummary {
    pub fn device(&self, address: &str) -> Option<&StreamDeviceReport> {
        self.devices
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
    }

    pub fn integrity_failures(&self) -> impl Iterator<Item = (&str, &StreamError)> {
        self.devices.iter().filter_map(|d| match &d.error {
            Some(e) if e.is_integrity_failure() => Some((d.address.as_str(), e)),
            _ => None,
        })
    }
}

/// A sensor enabled on a device.
#[derive(Debug, Clone, Copy)]
struct ActiveSensor {
    kind: SensorKind,
    odr_hz: f32,
    signal: SignalHandle,
}

/// Streams live sensor data from a set of devices.
pub struct StreamSession<S: Scanner> {
    connections: ConnectionManager<S>,
    store: CaptureStore,
    cloud: Option<CloudLink>,
    cancel: CancellationToken,
    options: StreamOptions,
}

impl<S: Scanner> StreamSession<S> {
    pub fn new(connections: ConnectionManager<S>, store: CaptureStore, options: StreamOptions) -> Self {
        Self {
            connections,
            store,
            cloud: None,
            cancel: CancellationToken::new(),
            options,
        }
    }

    pub fn with_cloud(mut self, cloud: CloudLink) -> Self {
        self.cloud = Some(cloud);
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

    /// Connect, start the requested sensors and stream until cancelled.
    ///
    /// `sensors` maps sensor names to output data rates in Hz.
    pub async fn run(
        &mut self,
        devices: &[DeviceEntry],
        sensors: &BTreeMap<String, f32>,
    ) -> Result<StreamSummary, StreamError> {
        let stats = Arc::clone(self.store.stats());
        let mut summary = StreamSummary::default();
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
                    summary.skipped.push((entry.mac.clone(), e));
                }
            }
        }
        if connected.is_empty() {
            tracing::error!("Failed to connect to any devices, terminating");
            return Err(StreamError::NoDevicesConnected);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.options.settle) => {}
            _ = self.cancel.cancelled() => {}
        }

        tracing::info!("Configuring devices");
        let requested = parse_sensors(sensors);
        let setup_timeout = self.connections.settings().setup_timeout;
        let mut ready = Vec::new();
        for mut device in connected {
            let cloud_session = self.cloud.as_ref().map(|link| {
                let info = device.board().info();
                link.service.create_session(SessionIdentity::new(
                    info.firmware_revision,
                    device.address(),
                    info.model,
                    device.name(),
                ))
            });

            let mut active = Vec::new();
            let mut captures = Vec::new();
            let enabled = self.enable_sensors(
                &mut device,
                &requested,
                cloud_session.clone(),
                &mut active,
                &mut captures,
            );

            if let Err(e) = enabled {
                tracing::error!(mac = %device.address(), "Failed to set up captures: {e}");
                stats.record_device_failed();
                summary
                    .devices
                    .push(self.abandon(device, active, captures, e.into(), setup_timeout).await);
                continue;
            }

            if active.is_empty() {
                tracing::warn!(mac = %device.address(), "No sensors were enabled for device");
                device.board_mut().disconnect();
                await_disconnect(&mut device, setup_timeout).await;
                continue;
            }
            ready.push((device, active, captures, cloud_session));
        }

        if ready.is_empty() {
            if summary.devices.is_empty() {
                tracing::error!("No active sensors to receive data from, terminating");
                return Err(StreamError::NoActiveSensors);
            }
            return Ok(summary);
        }

        for (device, active, _, _) in ready.iter_mut() {
            for sensor in active.iter() {
                if let Err(e) = sensor.kind.configure(device.board_mut(), sensor.odr_hz).await {
                    tracing::warn!(mac = %device.address(), sensor = %sensor.kind, "Failed to configure: {e}");
                }
            }
            for sensor in active.iter() {
                if let Err(e) = sensor.kind.start(device.board_mut()) {
                    tracing::warn!(mac = %device.address(), sensor = %sensor.kind, "Failed to start: {e}");
                }
            }
        }

        tracing::info!(devices = ready.len(), "Streaming data, cancel to stop");
        let settings = *self.connections.settings();
        let mut tasks = JoinSet::new();
        for (device, active, captures, cloud_session) in ready {
            let task = DeviceTask {
                device,
                active,
                captures,
                store: self.store.clone(),
                cloud: cloud_session.zip(self.cloud.as_ref().map(|l| l.credentials.clone())),
                cancel: self.cancel.clone(),
                policy: settings.reconnect.with_budget(self.options.reconnect_attempts),
                setup_timeout: settings.setup_timeout,
                stats: Arc::clone(&stats),
            };
            tasks.spawn(task.run());
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => summary.devices.push(report),
                Err(e) => tracing::error!("Device task failed: {e}"),
            }
        }
        Ok(summary)
    }

    /// Create and subscribe a capture for every requested sensor the board has.
    ///
    /// Captures created before a failure are left in `captures`.
    fn enable_sensors(
        &self,
        device: &mut Device<S::Board>,
        requested: &[(SensorKind, f32)],
        cloud_session: Option<Arc<dyn CloudSession>>,
        active: &mut Vec<ActiveSensor>,
        captures: &mut Vec<CaptureState>,
    ) -> Result<(), CaptureError> {
        let address = device.address().to_string();

        for &(kind, odr_hz) in requested {
            if !kind.exists(device.board()) {
                tracing::warn!(mac = %address, sensor = %kind, "Sensor does not exist on device");
                continue;
            }
            let signal = match kind.signal(device.board_mut()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(mac = %address, sensor = %kind, "No data signal: {e}");
                    continue;
                }
            };
            captures.push(self.store.create(&address, kind, cloud_session.clone())?);
            device.board_mut().subscribe(signal);
            active.push(ActiveSensor {
                kind,
                odr_hz,
                signal,
            });
        }
        Ok(())
    }

    /// Drop a device that failed before streaming started.
    async fn abandon(
        &self,
        mut device: Device<S::Board>,
        active: Vec<ActiveSensor>,
        captures: Vec<CaptureState>,
        mut error: StreamError,
        setup_timeout: Duration,
    ) -> StreamDeviceReport {
        device.board_mut().disconnect();
        await_disconnect(&mut device, setup_timeout).await;

        let artifacts = match self.store.finalize_all(captures, Completeness::Partial) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!(mac = %device.address(), "Finalize failed after: {error}");
                error = StreamError::Finalize(e);
                Vec::new()
            }
        };

        StreamDeviceReport {
            address: device.address().to_string(),
            name: device.name().to_string(),
            sensors: active.iter().map(|s| s.kind).collect(),
            artifacts,
            error: Some(error),
        }
    }
}

/// Resolve configured sensor names, warning about unknown ones.
fn parse_sensors(sensors: &BTreeMap<String, f32>) -> Vec<(SensorKind, f32)> {
    sensors
        .iter()
        .filter_map(|(name, hz)| match name.parse::<SensorKind>() {
            Ok(kind) => Some((kind, *hz)),
            Err(e) => {
                tracing::warn!("{e}");
                None
            }
        })
        .collect()
}

async fn await_disconnect<B: Board>(device: &mut Device<B>, timeout: Duration) {
    if tokio::time::timeout(timeout, wait_for_disconnect(device.board_mut()))
        .await
        .is_err()
    {
        tracing::warn!(mac = %device.address(), "Device did not disconnect within {timeout:?}");
    }
}

/// Everything one device's streaming task owns.
struct DeviceTask<B: Board> {
    device: Device<B>,
    active: Vec<ActiveSensor>,
    captures: Vec<CaptureState>,
    store: CaptureStore,
    cloud: Option<(Arc<dyn CloudSession>, CloudCredentials)>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
    setup_timeout: Duration,
    stats: SharedCaptureStats,
}

impl<B: Board> DeviceTask<B> {
    async fn run(mut self) -> StreamDeviceReport {
        let address = self.device.address().to_string();
        let routes: HashMap<SignalHandle, usize> = self
            .active
            .iter()
            .enumerate()
            .map(|(index, sensor)| (sensor.signal, index))
            .collect();

        let mut error = match AssertUnwindSafe(self.receive(&routes)).catch_unwind().await {
            Ok(received) => received.err(),
            Err(_) => Some(StreamError::Panicked { address: address.clone() }),
        };

        if self.device.board().is_connected() {
            tracing::info!(mac = %address, "Resetting device");
            self.device.board_mut().reset();
            await_disconnect(&mut self.device, self.setup_timeout).await;
        }

        let completeness = if error.is_none() {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let captures = std::mem::take(&mut self.captures);
        let artifacts = match self.store.finalize_all(captures, completeness) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                error = Some(StreamError::Finalize(e));
                Vec::new()
            }
        };

        if let Some((session, credentials)) = &self.cloud {
            sync_session(&address, session.as_ref(), credentials).await;
        }

        match &error {
            None => self.stats.record_device_completed(),
            Some(e) => {
                tracing::error!(mac = %address, "Streaming stopped: {e}");
                self.stats.record_device_failed();
            }
        }

        StreamDeviceReport {
            address,
            name: self.device.name().to_string(),
            sensors: self.active.iter().map(|s| s.kind).collect(),
            artifacts,
            error,
        }
    }

    /// Write samples until cancelled. Returns early only on a failure.
    async fn receive(&mut self, routes: &HashMap<SignalHandle, usize>) -> Result<(), StreamError> {
        let address = self.device.address().to_string();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                event = self.device.board_mut().next_event() => event,
            };

            match event {
                Some(BoardEvent::Data { signal, sample }) => {
                    let Some(&index) = routes.get(&signal) else {
                        tracing::trace!(mac = %address, ?signal, "Data for unsubscribed signal");
                        continue;
                    };
                    if let Err(e) = self.captures[index].write(&sample) {
                        if !e.is_sample_error() {
                            return Err(e.into());
                        }
                        tracing::warn!(mac = %address, "Dropped sample: {e}");
                    }
                }
                Some(BoardEvent::Disconnected) => {
                    tracing::warn!(mac = %address, "Connection lost");
                    self.device.mark_lost();
                    match self
                        .policy
                        .reconnect(&mut self.device, self.setup_timeout, &self.cancel)
                        .await
                    {
                        Ok(()) => self.restart_sensors().await,
                        Err(ConnectError::Cancelled) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(other) => {
                    tracing::trace!(mac = %address, "Ignoring {other:?} while streaming");
                }
                None => return Err(StreamError::EventsClosed { address }),
            }
        }
    }

    /// Bring the sensors back after a reconnect; setup loses them.
    async fn restart_sensors(&mut self) {
        let board = self.device.board_mut();
        for sensor in &self.active {
            board.subscribe(sensor.signal);
        }
        for sensor in &self.active {
            let restarted: Result<(), TransportError> = async {
                sensor.kind.configure(board, sensor.odr_hz).await?;
                sensor.kind.start(board)
            }
            .await;
            if let Err(e) = restarted {
                tracing::warn!(mac = %board.address(), sensor = %sensor.kind, "Failed to restart: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sensor_names_are_skipped() {
        let mut sensors = BTreeMap::new();
        sensors.insert("Accelerometer".to_string(), 50.0);
        sensors.insert("Thermometer".to_string(), 1.0);
        sensors.insert("euler angles".to_string(), 25.0);

        let parsed = parse_sensors(&sensors);
        assert_eq!(
            parsed,
            vec![
                (SensorKind::Accelerometer, 50.0),
                (SensorKind::EulerAngles, 25.0)
            ]
        );
    }
}
