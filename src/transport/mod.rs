//! Radio transport seam.
//!
//! Discovery, GATT plumbing and MTU negotiation live outside this crate.
//! Backends expose a board through the [`Board`] and [`Scanner`] traits;
//! everything the board reports comes back as [`BoardEvent`]s in FIFO order.

pub mod noop;
pub mod sim;
pub mod types;

use crate::sensor::SensorKind;
use async_trait::async_trait;

pub use noop::NoopScanner;
pub use sim::{ConnectAttempt, SimBoard, SimCommand, SimObserver, SimScanner};
pub use types::{
    Advertisement, BoardEvent, BoardInfo, RawSignal, Sample, SampleValue, SignalHandle,
    SignalsReply, TransportError,
};

/// A connected (or connectable) sensor board.
///
/// Command methods are fire-and-forget: their effects are observed through
/// [`Board::next_event`], the same way the board firmware answers with
/// notifications rather than return values.
#[async_trait]
pub trait Board: Send + 'static {
    /// Hardware address of the board.
    fn address(&self) -> &str;

    /// Model and firmware details, valid after the first setup.
    fn info(&self) -> BoardInfo;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Connect and initialize the board.
    ///
    /// With `resume` set, the backend restores the serialized setup state
    /// instead of running full service discovery. A stale blob makes this
    /// fail like any other setup error.
    async fn connect_and_set_up(&mut self, resume: Option<&[u8]>) -> Result<(), TransportError>;

    /// Serialize the current setup state into a resume blob.
    fn serialize_state(&self) -> Vec<u8>;

    /// Ask the board for a handle to every signal it is logging.
    async fn create_anonymous_signals(&mut self) -> Result<SignalsReply, TransportError>;

    /// Route samples of `signal` to [`BoardEvent::Data`].
    fn subscribe(&mut self, signal: SignalHandle);

    /// Start the bulk log download, reporting progress every `notify_every` entries.
    fn download_log(&mut self, notify_every: u32);

    /// Reset the board. The link drops as a consequence.
    fn reset(&mut self);

    /// Reset after the logger has garbage collected downloaded entries.
    fn reset_after_gc(&mut self);

    /// Erase every macro scheduled on the board.
    fn erase_macros(&mut self);

    /// Drop the link from the board side.
    fn disconnect(&mut self);

    /// Wait for the next notification. `None` once the backend is gone.
    async fn next_event(&mut self) -> Option<BoardEvent>;

    /// Whether the board carries the given sensor.
    fn has_sensor(&self, kind: SensorKind) -> bool;

    /// Program the sensor for the requested output data rate.
    async fn configure_sensor(&mut self, kind: SensorKind, odr_hz: f32)
        -> Result<(), TransportError>;

    /// Start sampling on a configured sensor.
    fn start_sensor(&mut self, kind: SensorKind) -> Result<(), TransportError>;

    /// Live data signal of a sensor.
    fn sensor_signal(&mut self, kind: SensorKind) -> Result<SignalHandle, TransportError>;
}

/// Advertisement source.
///
/// Only one scan may be active at a time: starting address scans and
/// global scans concurrently is undefined on the radio stacks we target.
#[async_trait]
pub trait Scanner: Send {
    type Board: Board;

    /// Begin scanning.
    fn start_scan(&mut self) -> Result<(), TransportError>;

    /// Wait for the next advertisement. `None` when the scanner is exhausted.
    async fn next_advertisement(&mut self) -> Option<Advertisement>;

    /// Stop scanning.
    fn stop_scan(&mut self);

    /// Obtain a board handle for an advertisement seen during this scan.
    fn attach(&mut self, advertisement: &Advertisement) -> Result<Self::Board, TransportError>;
}
