//! Enumeration of the signals a board is logging.

use crate::sensor::SensorKind;
use crate::transport::{Board, SignalHandle, SignalsReply, TransportError};
use thiserror::Error;

/// A logged signal, classified into a sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnonymousSignal {
    pub handle: SignalHandle,
    pub kind: SensorKind,
}

/// Enumeration failures.
///
/// None of these are link failures; they never trigger reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumerateError {
    #[error("device is not logging any sensor data")]
    NoLoggedData,

    #[error("failed to create anonymous data signals (status = {0})")]
    EnumerationFailed(i32),

    #[error("device logs an unmapped signal '{0}'")]
    UnknownIdentifier(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Ask the board for every signal it is logging.
pub async fn enumerate<B: Board>(board: &mut B) -> Result<Vec<AnonymousSignal>, EnumerateError> {
    tracing::info!(mac = %board.address(), "Syncing log information");

    let raw = match board.create_anonymous_signals().await? {
        SignalsReply::Status(status) => return Err(EnumerateError::EnumerationFailed(status)),
        SignalsReply::Signals(signals) if signals.is_empty() => {
            return Err(EnumerateError::NoLoggedData)
        }
        SignalsReply::Signals(signals) => signals,
    };

    raw.into_iter()
        .map(|signal| {
            SensorKind::from_identifier(&signal.identifier)
                .map(|kind| AnonymousSignal {
                    handle: signal.handle,
                    kind,
                })
                .ok_or(EnumerateError::UnknownIdentifier(signal.identifier))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimBoard;

    async fn connected(board: SimBoard) -> SimBoard {
        let mut board = board;
        board.connect_and_set_up(None).await.unwrap();
        board
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_classifies_signals() {
        let mut board = connected(SimBoard::new("AA:BB:CC:DD:EE:FF").logging(&[
            "acceleration",
            "pressure",
            "magnetic-field",
        ]))
        .await;

        let signals = enumerate(&mut board).await.unwrap();
        let kinds: Vec<_> = signals.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SensorKind::Accelerometer,
                SensorKind::Pressure,
                SensorKind::Magnetometer
            ]
        );
        assert_eq!(signals[1].handle, SignalHandle(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_nothing_logged() {
        let mut board = connected(SimBoard::new("AA:BB:CC:DD:EE:FF")).await;
        assert_eq!(enumerate(&mut board).await, Err(EnumerateError::NoLoggedData));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_error_status() {
        let mut board =
            connected(SimBoard::new("AA:BB:CC:DD:EE:FF").enumeration_status(16)).await;
        assert_eq!(
            enumerate(&mut board).await,
            Err(EnumerateError::EnumerationFailed(16))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_unmapped_identifier() {
        let mut board =
            connected(SimBoard::new("AA:BB:CC:DD:EE:FF").logging(&["acceleration", "temperature"]))
                .await;
        assert_eq!(
            enumerate(&mut board).await,
            Err(EnumerateError::UnknownIdentifier("temperature".to_string()))
        );
    }

    #[tokio::test]
    async fn test_enumerate_requires_link() {
        let mut board = SimBoard::new("AA:BB:CC:DD:EE:FF").logging(&["acceleration"]);
        assert_eq!(
            enumerate(&mut board).await,
            Err(EnumerateError::Transport(TransportError::NotConnected))
        );
    }
}
