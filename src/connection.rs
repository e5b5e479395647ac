//! Device discovery, connection and reconnection.
//!
//! ```text
//! DISCOVERING ──▶ CONNECTING ──▶ CONNECTED ◀──▶ RECONNECTING
//!      │               │                              │
//!      └──── timeout ──┴──────────▶ FAILED ◀── budget exhausted
//! ```
//!
//! First-time connects try the cached resume blob before falling back to
//! full setup, and always refresh the cache afterwards. Reconnects after a
//! link drop always run full setup: dropping invalidates whatever session
//! state the board had.

use crate::cache::DeviceCache;
use crate::transport::{Advertisement, Board, BoardEvent, Scanner, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default name when neither the advertisement nor the config names a device.
pub const DEFAULT_DEVICE_NAME: &str = "Board";

/// Connection state of a [`Device`].
///
/// Discovery and first-time setup happen inside [`ConnectionManager::connect`]
/// before a `Device` exists, so every device starts out `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Failed,
}

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("could not find device {address} within {timeout:?}")]
    NotFound { address: String, timeout: Duration },

    #[error("failed to initialize {address}: {source}")]
    Setup {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("timed out initializing {address}")]
    SetupTimeout { address: String },

    #[error("gave up reconnecting to {address} after {attempts} attempts")]
    ReconnectExhausted { address: String, attempts: u32 },

    #[error("scanner unavailable: {0}")]
    Scan(#[from] TransportError),

    #[error("cancelled")]
    Cancelled,
}

/// A board owned by one orchestration run.
pub struct Device<B> {
    board: B,
    name: String,
    state: LinkState,
}

impl<B: Board> Device<B> {
    /// Wrap a board that is already connected.
    pub fn connected(board: B, name: impl Into<String>) -> Self {
        Self {
            board,
            name: name.into(),
            state: LinkState::Connected,
        }
    }

    pub fn address(&self) -> &str {
        self.board.address()
    }

    /// Human-readable device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_board(self) -> B {
        self.board
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            tracing::debug!(mac = %self.board.address(), from = ?self.state, to = ?next, "Link state");
            self.state = next;
        }
    }

    /// Record that the link dropped.
    pub fn mark_lost(&mut self) {
        self.transition(LinkState::Reconnecting);
    }
}

/// Reconnection backoff: 5s, 15s, 25s, ... capped at 60s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
    /// Attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            step: Duration::from_secs(10),
            max: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Same delays with a retry budget.
    pub fn with_budget(self, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Delays to wait after each failed attempt.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial,
            step: self.step,
            max: self.max,
            remaining: self.max_attempts,
        }
    }

    /// Bring a dropped link back up, waiting between failed attempts.
    pub async fn reconnect<B: Board>(
        &self,
        device: &mut Device<B>,
        setup_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        device.transition(LinkState::Reconnecting);
        let address = device.address().to_string();
        let mut attempts = 0u32;

        for delay in self.delays() {
            attempts += 1;
            tracing::info!(mac = %address, attempt = attempts, "Attempting to reconnect");

            match set_up(device.board_mut(), None, setup_timeout).await {
                Ok(()) => {
                    tracing::info!(mac = %address, "Reconnected to device");
                    device.transition(LinkState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    let last = self.max_attempts.is_some_and(|max| attempts >= max);
                    if last {
                        tracing::info!(mac = %address, "Failed to reconnect ({e})");
                        break;
                    }
                    tracing::info!(
                        mac = %address,
                        "Failed to reconnect ({e}), trying again in {}s",
                        delay.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    device.transition(LinkState::Failed);
                    return Err(ConnectError::Cancelled);
                }
            }
        }

        tracing::warn!(mac = %address, "Failed to reconnect to device");
        device.transition(LinkState::Failed);
        Err(ConnectError::ReconnectExhausted { address, attempts })
    }
}

/// Iterator over reconnection delays.
///
/// Delays never decrease; the iterator ends when the attempt budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    step: Duration,
    max: Duration,
    remaining: Option<u32>,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let delay = self.next.min(self.max);
        self.next = (self.next + self.step).min(self.max);
        Some(delay)
    }
}

/// Timeouts and retry policy for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long to scan for a device
    pub discovery_timeout: Duration,
    /// How long a single setup may take
    pub setup_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Finds and connects devices, keeping the device cache up to date.
///
/// Holds the only scanner of the process; `&mut self` on [`discover`]
/// guarantees a single discovery pass at a time.
///
/// [`discover`]: ConnectionManager::discover
pub struct ConnectionManager<S: Scanner> {
    scanner: S,
    cache: DeviceCache,
    settings: ConnectionSettings,
}

impl<S: Scanner> ConnectionManager<S> {
    pub fn new(scanner: S, cache: DeviceCache, settings: ConnectionSettings) -> Self {
        Self {
            scanner,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Scan until `address` advertises or the discovery timeout elapses.
    pub async fn discover(&mut self, address: &str) -> Result<(S::Board, Advertisement), ConnectError> {
        let timeout = self.settings.discovery_timeout;
        self.scanner.start_scan()?;

        let scanner = &mut self.scanner;
        let found = tokio::time::timeout(timeout, async {
            while let Some(adv) = scanner.next_advertisement().await {
                if adv.matches(address) {
                    return Some(adv);
                }
            }
            None
        })
        .await;

        self.scanner.stop_scan();

        match found {
            Ok(Some(adv)) => {
                let board = self.scanner.attach(&adv)?;
                Ok((board, adv))
            }
            Ok(None) | Err(_) => Err(ConnectError::NotFound {
                address: address.to_string(),
                timeout,
            }),
        }
    }

    /// Discover and connect a device.
    ///
    /// `configured_name` is used when the advertisement carries no name.
    pub async fn connect(
        &mut self,
        address: &str,
        configured_name: Option<&str>,
    ) -> Result<Device<S::Board>, ConnectError> {
        tracing::info!(mac = %address, "Connecting to device");
        tracing::debug!(mac = %address, "Discovering");

        let (mut board, adv) = match self.discover(address).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(mac = %address, "{e}");
                return Err(e);
            }
        };
        tracing::debug!(mac = %address, "Running setup");

        let setup_timeout = self.settings.setup_timeout;
        let connected = match self.cache.resume_blob(address) {
            Some(blob) => match set_up(&mut board, Some(&blob), setup_timeout).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::info!(mac = %address, "Cached state rejected ({e}), running full setup");
                    set_up(&mut board, None, setup_timeout).await
                }
            },
            None => set_up(&mut board, None, setup_timeout).await,
        };

        if let Err(e) = connected {
            tracing::warn!(mac = %address, "{e}");
            return Err(e);
        }

        if let Err(e) = self.cache.store(board.address(), &board.serialize_state()) {
            tracing::warn!(mac = %address, "Could not save device state: {e}");
        }

        let name = adv
            .manufacturer_name()
            .or_else(|| configured_name.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());
        tracing::info!(mac = %address, name = %name, "Connected to device");
        Ok(Device::connected(board, name))
    }
}

/// Run one setup bounded by `timeout`.
async fn set_up<B: Board>(
    board: &mut B,
    resume: Option<&[u8]>,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let address = board.address().to_string();
    match tokio::time::timeout(timeout, board.connect_and_set_up(resume)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ConnectError::Setup { address, source }),
        Err(_) => Err(ConnectError::SetupTimeout { address }),
    }
}

/// Wait until the board reports that its link dropped.
///
/// Any other notification arriving meanwhile is discarded.
pub async fn wait_for_disconnect<B: Board>(board: &mut B) {
    loop {
        match board.next_event().await {
            Some(BoardEvent::Disconnected) | None => return,
            Some(other) => {
                tracing::trace!(mac = %board.address(), "Discarding {other:?} while waiting for disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimBoard, SimScanner};

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_backoff_sequence_caps_at_sixty() {
        let delays: Vec<_> = ReconnectPolicy::default().delays().take(9).collect();
        assert_eq!(delays, secs(&[5, 15, 25, 35, 45, 55, 60, 60, 60]));
    }

    #[test]
    fn test_backoff_stops_when_budget_spent() {
        let policy = ReconnectPolicy::default().with_budget(Some(3));
        assert_eq!(policy.delays().collect::<Vec<_>>(), secs(&[5, 15, 25]));

        let none = ReconnectPolicy::default().with_budget(Some(0));
        assert_eq!(none.delays().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_times_out() {
        let scanner = SimScanner::new(vec![SimBoard::new("11:22:33:44:55:66")]);
        let mut manager =
            ConnectionManager::new(scanner, DeviceCache::in_memory(), ConnectionSettings::default());

        let err = manager.connect("AA:BB:CC:DD:EE:FF", None).await.err();
        assert!(matches!(err, Some(ConnectError::NotFound { .. })));
        assert!(!manager.scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stores_blob_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");

        let first = SimBoard::new("aa:bb:cc:dd:ee:ff");
        let first_observer = first.observer();
        let mut manager = ConnectionManager::new(
            SimScanner::new(vec![first]),
            DeviceCache::load(&cache_path).unwrap(),
            ConnectionSettings::default(),
        );
        let device = manager.connect("AA:BB:CC:DD:EE:FF", Some("Wrist")).await.unwrap();
        assert_eq!(device.state(), LinkState::Connected);
        assert_eq!(device.name(), "Wrist");
        assert!(!first_observer.connect_attempts()[0].resumed);

        let cache = DeviceCache::load(&cache_path).unwrap();
        assert!(cache.resume_blob("AA:BB:CC:DD:EE:FF").is_some());

        let second = SimBoard::new("AA:BB:CC:DD:EE:FF");
        let second_observer = second.observer();
        let mut manager =
            ConnectionManager::new(SimScanner::new(vec![second]), cache, ConnectionSettings::default());
        manager.connect("AA:BB:CC:DD:EE:FF", None).await.unwrap();

        let attempts = second_observer.connect_attempts();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].resumed && attempts[0].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_blob_falls_back_to_full_setup() {
        let mut cache = DeviceCache::in_memory();
        cache.store("AA:BB:CC:DD:EE:FF", b"from an older firmware").unwrap();

        let board = SimBoard::new("AA:BB:CC:DD:EE:FF").named("Ankle");
        let observer = board.observer();
        let mut manager =
            ConnectionManager::new(SimScanner::new(vec![board]), cache, ConnectionSettings::default());

        let device = manager.connect("AA:BB:CC:DD:EE:FF", Some("ignored")).await.unwrap();
        assert_eq!(device.name(), "Ankle");

        let attempts = observer.connect_attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].resumed && !attempts[0].succeeded);
        assert!(!attempts[1].resumed && attempts[1].succeeded);
        assert_eq!(
            manager.cache().resume_blob("AA:BB:CC:DD:EE:FF"),
            Some(device.board().serialize_state())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout() {
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF").setup_latency(Duration::from_secs(30));
        let mut manager = ConnectionManager::new(
            SimScanner::new(vec![board]),
            DeviceCache::in_memory(),
            ConnectionSettings::default(),
        );
        let err = manager.connect("AA:BB:CC:DD:EE:FF", None).await.err();
        assert!(matches!(err, Some(ConnectError::SetupTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_between_attempts() {
        let mut board = SimBoard::new("AA:BB:CC:DD:EE:FF").setup_latency(Duration::ZERO);
        board.connect_and_set_up(None).await.unwrap();
        let observer = board.observer();
        let mut device = Device::connected(board, "Board");

        observer.drop_link();
        observer.fail_next_connects(2);

        let started = tokio::time::Instant::now();
        let policy = ReconnectPolicy::default().with_budget(Some(3));
        policy
            .reconnect(&mut device, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(device.state(), LinkState::Connected);
        assert_eq!(started.elapsed(), Duration::from_secs(5 + 15));
        assert!(observer.connect_attempts().iter().all(|a| !a.resumed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_budget() {
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .setup_latency(Duration::ZERO)
            .failing_connects(10);
        let observer = board.observer();
        let mut device = Device::connected(board, "Board");
        assert_eq!(device.state(), LinkState::Connected);
        device.mark_lost();
        assert_eq!(device.state(), LinkState::Reconnecting);

        let policy = ReconnectPolicy::default().with_budget(Some(3));
        let err = policy
            .reconnect(&mut device, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ConnectError::ReconnectExhausted {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                attempts: 3
            }
        );
        assert_eq!(device.state(), LinkState::Failed);
        assert_eq!(observer.connect_attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_cancellable() {
        let board = SimBoard::new("AA:BB:CC:DD:EE:FF")
            .setup_latency(Duration::ZERO)
            .failing_connects(u32::MAX);
        let mut device = Device::connected(board, "Board");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = ReconnectPolicy::default()
            .reconnect(&mut device, Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::Cancelled);
    }
}
