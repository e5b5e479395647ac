//! blelog agent - log download and capture for wireless sensor boards.
//!
//! This library connects to sensor boards over an unreliable wireless link,
//! drives their on-board logger through a reset/enumerate/download/finalize
//! sequence and persists every logged signal to its own CSV file.
//!
//! # Guarantees
//!
//! - **Resumable setup**: boards are set up from a cached resume blob when
//!   one exists, falling back to full setup when it is stale
//! - **Bounded retries**: dropped links are retried with a growing backoff
//! - **Honest artifacts**: a file is only given its final name once it has
//!   been flushed, and incomplete captures are marked as such
//! - **Isolation**: a failing device never stops the others
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        blelog agent                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐            │
//! │  │ Connection │──▶│ Enumerate  │──▶│  Download  │            │
//! │  │  Manager   │   │  signals   │   │Orchestrator│            │
//! │  └────────────┘   └────────────┘   └────────────┘            │
//! │        │                                 │                   │
//! │        ▼                                 ▼                   │
//! │  ┌────────────┐                   ┌────────────┐  ┌───────┐  │
//! │  │   Device   │                   │  Capture   │─▶│ Cloud │  │
//! │  │   Cache    │                   │   Store    │  │ Sync  │  │
//! │  └────────────┘                   └────────────┘  └───────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use blelog_agent::{
//!     CaptureStore, ConnectionManager, ConnectionSettings, DeviceCache, DeviceEntry,
//!     DownloadOptions, DownloadOrchestrator, SimScanner,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scanner = SimScanner::demo(["AA:BB:CC:DD:EE:FF"]);
//! let connections = ConnectionManager::new(
//!     scanner,
//!     DeviceCache::load_or_empty(".cache.json"),
//!     ConnectionSettings::default(),
//! );
//! let store = CaptureStore::new("output", blelog_agent::stats::create_shared_stats())?;
//!
//! let mut orchestrator = DownloadOrchestrator::new(connections, store, DownloadOptions::default());
//! let summary = orchestrator.run(&[DeviceEntry::new("AA:BB:CC:DD:EE:FF")]).await?;
//! println!("{} device(s) completed", summary.completed());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod capture;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod download;
pub mod enumerate;
pub mod sensor;
pub mod stats;
pub mod stream;
pub mod transport;

// Re-export key types at crate root for convenience
pub use cache::{CacheError, DeviceCache};
pub use capture::{CaptureError, CaptureState, CaptureStore, Completeness, FinalizedArtifact};
pub use cloud::{CloudCredentials, CloudError, CloudLink, CloudSession, CloudSync};
pub use config::{Config, ConfigError, DeviceEntry};
pub use connection::{
    ConnectError, ConnectionManager, ConnectionSettings, Device, LinkState, ReconnectPolicy,
};
pub use download::{
    DeviceOutcome, DownloadError, DownloadOptions, DownloadOrchestrator, DownloadPhase,
    ProgressReporter, RunSummary,
};
pub use enumerate::{enumerate, AnonymousSignal, EnumerateError};
pub use sensor::SensorKind;
pub use stats::{CaptureStats, SharedCaptureStats};
pub use stream::{StreamError, StreamOptions, StreamSession, StreamSummary};
pub use transport::{Board, BoardEvent, NoopScanner, Scanner, SimBoard, SimScanner};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION.split('.').count(), 3);
    }
}
