//! Scanner used when no radio backend is linked in.
//!
//! This exists so the binary builds and runs everywhere; every device lookup
//! simply times out.

use super::sim::SimBoard;
use super::{Advertisement, Scanner, TransportError};
use async_trait::async_trait;

/// A scanner that never sees any advertisement.
#[derive(Debug, Default)]
pub struct NoopScanner {
    scanning: bool,
}

impl NoopScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}

#[async_trait]
impl Scanner for NoopScanner {
    type Board = SimBoard;

    fn start_scan(&mut self) -> Result<(), TransportError> {
        if self.scanning {
            return Err(TransportError::ScanInProgress);
        }
        self.scanning = true;
        Ok(())
    }

    async fn next_advertisement(&mut self) -> Option<Advertisement> {
        std::future::pending().await
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
    }

    fn attach(&mut self, advertisement: &Advertisement) -> Result<SimBoard, TransportError> {
        Err(TransportError::Unavailable(advertisement.address.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_scan_at_a_time() {
        let mut scanner = NoopScanner::new();
        assert!(scanner.start_scan().is_ok());
        assert_eq!(scanner.start_scan(), Err(TransportError::ScanInProgress));
        scanner.stop_scan();
        assert!(!scanner.is_scanning());
        assert!(scanner.start_scan().is_ok());
    }
}
