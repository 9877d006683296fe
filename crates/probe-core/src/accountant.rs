use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Process-wide counters of transport connections.
///
/// Updated by the dial hook (`connection_opened`) and by the traced
/// connection's drop (`connection_closed`). Purely observational: it never
/// delays or denies a connection.
#[derive(Debug, Default)]
pub struct ConnectionAccountant {
    open: AtomicI64,
    opened: AtomicU64,
    closed: AtomicU64,
}

static GLOBAL: OnceLock<Arc<ConnectionAccountant>> = OnceLock::new();

/// The accountant shared by every client built in this process.
pub fn global() -> Arc<ConnectionAccountant> {
    GLOBAL
        .get_or_init(|| Arc::new(ConnectionAccountant::new()))
        .clone()
}

impl ConnectionAccountant {
    pub const fn new() -> Self {
        Self {
            open: AtomicI64::new(0),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connections currently open (opened minus closed).
    pub fn open(&self) -> i64 {
        self.open.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectionCounts {
        ConnectionCounts {
            open: self.open.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounts {
    pub open: i64,
    pub opened: u64,
    pub closed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_balance() {
        let acct = ConnectionAccountant::new();
        acct.connection_opened();
        acct.connection_opened();
        acct.connection_closed();

        let counts = acct.snapshot();
        assert_eq!(counts.open, 1);
        assert_eq!(counts.opened, 2);
        assert_eq!(counts.closed, 1);
    }

    #[test]
    fn test_close_without_open_goes_negative() {
        let acct = ConnectionAccountant::new();
        acct.connection_closed();
        assert_eq!(acct.open(), -1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        const CALLERS: usize = 100;
        const OPENS: usize = 10_000;
        const CLOSES: usize = 10_000;

        let acct = Arc::new(ConnectionAccountant::new());
        let mut handles = Vec::with_capacity(CALLERS);

        for caller in 0..CALLERS {
            let acct = acct.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..OPENS / CALLERS {
                    acct.connection_opened();
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                for _ in 0..CLOSES / CALLERS {
                    acct.connection_closed();
                }
                caller
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let counts = acct.snapshot();
        assert_eq!(counts.opened, OPENS as u64);
        assert_eq!(counts.closed, CLOSES as u64);
        assert_eq!(counts.open, OPENS as i64 - CLOSES as i64);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&global(), &global()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_uneven_opens_and_closes() {
        let acct = Arc::new(ConnectionAccountant::new());
        let mut handles = Vec::new();
        for caller in 0..50u64 {
            let acct = acct.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..(caller * 3) {
                    acct.connection_opened();
                }
                for _ in 0..caller {
                    acct.connection_closed();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let n: u64 = (0..50u64).map(|c| c * 3).sum();
        let m: u64 = (0..50u64).sum();
        assert_eq!(acct.open(), n as i64 - m as i64);
    }
}
