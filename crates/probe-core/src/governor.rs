use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission cancelled")]
    Cancelled,
    #[error("requested {requested} slots but capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
    #[error("governor closed")]
    Closed,
}

/// Bounded admission for in-flight requests.
///
/// Capacity is fixed for the lifetime of the governor; the driver builds a
/// new one per stage rather than resizing.
#[derive(Debug, Clone)]
pub struct Governor {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    held: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Reserved governor capacity. Dropping it returns the capacity.
#[derive(Debug)]
pub struct Slot {
    n: usize,
    held: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Governor {
    pub fn new(capacity: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            held: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for `n` units of capacity or for `cancel` to fire.
    ///
    /// When both are ready at once cancellation wins, so a cancelled caller
    /// never proceeds to send a request.
    pub async fn acquire(&self, n: u32, cancel: &CancellationToken) -> Result<Slot, AdmissionError> {
        if n > self.capacity {
            return Err(AdmissionError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
            permit = self.semaphore.clone().acquire_many_owned(n) => {
                permit.map_err(|_| AdmissionError::Closed)?
            }
        };

        let n = n as usize;
        let now = self.held.fetch_add(n, Ordering::AcqRel) + n;
        self.peak.fetch_max(now, Ordering::AcqRel);

        Ok(Slot {
            n,
            held: self.held.clone(),
            _permit: permit,
        })
    }

    /// Slots currently held.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Highest number of slots held at once since construction.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

impl Slot {
    /// Return the capacity now. Equivalent to dropping the slot.
    pub fn release(self) {}
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so `held` is decremented
        // before the capacity becomes visible to the next acquirer.
        self.held.fetch_sub(self.n, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gov = Governor::new(2);
        let cancel = CancellationToken::new();

        let a = gov.acquire(1, &cancel).await.unwrap();
        let b = gov.acquire(1, &cancel).await.unwrap();
        assert_eq!(gov.held(), 2);
        let full = tokio::time::timeout(Duration::from_millis(20), gov.acquire(1, &cancel)).await;
        assert!(full.is_err());

        a.release();
        assert_eq!(gov.held(), 1);
        drop(b);
        assert_eq!(gov.held(), 0);
        assert_eq!(gov.peak(), 2);
    }

    #[tokio::test]
    async fn test_acquire_more_than_capacity_fails() {
        let gov = Governor::new(3);
        let cancel = CancellationToken::new();
        let err = gov.acquire(4, &cancel).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::ExceedsCapacity {
                requested: 4,
                capacity: 3
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_while_blocked() {
        let gov = Governor::new(1);
        let cancel = CancellationToken::new();
        let _held = gov.acquire(1, &cancel).await.unwrap();

        let waiter = {
            let gov = gov.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gov.acquire(1, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock promptly")
            .unwrap();
        assert_eq!(res.unwrap_err(), AdmissionError::Cancelled);
        assert_eq!(gov.held(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_free_capacity() {
        let gov = Governor::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            gov.acquire(1, &cancel).await.unwrap_err(),
            AdmissionError::Cancelled
        );
        assert_eq!(gov.held(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peak_never_exceeds_capacity() {
        let gov = Governor::new(5);
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        for i in 0..200u64 {
            let slot = gov.acquire(1, &cancel).await.unwrap();
            assert!(gov.held() <= 5);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_micros(200 + (i % 7) * 50)).await;
                drop(slot);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(gov.peak() <= 5, "peak was {}", gov.peak());
        assert_eq!(gov.held(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let gov = Governor::new(1);
        let cancel = CancellationToken::new();
        let slot = gov.acquire(1, &cancel).await.unwrap();

        let res = tokio::spawn(async move {
            let _slot = slot;
            panic!("request blew up");
        })
        .await;
        assert!(res.is_err());
        assert_eq!(gov.held(), 0);
        let again = tokio::time::timeout(Duration::from_millis(20), gov.acquire(1, &cancel)).await;
        assert!(again.is_ok());
    }
}
