//! Exclusive ownership of the capture engine
//!
//! The wake monitor and the transcription stream must never hold a capture
//! session at the same time. Whoever wants the microphone takes a lease; the
//! next holder waits out a short settling delay after the previous release so
//! the driver is not reopened while still tearing down.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Default pause between one holder releasing and the next acquiring
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Default)]
struct Ledger {
    holder: Option<&'static str>,
    released_at: Option<Instant>,
}

/// Serializes access to the capture engine
#[derive(Debug, Clone)]
pub struct AudioEngineArbiter {
    engine: Arc<AsyncMutex<()>>,
    ledger: Arc<Mutex<Ledger>>,
    settle: Duration,
}

impl Default for AudioEngineArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY)
    }
}

impl AudioEngineArbiter {
    /// Create an arbiter with the given settling delay
    #[must_use]
    pub fn new(settle: Duration) -> Self {
        Self {
            engine: Arc::new(AsyncMutex::new(())),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            settle,
        }
    }

    /// Wait for the engine, then for it to settle
    pub async fn acquire(&self, owner: &'static str) -> EngineLease {
        let guard = Arc::clone(&self.engine).lock_owned().await;

        let released_at = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .released_at;
        if let Some(released_at) = released_at {
            let since = Instant::now().saturating_duration_since(released_at);
            if since < self.settle {
                let wait = self.settle - since;
                tracing::debug!(owner, wait_ms = wait.as_millis(), "waiting for audio engine to settle");
                tokio::time::sleep(wait).await;
            }
        }

        self.grant(owner, guard)
    }

    /// Take the engine only if nobody holds it (no settling wait)
    #[must_use]
    pub fn try_acquire(&self, owner: &'static str) -> Option<EngineLease> {
        let guard = Arc::clone(&self.engine).try_lock_owned().ok()?;
        Some(self.grant(owner, guard))
    }

    fn grant(&self, owner: &'static str, guard: OwnedMutexGuard<()>) -> EngineLease {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .holder = Some(owner);
        tracing::debug!(owner, "audio engine acquired");
        EngineLease {
            owner,
            ledger: Arc::clone(&self.ledger),
            _guard: guard,
        }
    }

    /// Current holder, if any
    #[must_use]
    pub fn holder(&self) -> Option<&'static str> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .holder
    }

    /// Configured settling delay
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        self.settle
    }
}

/// Proof of exclusive engine ownership; released on drop
#[derive(Debug)]
pub struct EngineLease {
    owner: &'static str,
    ledger: Arc<Mutex<Ledger>>,
    _guard: OwnedMutexGuard<()>,
}

impl EngineLease {
    /// Who holds the lease
    #[must_use]
    pub const fn owner(&self) -> &'static str {
        self.owner
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.holder = None;
        ledger.released_at = Some(Instant::now());
        tracing::debug!(owner = self.owner, "audio engine released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_holder_waits_for_release_and_settle() {
        let arbiter = AudioEngineArbiter::new(Duration::from_millis(150));
        let lease = arbiter.acquire("wake").await;
        assert_eq!(arbiter.holder(), Some("wake"));
        assert!(arbiter.try_acquire("transcription").is_none());

        let contender = arbiter.clone();
        let waiter = tokio::spawn(async move {
            let lease = contender.acquire("transcription").await;
            (Instant::now(), lease.owner())
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let released = Instant::now();
        drop(lease);

        let (acquired_at, owner) = waiter.await.unwrap();
        assert_eq!(owner, "transcription");
        assert!(acquired_at.duration_since(released) >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_after_settling() {
        let arbiter = AudioEngineArbiter::new(Duration::from_millis(150));
        drop(arbiter.acquire("wake").await);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let before = Instant::now();
        let lease = arbiter.acquire("transcription").await;
        assert_eq!(Instant::now(), before);
        drop(lease);
        assert_eq!(arbiter.holder(), None);
    }
}
