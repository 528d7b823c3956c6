//! Cancellable background watchers
//!
//! Each watcher kind has at most one live task. Arming a kind aborts the task
//! already armed for it, and every task is tagged with a generation that it
//! stamps on the signals it sends, so a signal queued by a task that has since
//! been replaced can be recognized and dropped.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::AbortHandle;

/// Background activities owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherKind {
    /// Forwards transcript changes
    TranscriptChange,
    /// Fires when the current candidate may have gone quiet long enough
    AutoSubmit,
    /// Bounds the wait for a backend answer
    ResponseTimeout,
    /// Fires after a quiet stretch in `Standby`
    StandbyIdle,
    /// The in-flight backend request
    Backend,
    /// Waits for the current utterance to finish playing
    Speech,
}

impl WatcherKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::TranscriptChange => "transcript_change",
            Self::AutoSubmit => "auto_submit",
            Self::ResponseTimeout => "response_timeout",
            Self::StandbyIdle => "standby_idle",
            Self::Backend => "backend",
            Self::Speech => "speech",
        }
    }
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    abort: AbortHandle,
}

/// Registry of live watcher tasks
#[derive(Debug, Default)]
pub struct Watchers {
    next_generation: u64,
    armed: HashMap<WatcherKind, Armed>,
}

impl Watchers {
    /// Replace the watcher of `kind` with the future built by `make`
    ///
    /// `make` receives the new generation. Returns that generation.
    pub fn arm<F, Fut>(&mut self, kind: WatcherKind, make: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;

        let handle = tokio::spawn(make(generation));
        self.armed.insert(
            kind,
            Armed {
                generation,
                abort: handle.abort_handle(),
            },
        );
        tracing::trace!(watcher = kind.as_str(), generation, "watcher armed");
        generation
    }

    /// Abort the watcher of `kind`; returns whether one was live
    pub fn cancel(&mut self, kind: WatcherKind) -> bool {
        self.armed.remove(&kind).is_some_and(|armed| {
            armed.abort.abort();
            tracing::trace!(watcher = kind.as_str(), generation = armed.generation, "watcher cancelled");
            true
        })
    }

    /// Abort every watcher
    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.abort.abort();
        }
    }

    /// Whether `generation` is still the live watcher of `kind`
    #[must_use]
    pub fn is_current(&self, kind: WatcherKind, generation: u64) -> bool {
        self.armed
            .get(&kind)
            .is_some_and(|armed| armed.generation == generation)
    }

    /// Forget a watcher that has delivered its final signal
    ///
    /// Returns false (and leaves the registry alone) for a stale generation.
    pub fn retire(&mut self, kind: WatcherKind, generation: u64) -> bool {
        if self.is_current(kind, generation) {
            self.armed.remove(&kind);
            true
        } else {
            false
        }
    }

    /// Whether a watcher of `kind` is live
    #[must_use]
    pub fn is_armed(&self, kind: WatcherKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
