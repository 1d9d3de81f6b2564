//! Pause coordination for out-of-band requests
//!
//! A snapshot request takes exclusive ownership of the stream's
//! request-issuing capability: the main loop's in-flight request is cancelled
//! and no new one is issued until the snapshot settles. A second snapshot
//! requested meanwhile waits its turn (FIFO); ownership is never shared.

use std::future::Future;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// The stream side of the pause protocol
pub trait PauseTarget: Send + Sync {
    /// Called once the pause lock is held: cancel the in-flight main request
    /// and disarm wake detection.
    fn suspend(&self);

    /// Called when the pause ends, however the snapshot finished: release the
    /// lock, re-arm wake detection and let the main loop issue a request.
    fn resume(&self);
}

pub struct PauseCoordinator {
    /// Waiter queue of pause owners
    owner: Mutex<()>,
    /// Whether the lock is held; the main loop gates on this
    held: watch::Sender<bool>,
}

impl PauseCoordinator {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            owner: Mutex::new(()),
            held,
        }
    }

    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    /// Resolves once the lock is not held
    pub async fn wait_released(&self) {
        let mut rx = self.held.subscribe();
        // The sender lives as long as self, so this only fails if it is gone
        let _ = rx.wait_for(|held| !*held).await;
    }

    /// Mark the lock held. Called by the target inside `suspend`.
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Mark the lock released. Called by the target inside `resume`.
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Run `op` while owning the pause lock
    ///
    /// `target.suspend()` runs before `op` starts and `target.resume()` runs
    /// after it settles, including when the returned future is dropped early.
    pub async fn run_exclusive<T, F, Fut>(&self, target: &T, op: F) -> Fut::Output
    where
        T: PauseTarget + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _owner = self.owner.lock().await;
        debug!("PauseCoordinator: pause acquired");
        target.suspend();

        let _resume = scopeguard::guard((), |_| {
            target.resume();
            debug!("PauseCoordinator: pause released");
        });

        op().await
    }
}

impl Default for PauseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PauseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseCoordinator")
            .field("held", &self.is_held())
            .finish()
    }
}
