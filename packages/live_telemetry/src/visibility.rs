//! Visibility gate.
//!
//! Tracks whether the consuming surface is in the foreground. Polling
//! components hold a [`VisibilityWatch`] and park while the surface is hidden.

use tokio::sync::watch;
use tracing::debug;

/// Owner side of the visibility signal. The host flips it; clones share state.
#[derive(Debug, Clone)]
pub struct VisibilityGate {
    tx: watch::Sender<bool>,
}

impl VisibilityGate {
    /// A gate that starts out visible.
    pub fn new() -> Self {
        Self::with_initial(true)
    }

    pub fn with_initial(visible: bool) -> Self {
        let (tx, _) = watch::channel(visible);
        Self { tx }
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a visibility change. Repeating the current value does not wake
    /// watchers.
    pub fn set_visible(&self, visible: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
        if changed {
            debug!(visible, "visibility changed");
        }
    }

    pub fn watch(&self) -> VisibilityWatch {
        VisibilityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for VisibilityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the visibility signal.
#[derive(Debug, Clone)]
pub struct VisibilityWatch {
    rx: watch::Receiver<bool>,
}

impl VisibilityWatch {
    pub fn is_visible(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the surface is visible. Returns immediately when it already
    /// is. If the gate has been dropped the last known value is final, so a
    /// hidden surface stays parked forever and callers must race this against
    /// their own cancellation.
    pub async fn visible(&mut self) {
        if self.rx.wait_for(|visible| *visible).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_visible() {
        let gate = VisibilityGate::new();
        assert!(gate.is_visible());
        assert!(gate.watch().is_visible());
    }

    #[test]
    fn watch_sees_updates() {
        let gate = VisibilityGate::new();
        let watch = gate.watch();
        gate.set_visible(false);
        assert!(!watch.is_visible());
        gate.set_visible(true);
        assert!(watch.is_visible());
    }

    #[tokio::test]
    async fn visible_resolves_immediately_when_shown() {
        let gate = VisibilityGate::new();
        let mut watch = gate.watch();
        tokio::time::timeout(Duration::from_millis(50), watch.visible())
            .await
            .expect("should not wait");
    }

    #[tokio::test]
    async fn visible_waits_while_hidden() {
        let gate = VisibilityGate::with_initial(false);
        let mut watch = gate.watch();

        let waiter = tokio::spawn(async move {
            watch.visible().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.set_visible(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
