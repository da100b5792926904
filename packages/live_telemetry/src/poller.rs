//! Fixed-interval repeating invoker.
//!
//! A tick is awaited to completion before the next interval starts, so ticks
//! never overlap. While the visibility gate reports hidden the loop parks and
//! issues nothing; on return to visibility the interval restarts.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::visibility::VisibilityWatch;

pub struct Poller {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn the poll loop. The first tick fires one `interval` after the
    /// surface is visible.
    pub fn spawn<F, Fut>(interval: Duration, visibility: VisibilityWatch, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(interval, visibility, cancel.clone(), tick));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop issuing ticks. An in-flight tick is dropped at its next await.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the loop has fully exited.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F, Fut>(
    interval: Duration,
    mut visibility: VisibilityWatch,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = visibility.visible() => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !visibility.is_visible() {
            debug!("surface hidden, poll skipped");
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick() => {}
        }
    }
    debug!("poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visibility::VisibilityGate;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_poller(
        interval: Duration,
        gate: &VisibilityGate,
    ) -> (Poller, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let poller = Poller::spawn(interval, gate.watch(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (poller, count)
    }

    /// Let spawned tasks run after a virtual clock jump.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_fixed_interval() {
        let gate = VisibilityGate::new();
        let (_poller, count) = counting_poller(Duration::from_secs(1), &gate);

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_ticks_while_hidden() {
        let gate = VisibilityGate::new();
        let (_poller, count) = counting_poller(Duration::from_secs(1), &gate);
        settle().await;

        gate.set_visible(false);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        gate.set_visible(true);
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_do_not_overlap() {
        let gate = VisibilityGate::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (f, m) = (in_flight.clone(), max_seen.clone());
        let _poller = Poller::spawn(Duration::from_millis(100), gate.watch(), move || {
            let (f, m) = (f.clone(), m.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(350)).await;
                f.fetch_sub(1, Ordering::SeqCst);
            }
        });

        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(100)).await;
            settle().await;
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let gate = VisibilityGate::new();
        let (poller, count) = counting_poller(Duration::from_secs(1), &gate);
        assert!(poller.is_running());
        poller.stop().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let gate = VisibilityGate::new();
        let (poller, count) = counting_poller(Duration::from_secs(1), &gate);
        drop(poller);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
