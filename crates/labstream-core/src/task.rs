use futures::future;
use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Background tasks owned by one handle.
///
/// Tasks observe [TaskGroup::shutdown_signal] and exit when it flips.
/// [TaskGroup::shutdown] signals and joins them; dropping the group
/// aborts whatever is still running, so the tasks are released exactly
/// once on every exit path.
#[derive(Debug)]
pub(crate) struct TaskGroup {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    joining: AsyncMutex<()>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            joining: AsyncMutex::new(()),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[cfg(test)]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Signals every task to stop and waits for all of them. Concurrent
    /// callers all return only once the tasks are joined.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let _joining = self.joining.lock().await;

        // Tasks may spawn further tasks while winding down.
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }

            debug!(group = self.name, tasks = handles.len(), "joining background tasks");
            for result in future::join_all(handles).await {
                if let Err(err) = result
                    && err.is_panic()
                {
                    warn!(group = self.name, "background task panicked: {err}");
                }
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Resolves once `signal` reports shutdown, or its sender is gone.
pub(crate) async fn stopped(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    #[tokio::test]
    async fn test_shutdown_joins_tasks() {
        let group = TaskGroup::new("test");
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let mut signal = group.shutdown_signal();
            let finished = finished.clone();
            group.spawn(async move {
                stopped(&mut signal).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        group.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(group.is_shutting_down());

        // Idempotent.
        group.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_shutdowns_both_wait_for_tasks() {
        let group = Arc::new(TaskGroup::new("test"));
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let mut signal = group.shutdown_signal();
            let finished = finished.clone();
            group.spawn(async move {
                stopped(&mut signal).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let closers: Vec<_> = (0..2)
            .map(|_| {
                let group = group.clone();
                let finished = finished.clone();
                tokio::spawn(async move {
                    group.shutdown().await;
                    finished.load(Ordering::SeqCst)
                })
            })
            .collect();
        for closer in closers {
            assert_eq!(closer.await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let group = TaskGroup::new("test");
            let finished = finished.clone();
            group.spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
