use crate::{
    config::BackpressurePolicy,
    error::{Error, Result},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use tokio::sync::Notify;

/// Why a queue stopped accepting items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by its local owner.
    Closed,
    /// The remote end went away.
    Lost,
}

impl From<CloseReason> for Error {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Closed => Error::Closed,
            CloseReason::Lost => Error::LostConnection,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: Option<CloseReason>,
    dropped: u64,
}

/// A bounded FIFO handed between a background task and its caller.
///
/// Waiting consumers are woken on arrival, either through a condition
/// variable (blocking threads) or a [Notify] (async tasks). Once closed,
/// remaining items are still delivered before the close reason is
/// reported.
#[derive(Debug)]
pub struct SampleQueue<T> {
    state: Mutex<State<T>>,
    readable: Condvar,
    writable: Condvar,
    notify: Notify,
}

impl<T> SampleQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                closed: None,
                dropped: 0,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Number of items discarded by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    /// Appends an item, applying `policy` when the queue is full.
    ///
    /// Returns `false` if the queue is closed and the item was discarded.
    /// With [BackpressurePolicy::Block] the calling thread waits for
    /// room.
    pub fn push(&self, item: T, policy: BackpressurePolicy) -> bool {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }

        match policy {
            BackpressurePolicy::DropOldest => {
                if state.items.len() >= state.capacity {
                    state.items.pop_front();
                    state.dropped += 1;
                }
            }
            BackpressurePolicy::Block => {
                while state.items.len() >= state.capacity && state.closed.is_none() {
                    self.writable.wait(&mut state);
                }
                if state.closed.is_some() {
                    return false;
                }
            }
        }

        state.items.push_back(item);
        drop(state);
        self.wake_readers();
        true
    }

    /// Appends several items atomically with respect to readers.
    pub fn extend(&self, items: impl IntoIterator<Item = T>, policy: BackpressurePolicy) -> bool {
        match policy {
            BackpressurePolicy::Block => items.into_iter().all(|item| self.push(item, policy)),
            BackpressurePolicy::DropOldest => {
                let mut state = self.state.lock();
                if state.closed.is_some() {
                    return false;
                }
                for item in items {
                    if state.items.len() >= state.capacity {
                        state.items.pop_front();
                        state.dropped += 1;
                    }
                    state.items.push_back(item);
                }
                drop(state);
                self.wake_readers();
                true
            }
        }
    }

    /// Takes the oldest item without waiting.
    ///
    /// `Ok(None)` means empty but still open; an error carries the close
    /// reason once everything has been consumed.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        let closed = state.closed;
        drop(state);

        match (item, closed) {
            (Some(item), _) => {
                self.writable.notify_one();
                Ok(Some(item))
            }
            (None, Some(reason)) => Err(reason.into()),
            (None, None) => Ok(None),
        }
    }

    /// Takes up to `max` items without waiting.
    pub fn drain(&self, max: usize) -> Result<Vec<T>> {
        let mut state = self.state.lock();
        if state.items.is_empty()
            && let Some(reason) = state.closed
        {
            return Err(reason.into());
        }
        let n = state.items.len().min(max);
        let items: Vec<T> = state.items.drain(..n).collect();
        drop(state);

        if !items.is_empty() {
            self.writable.notify_all();
        }
        Ok(items)
    }

    /// Takes the oldest item, blocking the calling thread for at most
    /// `timeout` (`None` waits indefinitely).
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        // A deadline past the end of representable time means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.writable.notify_one();
                return Ok(Some(item));
            }
            if let Some(reason) = state.closed {
                return Err(reason.into());
            }
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                        && state.closed.is_none()
                    {
                        return Ok(None);
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
    }

    /// Takes the oldest item, suspending the calling task for at most
    /// `timeout` (`None` waits indefinitely).
    pub async fn pop_wait(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop()? {
                return Ok(Some(item));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Waits until at least one item is queued or the queue is closed.
    pub async fn readable(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if !state.items.is_empty() || state.closed.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Discards all queued items and returns how many there were.
    pub fn clear(&self) -> usize {
        let n = {
            let mut state = self.state.lock();
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.writable.notify_all();
        n
    }

    /// Stops accepting items and wakes every waiter. A local close
    /// supersedes an earlier loss.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            match (state.closed, reason) {
                (None, _) | (Some(CloseReason::Lost), CloseReason::Closed) => {
                    state.closed = Some(reason)
                }
                _ => {}
            }
        }
        self.writable.notify_all();
        self.wake_readers();
    }

    fn wake_readers(&self) {
        self.readable.notify_all();
        self.notify.notify_waiters();
    }
}
