//! Downlink task queue
//!
//! One task per device, ordered by the time it becomes ready:
//! - `add` stores or moves the task of a device
//! - `dispatch` moves due tasks to the ready list
//! - `pop` hands a ready task to a callback and re-arms, removes or retries
//!   it depending on the callback result
//!
//! Tasks are persisted in a `sled` tree when the queue is opened on disk
//! and survive a restart; a task is only deleted from disk once its callback
//! completed without re-arming it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::{saturating_elapsed, Clock};
use crate::error::{Error, Result};

/// Upper bound on the dispatcher sleep between schedule scans
const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Number of consecutive failed attempts after which a task is dropped
pub const MAX_ATTEMPTS: u32 = 8;

const TREE_NAME: &str = "downlink_tasks";

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: SystemTime,
    ready: bool,
}

#[derive(Debug, Default)]
struct State {
    by_device: HashMap<String, Entry>,
    schedule: BTreeSet<(SystemTime, String)>,
    ready: VecDeque<String>,
    in_flight: HashSet<String>,
    attempts: HashMap<String, u32>,
}

impl State {
    fn unlink(&mut self, uid: &str) -> Option<Entry> {
        let entry = self.by_device.remove(uid)?;
        if entry.ready {
            self.ready.retain(|r| r != uid);
        } else {
            self.schedule.remove(&(entry.at, uid.to_string()));
        }
        Some(entry)
    }
}

fn encode_time(t: SystemTime) -> [u8; 8] {
    let nanos = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64;
    nanos.to_be_bytes()
}

fn decode_time(b: &[u8]) -> Option<SystemTime> {
    let bytes: [u8; 8] = b.try_into().ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_nanos(u64::from_be_bytes(bytes)))
}

/// Durable per-device task queue
pub struct TaskQueue {
    state: Mutex<State>,
    ready_notify: Notify,
    schedule_notify: Notify,
    tree: Option<sled::Tree>,
    clock: Arc<dyn Clock>,
    retry_backoff: Duration,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("durable", &self.tree.is_some())
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}

impl TaskQueue {
    /// Volatile queue
    pub fn in_memory(clock: Arc<dyn Clock>, retry_backoff: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready_notify: Notify::new(),
            schedule_notify: Notify::new(),
            tree: None,
            clock,
            retry_backoff,
        }
    }

    /// Queue persisted in the sled database at `path`
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>, retry_backoff: Duration) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_tree(db.open_tree(TREE_NAME)?, clock, retry_backoff)
    }

    /// Queue persisted in `tree`; stored tasks are scheduled again
    pub fn with_tree(tree: sled::Tree, clock: Arc<dyn Clock>, retry_backoff: Duration) -> Result<Self> {
        let mut state = State::default();
        for item in tree.iter() {
            let (key, value) = item?;
            let (Ok(uid), Some(at)) = (String::from_utf8(key.to_vec()), decode_time(&value)) else {
                warn!("Skipping corrupt downlink task entry");
                continue;
            };
            state.schedule.insert((at, uid.clone()));
            state.by_device.insert(uid, Entry { at, ready: false });
        }
        debug!(count = state.by_device.len(), "Loaded downlink tasks");
        Ok(Self {
            state: Mutex::new(state),
            ready_notify: Notify::new(),
            schedule_notify: Notify::new(),
            tree: Some(tree),
            clock,
            retry_backoff,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule the task of `uid` at `at`
    ///
    /// Without `replace`, an existing earlier task keeps its time.
    pub fn add(&self, uid: &str, at: SystemTime, replace: bool) -> Result<()> {
        let at = {
            let mut state = self.lock();
            let at = match state.by_device.get(uid) {
                Some(existing) if !replace && existing.at <= at => return Ok(()),
                _ => at,
            };
            state.unlink(uid);
            state.schedule.insert((at, uid.to_string()));
            state.by_device.insert(uid.to_string(), Entry { at, ready: false });
            if let Some(tree) = &self.tree {
                tree.insert(uid.as_bytes(), &encode_time(at))?;
            }
            at
        };
        debug!(dev_uid = uid, ?at, replace, "Added downlink task");
        self.schedule_notify.notify_one();
        Ok(())
    }

    /// Time of the task of `uid`, if one is queued
    pub fn scheduled(&self, uid: &str) -> Option<SystemTime> {
        self.lock().by_device.get(uid).map(|e| e.at)
    }

    /// Number of queued tasks, excluding those being processed
    pub fn len(&self) -> usize {
        self.lock().by_device.len()
    }

    /// Whether no task is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move due tasks to the ready list; returns the time until the next one
    fn dispatch_due(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.lock();
        let due: Vec<(SystemTime, String)> = state
            .schedule
            .iter()
            .take_while(|(at, _)| *at <= now)
            .filter(|(_, uid)| !state.in_flight.contains(uid))
            .cloned()
            .collect();
        for (at, uid) in due {
            state.schedule.remove(&(at, uid.clone()));
            if let Some(entry) = state.by_device.get_mut(&uid) {
                entry.ready = true;
            }
            state.ready.push_back(uid);
            self.ready_notify.notify_one();
        }
        state
            .schedule
            .iter()
            .find(|(_, uid)| !state.in_flight.contains(uid))
            .map(|(at, _)| saturating_elapsed(*at, now))
    }

    /// Move due tasks to the ready list until `cancel` fires
    pub async fn dispatch(&self, cancel: &CancellationToken, consumer: &str) -> Result<()> {
        debug!(consumer, "Starting downlink task dispatcher");
        loop {
            let wait = self
                .dispatch_due()
                .map_or(DISPATCH_INTERVAL, |d| d.min(DISPATCH_INTERVAL));
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.schedule_notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Wait for a ready task and process it with `f`
    ///
    /// `f` returns the next time the task should run, or `None` to remove
    /// it. On error the task is retried after the retry backoff, up to
    /// [`MAX_ATTEMPTS`] times.
    pub async fn pop<F, Fut>(&self, cancel: &CancellationToken, consumer: &str, f: F) -> Result<()>
    where
        F: FnOnce(String, SystemTime) -> Fut,
        Fut: Future<Output = Result<Option<SystemTime>>>,
    {
        let (uid, at) = loop {
            {
                let mut state = self.lock();
                if let Some(uid) = state.ready.pop_front() {
                    let at = state
                        .by_device
                        .remove(&uid)
                        .map_or_else(|| self.clock.now(), |e| e.at);
                    state.in_flight.insert(uid.clone());
                    break (uid, at);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::canceled()),
                _ = self.ready_notify.notified() => {}
            }
        };
        debug!(consumer, dev_uid = %uid, "Processing downlink task");

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            res = f(uid.clone(), at) => Some(res),
        };
        let Some(result) = result else {
            self.finish(&uid);
            self.add(&uid, at, false)?;
            return Err(Error::canceled());
        };

        match result {
            Ok(next) => {
                self.lock().attempts.remove(&uid);
                self.finish(&uid);
                match next {
                    Some(next) => self.add(&uid, next, false)?,
                    None => self.forget(&uid)?,
                }
            }
            Err(err) => {
                let attempts = {
                    let mut state = self.lock();
                    let n = state.attempts.entry(uid.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                self.finish(&uid);
                if attempts >= MAX_ATTEMPTS {
                    error!(dev_uid = %uid, attempts, error = %err, "Dropping downlink task after repeated failures");
                    self.lock().attempts.remove(&uid);
                    self.forget(&uid)?;
                } else {
                    warn!(dev_uid = %uid, attempts, error = %err, "Downlink task failed, retrying");
                    self.add(&uid, self.clock.now() + self.retry_backoff, false)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&self, uid: &str) {
        self.lock().in_flight.remove(uid);
        self.schedule_notify.notify_one();
    }

    /// Delete the persisted task unless it was re-added meanwhile
    fn forget(&self, uid: &str) -> Result<()> {
        let state = self.lock();
        if state.by_device.contains_key(uid) {
            return Ok(());
        }
        if let Some(tree) = &self.tree {
            tree.remove(uid.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn epoch(d: Duration) -> SystemTime {
        SystemTime::UNIX_EPOCH + d
    }

    fn queue(clock: Arc<MockClock>) -> Arc<TaskQueue> {
        Arc::new(TaskQueue::in_memory(clock, Duration::from_secs(2)))
    }

    async fn pop_one(q: &TaskQueue, next: Option<SystemTime>) -> (String, SystemTime) {
        let cancel = CancellationToken::new();
        let mut seen = None;
        q.pop(&cancel, "test", |uid, at| {
            seen = Some((uid, at));
            async move { Ok(next) }
        })
        .await
        .unwrap();
        seen.unwrap()
    }

    #[test]
    fn test_replace_semantics() {
        let clock = Arc::new(MockClock::new(epoch(Duration::from_secs(1000))));
        let q = queue(clock);
        q.add("d", epoch(Duration::from_secs(20)), false).unwrap();
        q.add("d", epoch(Duration::from_secs(30)), false).unwrap();
        assert_eq!(q.scheduled("d"), Some(epoch(Duration::from_secs(20))));
        q.add("d", epoch(Duration::from_secs(10)), false).unwrap();
        assert_eq!(q.scheduled("d"), Some(epoch(Duration::from_secs(10))));
        q.add("d", epoch(Duration::from_secs(30)), true).unwrap();
        assert_eq!(q.scheduled("d"), Some(epoch(Duration::from_secs(30))));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_in_time_order() {
        let clock = Arc::new(MockClock::new(epoch(Duration::from_secs(1000))));
        let q = queue(clock.clone());
        let cancel = CancellationToken::new();
        let dispatcher = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dispatch(&cancel, "d").await })
        };

        q.add("b", epoch(Duration::from_secs(2)), false).unwrap();
        q.add("a", epoch(Duration::from_secs(1)), false).unwrap();
        q.add("c", epoch(Duration::from_secs(2000)), false).unwrap();
        assert_eq!(pop_one(&q, None).await, ("a".into(), epoch(Duration::from_secs(1))));
        assert_eq!(pop_one(&q, None).await, ("b".into(), epoch(Duration::from_secs(2))));

        clock.set(epoch(Duration::from_secs(2000)));
        assert_eq!(pop_one(&q, None).await.0, "c");
        assert!(q.is_empty());

        cancel.cancel();
        dispatcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failure_retries_after_backoff() {
        let clock = Arc::new(MockClock::new(epoch(Duration::from_secs(1000))));
        let q = queue(clock.clone());
        q.add("d", epoch(Duration::from_secs(1)), false).unwrap();
        q.dispatch_due();
        let cancel = CancellationToken::new();
        q.pop(&cancel, "c", |_, _| async { Err(Error::store("boom")) })
            .await
            .unwrap();
        assert_eq!(q.scheduled("d"), Some(epoch(Duration::from_secs(1002))));

        for _ in 1..MAX_ATTEMPTS {
            clock.advance(Duration::from_secs(2));
            q.dispatch_due();
            q.pop(&cancel, "c", |_, _| async { Err(Error::store("boom")) })
                .await
                .unwrap();
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_pop_observes_cancellation() {
        let clock = Arc::new(MockClock::new(epoch(Duration::from_secs(1000))));
        let q = queue(clock);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = q
            .pop(&cancel, "c", |_, _| async { Ok(None) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_tasks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(MockClock::new(epoch(Duration::from_secs(1000))));
        {
            let q = TaskQueue::open(dir.path(), clock.clone(), Duration::from_secs(2)).unwrap();
            q.add("a", epoch(Duration::from_secs(5)), false).unwrap();
            q.add("b", epoch(Duration::from_secs(7)), false).unwrap();
            q.dispatch_due();
            assert_eq!(pop_one(&q, None).await.0, "a");
        }
        let q = TaskQueue::open(dir.path(), clock, Duration::from_secs(2)).unwrap();
        assert_eq!(q.scheduled("a"), None);
        assert_eq!(q.scheduled("b"), Some(epoch(Duration::from_secs(7))));
    }
}
