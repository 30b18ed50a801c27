//! Bounded in-memory stage queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::{BuildId, Error, Filter, QueueStats, Result, Scheduler, Stage, StageId};
use stagehand_db::StageStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_KIND: &str = "pipeline";
const DEFAULT_TYPE: &str = "docker";

/// How long a cancellation signal is remembered.
const CANCELLED_TTL: Duration = Duration::from_secs(5 * 60);

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of stages held at once.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Default)]
struct State {
    items: VecDeque<Stage>,
    paused: bool,
    cancelled: HashMap<BuildId, Instant>,
}

impl State {
    fn purge_cancelled(&mut self, now: Instant) {
        self.cancelled
            .retain(|_, at| now.duration_since(*at) < CANCELLED_TTL);
    }
}

/// Counts a blocked poller for as long as it is alive.
struct WorkerGuard<'a>(&'a AtomicUsize);

impl<'a> WorkerGuard<'a> {
    fn new(workers: &'a AtomicUsize) -> Self {
        workers.fetch_add(1, Ordering::SeqCst);
        Self(workers)
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO queue of ready stages.
///
/// Every state change bumps a generation counter on a watch channel. Waiters
/// subscribe before inspecting state, so a change between the check and the
/// wait is never missed.
pub struct MemoryQueue {
    capacity: usize,
    state: Mutex<State>,
    workers: AtomicUsize,
    notify: watch::Sender<u64>,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            capacity: config.capacity,
            state: Mutex::new(State::default()),
            workers: AtomicUsize::new(0),
            notify,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        self.notify.send_modify(|generation| *generation += 1);
    }

    /// Reconcile the queue with the store's unclaimed pending stages.
    ///
    /// Stages handed out by `request` leave the queue before an agent claims
    /// them; if the agent never does, only the store still knows about them.
    /// Missing stages are appended, queued stages that were claimed meanwhile
    /// are dropped, and stages of cancelled builds stay out. Stages that do
    /// not fit are left for the next pass. Returns the number enqueued.
    pub async fn sync(&self, store: &dyn StageStore) -> Result<usize> {
        let before: HashSet<StageId> = self.state().items.iter().map(|s| s.id).collect();
        let incomplete = store.list_incomplete().await?;
        let unclaimed: HashSet<StageId> = incomplete.iter().map(|s| s.id).collect();

        let mut added = 0;
        let dropped;
        {
            let mut state = self.state();
            let len = state.items.len();
            // stages scheduled after the listing are not in it yet
            state
                .items
                .retain(|s| unclaimed.contains(&s.id) || !before.contains(&s.id));
            dropped = len - state.items.len();

            let queued: HashSet<StageId> = state.items.iter().map(|s| s.id).collect();
            state.purge_cancelled(Instant::now());
            for stage in incomplete {
                if queued.contains(&stage.id) || state.cancelled.contains_key(&stage.build_id) {
                    continue;
                }
                if state.items.len() >= self.capacity {
                    warn!(stage.id = %stage.id, "Queue full, stage left for the next sync");
                    continue;
                }
                state.items.push_back(stage);
                added += 1;
            }
        }
        if added > 0 {
            self.signal();
        }
        if added > 0 || dropped > 0 {
            info!(added, dropped, "Queue synced with store");
        } else {
            debug!("Queue in sync with store");
        }
        Ok(added)
    }

    /// Run [`sync`](Self::sync) every `interval` until the task is aborted.
    pub fn spawn_sync(
        self: Arc<Self>,
        store: Arc<dyn StageStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.sync(store.as_ref()).await {
                    warn!(error = %err, "Cannot sync queue with store");
                }
            }
        })
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl Scheduler for MemoryQueue {
    async fn schedule(&self, stage: &Stage) -> Result<()> {
        {
            let mut state = self.state();
            if state.items.iter().any(|s| s.id == stage.id) {
                debug!(stage.id = %stage.id, "Stage already queued");
                return Ok(());
            }
            if state.items.len() >= self.capacity {
                return Err(Error::QueueFull(self.capacity));
            }
            state.items.push_back(stage.clone());
        }
        debug!(stage.id = %stage.id, build.id = %stage.build_id, "Stage scheduled");
        self.signal();
        Ok(())
    }

    async fn request(&self, filter: &Filter) -> Result<Stage> {
        let _worker = WorkerGuard::new(&self.workers);
        let mut rx = self.notify.subscribe();
        loop {
            {
                let mut state = self.state();
                if !state.paused {
                    if let Some(pos) = state.items.iter().position(|s| matches(filter, s)) {
                        if let Some(stage) = state.items.remove(pos) {
                            return Ok(stage);
                        }
                    }
                }
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    async fn cancel(&self, build: BuildId) -> Result<()> {
        {
            let mut state = self.state();
            let now = Instant::now();
            state.purge_cancelled(now);
            state.cancelled.insert(build, now);
            state.items.retain(|s| s.build_id != build);
        }
        info!(build.id = %build, "Build cancelled");
        self.signal();
        Ok(())
    }

    async fn cancelled(&self, build: BuildId) -> Result<bool> {
        let mut rx = self.notify.subscribe();
        loop {
            let cancelled = self.state().cancelled.contains_key(&build);
            if cancelled {
                return Ok(true);
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    async fn pause(&self) -> Result<()> {
        self.state().paused = true;
        info!("Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.state().paused = false;
        info!("Queue resumed");
        self.signal();
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state();
        Ok(QueueStats {
            pending: state.items.len(),
            workers: self.workers.load(Ordering::SeqCst),
            capacity: self.capacity,
            paused: state.paused,
        })
    }
}

/// Compare a stage's kind and type against an agent's. Empty values take the
/// defaults.
pub fn match_resource(kind_a: &str, type_a: &str, kind_b: &str, type_b: &str) -> bool {
    fn or<'a>(value: &'a str, default: &'a str) -> &'a str {
        if value.is_empty() { default } else { value }
    }
    or(kind_a, DEFAULT_KIND) == or(kind_b, DEFAULT_KIND)
        && or(type_a, DEFAULT_TYPE) == or(type_b, DEFAULT_TYPE)
}

/// Whether an agent advertising `filter` may run `stage`.
pub fn matches(filter: &Filter, stage: &Stage) -> bool {
    if !match_resource(&stage.kind, &stage.kind_type, &filter.kind, &filter.kind_type) {
        return false;
    }

    let platform_specific = !filter.os.is_empty()
        || !filter.arch.is_empty()
        || !filter.variant.is_empty()
        || !filter.kernel.is_empty();
    if platform_specific {
        if filter.os != stage.os || filter.arch != stage.arch {
            return false;
        }
        if !stage.variant.is_empty() && stage.variant != filter.variant {
            return false;
        }
        if !stage.kernel.is_empty() && stage.kernel != filter.kernel {
            return false;
        }
    }

    if (!stage.labels.is_empty() || !filter.labels.is_empty()) && stage.labels != filter.labels {
        return false;
    }
    true
}
