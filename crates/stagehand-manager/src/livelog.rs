//! In-memory live log streaming.

use async_trait::async_trait;
use stagehand_core::logs::Line;
use stagehand_core::services::LogStream;
use stagehand_core::{Error, Result, StepId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Lines kept per step for late subscribers.
const DEFAULT_HISTORY: usize = 5000;

struct Stream {
    history: VecDeque<Line>,
    tx: broadcast::Sender<Line>,
}

/// Fans out step output to subscribers while the step runs.
///
/// Subscribers that fall behind lose lines rather than slowing the writer.
pub struct LiveLog {
    history: usize,
    streams: Mutex<HashMap<StepId, Stream>>,
}

impl LiveLog {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            history: history.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StepId, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to a step. Returns the buffered history and a receiver for
    /// lines written afterwards; the receiver closes when the stream is
    /// deleted.
    pub fn tail(&self, step: StepId) -> Result<(Vec<Line>, broadcast::Receiver<Line>)> {
        let streams = self.streams();
        let stream = streams
            .get(&step)
            .ok_or_else(|| Error::NotFound(format!("log stream {step}")))?;
        Ok((stream.history.iter().cloned().collect(), stream.tx.subscribe()))
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LiveLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStream for LiveLog {
    async fn create(&self, step: StepId) -> Result<()> {
        let (tx, _) = broadcast::channel(self.history);
        self.streams().insert(
            step,
            Stream {
                history: VecDeque::new(),
                tx,
            },
        );
        Ok(())
    }

    async fn delete(&self, step: StepId) -> Result<()> {
        self.streams()
            .remove(&step)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("log stream {step}")))
    }

    async fn write(&self, step: StepId, line: &Line) -> Result<()> {
        let mut streams = self.streams();
        let stream = streams
            .get_mut(&step)
            .ok_or_else(|| Error::NotFound(format!("log stream {step}")))?;
        if stream.history.len() >= self.history {
            stream.history.pop_front();
        }
        stream.history.push_back(line.clone());
        // no subscribers is fine
        let _ = stream.tx.send(line.clone());
        Ok(())
    }
}
