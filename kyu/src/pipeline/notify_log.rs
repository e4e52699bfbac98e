//! Durable per-queue notification log.
//!
//! Every time a job reaches a terminal state one entry is appended to the log
//! of the job's queue. Status streams tail the log to turn other jobs'
//! completions into queue position updates and to learn when their own job
//! has finished.
//!
//! Entries live in SQLite, so a tailer in the gateway sees entries appended by
//! worker processes. Appends made in this process also wake blocked readers
//! immediately; appends from other processes are picked up on the next poll
//! tick.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::database::models::{NotificationLogDbModel, Outcome};
use crate::database::repositories::NotificationRepository;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Position in a queue's log: wall-clock millis plus a per-millisecond
/// counter. Rendered as `"<millis>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceId {
    pub millis: i64,
    pub seq: i64,
}

impl SequenceId {
    pub fn new(millis: i64, seq: i64) -> Self {
        Self { millis, seq }
    }

    /// Cursor for the first entry appended at or after `time`.
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self::new(time.timestamp_millis(), 0)
    }

    /// Cursor just past this id.
    pub fn next(&self) -> Self {
        Self::new(self.millis, self.seq + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for SequenceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::validation(format!("invalid sequence id: {s}")))?;
        let millis = millis
            .parse()
            .map_err(|_| Error::validation(format!("invalid sequence id: {s}")))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::validation(format!("invalid sequence id: {s}")))?;
        Ok(Self::new(millis, seq))
    }
}

impl Serialize for SequenceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence_id: SequenceId,
    pub queue_name: String,
    pub job_id: String,
    pub outcome: Outcome,
}

impl LogEntry {
    fn from_db_model(model: NotificationLogDbModel) -> Result<Self> {
        let outcome = Outcome::parse(&model.outcome).ok_or_else(|| {
            Error::Database(format!(
                "notification {}-{} has unknown outcome {}",
                model.millis, model.seq, model.outcome
            ))
        })?;
        Ok(Self {
            sequence_id: SequenceId::new(model.millis, model.seq),
            queue_name: model.queue_name,
            job_id: model.job_id,
            outcome,
        })
    }
}

/// Notification log configuration.
#[derive(Debug, Clone)]
pub struct NotificationLogConfig {
    /// How often a blocked reader re-checks the database.
    pub poll_interval: Duration,
    /// Maximum entries returned by one read.
    pub batch_size: i64,
}

impl Default for NotificationLogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 100,
        }
    }
}

pub struct NotificationLog {
    repo: Arc<dyn NotificationRepository>,
    config: NotificationLogConfig,
    /// Wake-up hints per queue for readers in this process.
    wakers: DashMap<String, Arc<Notify>>,
}

impl NotificationLog {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self::with_config(repo, NotificationLogConfig::default())
    }

    pub fn with_config(repo: Arc<dyn NotificationRepository>, config: NotificationLogConfig) -> Self {
        Self {
            repo,
            config,
            wakers: DashMap::new(),
        }
    }

    fn waker(&self, queue: &str) -> Arc<Notify> {
        self.wakers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Append an entry and wake this process's readers of `queue`.
    pub async fn append(&self, queue: &str, job_id: &str, outcome: Outcome) -> Result<SequenceId> {
        let model = self
            .repo
            .append(queue, job_id, outcome.as_str(), now_ms())
            .await?;
        let id = SequenceId::new(model.millis, model.seq);

        debug!(queue, job_id, %outcome, sequence_id = %id, "Appended notification");
        self.waker(queue).notify_waiters();
        Ok(id)
    }

    /// Wake this process's readers of `queue` after an entry was committed
    /// outside [`append`](Self::append).
    pub fn notify_appended(&self, queue: &str) {
        self.waker(queue).notify_waiters();
    }

    /// Entries with `sequence_id >= cursor`, oldest first, without waiting.
    pub async fn read_from(&self, queue: &str, cursor: SequenceId) -> Result<Vec<LogEntry>> {
        self.repo
            .read_from(queue, cursor.millis, cursor.seq, self.config.batch_size)
            .await?
            .into_iter()
            .map(LogEntry::from_db_model)
            .collect()
    }

    /// Like [`read_from`](Self::read_from) but suspends until at least one
    /// entry exists. Dropping the future cancels the wait.
    pub async fn read_blocking(&self, queue: &str, cursor: SequenceId) -> Result<Vec<LogEntry>> {
        let waker = self.waker(queue);
        loop {
            // Register before reading so an append between the read and the
            // wait is not missed.
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.read_from(queue, cursor).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Endless stream of `queue`'s entries starting at `cursor`.
    ///
    /// Each entry is yielded exactly once, in order. The stream only ends
    /// with an error; dropping it releases the subscription.
    pub fn tail(
        self: &Arc<Self>,
        queue: &str,
        cursor: SequenceId,
    ) -> impl Stream<Item = Result<LogEntry>> + Send + use<> {
        let log = Arc::clone(self);
        let queue = queue.to_string();
        async_stream::try_stream! {
            let mut cursor = cursor;
            loop {
                let batch = log.read_blocking(&queue, cursor).await?;
                for entry in batch {
                    cursor = entry.sequence_id.next();
                    yield entry;
                }
            }
        }
    }
}
