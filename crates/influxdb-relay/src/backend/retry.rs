//! In-memory retry buffer for one write backend.
//!
//! Decouples the fan-out path from backend latency: admission enqueues onto
//! a bounded channel and returns a synthetic 204 immediately. A single
//! worker per buffer coalesces records by (query, auth), flushes batches on
//! size or age, and retries transient failures with capped exponential
//! backoff. When bounds are exceeded the data is dropped, never blocked on.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::poster::{PostResponse, Poster};
use crate::error::RelayError;

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_MULTIPLIER: u32 = 2;

/// Idle poll interval of the worker; the latency floor for age-based flushes.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Admission channel capacity, in batch-point records.
const CHANNEL_CAPACITY: usize = 10_000;

/// One admitted write, keyed by its downstream query string and credentials.
struct BatchPoints {
    query: String,
    auth: Option<String>,
    data: Bytes,
}

/// Accumulated writes sharing one (query, auth) key.
struct CachedBatch {
    query: String,
    auth: Option<String>,
    buf: Vec<u8>,
    created: Instant,
}

impl CachedBatch {
    fn size(&self) -> usize {
        self.buf.len()
    }
}

/// Buffering poster wrapper. Admission never blocks on backend work; if the
/// channel is full the record is dropped and logged.
pub struct RetryBuffer {
    tx: mpsc::Sender<BatchPoints>,
}

impl RetryBuffer {
    /// Create a buffer and spawn its worker task.
    ///
    /// `max_buffered` bounds each cached batch in bytes, `max_batch` is an
    /// advisory accumulator capacity hint, and `max_interval` is both the
    /// flush-age threshold and the backoff ceiling.
    pub fn new(
        max_buffered: usize,
        max_batch: usize,
        max_interval: Duration,
        poster: Arc<dyn Poster>,
    ) -> Self {
        Self::with_backoff(
            max_buffered,
            max_batch,
            max_interval,
            RETRY_INITIAL_INTERVAL,
            poster,
        )
    }

    /// As [`RetryBuffer::new`] with an explicit starting backoff interval.
    pub fn with_backoff(
        max_buffered: usize,
        max_batch: usize,
        max_interval: Duration,
        initial_interval: Duration,
        poster: Arc<dyn Poster>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let worker = Worker {
            rx,
            poster,
            max_buffered,
            max_batch,
            max_interval,
            initial_interval,
            cached: Vec::new(),
        };
        tokio::spawn(worker.run());

        Self { tx }
    }
}

#[async_trait]
impl Poster for RetryBuffer {
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> Result<PostResponse, RelayError> {
        let record = BatchPoints {
            query: query.to_owned(),
            auth: auth.map(str::to_owned),
            data: body,
        };

        if let Err(err) = self.tx.try_send(record) {
            let record = match err {
                TrySendError::Full(record) | TrySendError::Closed(record) => record,
            };
            warn!(bytes = record.data.len(), "retry buffer full, dropping write");
        }

        Ok(PostResponse::accepted())
    }
}

/// The sole owner of a buffer's cached batches. Flushes are serialised
/// through this task, so at most one is in flight per backend.
struct Worker {
    rx: mpsc::Receiver<BatchPoints>,
    poster: Arc<dyn Poster>,
    max_buffered: usize,
    max_batch: usize,
    max_interval: Duration,
    initial_interval: Duration,
    cached: Vec<CachedBatch>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(points) => self.merge(points),
                Err(TryRecvError::Empty) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(TryRecvError::Disconnected) => break,
            }

            // Scan for batches due by age or size. The walk only advances
            // past retained entries, so removals never skip a neighbour.
            let mut i = 0;
            while i < self.cached.len() {
                let due = {
                    let batch = &self.cached[i];
                    batch.created.elapsed() > self.max_interval
                        || batch.size() > self.max_buffered
                };
                if due {
                    let batch = self.cached.remove(i);
                    self.flush(batch).await;
                } else {
                    i += 1;
                }
            }
        }
    }

    fn merge(&mut self, points: BatchPoints) {
        if let Some(cached) = self
            .cached
            .iter_mut()
            .find(|c| c.auth == points.auth && c.query == points.query)
        {
            cached.buf.extend_from_slice(&points.data);
            return;
        }

        let mut buf = Vec::with_capacity(self.max_batch.max(points.data.len()));
        buf.extend_from_slice(&points.data);
        self.cached.push(CachedBatch {
            query: points.query,
            auth: points.auth,
            buf,
            created: Instant::now(),
        });
    }

    /// Post one batch, retrying transport errors and 5xx responses.
    ///
    /// The interval doubles on each failure, capped at `max_interval`; the
    /// batch is abandoned once the cumulative backoff sleep would exceed
    /// twice the cap.
    async fn flush(&self, batch: CachedBatch) {
        let data = Bytes::from(batch.buf);
        let budget = 2 * self.max_interval;
        let mut interval = self.initial_interval;
        let mut slept = Duration::ZERO;

        loop {
            match self
                .poster
                .post(data.clone(), &batch.query, batch.auth.as_deref())
                .await
            {
                Ok(response) if !response.status.is_server_error() => {
                    debug!(bytes = data.len(), "flushed batch");
                    return;
                }
                Ok(response) => {
                    debug!(status = %response.status, "batch rejected by backend")
                }
                Err(e) => debug!(error = %e, "batch flush failed"),
            }

            interval = (interval * RETRY_MULTIPLIER).min(self.max_interval);
            if slept + interval > budget {
                error!(bytes = data.len(), "retry budget exhausted, lost data");
                return;
            }

            tokio::time::sleep(interval).await;
            slept += interval;
        }
    }
}
