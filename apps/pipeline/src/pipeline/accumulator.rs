//! Resume Batch Accumulator - groups ingestion events into bounded batches.
//!
//! A single collector task owns the buffer; producers hand items over through
//! a bounded channel, so nothing else ever touches the buffer. A batch is
//! flushed when the buffer reaches `batch_size` or when `batch_timeout` has
//! passed since the first item of a fresh buffer, whichever comes first.
//! Only one flush runs at a time; items arriving meanwhile wait for the next.
//!
//! Items are considered handled once buffered. A crash between buffering and
//! flushing loses them (at-most-once after ack).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Consumer of flushed batches.
#[async_trait]
pub trait BatchSink<T: Send + 'static>: Send + Sync + 'static {
    async fn process_batch(&self, batch: Vec<T>);
}

#[derive(Debug, Error)]
#[error("Batch accumulator is shut down")]
pub struct AccumulatorClosed;

/// Cloneable producer side of an accumulator.
pub struct AccumulatorSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for AccumulatorSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> AccumulatorSender<T> {
    pub async fn push(&self, item: T) -> Result<(), AccumulatorClosed> {
        self.tx.send(item).await.map_err(|_| AccumulatorClosed)
    }
}

pub struct BatchAccumulator<T> {
    sender: AccumulatorSender<T>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> BatchAccumulator<T> {
    pub fn spawn<S: BatchSink<T>>(sink: Arc<S>, batch_size: usize, batch_timeout: Duration) -> Self {
        let batch_size = batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size * 4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let collector = Collector {
            sink,
            batch_size,
            batch_timeout,
            buffer: Vec::with_capacity(batch_size),
            deadline: None,
            flushing: false,
        };
        let task = tokio::spawn(collector.run(rx, shutdown_rx));

        Self {
            sender: AccumulatorSender { tx },
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn sender(&self) -> AccumulatorSender<T> {
        self.sender.clone()
    }

    /// Flushes whatever is buffered, waits for running flushes and stops.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("Batch accumulator task ended abnormally: {e}");
        }
    }
}

struct Collector<T, S> {
    sink: Arc<S>,
    batch_size: usize,
    batch_timeout: Duration,
    buffer: Vec<T>,
    deadline: Option<Instant>,
    flushing: bool,
}

impl<T: Send + 'static, S: BatchSink<T>> Collector<T, S> {
    async fn run(mut self, mut rx: mpsc::Receiver<T>, mut shutdown: oneshot::Receiver<()>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

        loop {
            let deadline = self.deadline;
            tokio::select! {
                received = rx.recv() => match received {
                    Some(item) => self.on_item(item, &done_tx),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    if !self.flushing && !self.buffer.is_empty() {
                        debug!("Batch timeout reached with {} buffered", self.buffer.len());
                        self.flush(&done_tx);
                    }
                }
                Some(()) = done_rx.recv(), if self.flushing => {
                    self.flushing = false;
                    self.after_flush(&done_tx);
                }
                _ = &mut shutdown => break,
            }
        }

        rx.close();
        while let Ok(item) = rx.try_recv() {
            self.buffer.push(item);
        }
        if self.flushing {
            let _ = done_rx.recv().await;
            self.flushing = false;
        }
        if !self.buffer.is_empty() {
            info!("Flushing {} buffered items before shutdown", self.buffer.len());
            let batch = std::mem::take(&mut self.buffer);
            self.sink.process_batch(batch).await;
        }
    }

    fn on_item(&mut self, item: T, done_tx: &mpsc::UnboundedSender<()>) {
        self.buffer.push(item);
        if self.buffer.len() >= self.batch_size {
            if !self.flushing {
                self.flush(done_tx);
            }
        } else if self.buffer.len() == 1 && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.batch_timeout);
        }
    }

    fn after_flush(&mut self, done_tx: &mpsc::UnboundedSender<()>) {
        if self.buffer.len() >= self.batch_size {
            self.flush(done_tx);
        } else if !self.buffer.is_empty() && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.batch_timeout);
        }
    }

    /// Snapshots and clears the buffer, then processes it on its own task.
    fn flush(&mut self, done_tx: &mpsc::UnboundedSender<()>) {
        let batch = std::mem::take(&mut self.buffer);
        self.deadline = None;
        self.flushing = true;

        let sink = Arc::clone(&self.sink);
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let size = batch.len();
            let processing = tokio::spawn(async move { sink.process_batch(batch).await });
            if let Err(e) = processing.await {
                error!("Processing a batch of {size} panicked: {e}");
            }
            let _ = done_tx.send(());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Records (elapsed ms since creation, batch) for every flush.
    struct RecordingSink {
        start: Instant,
        batches: Mutex<Vec<(u128, Vec<u32>)>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                batches: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                batches: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn batches(&self) -> Vec<(u128, Vec<u32>)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink<u32> for RecordingSink {
        async fn process_batch(&self, batch: Vec<u32>) {
            self.batches
                .lock()
                .unwrap()
                .push((self.start.elapsed().as_millis(), batch));
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_immediately_at_batch_size() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 5, Duration::from_millis(5000));
        for i in 0..5 {
            acc.sender().push(i).await.unwrap();
        }
        settle().await;

        assert_eq!(sink.batches(), vec![(0, vec![0, 1, 2, 3, 4])]);
        acc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush_never_early() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 5, Duration::from_millis(5000));
        for i in 0..3 {
            acc.sender().push(i).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(4999)).await;
        settle().await;
        assert!(sink.batches().is_empty(), "flushed before the timeout");

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(sink.batches(), vec![(5000, vec![0, 1, 2])]);
        acc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_starts_at_first_buffered_item() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 5, Duration::from_millis(5000));
        acc.sender().push(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3000)).await;
        acc.sender().push(2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(sink.batches(), vec![(5000, vec![1, 2])]);
        acc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_cancels_pending_timer() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 2, Duration::from_millis(5000));
        acc.sender().push(1).await.unwrap();
        acc.sender().push(2).await.unwrap();
        acc.sender().push(3).await.unwrap();
        settle().await;
        assert_eq!(sink.batches(), vec![(0, vec![1, 2])]);

        // The leftover item gets a fresh timer of its own.
        tokio::time::sleep(Duration::from_millis(5001)).await;
        settle().await;
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.batches()[1].1, vec![3]);
        acc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_flush_runs_at_a_time() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = RecordingSink::gated(gate.clone());
        let acc = BatchAccumulator::spawn(sink.clone(), 2, Duration::from_millis(5000));

        acc.sender().push(1).await.unwrap();
        acc.sender().push(2).await.unwrap();
        settle().await;
        acc.sender().push(3).await.unwrap();
        acc.sender().push(4).await.unwrap();
        acc.sender().push(5).await.unwrap();
        settle().await;
        assert_eq!(sink.batches().len(), 1, "second flush started while first was running");

        // Releasing the first flush immediately triggers the next with everything buffered.
        gate.add_permits(1);
        settle().await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].1, vec![3, 4, 5]);

        gate.add_permits(10);
        acc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_leftovers() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 5, Duration::from_millis(5000));
        acc.sender().push(7).await.unwrap();
        acc.sender().push(8).await.unwrap();
        acc.shutdown().await;

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].1, vec![7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_shutdown_fails() {
        let sink = RecordingSink::new();
        let acc = BatchAccumulator::spawn(sink.clone(), 5, Duration::from_millis(5000));
        let sender = acc.sender();
        acc.shutdown().await;
        assert!(sender.push(1).await.is_err());
    }
}
