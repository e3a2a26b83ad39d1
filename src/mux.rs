//! Stream multiplexer merging crawl backlogs and live-update pushes.
//!
//! Each crawler hands over two logically distinct feeds: a self-pacing
//! backlog of discovered files and a push stream of filesystem events. The
//! multiplexer routes any number of such feeds into one consumer-visible
//! sequence, so the indexing loop never needs to know how many sources exist
//! or how fast each one produces.
//!
//! Ordering is preserved per feed, never across feeds. Backpressure is
//! bounded: every producer blocks on a full channel rather than buffering
//! without limit.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};

/// Merges a dynamic set of input streams plus a push channel into one output.
pub struct StreamMux<T> {
    tx: mpsc::Sender<T>,
    rx: Option<mpsc::Receiver<T>>,
    stop_tx: watch::Sender<bool>,
}

/// Cloneable handle for pushing items directly into the merged stream.
#[derive(Clone)]
pub struct MuxHandle<T> {
    tx: mpsc::Sender<T>,
}

/// Signals the multiplexer to wind down. Cheap to clone and hand to a
/// shutdown task.
#[derive(Clone)]
pub struct MuxStopper {
    stop_tx: watch::Sender<bool>,
}

/// The single consumer side of the merged stream.
pub struct MuxOutput<T> {
    rx: mpsc::Receiver<T>,
    stop_rx: watch::Receiver<bool>,
}

impl<T: Send + 'static> StreamMux<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: Some(rx),
            stop_tx,
        }
    }

    /// Adds an input stream. A forwarder task drains it into the shared
    /// channel until the input ends, the output is dropped, or the mux is
    /// stopped. Inputs can be added while the consumer is already running.
    pub fn add_input(&self, mut input: mpsc::Receiver<T>) {
        let tx = self.tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = input.recv() => match item {
                        Some(item) => {
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => break,
                }
            }
        });
    }

    pub fn handle(&self) -> MuxHandle<T> {
        MuxHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn stopper(&self) -> MuxStopper {
        MuxStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Takes the single consumer output. Subsequent calls fail.
    pub fn output(&mut self) -> Result<MuxOutput<T>> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow!("multiplexer output already taken"))?;
        Ok(MuxOutput {
            rx,
            stop_rx: self.stop_tx.subscribe(),
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl<T> MuxHandle<T> {
    /// Pushes one item, waiting when the merged channel is full.
    pub async fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow!("multiplexer closed"))
    }

    /// Blocking variant for non-async producers (watcher bridge threads).
    pub fn blocking_push(&self, item: T) -> Result<()> {
        self.tx
            .blocking_send(item)
            .map_err(|_| anyhow!("multiplexer closed"))
    }
}

impl MuxStopper {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl<T> MuxOutput<T> {
    /// Receives the next merged item. After `stop()`, already-buffered items
    /// are drained and then the sequence ends.
    pub async fn next(&mut self) -> Option<T> {
        if *self.stop_rx.borrow() {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            item = self.rx.recv() => item,
            _ = self.stop_rx.changed() => self.rx.try_recv().ok(),
        }
    }
}
