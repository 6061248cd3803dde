//! Write-behind audit buffer
//!
//! Producers push events into a bounded channel. A single background task
//! owns the pending batch, so taking the batch for a flush can never race
//! an append. The task flushes on a fixed interval, on explicit request,
//! and once more when stopped.

use super::models::AuditEvent;
use crate::config::AuditConfig;
use crate::error::{GovernanceError, Result};
use crate::storage::AuditStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum BufferCommand {
    Record(Vec<AuditEvent>),
    Flush(oneshot::Sender<Result<usize>>),
    Shutdown,
}

/// Handle to the background flush task
pub struct AuditBuffer {
    tx: mpsc::Sender<BufferCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuditBuffer {
    /// Spawn the flush task. Must be called inside a Tokio runtime.
    pub fn start(store: Arc<dyn AuditStore>, config: AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let worker = FlushWorker {
            store,
            pending: Vec::new(),
            max_pending: config.buffer_capacity.max(1),
            max_batch: config.max_batch.max(1),
        };
        let task = tokio::spawn(worker.run(rx, config.flush_interval));

        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue events. Waits when the channel is full.
    pub async fn push(&self, events: Vec<AuditEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.tx
            .send(BufferCommand::Record(events))
            .await
            .map_err(|_| GovernanceError::Internal("Audit buffer is stopped".to_string()))
    }

    /// Flush everything queued so far; returns the number of events written
    pub async fn flush(&self) -> Result<usize> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(BufferCommand::Flush(reply))
            .await
            .map_err(|_| GovernanceError::Internal("Audit buffer is stopped".to_string()))?;
        done.await
            .map_err(|_| GovernanceError::Internal("Audit flush task exited".to_string()))?
    }

    /// Drain, flush and wait for the task to finish
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if self.tx.send(BufferCommand::Shutdown).await.is_err() {
            warn!("Audit flush task already exited");
        }
        if let Err(e) = task.await {
            error!("Audit flush task panicked: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct FlushWorker {
    store: Arc<dyn AuditStore>,
    pending: Vec<AuditEvent>,
    max_pending: usize,
    max_batch: usize,
}

impl FlushWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<BufferCommand>, period: std::time::Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("Audit flush failed, retrying next interval: {}", e);
                    }
                }
                command = rx.recv() => match command {
                    Some(BufferCommand::Record(events)) => self.append(events),
                    Some(BufferCommand::Flush(reply)) => {
                        let _ = reply.send(self.flush().await);
                    }
                    Some(BufferCommand::Shutdown) | None => break,
                },
            }
        }

        // Anything sent before the shutdown is still in the channel.
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                BufferCommand::Record(events) => self.append(events),
                BufferCommand::Flush(reply) => {
                    let _ = reply.send(Ok(0));
                }
                BufferCommand::Shutdown => {}
            }
        }

        match self.flush().await {
            Ok(n) => info!("Audit buffer drained ({} events written on stop)", n),
            Err(e) => error!(
                "Audit buffer lost {} events on stop: {}",
                self.pending.len(),
                e
            ),
        }
    }

    fn append(&mut self, events: Vec<AuditEvent>) {
        self.pending.extend(events);
        if self.pending.len() > self.max_pending {
            let overflow = self.pending.len() - self.max_pending;
            warn!(
                "Audit buffer over capacity, dropping {} oldest events",
                overflow
            );
            self.pending.drain(..overflow);
        }
    }

    /// Write pending events in batches. A failed batch stays pending.
    async fn flush(&mut self) -> Result<usize> {
        let mut written = 0;
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.max_batch);
            let batch: Vec<AuditEvent> = self.pending.drain(..take).collect();

            if let Err(e) = self.store.insert_events(&batch).await {
                let mut retained = batch;
                retained.append(&mut self.pending);
                self.pending = retained;
                return Err(e);
            }
            written += take;
        }

        if written > 0 {
            debug!("Flushed {} audit events", written);
        }
        Ok(written)
    }
}
