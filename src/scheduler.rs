//! Background task scheduling with graceful shutdown.
//!
//! Each registered task gets its own thread driven by a ticker; dropping
//! the shared shutdown sender wakes every task, which logs and exits at
//! its next scan boundary. `shutdown` then joins them all, so no
//! background work survives a closed database.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::error::Result;

/// A named periodic background task.
pub trait BackgroundTask: Send + Sync + 'static {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task once.
    fn execute(&self) -> Result<()>;
}

/// Owns the threads running registered tasks.
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            tasks: Vec::new(),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Registers a periodic task and starts its timer thread.
    pub fn register<T: BackgroundTask>(&mut self, task: Arc<T>) -> Result<()> {
        let interval = task.interval();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = std::thread::Builder::new()
            .name(task.name().to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = task.execute() {
                                tracing::error!(task = task.name(), error = %e, "task execution failed");
                            }
                        }
                        recv(shutdown_rx) -> _ => {
                            tracing::info!(task = task.name(), "task shutting down");
                            break;
                        }
                    }
                }
            })?;

        self.tasks.push(handle);
        Ok(())
    }

    /// Signals every task to stop and waits for them.
    pub fn shutdown(&mut self) {
        // Dropping the only sender disconnects the channel, which every
        // task observes as a recv on its next scan boundary.
        self.shutdown_tx.take();
        for task in self.tasks.drain(..) {
            if task.join().is_err() {
                tracing::error!("background task panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
