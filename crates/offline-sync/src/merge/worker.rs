//! Dedicated merge worker thread.
//!
//! The worker owns a plain OS thread fed through a channel; replies come
//! back over oneshot channels so async callers can await them. The thread is
//! spawned lazily on first use and joined on `terminate` or drop.

use super::{ExecutionPath, MergeError, MergeExecutor, MergeRequest, MergeResponse, Result, crdt};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const THREAD_NAME: &str = "offline-sync-merge";

struct Job {
    request: MergeRequest,
    reply: oneshot::Sender<Result<MergeResponse>>,
}

struct WorkerThread {
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

impl WorkerThread {
    fn spawn() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Merge worker started");
                // Exits once every sender is gone.
                while let Ok(job) = receiver.recv() {
                    let result = crdt::execute(job.request);
                    // The caller may have stopped waiting.
                    let _ = job.reply.send(result);
                }
                debug!("Merge worker stopped");
            })?;
        Ok(Self { sender, handle })
    }

    fn join(self) {
        drop(self.sender);
        if self.handle.join().is_err() {
            warn!("Merge worker panicked");
        }
    }
}

/// Runs merges on a dedicated thread.
#[derive(Default)]
pub struct WorkerExecutor {
    thread: Mutex<Option<WorkerThread>>,
}

impl WorkerExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the worker thread is currently running.
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<WorkerThread>> {
        self.thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sender for the running worker, spawning it first if needed.
    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        let mut guard = self.lock();
        if let Some(thread) = guard.as_ref() {
            if !thread.handle.is_finished() {
                return Ok(thread.sender.clone());
            }
            if let Some(dead) = guard.take() {
                dead.join();
            }
        }

        let thread = WorkerThread::spawn().map_err(|e| {
            warn!("Failed to spawn merge worker: {}", e);
            MergeError::WorkerUnavailable
        })?;
        info!("Spawned merge worker thread");
        let sender = thread.sender.clone();
        *guard = Some(thread);
        Ok(sender)
    }

    /// Drop a worker that stopped answering so the next call respawns it.
    fn discard(&self) {
        if let Some(thread) = self.lock().take() {
            thread.join();
        }
    }
}

#[async_trait]
impl MergeExecutor for WorkerExecutor {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Worker
    }

    fn init(&self) -> Result<()> {
        self.sender().map(|_| ())
    }

    fn terminate(&self) {
        if let Some(thread) = self.lock().take() {
            debug!("Terminating merge worker");
            thread.join();
        }
    }

    async fn execute(&self, request: MergeRequest) -> Result<MergeResponse> {
        let sender = self.sender()?;
        let (reply, response) = oneshot::channel();

        if sender.send(Job { request, reply }).is_err() {
            self.discard();
            return Err(MergeError::WorkerUnavailable);
        }
        drop(sender);

        match response.await {
            Ok(result) => result,
            Err(_) => {
                warn!("Merge worker dropped a request");
                self.discard();
                Err(MergeError::WorkerUnavailable)
            }
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}
