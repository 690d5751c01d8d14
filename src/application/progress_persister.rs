use crate::application::error::SessionError;
use crate::application::session_store::{ProgressSnapshot, SessionStore};
use crate::infrastructure::credential_store::TokenStore;
use crate::infrastructure::practice_api_client::PracticeApiClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted { seq: u64 },
    /// Nothing newer than what the server already holds.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistHealth {
    pub last_persisted_seq: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

enum PersistCommand {
    Snapshot(ProgressSnapshot),
    Flush {
        respond_to: oneshot::Sender<PersistOutcome>,
    },
}

/// Cloneable handle for enqueueing snapshots.
#[derive(Clone)]
pub struct PersistQueue {
    sender: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistQueue {
    pub fn enqueue(&self, snapshot: ProgressSnapshot) -> Result<(), SessionError> {
        self.sender
            .send(PersistCommand::Snapshot(snapshot))
            .map_err(|_| SessionError::PersisterUnavailable)
    }
}

/// Pushes progress snapshots to the server from a single background worker.
///
/// Snapshots are applied in issuance order. While a persist is in flight, new
/// snapshots queue up; once it settles the worker sends only the newest one.
/// A flush resolves after every snapshot enqueued before it has been handled.
/// Dropping the persister lets the worker drain the queue and exit.
pub struct ProgressPersister {
    queue: PersistQueue,
    health: watch::Receiver<PersistHealth>,
    _worker: JoinHandle<()>,
}

impl ProgressPersister {
    pub fn spawn<C, T>(handle: &Handle, store: Arc<SessionStore<C, T>>) -> Self
    where
        C: PracticeApiClient + 'static,
        T: TokenStore + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(PersistHealth::default());
        let worker = handle.spawn(run_worker(store, receiver, health_tx));
        Self {
            queue: PersistQueue { sender },
            health: health_rx,
            _worker: worker,
        }
    }

    pub fn queue(&self) -> PersistQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, snapshot: ProgressSnapshot) -> Result<(), SessionError> {
        self.queue.enqueue(snapshot)
    }

    pub async fn flush(&self) -> Result<PersistOutcome, SessionError> {
        let (respond_to, response) = oneshot::channel();
        self.queue
            .sender
            .send(PersistCommand::Flush { respond_to })
            .map_err(|_| SessionError::PersisterUnavailable)?;
        response.await.map_err(|_| SessionError::PersisterUnavailable)
    }

    pub fn health(&self) -> watch::Receiver<PersistHealth> {
        self.health.clone()
    }
}

async fn run_worker<C, T>(
    store: Arc<SessionStore<C, T>>,
    mut receiver: mpsc::UnboundedReceiver<PersistCommand>,
    health: watch::Sender<PersistHealth>,
) where
    C: PracticeApiClient,
    T: TokenStore,
{
    let mut last_persisted: Option<ProgressSnapshot> = None;
    let mut unsynced: Option<ProgressSnapshot> = None;

    while let Some(command) = receiver.recv().await {
        let mut pending: Option<ProgressSnapshot> = None;
        let mut waiters = Vec::new();
        absorb(command, &mut pending, &mut waiters);
        while let Ok(command) = receiver.try_recv() {
            absorb(command, &mut pending, &mut waiters);
        }

        // A flush retries the last failed snapshot when nothing newer exists.
        let target = match pending {
            Some(snapshot) => Some(snapshot),
            None if !waiters.is_empty() => unsynced.take(),
            None => None,
        };

        let outcome = match target {
            None => PersistOutcome::Skipped,
            Some(snapshot)
                if last_persisted.as_ref().is_some_and(|persisted| {
                    persisted.seq >= snapshot.seq || persisted.same_content(&snapshot)
                }) =>
            {
                debug!(seq = snapshot.seq, "progress unchanged since last persist");
                unsynced = None;
                PersistOutcome::Skipped
            }
            Some(snapshot) => match store.persist(&snapshot).await {
                Ok(()) => {
                    debug!(
                        seq = snapshot.seq,
                        session_id = %snapshot.session_id,
                        step_index = snapshot.step_index,
                        "progress persisted"
                    );
                    let seq = snapshot.seq;
                    health.send_modify(|state| {
                        state.last_persisted_seq = Some(seq);
                        state.consecutive_failures = 0;
                        state.last_error = None;
                    });
                    unsynced = None;
                    last_persisted = Some(snapshot);
                    PersistOutcome::Persisted { seq }
                }
                Err(error) => {
                    warn!(
                        seq = snapshot.seq,
                        session_id = %snapshot.session_id,
                        error = %error,
                        "failed to persist progress"
                    );
                    let message = error.to_string();
                    health.send_modify(|state| {
                        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                        state.last_error = Some(message.clone());
                    });
                    // The server may or may not have applied the write.
                    last_persisted = None;
                    unsynced = Some(snapshot);
                    PersistOutcome::Failed(message)
                }
            },
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
    debug!("progress persister stopped");
}

fn absorb(
    command: PersistCommand,
    pending: &mut Option<ProgressSnapshot>,
    waiters: &mut Vec<oneshot::Sender<PersistOutcome>>,
) {
    match command {
        PersistCommand::Snapshot(snapshot) => {
            if pending.as_ref().is_none_or(|current| snapshot.seq >= current.seq) {
                *pending = Some(snapshot);
            }
        }
        PersistCommand::Flush { respond_to } => waiters.push(respond_to),
    }
}

/// Periodic autosave task, aborted when dropped.
pub struct AutosaveTicker {
    task: JoinHandle<()>,
}

impl AutosaveTicker {
    /// Calls `tick` every `period`, first after one full period. The task ends
    /// when `tick` returns `false`.
    pub fn spawn<F>(handle: &Handle, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = handle.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick() {
                    info!("autosave stopped");
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for AutosaveTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
