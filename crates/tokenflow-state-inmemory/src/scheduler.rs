//! Tokio-timer scheduler executor
//!
//! Triggers live in a [`TriggerStore`] that outlives any executor, so a new
//! executor over the same store plays the part of a restarted process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tokenflow_core::scheduler::{FiredJob, JobId, MisfirePolicy, SchedulerExecutor, Trigger};
use tokenflow_core::SchedulerError;

/// Lifecycle of a persisted trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    /// Armed, not fired yet
    Waiting,
    /// Fired, waiting for the engine's acknowledgement
    Acquired,
    /// The fire failed or was interrupted
    Error,
}

/// A trigger as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTrigger {
    /// Job to run
    pub job_id: JobId,
    /// Job name, also the trigger key
    pub job_name: String,
    /// Fire time and misfire policy
    pub trigger: Trigger,
    /// Current state
    pub state: TriggerState,
}

/// Persistent trigger table
#[derive(Debug, Default)]
pub struct TriggerStore {
    triggers: DashMap<String, StoredTrigger>,
}

impl TriggerStore {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the trigger of `job_name`
    pub fn state(&self, job_name: &str) -> Option<TriggerState> {
        self.triggers.get(job_name).map(|trigger| trigger.state)
    }

    /// Every stored trigger
    pub fn triggers(&self) -> Vec<StoredTrigger> {
        self.triggers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of stored triggers
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether no trigger is stored
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    fn set_state(&self, job_name: &str, state: TriggerState) {
        if let Some(mut trigger) = self.triggers.get_mut(job_name) {
            trigger.state = state;
        }
    }
}

struct Inner {
    store: Arc<TriggerStore>,
    fired: mpsc::Sender<FiredJob>,
    started: AtomicBool,
    shutdown: AtomicBool,
    generation: AtomicU64,
    timers: DashMap<String, (u64, JoinHandle<()>)>,
}

/// [`SchedulerExecutor`] firing triggers with tokio timers.
///
/// A fired trigger is `Acquired` until the engine acknowledges it; a success
/// removes it, a failure or a missing answer marks it `Error`. Only a
/// `Waiting` trigger can fire, so each trigger fires at most once until it
/// is rescheduled.
pub struct TokioSchedulerExecutor {
    inner: Arc<Inner>,
}

impl TokioSchedulerExecutor {
    /// Create an executor over `store` handing fired jobs to `fired`
    pub fn new(store: Arc<TriggerStore>, fired: mpsc::Sender<FiredJob>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fired,
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                timers: DashMap::new(),
            }),
        }
    }

    /// Executor plus the receiving end of its fired jobs
    pub fn with_channel(
        store: Arc<TriggerStore>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<FiredJob>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(store, sender), receiver)
    }

    /// The trigger table
    pub fn store(&self) -> &Arc<TriggerStore> {
        &self.inner.store
    }
}

fn arm(inner: &Arc<Inner>, job_name: &str, start_at: DateTime<Utc>) {
    let delay = (start_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst);
    let task_inner = inner.clone();
    let name = job_name.to_string();

    let (registered, on_registered) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        // the handle must be in `timers` before the task can deregister it
        let _ = on_registered.await;
        tokio::time::sleep(delay).await;
        fire(&task_inner, &name).await;
        task_inner
            .timers
            .remove_if(&name, |_, (armed, _)| *armed == generation);
    });

    if let Some((_, previous)) = inner.timers.insert(job_name.to_string(), (generation, handle)) {
        previous.abort();
    }
    let _ = registered.send(());
}

async fn fire(inner: &Inner, job_name: &str) {
    let job_id = {
        let Some(mut trigger) = inner.store.triggers.get_mut(job_name) else {
            return;
        };
        if trigger.state != TriggerState::Waiting {
            return;
        }
        trigger.state = TriggerState::Acquired;
        trigger.job_id.clone()
    };

    let (ack, outcome) = oneshot::channel();
    let fired = FiredJob {
        job_id,
        job_name: job_name.to_string(),
        ack,
    };
    let result = match inner.fired.send(fired).await {
        Ok(()) => match outcome.await {
            Ok(result) => result,
            Err(_) => Err("engine dropped the job".to_string()),
        },
        Err(_) => Err("engine is not listening".to_string()),
    };

    match result {
        Ok(()) => {
            inner
                .store
                .triggers
                .remove_if(job_name, |_, trigger| trigger.state == TriggerState::Acquired);
            debug!(job_name, "Trigger fired");
        }
        Err(e) => {
            inner.store.set_state(job_name, TriggerState::Error);
            warn!(job_name, error = %e, "Trigger failed");
        }
    }
}

#[async_trait]
impl SchedulerExecutor for TokioSchedulerExecutor {
    async fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let now = Utc::now();
        let mut resumed = 0;
        let mut orphaned = 0;
        for trigger in self.inner.store.triggers() {
            match trigger.state {
                TriggerState::Waiting => {
                    if trigger.trigger.start_at < now
                        && trigger.trigger.misfire_policy == MisfirePolicy::Ignore
                    {
                        self.inner.store.triggers.remove(&trigger.job_name);
                        debug!(job_name = %trigger.job_name, "Dropping misfired trigger");
                        continue;
                    }
                    arm(&self.inner, &trigger.job_name, trigger.trigger.start_at);
                    resumed += 1;
                }
                // fired by a previous executor that never got an answer
                TriggerState::Acquired => {
                    self.inner
                        .store
                        .set_state(&trigger.job_name, TriggerState::Error);
                    orphaned += 1;
                }
                TriggerState::Error => {}
            }
        }
        info!(resumed, orphaned, "Scheduler executor started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let names: Vec<String> = self
            .inner
            .timers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, (_, handle))) = self.inner.timers.remove(&name) {
                handle.abort();
            }
        }
        info!("Scheduler executor stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    async fn schedule(
        &self,
        job_id: JobId,
        job_name: String,
        trigger: Trigger,
    ) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::NotStarted);
        }
        let start_at = trigger.start_at;
        self.inner.store.triggers.insert(
            job_name.clone(),
            StoredTrigger {
                job_id,
                job_name: job_name.clone(),
                trigger,
                state: TriggerState::Waiting,
            },
        );
        if self.is_started() {
            arm(&self.inner, &job_name, start_at);
        }
        Ok(())
    }

    async fn unschedule(&self, job_name: &str) -> Result<bool, SchedulerError> {
        // a firing timer is waiting for its job's outcome and deregisters itself
        if self.inner.store.state(job_name) != Some(TriggerState::Acquired) {
            if let Some((_, (_, handle))) = self.inner.timers.remove(job_name) {
                handle.abort();
            }
        }
        Ok(self.inner.store.triggers.remove(job_name).is_some())
    }

    async fn is_scheduled(&self, job_name: &str) -> Result<bool, SchedulerError> {
        Ok(self.inner.store.triggers.contains_key(job_name))
    }

    async fn reschedule_erroneous_triggers(&self) -> Result<usize, SchedulerError> {
        let erroneous: Vec<StoredTrigger> = self
            .inner
            .store
            .triggers()
            .into_iter()
            .filter(|trigger| trigger.state == TriggerState::Error)
            .collect();

        for trigger in &erroneous {
            self.inner
                .store
                .set_state(&trigger.job_name, TriggerState::Waiting);
            if self.is_started() {
                arm(&self.inner, &trigger.job_name, trigger.trigger.start_at);
            }
        }
        Ok(erroneous.len())
    }
}
