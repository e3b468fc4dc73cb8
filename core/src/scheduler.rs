//! Runs database jobs one at a time in arrival order.
//!
//! A transaction holds the scheduler from BEGIN to COMMIT/ROLLBACK, so queries issued outside it
//! queue behind the whole transaction instead of interleaving with it.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::backend::TransactionOpts;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Init,
    RunQueries,
    RunTransaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
}

impl Job {
    pub fn new(kind: JobKind) -> Self { Self { id: Ulid::new().to_string(), kind } }

    /// The job of transaction `id`. Its id is the transaction id, so later statements of the same
    /// transaction can find it.
    pub fn transaction(id: impl Into<String>) -> Self { Self { id: id.into(), kind: JobKind::RunTransaction } }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:?}({})", self.kind, self.id) }
}

/// Snapshot of the scheduler for error reports.
#[derive(Debug, Clone, Default)]
pub struct SchedulerDump {
    pub current: Option<Job>,
    pub queue: Vec<Job>,
}

impl fmt::Display for SchedulerDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.current {
            Some(job) => write!(f, "current: {}", job)?,
            None => write!(f, "current: none")?,
        }
        write!(f, ", queue: [")?;
        for (i, job) in self.queue.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", job)?;
        }
        write!(f, "]")
    }
}

#[derive(Debug, Default)]
struct QueueState {
    current: Option<Job>,
    queue: VecDeque<Job>,
}

impl QueueState {
    fn dump(&self) -> SchedulerDump { SchedulerDump { current: self.current.clone(), queue: self.queue.iter().cloned().collect() } }

    fn is_current(&self, id: &str) -> bool { self.current.as_ref().is_some_and(|job| job.id == id) }
}

/// FIFO mutual exclusion over jobs. Cloning yields another handle on the same queue.
#[derive(Clone)]
pub struct JobScheduler {
    state: watch::Sender<QueueState>,
    config: SchedulerConfig,
}

impl Default for JobScheduler {
    fn default() -> Self { Self::new(SchedulerConfig::default()) }
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self { Self { state: watch::Sender::new(QueueState::default()), config } }

    /// Wait until `job` is the current job. Jobs become current in the order they were queued.
    pub async fn acquire(&self, job: Job) -> Result<(), SchedulerError> {
        let mut started = false;
        self.state.send_modify(|state| {
            if state.current.is_none() && state.queue.is_empty() {
                state.current = Some(job.clone());
                started = true;
            } else {
                state.queue.push_back(job.clone());
            }
        });
        if started {
            debug!("job {} started", job);
            return Ok(());
        }

        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(self.config.acquire_timeout, async { rx.wait_for(|state| state.is_current(&job.id)).await.is_ok() }).await;
        match waited {
            Ok(true) => {
                debug!("job {} started", job);
                Ok(())
            }
            Ok(false) => Err(SchedulerError::NotAcquired(job.to_string())),
            Err(_) => {
                let mut promoted = false;
                let mut dump = SchedulerDump::default();
                self.state.send_modify(|state| {
                    promoted = state.is_current(&job.id);
                    if !promoted {
                        state.queue.retain(|queued| queued.id != job.id);
                    }
                    dump = state.dump();
                });
                if promoted {
                    return Ok(());
                }
                warn!("job {} timed out after {:?}: {}", job, self.config.acquire_timeout, dump);
                Err(SchedulerError::Timeout { job: job.to_string(), state: dump })
            }
        }
    }

    /// Finish the current job and start the next queued one.
    pub fn release(&self, job: &Job) -> Result<(), SchedulerError> {
        let mut dump = None;
        self.state.send_if_modified(|state| {
            if !state.is_current(&job.id) {
                dump = Some(state.dump());
                return false;
            }
            state.current = state.queue.pop_front();
            true
        });
        match dump {
            Some(state) => Err(SchedulerError::InvariantViolation { job: job.to_string(), state }),
            None => {
                debug!("job {} done", job);
                Ok(())
            }
        }
    }

    /// Acquire the job a query batch with `opts` runs under.
    ///
    /// A batch that starts a transaction acquires the transaction's job. A batch continuing one waits
    /// until that transaction is current, which it already is when called from inside it. A batch
    /// outside any transaction acquires a fresh job.
    pub async fn acquire_for(&self, opts: Option<&TransactionOpts>) -> Result<Job, SchedulerError> {
        match opts {
            Some(opts) if opts.contains_start => {
                let job = Job::transaction(&opts.transaction_id);
                self.acquire(job.clone()).await?;
                Ok(job)
            }
            Some(opts) => {
                let mut rx = self.state.subscribe();
                let id = &opts.transaction_id;
                match tokio::time::timeout(self.config.acquire_timeout, async { rx.wait_for(|state| state.is_current(id)).await.is_ok() }).await {
                    Ok(true) => Ok(Job::transaction(id)),
                    Ok(false) => Err(SchedulerError::NotAcquired(id.clone())),
                    Err(_) => Err(SchedulerError::Timeout { job: Job::transaction(id).to_string(), state: self.dump() }),
                }
            }
            None => {
                let job = Job::new(JobKind::RunQueries);
                self.acquire(job.clone()).await?;
                Ok(job)
            }
        }
    }

    /// Release after a batch ran with `opts`, if the batch ends the job.
    ///
    /// A plain batch and a rollback always end it. A batch that finishes a transaction ends it when it
    /// succeeded, or when it failed with rollback_on_fail (the engine rolled back for us). A batch that
    /// only starts a transaction ends it when it failed, since nothing else will.
    pub fn release_for(&self, job: &Job, opts: Option<&TransactionOpts>, succeeded: bool) -> Result<bool, SchedulerError> {
        let ends = match opts {
            None => true,
            Some(opts) if opts.contains_rollback => true,
            Some(opts) if opts.contains_finish => succeeded || opts.rollback_on_fail,
            Some(opts) if opts.contains_start => !succeeded,
            Some(_) => false,
        };
        if ends {
            self.release(job)?;
        }
        Ok(ends)
    }

    /// Resolves once nothing is running or queued.
    pub async fn wait_all_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.current.is_none() && state.queue.is_empty()).await;
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.current.is_none() && state.queue.is_empty()
    }

    pub fn dump(&self) -> SchedulerDump { self.state.borrow().dump() }
}
