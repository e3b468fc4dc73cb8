//! The execution contract between the client and whatever runs SQL: queries, transaction options
//! and the [`DbBackend`] trait, plus [`QueryRunner`], which puts any [`QueryExecutor`] behind the job
//! scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::error::BackendError;
use crate::scheduler::{Job, JobKind, JobScheduler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Integer(v) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Integer(v as i64) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Real(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Text(v.to_owned()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::Text(v) }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Blob(v) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map_or(Value::Null, Into::into) }
}

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub elapsed: Duration,
}

/// A table a query touches, with the tables derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub depends_on: Vec<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), depends_on: Vec::new() } }

    pub fn depends_on(mut self, table: impl Into<String>) -> Self {
        self.depends_on.push(table.into());
        self
    }
}

impl From<&str> for TableRef {
    fn from(name: &str) -> Self { TableRef::new(name) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub values: Vec<Value>,
    pub tables: Vec<TableRef>,
    /// The query writes to its tables
    pub modifies: bool,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self { Self { text: text.into(), values: Vec::new(), tables: Vec::new(), modifies: false } }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn reads(mut self, table: impl Into<TableRef>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn writes(mut self, table: impl Into<TableRef>) -> Self {
        self.tables.push(table.into());
        self.modifies = true;
        self
    }

    pub fn read_tables(&self) -> BTreeSet<String> { self.tables.iter().map(|t| t.name.clone()).collect() }

    /// Tables changed by running this query, including those derived from them.
    pub fn write_tables(&self) -> BTreeSet<String> {
        if !self.modifies {
            return BTreeSet::new();
        }
        self.tables.iter().flat_map(|t| std::iter::once(t.name.clone()).chain(t.depends_on.iter().cloned())).collect()
    }
}

/// What one call to [`DbBackend::exec_queries`] runs.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryBatch {
    Usual(Vec<Query>),
    /// One statement run once per value set.
    Prepared { query: Query, values: Vec<Vec<Value>> },
}

impl QueryBatch {
    pub fn texts(&self) -> Vec<String> {
        match self {
            QueryBatch::Usual(queries) => queries.iter().map(|q| q.text.clone()).collect(),
            QueryBatch::Prepared { query, .. } => vec![query.text.clone()],
        }
    }

    pub fn queries(&self) -> Vec<&Query> {
        match self {
            QueryBatch::Usual(queries) => queries.iter().collect(),
            QueryBatch::Prepared { query, .. } => vec![query],
        }
    }
}

/// Where a batch stands relative to a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOpts {
    pub transaction_id: String,
    pub contains_start: bool,
    pub contains_finish: bool,
    pub contains_rollback: bool,
    /// The backend rolls back on its own when the batch fails
    pub rollback_on_fail: bool,
    pub is_atomic: bool,
}

impl TransactionOpts {
    /// Opts for a batch continuing transaction `id`.
    pub fn new(id: impl Into<String>) -> Self { Self { transaction_id: id.into(), ..Default::default() } }
}

#[async_trait]
pub trait DbBackend: Send + Sync + 'static {
    async fn initialize(&self) -> Result<(), BackendError>;
    async fn exec_queries(&self, batch: &QueryBatch, opts: Option<&TransactionOpts>) -> Result<Vec<QueryResult>, BackendError>;
    async fn stop(&self) -> Result<(), BackendError>;
}

/// A connection to the embedded engine that runs one statement at a time.
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    async fn open(&self) -> anyhow::Result<()>;
    async fn exec(&self, query: &Query) -> anyhow::Result<Vec<Row>>;

    async fn exec_prepared(&self, query: &Query, values: &[Vec<Value>]) -> anyhow::Result<Vec<Vec<Row>>> {
        let mut results = Vec::with_capacity(values.len());
        for set in values {
            let bound = Query { values: set.clone(), ..query.clone() };
            results.push(self.exec(&bound).await?);
        }
        Ok(results)
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.exec(&Query::new("ROLLBACK")).await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> { Ok(()) }
}

/// A [`DbBackend`] over a [`QueryExecutor`], serialized by a [`JobScheduler`].
pub struct QueryRunner<E> {
    executor: E,
    scheduler: JobScheduler,
    initialized: AtomicBool,
    /// Set as soon as `stop` begins. Only work of already started transactions is accepted after it.
    stopping: AtomicBool,
    stopped: AtomicBool,
}

impl<E: QueryExecutor> QueryRunner<E> {
    pub fn new(executor: E, config: SchedulerConfig) -> Self {
        Self { executor, scheduler: JobScheduler::new(config), initialized: AtomicBool::new(false), stopping: AtomicBool::new(false), stopped: AtomicBool::new(false) }
    }

    pub fn executor(&self) -> &E { &self.executor }
    pub fn scheduler(&self) -> &JobScheduler { &self.scheduler }

    fn refuses(&self, opts: Option<&TransactionOpts>) -> bool {
        self.stopping.load(Ordering::SeqCst) && opts.map_or(true, |opts| opts.contains_start)
    }

    async fn run_batch(&self, batch: &QueryBatch) -> Result<Vec<QueryResult>, BackendError> {
        match batch {
            QueryBatch::Usual(queries) => {
                let mut results = Vec::with_capacity(queries.len());
                for query in queries {
                    let started = Instant::now();
                    let rows = self.executor.exec(query).await.map_err(|source| BackendError::Query { text: query.text.clone(), source })?;
                    results.push(QueryResult { rows, elapsed: started.elapsed() });
                }
                Ok(results)
            }
            QueryBatch::Prepared { query, values } => {
                let started = Instant::now();
                let sets = self.executor.exec_prepared(query, values).await.map_err(|source| BackendError::Query { text: query.text.clone(), source })?;
                let elapsed = started.elapsed() / sets.len().max(1) as u32;
                Ok(sets.into_iter().map(|rows| QueryResult { rows, elapsed }).collect())
            }
        }
    }
}

#[async_trait]
impl<E: QueryExecutor> DbBackend for QueryRunner<E> {
    async fn initialize(&self) -> Result<(), BackendError> {
        let job = Job::new(JobKind::Init);
        self.scheduler.acquire(job.clone()).await?;
        let opened = self.executor.open().await;
        self.scheduler.release(&job)?;
        opened?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn exec_queries(&self, batch: &QueryBatch, opts: Option<&TransactionOpts>) -> Result<Vec<QueryResult>, BackendError> {
        if self.stopped.load(Ordering::SeqCst) || self.refuses(opts) {
            return Err(BackendError::Stopped);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BackendError::NotInitialized);
        }

        let job = self.scheduler.acquire_for(opts).await?;
        // stop may have begun while this batch was queued; a job it saw is waited for, any other backs out
        if self.refuses(opts) {
            self.scheduler.release_for(&job, opts, false)?;
            return Err(BackendError::Stopped);
        }
        let result = self.run_batch(batch).await;
        if let (Err(err), Some(opts)) = (&result, opts) {
            if opts.rollback_on_fail {
                if let Err(rollback) = self.executor.rollback().await {
                    warn!("failed to roll back transaction {} after {}: {}", opts.transaction_id, err, rollback);
                }
            }
        }
        self.scheduler.release_for(&job, opts, result.is_ok())?;
        result
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.stopping.store(true, Ordering::SeqCst);
        self.scheduler.wait_all_idle().await;
        self.stopped.store(true, Ordering::SeqCst);
        self.executor.close().await?;
        Ok(())
    }
}
